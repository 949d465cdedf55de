//! The socket manager: owns the readiness queue, the registry and the
//! worker threads.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Type};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, recover};
use crate::listener::{Acceptor, ListenSocket};
use crate::metrics;
use crate::poller::{self, Interest, Poller};
use crate::registry::{Attachment, Endpoint, Registry};
use crate::socket::{Socket, SocketHandler};
use crate::worker::SocketWorker;

/// How long `close_all` waits for the registry to drain before sweeping
/// again for sockets that were added in the meantime.
const CLOSE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// State shared by the manager, its workers and (weakly) every socket.
pub(crate) struct Shared {
    pub(crate) poller: Box<dyn Poller>,
    pub(crate) registry: Registry,
    pub(crate) config: EngineConfig,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: EngineConfig, poller: Box<dyn Poller>) -> Arc<Self> {
        Arc::new(Self {
            poller,
            registry: Registry::new(),
            config: config.normalized(),
            running: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn add_socket(self: &Arc<Self>, socket: &Arc<Socket>) -> bool {
        if !socket.attachment.attach(self) {
            warn!(fd = socket.raw_fd(), "socket already belongs to another manager");
            return false;
        }

        let write_mode = {
            let mut slots = self.registry.lock();
            // Only accepted or dialed sockets have anything to read.
            if socket.is_closed() || !socket.is_connected() || !self.is_running() {
                return false;
            }
            if slots.holds(&socket.attachment, Arc::as_ptr(socket).cast()) {
                return false;
            }

            // A socket with queued output starts in write mode and owns the
            // send permit from here on.
            let write_mode = socket.writable() && socket.acquire_send_lock();
            let Some(token) = slots.insert(Endpoint::Stream(socket.clone()), &socket.attachment)
            else {
                warn!(fd = socket.raw_fd(), "socket registry is full");
                if write_mode {
                    socket.dec_send_lock();
                }
                return false;
            };
            metrics::inc_sockets_added();

            let interest = if write_mode {
                Interest::Writable
            } else {
                Interest::Readable
            };
            if let Err(err) = self.poller.register(socket.raw_fd(), token, interest) {
                metrics::inc_register_failures();
                warn!(fd = socket.raw_fd(), %token, %err, "failed to register socket");
            }
            write_mode
        };

        if !write_mode {
            // Output queued while the token was not yet published found
            // nothing to arm; arm it now.
            let burst = socket.burst_begin();
            if burst.writable() {
                burst.push();
            }
        }
        true
    }

    pub(crate) fn add_listener(self: &Arc<Self>, listener: &Arc<ListenSocket>) -> bool {
        if !listener.attachment.attach(self) {
            warn!(addr = %listener.local_addr(), "listener already belongs to another manager");
            return false;
        }

        let mut slots = self.registry.lock();
        if listener.is_closed() || !self.is_running() {
            return false;
        }
        if slots.holds(&listener.attachment, Arc::as_ptr(listener).cast()) {
            return false;
        }
        let Some(token) = slots.insert(Endpoint::Listener(listener.clone()), &listener.attachment)
        else {
            warn!(addr = %listener.local_addr(), "socket registry is full");
            return false;
        };
        metrics::inc_sockets_added();

        let interest = Interest::Listen {
            backlog: listener.backlog(),
        };
        match self.poller.register(listener.raw_fd(), token, interest) {
            Ok(()) => info!(addr = %listener.local_addr(), %token, "listening"),
            Err(err) => {
                metrics::inc_register_failures();
                warn!(addr = %listener.local_addr(), %token, %err, "failed to register listener");
            }
        }
        true
    }

    pub(crate) fn remove_socket(&self, socket: &Socket) -> bool {
        self.remove_endpoint(
            &socket.attachment,
            socket.raw_fd(),
            std::ptr::from_ref(socket).cast(),
        )
    }

    pub(crate) fn remove_listener(&self, listener: &ListenSocket) -> bool {
        self.remove_endpoint(
            &listener.attachment,
            listener.raw_fd(),
            std::ptr::from_ref(listener).cast(),
        )
    }

    fn remove_endpoint(&self, attachment: &Attachment, fd: RawFd, endpoint: *const ()) -> bool {
        let mut slots = self.registry.lock();
        let token = attachment.token();
        if !slots.remove(attachment, endpoint) {
            return false;
        }
        metrics::inc_sockets_removed();
        if let Err(err) = self.poller.deregister(fd) {
            metrics::inc_deregister_failures();
            warn!(fd, %token, %err, "failed to deregister socket");
        }
        self.registry.notify_if_empty(&slots);
        true
    }

    pub(crate) fn close_all(&self) {
        loop {
            for endpoint in self.registry.snapshot() {
                match endpoint {
                    Endpoint::Stream(socket) => socket.disconnect(),
                    Endpoint::Listener(listener) => listener.close(),
                }
            }
            if self.registry.wait_empty(CLOSE_SWEEP_INTERVAL) {
                return;
            }
        }
    }
}

/// Connection multiplexing engine.
///
/// Construct one per server, register sockets with `add_socket` (or let a
/// listener do it) and start as many workers as needed with
/// `spawn_worker_threads`. Dropping the manager shuts it down.
pub struct SocketMgr {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl SocketMgr {
    /// Create a manager on the platform's readiness queue.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let poller = poller::default_poller().map_err(EngineError::Multiplexer)?;
        Ok(Self::with_poller(config, poller))
    }

    /// Create a manager on a caller-supplied readiness queue.
    pub fn with_poller(config: EngineConfig, poller: Box<dyn Poller>) -> Self {
        info!(poller = poller.name(), "socket manager created");
        Self {
            shared: Shared::new(config, poller),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn poller_name(&self) -> &'static str {
        self.shared.poller.name()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Register a stream. It starts in write mode if it already has queued
    /// output. False if it was already registered, is disconnected, or the
    /// manager is shutting down. A readiness-queue failure is logged and the
    /// socket stays registered.
    pub fn add_socket(&self, socket: &Arc<Socket>) -> bool {
        self.shared.add_socket(socket)
    }

    /// Register a listening socket with persistent read interest.
    pub fn add_listener(&self, listener: &Arc<ListenSocket>) -> bool {
        self.shared.add_listener(listener)
    }

    /// Drop `socket` from the registry and the readiness queue. False (and
    /// no effect) if it was not registered.
    pub fn remove_socket(&self, socket: &Socket) -> bool {
        self.shared.remove_socket(socket)
    }

    pub fn contains(&self, socket: &Socket) -> bool {
        self.shared
            .registry
            .lock()
            .holds(&socket.attachment, std::ptr::from_ref(socket).cast())
    }

    /// Registered endpoints, listeners included.
    pub fn socket_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Disconnect everything and return once the registry is empty.
    pub fn close_all(&self) {
        self.shared.close_all();
    }

    /// Start one more worker thread on the shared readiness queue.
    pub fn spawn_worker_threads(&self) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::ShutDown);
        }
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = SocketWorker::new(id, self.shared.clone());
        let handle = thread::Builder::new()
            .name(format!("socket-worker-{id}"))
            .spawn(move || worker.run())
            .map_err(EngineError::Spawn)?;
        recover(self.workers.lock()).push(handle);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        recover(self.workers.lock()).len()
    }

    /// Bind a listener on `addr` and register it. Connections are handed to
    /// `acceptor`.
    pub fn listen(
        &self,
        addr: SocketAddr,
        acceptor: impl Acceptor + 'static,
    ) -> Result<Arc<ListenSocket>, EngineError> {
        let listener = ListenSocket::bind(addr, self.shared.config.listen_backlog, acceptor)?;
        if !self.add_listener(&listener) {
            listener.close();
            return Err(EngineError::ShutDown);
        }
        Ok(listener)
    }

    /// Dial `addr` (blocking up to `timeout`, or the OS default on `None`)
    /// and register the connection.
    pub fn connect(
        &self,
        addr: SocketAddr,
        handler: Box<dyn SocketHandler>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Socket>, EngineError> {
        if !self.is_running() {
            return Err(EngineError::ShutDown);
        }
        let stream = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match timeout {
            Some(timeout) => stream.connect_timeout(&addr.into(), timeout)?,
            None => stream.connect(&addr.into())?,
        }
        let socket = Socket::new(stream, handler, &self.shared.config)?;
        socket.accept(addr);
        if !self.add_socket(&socket) {
            socket.disconnect();
            return Err(EngineError::ShutDown);
        }
        Ok(socket)
    }

    /// Stop the workers, close every socket and join the worker threads.
    /// Workers notice within one wait timeout.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("socket manager shutting down");
        }
        self.shared.close_all();

        let handles: Vec<JoinHandle<()>> = recover(self.workers.lock()).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("socket worker panicked");
            }
        }
    }
}

impl Drop for SocketMgr {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SocketMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMgr")
            .field("poller", &self.shared.poller.name())
            .field("sockets", &self.socket_count())
            .field("workers", &self.worker_count())
            .field("running", &self.is_running())
            .finish()
    }
}
