//! One TCP connection: buffers, lifecycle flags and the write burst.
//!
//! Reads are driven by the engine (`read_callback`) and handed to the
//! application through `SocketHandler::on_read`. Writes go through a
//! `Burst`, which holds the socket's write mutex: application threads queue
//! bytes with `Burst::send` and arm write interest with `Burst::push`, the
//! engine drains with `Burst::write_callback` on writability. Bytes leave in
//! the order they were queued because both sides hold the same mutex.

use std::fmt;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, TryLockError};

use tracing::{debug, trace, warn};

use crate::config::{BackpressurePolicy, EngineConfig};
use crate::error::{BurstError, recover};
use crate::metrics;
use crate::poller::Interest;
use crate::registry::Attachment;
use crate::ring_buffer::RingBuffer;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Application hooks for one connection.
///
/// Hooks run on engine worker threads (or on whichever thread disconnects
/// the socket) and must not block. No engine lock is held while they run,
/// so they may freely send, disconnect or consume the read buffer. When
/// holding both buffers, take `read_buffer()` before `burst_begin()`.
pub trait SocketHandler: Send + Sync {
    /// The socket became connected (accepted or dialed).
    fn on_connect(&self, _socket: &Socket) {}

    /// New bytes were appended to `socket.read_buffer()`.
    fn on_read(&self, socket: &Socket);

    /// The engine flushed the whole write buffer. May run concurrently with
    /// `on_read`.
    fn on_drained(&self, _socket: &Socket) {}

    /// Runs exactly once, after the descriptor has been closed.
    fn on_disconnect(&self, _socket: &Socket) {}
}

pub struct Socket {
    /// Descriptor number, kept for logs and deregistration after close.
    fd: RawFd,
    /// `None` once disconnected. Readers hold the guard across every
    /// syscall so the descriptor cannot be closed (and reused) under them.
    stream: RwLock<Option<socket2::Socket>>,
    peer: OnceLock<SocketAddr>,
    read_buffer: Mutex<RingBuffer>,
    /// The write mutex.
    write_buffer: Mutex<RingBuffer>,
    /// Bytes in `write_buffer`, readable without the mutex.
    pending: AtomicUsize,
    connected: AtomicBool,
    closed: AtomicBool,
    deleted: AtomicBool,
    /// Claimed by the worker currently inside `read_callback`.
    reading: AtomicBool,
    /// Single permit: nonzero while a write-readiness registration is
    /// outstanding.
    write_lock: AtomicUsize,
    backpressure: BackpressurePolicy,
    pub(crate) attachment: Attachment,
    handler: Box<dyn SocketHandler>,
}

impl Socket {
    /// Wrap a connected stream. The stream is switched to non-blocking mode.
    pub fn new(
        stream: socket2::Socket,
        handler: Box<dyn SocketHandler>,
        config: &EngineConfig,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        if config.nodelay {
            stream.set_nodelay(true)?;
        }
        #[cfg(target_vendor = "apple")]
        stream.set_nosigpipe(true)?;

        Ok(Arc::new(Self {
            fd: stream.as_raw_fd(),
            stream: RwLock::new(Some(stream)),
            peer: OnceLock::new(),
            read_buffer: Mutex::new(RingBuffer::with_capacity(config.read_buffer_size.max(1))),
            write_buffer: Mutex::new(RingBuffer::with_capacity(config.write_buffer_size.max(1))),
            pending: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            write_lock: AtomicUsize::new(0),
            backpressure: config.backpressure,
            attachment: Attachment::new(),
            handler,
        }))
    }

    /// Record the peer, mark the socket connected and fire `on_connect`.
    /// Used for both accepted and dialed connections.
    pub fn accept(&self, peer: SocketAddr) {
        let _ = self.peer.set(peer);
        self.connected.store(true, Ordering::SeqCst);
        trace!(fd = self.fd, %peer, "socket connected");
        self.handler.on_connect(self);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.peer().map(|peer| peer.ip())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Inbound bytes, consumed by the application's framing layer.
    pub fn read_buffer(&self) -> MutexGuard<'_, RingBuffer> {
        recover(self.read_buffer.lock())
    }

    /// True while queued output has not been handed to the OS.
    pub fn writable(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Take the write mutex. Drop the guard (or call `Burst::end`) before
    /// returning to the engine.
    pub fn burst_begin(&self) -> Burst<'_> {
        Burst {
            socket: self,
            buffer: recover(self.write_buffer.lock()),
        }
    }

    /// `burst_begin` without waiting; `None` if another thread holds it.
    pub fn try_burst_begin(&self) -> Option<Burst<'_>> {
        let buffer = match self.write_buffer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(Burst {
            socket: self,
            buffer,
        })
    }

    /// Take the write-readiness permit. False if one is already out.
    pub fn acquire_send_lock(&self) -> bool {
        self.write_lock
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn inc_send_lock(&self) {
        self.write_lock.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_send_lock(&self) {
        let released = self
            .write_lock
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1));
        debug_assert!(released.is_ok(), "send lock released while not held");
    }

    pub fn send_lock_held(&self) -> bool {
        self.write_lock.load(Ordering::Acquire) > 0
    }

    /// Re-arm this socket in the engine's readiness queue. False when the
    /// socket is not registered or the queue refused the change.
    ///
    /// Write interest must only be changed while holding the burst.
    pub fn post_event(&self, interest: Interest) -> bool {
        match self.rearm(interest) {
            Some(Ok(())) => true,
            Some(Err(_)) | None => false,
        }
    }

    /// `post_event` that keeps the queue's error. `None` when the socket is
    /// not registered (or already closed), so there was nothing to re-arm.
    pub(crate) fn rearm(&self, interest: Interest) -> Option<io::Result<()>> {
        let engine = self.attachment.engine()?;
        let token = self.attachment.token();
        if token.is_null() {
            return None;
        }
        let stream = recover(self.stream.read());
        if stream.is_none() {
            return None;
        }
        let result = engine.poller.reregister(self.fd, token, interest);
        if let Err(err) = &result {
            warn!(fd = self.fd, %token, ?interest, %err, "failed to re-arm socket");
        }
        Some(result)
    }

    /// Pull what the OS has into the read buffer and notify the handler.
    ///
    /// `len_hint` caps the bytes read; 0 reads until would-block or until
    /// the buffer is full. At most one call per socket does work at a time.
    pub fn read_callback(&self, len_hint: usize) {
        if self.is_deleted() || !self.is_connected() {
            return;
        }
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }

        let filled = self.fill_read_buffer(len_hint);
        // A full buffer is reported even when nothing new arrived, so the
        // application gets a chance to make room.
        if matches!(filled, Ok(fill) if fill.read > 0 || fill.full) {
            self.handler.on_read(self);
        }
        self.reading.store(false, Ordering::Release);

        match filled {
            Ok(Fill { eof: true, .. }) => {
                trace!(fd = self.fd, "peer closed connection");
                self.disconnect();
            }
            Ok(_) => {}
            Err(err) => self.on_error(err.raw_os_error().unwrap_or(0)),
        }
    }

    fn fill_read_buffer(&self, len_hint: usize) -> io::Result<Fill> {
        // Buffer before stream: a thread holding the read buffer may call
        // `disconnect`, which needs the stream exclusively.
        let mut buffer = self.read_buffer();
        let stream = recover(self.stream.read());
        let Some(stream) = stream.as_ref() else {
            return Ok(Fill::default());
        };
        let limit = if len_hint == 0 { usize::MAX } else { len_hint };

        let mut total = 0;
        let mut eof = false;
        while total < limit {
            let spare = buffer.spare_mut();
            if spare.is_empty() {
                break;
            }
            let want = spare.len().min(limit - total);
            let mut reader = stream;
            match reader.read(&mut spare[..want]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    buffer.commit(n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        metrics::add_bytes_read(total);
        Ok(Fill {
            read: total,
            eof,
            full: buffer.available() == 0,
        })
    }

    pub(crate) fn notify_drained(&self) {
        self.handler.on_drained(self);
    }

    /// Pending `SO_ERROR` on the descriptor, 0 if none.
    pub(crate) fn pending_error_code(&self) -> i32 {
        let stream = recover(self.stream.read());
        match stream.as_ref().map(socket2::Socket::take_error) {
            Some(Ok(Some(err))) => err.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// The readiness queue reported an error or hangup.
    pub fn on_error(&self, code: i32) {
        metrics::inc_socket_errors();
        debug!(
            fd = self.fd,
            code,
            err = %io::Error::from_raw_os_error(code),
            "socket error, disconnecting"
        );
        self.disconnect();
    }

    /// Leave the engine and close the descriptor. Only the first call does
    /// anything; safe from any thread.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        // Deregister while the descriptor is still open.
        if let Some(engine) = self.attachment.engine() {
            engine.remove_socket(self);
        }
        let stream = recover(self.stream.write()).take();
        drop(stream);
        trace!(fd = self.fd, "socket closed");
        self.handler.on_disconnect(self);
    }

    /// Disconnect and tombstone the socket: the engine never dispatches to
    /// it again. Memory goes away with the last `Arc`, so a callback still
    /// running elsewhere keeps it alive until it returns.
    pub fn delete(&self) {
        self.disconnect();
        self.deleted.store(true, Ordering::Release);
    }

    /// Queue `data` in one burst and arm write interest.
    ///
    /// On refusal the configured `BackpressurePolicy` decides whether the
    /// connection survives.
    pub fn send(&self, data: &[u8]) -> Result<(), BurstError> {
        let mut burst = self.burst_begin();
        match burst.send(data) {
            Ok(()) => {
                burst.push();
                Ok(())
            }
            Err(err) => {
                drop(burst);
                if self.backpressure == BackpressurePolicy::Disconnect
                    && err != BurstError::NotConnected
                {
                    debug!(fd = self.fd, %err, "write buffer overflow, disconnecting");
                    self.disconnect();
                }
                Err(err)
            }
        }
    }
}

/// Outcome of one `fill_read_buffer` pass.
#[derive(Debug, Default, Clone, Copy)]
struct Fill {
    read: usize,
    /// The peer closed its side.
    eof: bool,
    full: bool,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("peer", &self.peer())
            .field("connected", &self.is_connected())
            .field("deleted", &self.is_deleted())
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("token", &self.attachment.token())
            .finish()
    }
}

/// Held write mutex. Dropping it ends the burst.
pub struct Burst<'a> {
    socket: &'a Socket,
    buffer: MutexGuard<'a, RingBuffer>,
}

impl Burst<'_> {
    /// Append all of `data` to the write buffer, or nothing.
    pub fn send(&mut self, data: &[u8]) -> Result<(), BurstError> {
        if !self.socket.is_connected() {
            return Err(BurstError::NotConnected);
        }
        if let Err(err) = self.buffer.push(data) {
            metrics::inc_burst_rejected();
            return Err(err.into());
        }
        self.sync_pending();
        Ok(())
    }

    /// Ask the engine for a write-readiness wake-up, unless one is already
    /// outstanding.
    pub fn push(&self) {
        if self.socket.acquire_send_lock() && !self.socket.post_event(Interest::Writable) {
            // Not registered yet: registration picks up the queued bytes.
            self.socket.dec_send_lock();
        }
    }

    pub fn writable(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// The write buffer itself, for framing layers that serialize in place.
    pub fn buffer(&mut self) -> &mut RingBuffer {
        &mut self.buffer
    }

    pub fn end(self) {}

    /// Hand queued bytes to the OS until it stops accepting them.
    ///
    /// `len_hint` caps the bytes sent; 0 sends as much as possible.
    /// Returns the number of bytes the OS took.
    pub fn write_callback(&mut self, len_hint: usize) -> io::Result<usize> {
        let stream = recover(self.socket.stream.read());
        let Some(stream) = stream.as_ref() else {
            return Ok(0);
        };
        let limit = if len_hint == 0 { usize::MAX } else { len_hint };

        let mut total = 0;
        let mut result = Ok(());
        while total < limit && !self.buffer.is_empty() {
            let chunk = self.buffer.filled();
            let want = chunk.len().min(limit - total);
            match stream.send_with_flags(&chunk[..want], SEND_FLAGS) {
                Ok(0) => break,
                Ok(n) => {
                    self.buffer.consume(n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.sync_pending();
        metrics::add_bytes_written(total);
        result.map(|()| total)
    }

    fn sync_pending(&self) {
        self.socket
            .pending
            .store(self.buffer.len(), Ordering::Release);
    }
}

impl Deref for Burst<'_> {
    type Target = RingBuffer;

    fn deref(&self) -> &RingBuffer {
        &self.buffer
    }
}

impl Drop for Burst<'_> {
    fn drop(&mut self) {
        self.sync_pending();
    }
}
