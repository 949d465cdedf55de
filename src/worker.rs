//! Worker loop: wait on the shared readiness queue and turn each event into
//! one callback on the socket it names.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::listener::ListenSocket;
use crate::manager::Shared;
use crate::metrics;
use crate::poller::{Events, Interest, Readiness};
use crate::registry::Endpoint;
use crate::socket::Socket;

/// Pause after a failed wait so a broken queue does not spin a core.
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) struct SocketWorker {
    id: usize,
    shared: Arc<Shared>,
}

impl SocketWorker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub(crate) fn run(self) {
        info!(worker = self.id, poller = self.shared.poller.name(), "socket worker started");
        let mut events = Events::with_capacity(self.shared.config.max_events);
        let timeout = Some(self.shared.config.wait_timeout);

        while self.shared.is_running() {
            match self.shared.poller.wait(&mut events, timeout) {
                Ok(0) => metrics::inc_wait_timeouts(),
                Ok(_) => {
                    metrics::inc_wakeups();
                    for readiness in &events {
                        dispatch(&self.shared, readiness);
                    }
                }
                Err(err) => {
                    error!(worker = self.id, %err, "readiness queue wait failed");
                    thread::sleep(WAIT_ERROR_BACKOFF);
                }
            }
        }
        info!(worker = self.id, "socket worker stopped");
    }
}

/// Route one readiness report to its endpoint.
pub(crate) fn dispatch(shared: &Arc<Shared>, readiness: &Readiness) {
    let token = readiness.token;
    if token.is_null() {
        metrics::inc_null_events();
        error!(?readiness, "readiness event without a socket token");
        return;
    }
    let Some(endpoint) = shared.registry.resolve(token) else {
        // Removed after the event was queued.
        metrics::inc_stale_events();
        debug!(%token, "event for a retired socket");
        return;
    };
    match endpoint {
        Endpoint::Stream(socket) => dispatch_stream(&socket, readiness),
        Endpoint::Listener(listener) => dispatch_listener(shared, &listener, readiness),
    }
}

fn dispatch_stream(socket: &Socket, readiness: &Readiness) {
    if socket.is_deleted() {
        return;
    }
    if readiness.error {
        socket.on_error(error_code(socket, readiness));
        return;
    }
    // Read before acting on a hangup so bytes the peer sent before closing
    // still reach the handler.
    if readiness.readable {
        socket.read_callback(0);
    }
    if readiness.writable && socket.is_connected() {
        drain(socket);
    }
    if readiness.hangup && socket.is_connected() {
        socket.on_error(error_code(socket, readiness));
    }
}

fn error_code(socket: &Socket, readiness: &Readiness) -> i32 {
    if readiness.os_error != 0 {
        readiness.os_error
    } else {
        socket.pending_error_code()
    }
}

/// Flush the write buffer, then either keep write interest armed or hand
/// the permit back and return to read interest.
fn drain(socket: &Socket) {
    let mut burst = socket.burst_begin();
    if !socket.send_lock_held() {
        // Interest was already disarmed; this report predates that.
        return;
    }
    if let Err(err) = burst.write_callback(0) {
        drop(burst);
        socket.on_error(err.raw_os_error().unwrap_or(0));
        return;
    }
    if !socket.is_connected() {
        return;
    }
    if burst.writable() {
        match socket.rearm(Interest::Writable) {
            Some(Ok(())) => {}
            None => socket.dec_send_lock(),
            Some(Err(err)) => {
                // Queued bytes would sit with nothing armed to send them.
                socket.dec_send_lock();
                drop(burst);
                socket.on_error(err.raw_os_error().unwrap_or(0));
            }
        }
        return;
    }
    socket.dec_send_lock();
    if let Some(Err(err)) = socket.rearm(Interest::Readable) {
        // Write interest is still armed with no permit behind it.
        drop(burst);
        socket.on_error(err.raw_os_error().unwrap_or(0));
        return;
    }
    burst.end();
    socket.notify_drained();
}

fn dispatch_listener(shared: &Arc<Shared>, listener: &ListenSocket, readiness: &Readiness) {
    if readiness.is_error_or_hangup() {
        error!(
            addr = %listener.local_addr(),
            code = readiness.os_error,
            "listener reported an error, closing"
        );
        listener.close();
        return;
    }
    if readiness.readable {
        listener.accept_pending(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::poller::{Poller, Token};
    use crate::socket::SocketHandler;
    use std::io::{self, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::RawFd;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Calls {
        armed: Mutex<Vec<(RawFd, Interest)>>,
        deregistered: AtomicUsize,
        /// Refuse every `reregister` to this interest.
        refuse: Mutex<Option<Interest>>,
    }

    #[derive(Debug)]
    struct Probe(Arc<Calls>);

    impl Poller for Probe {
        fn register(&self, fd: RawFd, _token: Token, interest: Interest) -> io::Result<()> {
            self.0.armed.lock().unwrap().push((fd, interest));
            Ok(())
        }

        fn reregister(&self, fd: RawFd, _token: Token, interest: Interest) -> io::Result<()> {
            if *self.0.refuse.lock().unwrap() == Some(interest) {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            self.0.armed.lock().unwrap().push((fd, interest));
            Ok(())
        }

        fn deregister(&self, _fd: RawFd) -> io::Result<()> {
            self.0.deregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn wait(&self, _events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
            thread::sleep(timeout.unwrap_or(Duration::from_millis(1)));
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "probe"
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    struct Echo(Arc<Counter>);

    impl SocketHandler for Echo {
        fn on_read(&self, socket: &Socket) {
            self.0.0.fetch_add(1, Ordering::SeqCst);
            let mut data = vec![0u8; socket.read_buffer().len()];
            let n = socket.read_buffer().read(&mut data);
            socket.send(&data[..n]).unwrap();
        }
    }

    fn engine() -> (Arc<Shared>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let shared = Shared::new(EngineConfig::default(), Box::new(Probe(calls.clone())));
        (shared, calls)
    }

    fn registered(shared: &Arc<Shared>) -> (Arc<Socket>, TcpStream, Arc<Counter>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let counter = Arc::new(Counter::default());
        let socket = Socket::new(
            socket2::Socket::from(server),
            Box::new(Echo(counter.clone())),
            &shared.config,
        )
        .unwrap();
        socket.accept(peer);
        assert!(shared.add_socket(&socket));
        (socket, client, counter)
    }

    #[test]
    fn null_and_stale_tokens_are_ignored() {
        let (shared, _calls) = engine();
        dispatch(&shared, &Readiness::readable(Token::NULL));
        dispatch(&shared, &Readiness::readable(Token::new(3, 9)));

        let (socket, _client, counter) = registered(&shared);
        let token = socket.attachment.token();
        socket.disconnect();
        dispatch(&shared, &Readiness::readable(token));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn error_event_disconnects_and_unregisters() {
        let (shared, calls) = engine();
        let (socket, _client, _) = registered(&shared);
        assert_eq!(shared.registry.len(), 1);

        dispatch(&shared, &Readiness::error(socket.attachment.token(), libc::ECONNRESET));
        assert!(!socket.is_connected());
        assert_eq!(shared.registry.len(), 0);
        assert_eq!(calls.deregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readable_then_writable_echoes_and_returns_to_read_interest() {
        let (shared, calls) = engine();
        let (socket, mut client, counter) = registered(&shared);
        let token = socket.attachment.token();
        client.write_all(b"marco").unwrap();

        // Loopback delivery is quick but not instant.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.0.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            dispatch(&shared, &Readiness::readable(token));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(socket.writable());
        assert!(socket.send_lock_held());
        assert_eq!(
            calls.armed.lock().unwrap().last(),
            Some(&(socket.raw_fd(), Interest::Writable))
        );

        dispatch(&shared, &Readiness::writable(token));
        assert!(!socket.writable());
        assert!(!socket.send_lock_held());
        assert_eq!(
            calls.armed.lock().unwrap().last(),
            Some(&(socket.raw_fd(), Interest::Readable))
        );

        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"marco");
    }

    #[test]
    fn failed_return_to_read_interest_disconnects() {
        let (shared, calls) = engine();
        let (socket, _client, _) = registered(&shared);
        socket.send(b"bye").unwrap();
        assert!(socket.send_lock_held());

        *calls.refuse.lock().unwrap() = Some(Interest::Readable);
        dispatch(&shared, &Readiness::writable(socket.attachment.token()));

        assert!(!socket.is_connected());
        assert!(!socket.send_lock_held());
        assert_eq!(shared.registry.len(), 0);
        assert_eq!(calls.deregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_rearm_with_output_left_disconnects() {
        // More than loopback socket buffers can absorb while the client
        // never reads, so one drain leaves bytes queued.
        const BACKLOG: usize = 32 << 20;
        let calls = Arc::new(Calls::default());
        let config = EngineConfig {
            write_buffer_size: BACKLOG,
            ..EngineConfig::default()
        };
        let shared = Shared::new(config, Box::new(Probe(calls.clone())));
        let (socket, _client, _) = registered(&shared);
        {
            let mut burst = socket.burst_begin();
            burst.send(&vec![0x42; BACKLOG]).unwrap();
            burst.push();
        }
        assert!(socket.send_lock_held());

        *calls.refuse.lock().unwrap() = Some(Interest::Writable);
        dispatch(&shared, &Readiness::writable(socket.attachment.token()));

        assert!(!socket.is_connected());
        assert!(!socket.send_lock_held());
        assert_eq!(shared.registry.len(), 0);
    }

    #[test]
    fn writable_report_after_disarm_is_ignored() {
        let (shared, calls) = engine();
        let (socket, _client, _) = registered(&shared);
        let before = calls.armed.lock().unwrap().len();

        dispatch(&shared, &Readiness::writable(socket.attachment.token()));
        assert!(!socket.send_lock_held());
        assert_eq!(calls.armed.lock().unwrap().len(), before);
    }

    #[test]
    fn deleted_socket_gets_no_callbacks() {
        let (shared, _calls) = engine();
        let (socket, mut client, counter) = registered(&shared);
        let token = socket.attachment.token();
        socket.delete();
        client.write_all(b"late").unwrap();
        dispatch(&shared, &Readiness::readable(token));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
