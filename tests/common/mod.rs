#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use sockmux::{EngineConfig, Events, Interest, Poller, Readiness, Socket, SocketHandler, Token};

/// Engine config with a short wait so workers notice shutdown quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        wait_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Loopback connection: the accepted server side (for a `Socket`), the
/// client side, and the client's address as seen by the server.
pub fn tcp_pair() -> (socket2::Socket, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    (socket2::Socket::from(server), client, peer)
}

/// A connected `Socket` (not registered anywhere) plus its client end.
pub fn connected_socket(
    config: &EngineConfig,
    handler: impl SocketHandler + 'static,
) -> (Arc<Socket>, TcpStream) {
    let (server, client, peer) = tcp_pair();
    let socket = Socket::new(server, Box::new(handler), config).unwrap();
    socket.accept(peer);
    (socket, client)
}

#[derive(Default)]
pub struct Record {
    pub connects: AtomicUsize,
    pub reads: AtomicUsize,
    pub drained: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub received: Mutex<Vec<u8>>,
}

impl Record {
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

/// Counts hooks and moves everything read into `Record::received`.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Record>);

impl SocketHandler for Recorder {
    fn on_connect(&self, _socket: &Socket) {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_read(&self, socket: &Socket) {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        let mut input = socket.read_buffer();
        let mut chunk = vec![0u8; input.len()];
        let n = input.read(&mut chunk);
        self.0.received.lock().unwrap().extend_from_slice(&chunk[..n]);
    }

    fn on_drained(&self, _socket: &Socket) {
        self.0.drained.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _socket: &Socket) {
        self.0.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes back whatever fits in the write buffer.
pub struct Echo;

impl Echo {
    fn pump(socket: &Socket) {
        let mut input = socket.read_buffer();
        let mut burst = socket.burst_begin();
        while !input.is_empty() && burst.available() > 0 {
            let chunk = input.filled();
            let n = chunk.len().min(burst.available());
            if burst.send(&chunk[..n]).is_err() {
                break;
            }
            input.consume(n);
        }
        if burst.writable() {
            burst.push();
        }
    }
}

impl SocketHandler for Echo {
    fn on_read(&self, socket: &Socket) {
        Self::pump(socket);
    }

    fn on_drained(&self, socket: &Socket) {
        Self::pump(socket);
    }
}

#[derive(Debug, Default)]
pub struct Script {
    queue: Mutex<VecDeque<Readiness>>,
    ready: Condvar,
    tokens: Mutex<HashMap<RawFd, Token>>,
    pub registrations: Mutex<Vec<(RawFd, Interest)>>,
    pub rearms: Mutex<Vec<(RawFd, Interest)>>,
    pub deregistrations: AtomicUsize,
    pub waits: AtomicUsize,
}

impl Script {
    /// Queue an event for the next `wait`.
    pub fn inject(&self, readiness: Readiness) {
        self.queue.lock().unwrap().push_back(readiness);
        self.ready.notify_all();
    }

    /// Token the engine registered `fd` with, if still registered.
    pub fn token_for(&self, fd: RawFd) -> Option<Token> {
        self.tokens.lock().unwrap().get(&fd).copied()
    }

    pub fn last_registration(&self) -> Option<(RawFd, Interest)> {
        self.registrations.lock().unwrap().last().copied()
    }

    pub fn last_rearm(&self) -> Option<(RawFd, Interest)> {
        self.rearms.lock().unwrap().last().copied()
    }

    pub fn deregistrations(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }
}

/// Readiness queue driven entirely by the test: nothing fires unless
/// injected through the shared `Script`.
#[derive(Debug)]
pub struct ScriptedPoller(pub Arc<Script>);

impl ScriptedPoller {
    pub fn new() -> (Box<dyn Poller>, Arc<Script>) {
        let script = Arc::new(Script::default());
        (Box::new(ScriptedPoller(script.clone())), script)
    }
}

impl Poller for ScriptedPoller {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut tokens = self.0.tokens.lock().unwrap();
        if tokens.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        tokens.insert(fd, token);
        self.0.registrations.lock().unwrap().push((fd, interest));
        Ok(())
    }

    fn reregister(&self, fd: RawFd, _token: Token, interest: Interest) -> io::Result<()> {
        if !self.0.tokens.lock().unwrap().contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.0.rearms.lock().unwrap().push((fd, interest));
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        if self.0.tokens.lock().unwrap().remove(&fd).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.0.deregistrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        self.0.waits.fetch_add(1, Ordering::SeqCst);
        let queue = self.0.queue.lock().unwrap();
        let (mut queue, _) = self
            .0
            .ready
            .wait_timeout_while(
                queue,
                timeout.unwrap_or(Duration::from_secs(3600)),
                |queue| queue.is_empty(),
            )
            .unwrap();
        while events.len() < events.capacity() {
            match queue.pop_front() {
                Some(readiness) => events.push(readiness),
                None => break,
            }
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
