//! Readiness-queue abstraction.
//!
//! One `Poller` per `SocketMgr`, shared by every worker thread. The backend
//! is picked at build time: epoll on Linux/Android, kqueue on the BSD and
//! Apple family. Worker and socket logic only talk to the trait.
//!
//! Notification model both backends implement:
//! - stream read interest is level-triggered and stays armed
//! - write interest fires once per `reregister(.., Interest::Writable)`;
//!   afterwards `reregister(.., Interest::Readable)` returns the fd to read
//!   interest (a no-op where read and write filters are independent)
//! - listeners get persistent read interest

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub mod kqueue;

/// Opaque event payload: slot key in the low 32 bits, slot generation in the
/// high 32 bits. Generation 0 is never issued, so `Token::NULL` never names
/// a socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub const NULL: Token = Token(0);

    pub(crate) fn new(key: usize, generation: u32) -> Self {
        debug_assert!(key <= u32::MAX as usize, "slot key must fit in u32");
        debug_assert!(generation != 0, "generation 0 is reserved");
        Token(((generation as u64) << 32) | key as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Token(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn key(self) -> usize {
        (self.0 & u32::MAX as u64) as usize
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_null(self) -> bool {
        self.generation() == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}#{})", self.key(), self.generation())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key(), self.generation())
    }
}

/// Registration mode for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Wake when readable.
    Readable,
    /// Wake once when writable (socket registered with queued output).
    Writable,
    /// Listening socket: persistent read interest sized to the backlog.
    Listen { backlog: i32 },
}

/// One readiness report, already decoded from the backend's raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
    /// OS error code carried by the event, 0 when the backend has none.
    pub os_error: i32,
}

impl Readiness {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            readable: true,
            ..Self::empty(token)
        }
    }

    pub fn writable(token: Token) -> Self {
        Self {
            token,
            writable: true,
            ..Self::empty(token)
        }
    }

    pub fn error(token: Token, os_error: i32) -> Self {
        Self {
            token,
            error: true,
            os_error,
            ..Self::empty(token)
        }
    }

    pub fn hangup(token: Token) -> Self {
        Self {
            token,
            hangup: true,
            ..Self::empty(token)
        }
    }

    fn empty(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            error: false,
            hangup: false,
            os_error: 0,
        }
    }

    pub fn is_error_or_hangup(&self) -> bool {
        self.error || self.hangup
    }
}

/// Reusable event batch filled by `Poller::wait`.
#[derive(Debug)]
pub struct Events {
    ready: Vec<Readiness>,
    capacity: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ready: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Most events a single wait may return.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
    }

    /// Append an event. Ignored once the batch is at capacity.
    pub fn push(&mut self, readiness: Readiness) {
        if self.ready.len() < self.capacity {
            self.ready.push(readiness);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Readiness> {
        self.ready.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Readiness;
    type IntoIter = std::slice::Iter<'a, Readiness>;

    fn into_iter(self) -> Self::IntoIter {
        self.ready.iter()
    }
}

/// OS readiness queue.
///
/// All methods take `&self`: one poller is shared by every worker thread
/// and by application threads re-arming write interest.
pub trait Poller: Send + Sync + fmt::Debug {
    /// Add `fd` with the given mode. `token` comes back in its events.
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Re-arm an already registered `fd` (the engine's "post event").
    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Remove every interest for `fd`.
    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` (forever on `None`) and fill `events`.
    /// Returns the number of events; 0 on timeout or signal interruption.
    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Create the platform's default readiness queue.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn default_poller() -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(epoll::EpollPoller::new()?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub fn default_poller() -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(kqueue::KqueuePoller::new()?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
pub fn default_poller() -> io::Result<Box<dyn Poller>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no readiness queue backend for this platform",
    ))
}

/// Milliseconds for a wait call, rounding sub-millisecond timeouts up so a
/// short timeout never turns into a busy poll.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if Duration::from_millis(ms as u64) < t {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}
