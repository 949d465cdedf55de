//! Engine sizing and operational configuration.
//!
//! Compile-time defaults live here as constants; `EngineConfig` carries the
//! runtime values a `SocketMgr` is built with.

use std::time::Duration;

/// Per-socket inbound ring buffer size (bytes).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 65536;

/// Per-socket outbound ring buffer size (bytes).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 65536;

/// Upper bound on readiness events collected by one wait.
pub const MAX_EVENTS: usize = 1024;

/// How long a worker blocks on the readiness queue before re-checking the
/// shutdown flag.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept backlog for listening sockets.
pub const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;

/// Tokens carry the slot key in their low 32 bits.
pub const MAX_SOCKETS: usize = u32::MAX as usize;

// Compile-time sanity checks
const _: () = assert!(MAX_EVENTS > 0, "a wait must be able to return an event");
const _: () = assert!(
    DEFAULT_READ_BUFFER_SIZE > 0 && DEFAULT_WRITE_BUFFER_SIZE > 0,
    "socket buffers cannot be empty"
);

/// What `Socket::send` does when the write buffer cannot take a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackpressurePolicy {
    /// Refuse the message and keep the connection.
    #[default]
    Drop,
    /// Refuse the message and disconnect the peer.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_events: usize,
    pub wait_timeout: Duration,
    pub listen_backlog: i32,
    /// Set TCP_NODELAY on accepted and dialed sockets.
    pub nodelay: bool,
    pub backpressure: BackpressurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_events: MAX_EVENTS,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            listen_backlog: LISTEN_BACKLOG,
            nodelay: true,
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would make the engine unusable.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_events = self.max_events.clamp(1, MAX_EVENTS);
        self.read_buffer_size = self.read_buffer_size.max(1);
        self.write_buffer_size = self.write_buffer_size.max(1);
        self
    }
}
