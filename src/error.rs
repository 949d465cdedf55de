use std::io;
use std::sync::{LockResult, PoisonError};

use crate::ring_buffer::PushError;

/// Failures surfaced by the engine's constructors and thread management.
///
/// Per-socket failures never show up here: they are logged and turned into
/// a disconnect.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The readiness queue (epoll/kqueue) could not be created. Nothing can
    /// run without it.
    #[error("could not create readiness queue: {0}")]
    Multiplexer(#[source] io::Error),
    #[error("could not spawn socket worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
    #[error("socket manager has shut down")]
    ShutDown,
}

/// Why a burst append was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BurstError {
    /// Write buffer capacity exceeded (backpressure).
    #[error("write buffer refused data: {0}")]
    Buffer(#[from] PushError),
    #[error("socket is not connected")]
    NotConnected,
}

impl BurstError {
    /// True when retrying after the buffer drains could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BurstError::Buffer(PushError::Full { .. }))
    }
}

/// Take the guard out of a poisoned lock. A panicking application hook must
/// not wedge every other thread touching the same socket.
pub(crate) fn recover<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}
