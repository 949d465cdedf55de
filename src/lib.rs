//! sockmux: a readiness-driven TCP connection engine.
//!
//! A `SocketMgr` owns one OS readiness queue (epoll or kqueue) shared by any
//! number of worker threads. Sockets registered with it get their reads
//! pulled into a per-socket ring buffer and handed to a `SocketHandler`;
//! application threads queue output through a `Burst` and the workers drain
//! it when the descriptor becomes writable.

pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod poller;
mod registry;
pub mod ring_buffer;
pub mod socket;
mod worker;

pub use config::{BackpressurePolicy, EngineConfig};
pub use error::{BurstError, EngineError};
pub use listener::{Acceptor, ListenSocket};
pub use manager::SocketMgr;
pub use poller::{Events, Interest, Poller, Readiness, Token};
pub use ring_buffer::{PushError, RingBuffer};
pub use socket::{Burst, Socket, SocketHandler};
