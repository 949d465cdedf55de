//! Accept path: a listening socket registered with the engine and the
//! `Acceptor` hook that turns new connections into `Socket`s.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use socket2::{Domain, Protocol, Type};
use tracing::{debug, info, trace, warn};

use crate::error::recover;
use crate::manager::Shared;
use crate::registry::Attachment;
use crate::socket::{Socket, SocketHandler};

/// Decides what handles a freshly accepted connection. Returning `None`
/// refuses it (the connection is closed immediately).
pub trait Acceptor: Send + Sync {
    fn handler_for(&self, peer: &SocketAddr) -> Option<Box<dyn SocketHandler>>;
}

impl<F> Acceptor for F
where
    F: Fn(&SocketAddr) -> Option<Box<dyn SocketHandler>> + Send + Sync,
{
    fn handler_for(&self, peer: &SocketAddr) -> Option<Box<dyn SocketHandler>> {
        self(peer)
    }
}

pub struct ListenSocket {
    fd: RawFd,
    socket: RwLock<Option<socket2::Socket>>,
    local_addr: SocketAddr,
    backlog: i32,
    closed: AtomicBool,
    pub(crate) attachment: Attachment,
    acceptor: Box<dyn Acceptor>,
}

impl ListenSocket {
    /// Bind and listen on `addr` (port 0 picks a free port).
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        acceptor: impl Acceptor + 'static,
    ) -> io::Result<Arc<Self>> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))?;

        Ok(Arc::new(Self {
            fd: socket.as_raw_fd(),
            socket: RwLock::new(Some(socket)),
            local_addr,
            backlog,
            closed: AtomicBool::new(false),
            attachment: Attachment::new(),
            acceptor: Box::new(acceptor),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting: leave the engine and close the descriptor. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.attachment.engine() {
            engine.remove_listener(self);
        }
        drop(recover(self.socket.write()).take());
        info!(addr = %self.local_addr, "listener closed");
    }

    /// Accept until the backlog is drained, registering every connection
    /// the acceptor takes.
    pub(crate) fn accept_pending(&self, shared: &Arc<Shared>) {
        loop {
            let accepted = {
                let socket = recover(self.socket.read());
                let Some(socket) = socket.as_ref() else {
                    return;
                };
                socket.accept()
            };

            match accepted {
                Ok((stream, addr)) => {
                    let Some(peer) = addr.as_socket() else {
                        continue;
                    };
                    self.admit(shared, stream, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(err) => {
                    // Out of descriptors and the like: retry on the next wake-up.
                    warn!(addr = %self.local_addr, %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&self, shared: &Arc<Shared>, stream: socket2::Socket, peer: SocketAddr) {
        let Some(handler) = self.acceptor.handler_for(&peer) else {
            debug!(%peer, "connection refused by acceptor");
            return;
        };
        let socket = match Socket::new(stream, handler, &shared.config) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%peer, %err, "could not set up accepted connection");
                return;
            }
        };
        trace!(fd = socket.raw_fd(), %peer, "accepted connection");
        socket.accept(peer);
        if !shared.add_socket(&socket) {
            socket.disconnect();
        }
    }
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSocket")
            .field("fd", &self.fd)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("token", &self.attachment.token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LISTEN_BACKLOG;

    struct Quiet;

    impl SocketHandler for Quiet {
        fn on_read(&self, _socket: &Socket) {}
    }

    #[test]
    fn bind_reports_assigned_port() {
        let listener = ListenSocket::bind(
            "127.0.0.1:0".parse().unwrap(),
            LISTEN_BACKLOG,
            |_: &SocketAddr| Some(Box::new(Quiet) as Box<dyn SocketHandler>),
        )
        .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(!listener.is_closed());

        listener.close();
        listener.close();
        assert!(listener.is_closed());
    }
}
