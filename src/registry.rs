//! Live-endpoint registry.
//!
//! Every socket registered with the readiness queue owns one slot here. The
//! slot key and a per-insert generation form the `Token` the poller hands
//! back with each event, so a stale event for a retired slot resolves to
//! nothing even after the key has been reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use slab::Slab;

use crate::config::MAX_SOCKETS;
use crate::error::recover;
use crate::listener::ListenSocket;
use crate::manager::Shared;
use crate::poller::Token;
use crate::socket::Socket;

/// Anything the engine can register: a connected stream or a listener.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Stream(Arc<Socket>),
    Listener(Arc<ListenSocket>),
}

impl Endpoint {
    /// Identity used to match a removal against the slot's occupant.
    fn addr(&self) -> *const () {
        match self {
            Endpoint::Stream(socket) => Arc::as_ptr(socket).cast(),
            Endpoint::Listener(listener) => Arc::as_ptr(listener).cast(),
        }
    }
}

/// Per-endpoint link back to the engine that registered it.
///
/// The engine reference is set once and never changes, so an endpoint can
/// only ever belong to one `SocketMgr`. The token is written only while the
/// registry lock is held.
pub(crate) struct Attachment {
    engine: OnceLock<Weak<Shared>>,
    token: AtomicU64,
}

impl Attachment {
    pub(crate) fn new() -> Self {
        Self {
            engine: OnceLock::new(),
            token: AtomicU64::new(Token::NULL.as_u64()),
        }
    }

    /// Bind to `shared`. False if already bound to a different engine.
    pub(crate) fn attach(&self, shared: &Arc<Shared>) -> bool {
        let bound = self.engine.get_or_init(|| Arc::downgrade(shared));
        std::ptr::eq(bound.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn engine(&self) -> Option<Arc<Shared>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    pub(crate) fn token(&self) -> Token {
        Token::from_u64(self.token.load(Ordering::Acquire))
    }

    fn set_token(&self, token: Token) {
        self.token.store(token.as_u64(), Ordering::Release);
    }
}

struct Slot {
    generation: u32,
    endpoint: Endpoint,
}

/// Slot map guarded by the registry lock.
pub(crate) struct Slots {
    slab: Slab<Slot>,
    next_generation: u32,
}

impl Slots {
    /// Store `endpoint` and publish its token on `attachment`.
    /// `None` when the key space is exhausted.
    pub(crate) fn insert(&mut self, endpoint: Endpoint, attachment: &Attachment) -> Option<Token> {
        let entry = self.slab.vacant_entry();
        if entry.key() >= MAX_SOCKETS {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation = match self.next_generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let token = Token::new(entry.key(), generation);
        entry.insert(Slot {
            generation,
            endpoint,
        });
        attachment.set_token(token);
        Some(token)
    }

    /// Remove the slot named by `attachment`'s token if `endpoint` still
    /// occupies it, clearing the token. False when already gone.
    pub(crate) fn remove(&mut self, attachment: &Attachment, endpoint: *const ()) -> bool {
        let token = attachment.token();
        if token.is_null() {
            return false;
        }
        let occupied = self
            .slab
            .get(token.key())
            .is_some_and(|slot| slot.generation == token.generation() && slot.endpoint.addr() == endpoint);
        if !occupied {
            return false;
        }
        self.slab.remove(token.key());
        attachment.set_token(Token::NULL);
        true
    }

    pub(crate) fn get(&self, token: Token) -> Option<&Endpoint> {
        if token.is_null() {
            return None;
        }
        self.slab
            .get(token.key())
            .filter(|slot| slot.generation == token.generation())
            .map(|slot| &slot.endpoint)
    }

    /// True if `attachment`'s token currently names `endpoint`.
    pub(crate) fn holds(&self, attachment: &Attachment, endpoint: *const ()) -> bool {
        self.get(attachment.token())
            .is_some_and(|occupant| occupant.addr() == endpoint)
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

pub(crate) struct Registry {
    slots: Mutex<Slots>,
    emptied: Condvar,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                slab: Slab::new(),
                next_generation: 1,
            }),
            emptied: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slots> {
        recover(self.slots.lock())
    }

    /// Clone out the endpoint for `token`. The returned `Arc` keeps the
    /// endpoint alive for the duration of a callback.
    pub(crate) fn resolve(&self, token: Token) -> Option<Endpoint> {
        self.lock().get(token).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Endpoint> {
        self.lock()
            .slab
            .iter()
            .map(|(_, slot)| slot.endpoint.clone())
            .collect()
    }

    /// Wake `wait_empty` callers if the last slot just went away.
    pub(crate) fn notify_if_empty(&self, slots: &Slots) {
        if slots.is_empty() {
            self.emptied.notify_all();
        }
    }

    /// Block until the registry is empty or `timeout` passes. Returns
    /// whether it is empty.
    pub(crate) fn wait_empty(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = recover(
            self.emptied
                .wait_timeout_while(guard, timeout, |slots| !slots.is_empty()),
        );
        guard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::socket::SocketHandler;
    use std::net::{TcpListener, TcpStream};

    struct Quiet;

    impl SocketHandler for Quiet {
        fn on_read(&self, _socket: &Socket) {}
    }

    fn socket() -> (Arc<Socket>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let socket = Socket::new(
            socket2::Socket::from(server),
            Box::new(Quiet),
            &EngineConfig::default(),
        )
        .unwrap();
        (socket, client)
    }

    #[test]
    fn reused_key_gets_a_new_generation() {
        let registry = Registry::new();
        let (a, _ca) = socket();
        let (b, _cb) = socket();

        let first = registry
            .lock()
            .insert(Endpoint::Stream(a.clone()), &a.attachment)
            .unwrap();
        assert!(registry.lock().remove(&a.attachment, Arc::as_ptr(&a).cast()));
        assert!(a.attachment.token().is_null());

        let second = registry
            .lock()
            .insert(Endpoint::Stream(b.clone()), &b.attachment)
            .unwrap();
        assert_eq!(first.key(), second.key());
        assert_ne!(first, second);

        // The retired token no longer resolves, the new one does.
        assert!(registry.resolve(first).is_none());
        assert!(matches!(
            registry.resolve(second),
            Some(Endpoint::Stream(s)) if Arc::ptr_eq(&s, &b)
        ));
    }

    #[test]
    fn remove_checks_identity_and_is_idempotent() {
        let registry = Registry::new();
        let (a, _ca) = socket();
        let (b, _cb) = socket();
        registry
            .lock()
            .insert(Endpoint::Stream(a.clone()), &a.attachment)
            .unwrap();

        // `b` is not registered: its null token removes nothing.
        assert!(!registry.lock().remove(&b.attachment, Arc::as_ptr(&b).cast()));
        assert_eq!(registry.len(), 1);

        assert!(registry.lock().remove(&a.attachment, Arc::as_ptr(&a).cast()));
        assert!(!registry.lock().remove(&a.attachment, Arc::as_ptr(&a).cast()));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn null_token_never_resolves() {
        let registry = Registry::new();
        assert!(registry.resolve(Token::NULL).is_none());
    }

    #[test]
    fn wait_empty_times_out_while_occupied() {
        let registry = Registry::new();
        assert!(registry.wait_empty(Duration::from_millis(1)));

        let (a, _ca) = socket();
        registry
            .lock()
            .insert(Endpoint::Stream(a.clone()), &a.attachment)
            .unwrap();
        assert!(!registry.wait_empty(Duration::from_millis(10)));
    }
}
