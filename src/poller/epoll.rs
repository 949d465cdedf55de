use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::{Events, Interest, Poller, Readiness, Token, timeout_millis};
use crate::config::MAX_EVENTS;

const READ_EVENTS: u32 = libc::EPOLLIN as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
const ERROR_EVENTS: u32 = libc::EPOLLERR as u32;
const HANGUP_EVENTS: u32 = libc::EPOLLHUP as u32;

/// Level-triggered epoll backend.
///
/// A stream is either in read mode (`EPOLLIN`) or write mode (`EPOLLOUT`);
/// the engine switches between the two with `reregister` while it holds the
/// socket's write mutex, so the mode changes never race.
#[derive(Debug)]
pub struct EpollPoller {
    epfd: OwnedFd,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: no pointer arguments; the result is checked below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 just returned this descriptor and nothing else owns it.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: Token) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: token.as_u64(),
        };
        // SAFETY: `event` outlives the call and the kernel only reads it.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn interest_bits(interest: Interest) -> u32 {
    match interest {
        Interest::Readable | Interest::Listen { .. } => READ_EVENTS,
        Interest::Writable => WRITE_EVENTS,
    }
}

impl Poller for EpollPoller {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest_bits(interest), token)
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest_bits(interest), token)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Token::NULL)
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let max = events.capacity().min(MAX_EVENTS);
        let mut raw = [const { MaybeUninit::<libc::epoll_event>::uninit() }; MAX_EVENTS];

        // SAFETY: `raw` has room for `max` entries and the kernel writes at
        // most that many.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                raw.as_mut_ptr().cast(),
                max as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for slot in &raw[..n as usize] {
            // SAFETY: epoll_wait initialized the first `n` entries.
            let event = unsafe { slot.assume_init_read() };
            let bits = event.events;
            events.push(Readiness {
                token: Token::from_u64(event.u64),
                readable: bits & READ_EVENTS != 0,
                writable: bits & WRITE_EVENTS != 0,
                error: bits & ERROR_EVENTS != 0,
                hangup: bits & HANGUP_EVENTS != 0,
                os_error: 0,
            });
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn wait_times_out_with_no_registrations() {
        let poller = EpollPoller::new().unwrap();
        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn readable_event_carries_token() {
        let poller = EpollPoller::new().unwrap();
        let (server, mut client) = pair();
        let token = Token::new(5, 9);
        poller
            .register(server.as_raw_fd(), token, Interest::Readable)
            .unwrap();

        client.write_all(b"ping").unwrap();
        let mut events = Events::with_capacity(8);
        let n = poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.token, token);
        assert!(ev.readable);
        assert!(!ev.writable);
    }

    #[test]
    fn batch_decodes_every_ready_entry_up_to_capacity() {
        let poller = EpollPoller::new().unwrap();
        let pairs: Vec<_> = (0..3).map(|_| pair()).collect();
        for (i, (server, client)) in pairs.iter().enumerate() {
            poller
                .register(server.as_raw_fd(), Token::new(i, 1), Interest::Readable)
                .unwrap();
            (&*client).write_all(b"x").unwrap();
        }

        let mut small = Events::with_capacity(2);
        let n = poller
            .wait(&mut small, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(n, 2);

        // Level-triggered: everything still pending shows up in a larger batch.
        let mut events = Events::with_capacity(8);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while events.len() < 3 && std::time::Instant::now() < deadline {
            poller
                .wait(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
        }
        let mut keys: Vec<usize> = events.iter().map(|ev| ev.token.key()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 2]);
        assert!(events.iter().all(|ev| ev.readable && ev.token.generation() == 1));
    }

    #[test]
    fn reregister_switches_between_write_and_read_mode() {
        let poller = EpollPoller::new().unwrap();
        let (server, _client) = pair();
        let fd = server.as_raw_fd();
        let token = Token::new(1, 1);
        poller.register(fd, token, Interest::Readable).unwrap();

        // Nothing to read: no events in read mode.
        let mut events = Events::with_capacity(8);
        assert_eq!(
            poller
                .wait(&mut events, Some(Duration::from_millis(10)))
                .unwrap(),
            0
        );

        poller.reregister(fd, token, Interest::Writable).unwrap();
        assert_eq!(
            poller
                .wait(&mut events, Some(Duration::from_secs(2)))
                .unwrap(),
            1
        );
        assert!(events.iter().next().unwrap().writable);

        poller.reregister(fd, token, Interest::Readable).unwrap();
        assert_eq!(
            poller
                .wait(&mut events, Some(Duration::from_millis(10)))
                .unwrap(),
            0
        );
    }

    #[test]
    fn deregister_twice_reports_error() {
        let poller = EpollPoller::new().unwrap();
        let (server, _client) = pair();
        let fd = server.as_raw_fd();
        poller
            .register(fd, Token::new(0, 1), Interest::Readable)
            .unwrap();
        poller.deregister(fd).unwrap();
        assert!(poller.deregister(fd).is_err());
    }
}
