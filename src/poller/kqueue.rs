use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{Events, Interest, Poller, Readiness, Token};
use crate::config::MAX_EVENTS;

/// kqueue backend.
///
/// Read and write are separate filters: the read filter stays armed for the
/// life of the registration, the write filter is `EV_ONESHOT` and is
/// re-added by every `reregister(.., Interest::Writable)`.
#[derive(Debug)]
pub struct KqueuePoller {
    kq: OwnedFd,
}

fn change(fd: RawFd, filter: i32, flags: u32, data: isize, token: Token) -> libc::kevent {
    // Field widths differ between the BSDs; build from zero and cast.
    // SAFETY: kevent is plain integers and pointers, all-zero is valid.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.data = data as _;
    ev.udata = token.as_u64() as usize as _;
    ev
}

impl KqueuePoller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: no arguments; the result is checked below.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kqueue just returned this descriptor and nothing else owns it.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: `kq` is an open descriptor owned by this function.
        let rc = unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { kq })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        // SAFETY: `changes` is a live slice of `changes.len()` entries and
        // no event list is passed.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

const READ: i32 = libc::EVFILT_READ as i32;
const WRITE: i32 = libc::EVFILT_WRITE as i32;
const ADD: u32 = libc::EV_ADD as u32;
const ONESHOT: u32 = libc::EV_ONESHOT as u32;
const DELETE: u32 = libc::EV_DELETE as u32;

impl Poller for KqueuePoller {
    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match interest {
            Interest::Readable => self.apply(&[change(fd, READ, ADD, 0, token)]),
            Interest::Writable => self.apply(&[
                change(fd, READ, ADD, 0, token),
                change(fd, WRITE, ADD | ONESHOT, 0, token),
            ]),
            Interest::Listen { backlog } => {
                self.apply(&[change(fd, READ, ADD, backlog as isize, token)])
            }
        }
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match interest {
            // The read filter never left; the one-shot write filter is already gone.
            Interest::Readable | Interest::Listen { .. } => Ok(()),
            Interest::Writable => self.apply(&[change(fd, WRITE, ADD | ONESHOT, 0, token)]),
        }
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The write filter is usually absent (one-shot already fired), so
        // only report failure when neither filter could be removed.
        let read = self.apply(&[change(fd, READ, DELETE, 0, Token::NULL)]);
        let write = self.apply(&[change(fd, WRITE, DELETE, 0, Token::NULL)]);
        match (read, write) {
            (Err(err), Err(_)) => Err(err),
            _ => Ok(()),
        }
    }

    fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let max = events.capacity().min(MAX_EVENTS);
        let mut raw = [const { MaybeUninit::<libc::kevent>::uninit() }; MAX_EVENTS];

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(ptr::null(), |s| s as *const libc::timespec);

        // SAFETY: `raw` has room for `max` entries, `ts` outlives the call.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                raw.as_mut_ptr().cast(),
                max as libc::c_int,
                ts_ptr,
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
            // SAFETY: kevent initialized the first `n` entries.
            let ev = unsafe { slot.assume_init_read() };
            let flags = ev.flags as u32;
            let filter = ev.filter as i32;
            let error = flags & libc::EV_ERROR as u32 != 0;
            let hangup = flags & libc::EV_EOF as u32 != 0;
            let os_error = if error {
                ev.data as i32
            } else if hangup {
                ev.fflags as i32
            } else {
                0
            };
            events.push(Readiness {
                token: Token::from_u64(ev.udata as usize as u64),
                readable: filter == READ,
                writable: filter == WRITE,
                error,
                hangup,
                os_error,
            });
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}
