use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::SysEvent;

const MAX_EVENTS: usize = 256;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    /// Add `fd` disarmed; the combiner arms it when a queue needs it.
    pub(crate) fn register(&self, fd: RawFd, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: data };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        data: u64,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(readable, writable),
            u64: data,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<SysEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying
                // a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            buf.as_mut_ptr(),
            MAX_EVENTS as libc::c_int,
            timeout,
        ))?;

        events.clear();
        for event in buf.iter().take(n as usize) {
            let bits = event.events as libc::c_int;
            events.push(SysEvent {
                data: event.u64,
                readable: bits & (EPOLLIN | EPOLLPRI) != 0,
                writable: bits & EPOLLOUT != 0,
                error: bits & (EPOLLRDHUP | EPOLLERR | EPOLLHUP) != 0,
            });
        }
        Ok(())
    }
}

fn interests_to_epoll(readable: bool, writable: bool) -> u32 {
    if !readable && !writable {
        return 0;
    }
    let mut kind = EPOLLONESHOT | EPOLLRDHUP;
    if readable {
        kind |= EPOLLIN;
    }
    if writable {
        kind |= EPOLLOUT;
    }
    kind as u32
}
