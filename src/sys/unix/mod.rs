use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;
pub(crate) mod poll;

/// One readiness event, normalised across selector implementations.
/// `data` is whatever was registered: a (possibly tagged) object pointer,
/// or the wake-channel token.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SysEvent {
    pub(crate) data: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
}

/// Runtime-selected multiplexer. All registrations are one-shot: the
/// combiner re-arms explicitly whenever queue state demands it.
pub(crate) enum Selector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::Selector),
    Poll(poll::Selector),
}

impl Selector {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn epoll() -> io::Result<Selector> {
        Ok(Selector::Epoll(epoll::Selector::new()?))
    }

    pub(crate) fn poll(wake_wr: RawFd) -> Selector {
        Selector::Poll(poll::Selector::new(wake_wr))
    }

    pub(crate) fn register(&self, fd: RawFd, data: u64) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.register(fd, data),
            Selector::Poll(s) => s.register(fd, data),
        }
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        data: u64,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.update(fd, data, readable, writable),
            Selector::Poll(s) => s.update(fd, data, readable, writable),
        }
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.deregister(fd),
            Selector::Poll(s) => s.deregister(fd),
        }
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<SysEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Selector::Epoll(s) => s.select(events, timeout),
            Selector::Poll(s) => s.select(events, timeout),
        }
    }
}

/// Wake-channel message: 16 bytes on the loop's self-pipe. Pipe writes of
/// this size are atomic, so concurrent posters never interleave.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WakeMsg {
    pub(crate) cmd: u64,
    pub(crate) data: u64,
}

pub(crate) const WAKE_MSG_SIZE: usize = 16;

/// Worker observing this leaves the loop.
pub(crate) const WAKE_CMD_QUIT: u64 = 0;
/// Deliver a user event (`data` is the op pointer).
pub(crate) const WAKE_CMD_USER_EVENT: u64 = 1;
/// Just make `select` return.
pub(crate) const WAKE_CMD_EMPTY: u64 = 2;

impl WakeMsg {
    pub(crate) fn to_bytes(self) -> [u8; WAKE_MSG_SIZE] {
        let mut buf = [0; WAKE_MSG_SIZE];
        buf[..8].copy_from_slice(&self.cmd.to_ne_bytes());
        buf[8..].copy_from_slice(&self.data.to_ne_bytes());
        buf
    }

    pub(crate) fn from_bytes(buf: &[u8; WAKE_MSG_SIZE]) -> WakeMsg {
        let mut cmd = [0; 8];
        let mut data = [0; 8];
        cmd.copy_from_slice(&buf[..8]);
        data.copy_from_slice(&buf[8..]);
        WakeMsg {
            cmd: u64::from_ne_bytes(cmd),
            data: u64::from_ne_bytes(data),
        }
    }
}

/// Non-blocking close-on-exec pipe; `[read, write]`.
pub(crate) fn pipe() -> io::Result<[File; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    // SAFETY: `pipe2` initialised both descriptors and nothing else owns
    // them yet.
    Ok(unsafe { [File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])] })
}
