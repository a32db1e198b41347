//! `poll(2)` fallback selector.
//!
//! Keeps its own registration table and rebuilds the pollfd array per
//! call. One-shot delivery is emulated by disarming a registration when it
//! fires. Only one thread runs the syscall at a time; registration changes
//! made while a poller is parked are pushed through the loop's wake
//! channel so the new mask takes effect promptly.

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use super::{SysEvent, WakeMsg, WAKE_CMD_EMPTY};

#[derive(Debug, Clone, Copy)]
struct Registration {
    data: u64,
    readable: bool,
    writable: bool,
}

#[derive(Debug)]
pub(crate) struct Selector {
    registry: Mutex<HashMap<RawFd, Registration>>,
    poll_lock: Mutex<()>,
    wake_wr: RawFd,
}

impl Selector {
    pub(crate) fn new(wake_wr: RawFd) -> Selector {
        Selector {
            registry: Mutex::new(HashMap::new()),
            poll_lock: Mutex::new(()),
            wake_wr,
        }
    }

    pub(crate) fn register(&self, fd: RawFd, data: u64) -> io::Result<()> {
        self.registry.lock().unwrap().insert(
            fd,
            Registration {
                data,
                readable: false,
                writable: false,
            },
        );
        Ok(())
    }

    pub(crate) fn update(
        &self,
        fd: RawFd,
        data: u64,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        {
            let mut registry = self.registry.lock().unwrap();
            let reg = registry
                .get_mut(&fd)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            *reg = Registration {
                data,
                readable,
                writable,
            };
        }
        // A loop thread rebuilds its pollfd set on the next iteration and
        // polling is serialised, so only foreign threads need to interrupt
        // a parked poller. Kicking from a loop thread would also turn the
        // wake channel's own re-arm into a wake storm.
        if crate::context::thread_id() < 0 {
            self.kick();
        }
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self.registry.lock().unwrap().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    pub(crate) fn select(
        &self,
        events: &mut Vec<SysEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let _poller = self.poll_lock.lock().unwrap();

        let mut pollfds: Vec<libc::pollfd> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .map(|(fd, reg)| {
                    let mut pevents: libc::c_short = 0;
                    if reg.readable {
                        pevents |= libc::POLLIN | libc::POLLRDHUP;
                    }
                    if reg.writable {
                        pevents |= libc::POLLOUT;
                    }
                    libc::pollfd {
                        fd: *fd,
                        events: pevents,
                        revents: 0,
                    }
                })
                .collect()
        };

        let timeout = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let n = syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout
        ))?;

        events.clear();
        if n == 0 {
            return Ok(());
        }

        let mut registry = self.registry.lock().unwrap();
        for pollfd in &pollfds {
            if pollfd.revents == 0 {
                continue;
            }
            let reg = match registry.get_mut(&pollfd.fd) {
                Some(reg) => reg,
                // Deregistered while we were polling.
                None => continue,
            };
            let bits = pollfd.revents;
            let fired = SysEvent {
                data: reg.data,
                readable: bits & (libc::POLLIN | libc::POLLPRI) != 0,
                writable: bits & libc::POLLOUT != 0,
                error: bits & (libc::POLLRDHUP | libc::POLLERR | libc::POLLHUP) != 0,
            };
            // One-shot: disarm until the combiner re-arms.
            reg.readable = false;
            reg.writable = false;
            events.push(fired);
        }
        Ok(())
    }

    /// Nudge whichever thread is parked in `poll` so it rebuilds its fd
    /// array with fresh masks.
    fn kick(&self) {
        let msg = WakeMsg {
            cmd: WAKE_CMD_EMPTY,
            data: 0,
        };
        let mut pipe = PipeWriter(self.wake_wr);
        let _ = pipe.write(&msg.to_bytes());
    }
}

struct PipeWriter(RawFd);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()))
            .map(|n| n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
