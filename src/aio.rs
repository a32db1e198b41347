//! Operation submission and the non-blocking execute hooks.
//!
//! Submission is the producer side of the combiner protocol. The caller
//! bumps the object's state word; the first toucher of an idle object gets
//! a synchronous shot at the syscall before any queueing happens, bounded
//! by the per-thread completion budget so callback recursion cannot run
//! away. Everyone else leaves a start intent behind and returns.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::combiner;
use crate::context;
use crate::coro;
use crate::flags::Flags;
use crate::object::{AioObject, Object};
use crate::op::{
    self, alloc_op, completion_of, Action, Callback, Completion, Op, Payload, RunState, Side,
    MAX_SYNCHRONOUS_FINISHED,
};
use crate::sock::HostAddress;
use crate::status::Status;

fn unspec() -> HostAddress {
    HostAddress {
        family: 0,
        ipv4: 0,
        port: 0,
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// ===== non-blocking syscall attempts ====================================
//
// Shared between the inline fast path and the combiner's execute hook;
// every readiness selector drives the same syscalls.

unsafe fn sys_read(
    fd: RawFd,
    buf: *mut u8,
    len: usize,
    transferred: &mut usize,
    wait_all: bool,
) -> Status {
    let n = libc::read(
        fd,
        buf.add(*transferred) as *mut libc::c_void,
        len - *transferred,
    );
    if n > 0 {
        *transferred += n as usize;
        if wait_all && *transferred < len {
            Status::Pending
        } else {
            Status::Success
        }
    } else if n == 0 {
        if len - *transferred > 0 {
            Status::Disconnected
        } else {
            Status::Success
        }
    } else {
        match last_errno() {
            libc::EAGAIN | libc::EWOULDBLOCK => Status::Pending,
            libc::ECONNRESET => Status::Disconnected,
            _ => Status::UnknownError,
        }
    }
}

unsafe fn sys_write(
    fd: RawFd,
    buf: *const u8,
    len: usize,
    transferred: &mut usize,
    wait_all: bool,
) -> Status {
    let n = libc::write(
        fd,
        buf.add(*transferred) as *const libc::c_void,
        len - *transferred,
    );
    if n > 0 {
        *transferred += n as usize;
        if wait_all && *transferred < len {
            Status::Pending
        } else {
            Status::Success
        }
    } else if n == 0 {
        if len - *transferred > 0 {
            Status::Disconnected
        } else {
            Status::Success
        }
    } else {
        match last_errno() {
            libc::EAGAIN | libc::EWOULDBLOCK => Status::Pending,
            libc::EPIPE | libc::ECONNRESET => Status::Disconnected,
            _ => Status::UnknownError,
        }
    }
}

unsafe fn sys_recvfrom(fd: RawFd, buf: *mut u8, len: usize) -> (Status, usize, HostAddress) {
    let mut source: libc::sockaddr_in = mem::zeroed();
    let mut addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = libc::recvfrom(
        fd,
        buf as *mut libc::c_void,
        len,
        0,
        &mut source as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut addrlen,
    );
    if n >= 0 {
        (
            Status::Success,
            n as usize,
            HostAddress::from_sockaddr_in(&source),
        )
    } else {
        let status = match last_errno() {
            libc::EAGAIN | libc::EWOULDBLOCK => Status::Pending,
            libc::ENOMEM => Status::BufferTooSmall,
            _ => Status::UnknownError,
        };
        (status, 0, unspec())
    }
}

unsafe fn sys_sendto(fd: RawFd, buf: *const u8, len: usize, dest: HostAddress) -> Status {
    let addr = dest.to_sockaddr_in();
    let n = libc::sendto(
        fd,
        buf as *const libc::c_void,
        len,
        0,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    );
    if n != -1 {
        Status::Success
    } else {
        match last_errno() {
            libc::EAGAIN | libc::EWOULDBLOCK => Status::Pending,
            _ => Status::UnknownError,
        }
    }
}

unsafe fn sys_connect_start(fd: RawFd, dest: HostAddress) -> Status {
    let addr = dest.to_sockaddr_in();
    let res = libc::connect(
        fd,
        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    );
    if res == 0 {
        Status::Success
    } else if last_errno() == libc::EINPROGRESS {
        Status::Pending
    } else {
        Status::UnknownError
    }
}

unsafe fn sys_connect_finish(fd: RawFd) -> Status {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    );
    if res == 0 && error == 0 {
        Status::Success
    } else {
        Status::UnknownError
    }
}

unsafe fn sys_accept(fd: RawFd) -> (Status, RawFd, HostAddress) {
    let mut client: libc::sockaddr_in = mem::zeroed();
    let mut addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let accepted = libc::accept4(
        fd,
        &mut client as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut addrlen,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    );
    if accepted != -1 {
        (
            Status::Success,
            accepted,
            HostAddress::from_sockaddr_in(&client),
        )
    } else {
        let status = match last_errno() {
            libc::EAGAIN | libc::EWOULDBLOCK => Status::Pending,
            _ => Status::UnknownError,
        };
        (status, -1, unspec())
    }
}

/// One I/O attempt for a queued op; the combiner's execute hook.
pub(crate) unsafe fn execute_op(op: *mut Op) -> Status {
    let fd = (*(*op).object).kind.fd();
    let wait_all = (*op).flags.contains(Flags::WAIT_ALL);
    match &mut (*op).payload {
        Payload::Connect { dest, started } => {
            if !*started {
                *started = true;
                sys_connect_start(fd, *dest)
            } else {
                sys_connect_finish(fd)
            }
        }
        Payload::Accept { accepted, peer } => {
            let (status, client, addr) = sys_accept(fd);
            if status == Status::Success {
                *accepted = client;
                *peer = addr;
            }
            status
        }
        Payload::Read {
            buf,
            len,
            transferred,
        } => sys_read(fd, *buf, *len, transferred, wait_all),
        Payload::Write {
            buf,
            len,
            transferred,
        } => sys_write(fd, *buf, *len, transferred, wait_all),
        Payload::ReadMsg {
            buf,
            len,
            transferred,
            peer,
        } => {
            let (status, n, addr) = sys_recvfrom(fd, *buf, *len);
            if status == Status::Success {
                *transferred = n;
                *peer = addr;
            }
            status
        }
        Payload::WriteMsg { buf, len, dest } => sys_sendto(fd, *buf, *len, *dest),
        Payload::UserEvent { .. } | Payload::None => Status::UnknownError,
    }
}

// ===== submission =======================================================

/// Outcome of the inline first attempt.
enum Inline {
    /// Completed synchronously; no multiplexer involvement needed.
    Done(Payload, Status),
    /// Would block: queue this payload (progress preserved) and wait for
    /// readiness.
    Queue(Payload),
}

fn inline_of(payload: Payload, status: Status) -> Inline {
    if status == Status::Pending {
        Inline::Queue(payload)
    } else {
        Inline::Done(payload, status)
    }
}

/// Core async submission; the C-side shape of `aioRead` and friends.
unsafe fn submit(
    obj: *mut Object,
    flags: Flags,
    timeout: u64,
    side: Side,
    attempt: impl FnOnce() -> Inline,
    fresh: impl FnOnce() -> Payload,
    callback: Callback,
) {
    if (*obj).tag.fetch_add(1, Ordering::AcqRel) == 0 {
        let queues = &mut *(*obj).queues.get();
        let list = match side {
            Side::Read => &mut queues.read,
            Side::Write => &mut queues.write,
        };
        if list.is_empty() {
            match attempt() {
                Inline::Done(payload, status) => {
                    let left = (*obj).tag.fetch_sub(1, Ordering::AcqRel) - 1;
                    if left != 0 {
                        combiner::run(obj, left, ptr::null_mut(), Action::None);
                    }
                    let n = context::bump_finished_sync();
                    if !flags.contains(Flags::SERIALIZED)
                        && (flags.contains(Flags::REALTIME) || n <= MAX_SYNCHRONOUS_FINISHED)
                    {
                        callback(completion_of(&payload, status));
                    } else {
                        let parked = alloc_op(obj, flags, 0, payload, Some(callback));
                        op::force_status(parked, status);
                        context::push_finished(parked);
                    }
                }
                Inline::Queue(payload) => {
                    let op = alloc_op(obj, flags, timeout, payload, Some(callback));
                    // Already attempted once; wait for readiness.
                    (*op).running = RunState::Running;
                    combiner::run(obj, 1, op, Action::Start);
                }
            }
        } else {
            let op = alloc_op(obj, flags, timeout, fresh(), Some(callback));
            combiner::arm_timeout(obj, op);
            list.push_back(op);
            let left = (*obj).tag.fetch_sub(1, Ordering::AcqRel) - 1;
            if left != 0 {
                combiner::run(obj, left, ptr::null_mut(), Action::None);
            }
        }
    } else {
        let op = alloc_op(obj, flags, timeout, fresh(), Some(callback));
        (*obj).announcements.push(op, Action::Start);
    }
    context::flush_if_user_thread();
}

struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

struct SendCo(coro::Coroutine);
unsafe impl Send for SendCo {}

fn resume_callback(co: coro::Coroutine, slot: *mut Completion) -> Callback {
    let co = SendCo(co);
    let slot = SendPtr(slot);
    Box::new(move |completion| {
        let slot = slot;
        let co = co;
        // The coroutine's stack frame is intact until it is resumed, so
        // the slot write lands before the read after `yield_now`.
        unsafe { *slot.0 = completion };
        co.0.call();
    })
}

/// Coroutine-blocking submission. Suspends the calling coroutine until the
/// operation is terminal; the combiner call is deferred to the yield
/// callback so a completion can never race the suspension.
unsafe fn co_submit(
    obj: *mut Object,
    flags: Flags,
    timeout: u64,
    side: Side,
    attempt: impl FnOnce() -> Inline,
    fresh: impl FnOnce() -> Payload,
) -> Completion {
    let co = coro::current().expect("blocking I/O helpers must run inside a coroutine");
    let mut slot = Completion {
        status: Status::Unknown,
        bytes: 0,
        peer: None,
        accepted: None,
    };

    if (*obj).tag.fetch_add(1, Ordering::AcqRel) == 0 {
        let queues = &mut *(*obj).queues.get();
        let list = match side {
            Side::Read => &mut queues.read,
            Side::Write => &mut queues.write,
        };
        if list.is_empty() {
            match attempt() {
                Inline::Done(payload, status) => {
                    let left = (*obj).tag.fetch_sub(1, Ordering::AcqRel) - 1;
                    let n = context::bump_finished_sync();
                    if left == 0 && n <= MAX_SYNCHRONOUS_FINISHED {
                        return completion_of(&payload, status);
                    }
                    // Leftover combiner work or exhausted budget: park the
                    // result and take the scenic route through the finish
                    // queue.
                    let parked =
                        alloc_op(obj, flags, 0, payload, Some(resume_callback(co, &mut slot)));
                    op::force_status(parked, status);
                    context::push_finished(parked);
                    if left != 0 {
                        let obj = SendPtr(obj);
                        coro::set_yield_callback(move || {
                            combiner::run(obj.0, left, ptr::null_mut(), Action::None)
                        });
                    }
                }
                Inline::Queue(payload) => {
                    let op = alloc_op(
                        obj,
                        flags,
                        timeout,
                        payload,
                        Some(resume_callback(co, &mut slot)),
                    );
                    (*op).running = RunState::Running;
                    let obj = SendPtr(obj);
                    let op = SendPtr(op);
                    coro::set_yield_callback(move || {
                        combiner::run(obj.0, 1, op.0, Action::Start)
                    });
                }
            }
        } else {
            let op = alloc_op(
                obj,
                flags,
                timeout,
                fresh(),
                Some(resume_callback(co, &mut slot)),
            );
            combiner::arm_timeout(obj, op);
            list.push_back(op);
            let left = (*obj).tag.fetch_sub(1, Ordering::AcqRel) - 1;
            if left != 0 {
                let obj = SendPtr(obj);
                coro::set_yield_callback(move || {
                    combiner::run(obj.0, left, ptr::null_mut(), Action::None)
                });
            }
        }
    } else {
        let op = alloc_op(
            obj,
            flags,
            timeout,
            fresh(),
            Some(resume_callback(co, &mut slot)),
        );
        (*obj).announcements.push(op, Action::Start);
    }

    coro::yield_now();
    slot
}

fn map_transfer(completion: Completion) -> Result<usize, Status> {
    if completion.status == Status::Success {
        Ok(completion.bytes)
    } else {
        Err(completion.status)
    }
}

impl AioObject {
    /// Asynchronously connect the underlying socket to `dest`.
    /// `timeout_us` of zero means no timeout.
    pub fn connect(
        self,
        dest: HostAddress,
        timeout_us: u64,
        cb: impl FnOnce(Completion) + Send + 'static,
    ) {
        let obj = self.as_ptr();
        unsafe {
            let fd = (*obj).kind.fd();
            submit(
                obj,
                Flags::NONE,
                timeout_us,
                Side::Write,
                move || {
                    let status = sys_connect_start(fd, dest);
                    inline_of(
                        Payload::Connect {
                            dest,
                            started: true,
                        },
                        status,
                    )
                },
                move || Payload::Connect {
                    dest,
                    started: false,
                },
                Box::new(cb),
            );
        }
    }

    /// Accept one connection; the completion carries the new socket and
    /// the peer address.
    pub fn accept(self, timeout_us: u64, cb: impl FnOnce(Completion) + Send + 'static) {
        let obj = self.as_ptr();
        unsafe {
            let fd = (*obj).kind.fd();
            submit(
                obj,
                Flags::NONE,
                timeout_us,
                Side::Read,
                move || {
                    let (status, accepted, peer) = sys_accept(fd);
                    inline_of(Payload::Accept { accepted, peer }, status)
                },
                move || Payload::Accept {
                    accepted: -1,
                    peer: unspec(),
                },
                Box::new(cb),
            );
        }
    }

    /// Asynchronous stream read.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and untouched until the completion callback
    /// has run; the operation holds only the raw pointer.
    pub unsafe fn read(
        self,
        buf: &mut [u8],
        flags: Flags,
        timeout_us: u64,
        cb: impl FnOnce(Completion) + Send + 'static,
    ) {
        let obj = self.as_ptr();
        let fd = (*obj).kind.fd();
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        let wait_all = flags.contains(Flags::WAIT_ALL);
        submit(
            obj,
            flags,
            timeout_us,
            Side::Read,
            move || {
                let mut transferred = 0;
                let status = sys_read(fd, ptr, len, &mut transferred, wait_all);
                inline_of(
                    Payload::Read {
                        buf: ptr,
                        len,
                        transferred,
                    },
                    status,
                )
            },
            move || Payload::Read {
                buf: ptr,
                len,
                transferred: 0,
            },
            Box::new(cb),
        );
    }

    /// Asynchronous stream write.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid until the completion callback has run.
    pub unsafe fn write(
        self,
        buf: &[u8],
        flags: Flags,
        timeout_us: u64,
        cb: impl FnOnce(Completion) + Send + 'static,
    ) {
        let obj = self.as_ptr();
        let fd = (*obj).kind.fd();
        let (ptr, len) = (buf.as_ptr(), buf.len());
        let wait_all = flags.contains(Flags::WAIT_ALL);
        submit(
            obj,
            flags,
            timeout_us,
            Side::Write,
            move || {
                let mut transferred = 0;
                let status = sys_write(fd, ptr, len, &mut transferred, wait_all);
                inline_of(
                    Payload::Write {
                        buf: ptr,
                        len,
                        transferred,
                    },
                    status,
                )
            },
            move || Payload::Write {
                buf: ptr,
                len,
                transferred: 0,
            },
            Box::new(cb),
        );
    }

    /// Asynchronous datagram receive; the completion carries the source
    /// address.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid until the completion callback has run.
    pub unsafe fn read_msg(
        self,
        buf: &mut [u8],
        flags: Flags,
        timeout_us: u64,
        cb: impl FnOnce(Completion) + Send + 'static,
    ) {
        let obj = self.as_ptr();
        let fd = (*obj).kind.fd();
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        submit(
            obj,
            flags,
            timeout_us,
            Side::Read,
            move || {
                let (status, transferred, peer) = sys_recvfrom(fd, ptr, len);
                inline_of(
                    Payload::ReadMsg {
                        buf: ptr,
                        len,
                        transferred,
                        peer,
                    },
                    status,
                )
            },
            move || Payload::ReadMsg {
                buf: ptr,
                len,
                transferred: 0,
                peer: unspec(),
            },
            Box::new(cb),
        );
    }

    /// Asynchronous datagram send to `dest`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid until the completion callback has run.
    pub unsafe fn write_msg(
        self,
        buf: &[u8],
        dest: HostAddress,
        flags: Flags,
        timeout_us: u64,
        cb: impl FnOnce(Completion) + Send + 'static,
    ) {
        let obj = self.as_ptr();
        let fd = (*obj).kind.fd();
        let (ptr, len) = (buf.as_ptr(), buf.len());
        submit(
            obj,
            flags,
            timeout_us,
            Side::Write,
            move || {
                let status = sys_sendto(fd, ptr, len, dest);
                inline_of(Payload::WriteMsg { buf: ptr, len, dest }, status)
            },
            move || Payload::WriteMsg { buf: ptr, len, dest },
            Box::new(cb),
        );
    }

    /// Cancel everything queued on this object with [`Status::Canceled`].
    /// Safe to call from any thread, concurrently.
    pub fn cancel_io(self) {
        unsafe {
            combiner::cancel_io(self.as_ptr());
            context::flush_if_user_thread();
        }
    }

    /// Tear the object down: pending operations finish with
    /// [`Status::Canceled`], then the descriptor is closed and the object
    /// freed once the last in-flight completion has drained. No operation
    /// may be submitted after this.
    pub fn delete(self) {
        unsafe {
            combiner::delete_object(self.as_ptr());
            context::flush_if_user_thread();
        }
    }

    // ----- coroutine-blocking variants ---------------------------------

    /// Connect, suspending the current coroutine until done.
    pub fn co_connect(self, dest: HostAddress, timeout_us: u64) -> Result<(), Status> {
        let obj = self.as_ptr();
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            co_submit(
                obj,
                Flags::NONE,
                timeout_us,
                Side::Write,
                move || {
                    let status = sys_connect_start(fd, dest);
                    inline_of(
                        Payload::Connect {
                            dest,
                            started: true,
                        },
                        status,
                    )
                },
                move || Payload::Connect {
                    dest,
                    started: false,
                },
            )
        };
        if completion.status == Status::Success {
            Ok(())
        } else {
            Err(completion.status)
        }
    }

    /// Accept, suspending the current coroutine until a connection
    /// arrives.
    pub fn co_accept(self, timeout_us: u64) -> Result<(RawFd, HostAddress), Status> {
        let obj = self.as_ptr();
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            co_submit(
                obj,
                Flags::NONE,
                timeout_us,
                Side::Read,
                move || {
                    let (status, accepted, peer) = sys_accept(fd);
                    inline_of(Payload::Accept { accepted, peer }, status)
                },
                move || Payload::Accept {
                    accepted: -1,
                    peer: unspec(),
                },
            )
        };
        match (completion.status, completion.accepted) {
            (Status::Success, Some(fd)) => Ok((fd, completion.peer.unwrap_or(unspec()))),
            (Status::Success, None) => Err(Status::UnknownError),
            (status, _) => Err(status),
        }
    }

    /// Read, suspending the current coroutine; returns bytes transferred.
    pub fn co_read(
        self,
        buf: &mut [u8],
        flags: Flags,
        timeout_us: u64,
    ) -> Result<usize, Status> {
        let obj = self.as_ptr();
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            let wait_all = flags.contains(Flags::WAIT_ALL);
            co_submit(
                obj,
                flags,
                timeout_us,
                Side::Read,
                move || {
                    let mut transferred = 0;
                    let status = sys_read(fd, ptr, len, &mut transferred, wait_all);
                    inline_of(
                        Payload::Read {
                            buf: ptr,
                            len,
                            transferred,
                        },
                        status,
                    )
                },
                move || Payload::Read {
                    buf: ptr,
                    len,
                    transferred: 0,
                },
            )
        };
        map_transfer(completion)
    }

    /// Write, suspending the current coroutine; returns bytes transferred.
    pub fn co_write(self, buf: &[u8], flags: Flags, timeout_us: u64) -> Result<usize, Status> {
        let obj = self.as_ptr();
        let (ptr, len) = (buf.as_ptr(), buf.len());
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            let wait_all = flags.contains(Flags::WAIT_ALL);
            co_submit(
                obj,
                flags,
                timeout_us,
                Side::Write,
                move || {
                    let mut transferred = 0;
                    let status = sys_write(fd, ptr, len, &mut transferred, wait_all);
                    inline_of(
                        Payload::Write {
                            buf: ptr,
                            len,
                            transferred,
                        },
                        status,
                    )
                },
                move || Payload::Write {
                    buf: ptr,
                    len,
                    transferred: 0,
                },
            )
        };
        map_transfer(completion)
    }

    /// Datagram receive, suspending the current coroutine; returns bytes
    /// and source.
    pub fn co_read_msg(
        self,
        buf: &mut [u8],
        flags: Flags,
        timeout_us: u64,
    ) -> Result<(usize, HostAddress), Status> {
        let obj = self.as_ptr();
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            co_submit(
                obj,
                flags,
                timeout_us,
                Side::Read,
                move || {
                    let (status, transferred, peer) = sys_recvfrom(fd, ptr, len);
                    inline_of(
                        Payload::ReadMsg {
                            buf: ptr,
                            len,
                            transferred,
                            peer,
                        },
                        status,
                    )
                },
                move || Payload::ReadMsg {
                    buf: ptr,
                    len,
                    transferred: 0,
                    peer: unspec(),
                },
            )
        };
        if completion.status == Status::Success {
            Ok((completion.bytes, completion.peer.unwrap_or(unspec())))
        } else {
            Err(completion.status)
        }
    }

    /// Datagram send, suspending the current coroutine.
    pub fn co_write_msg(
        self,
        buf: &[u8],
        dest: HostAddress,
        flags: Flags,
        timeout_us: u64,
    ) -> Result<usize, Status> {
        let obj = self.as_ptr();
        let (ptr, len) = (buf.as_ptr(), buf.len());
        let completion = unsafe {
            let fd = (*obj).kind.fd();
            co_submit(
                obj,
                flags,
                timeout_us,
                Side::Write,
                move || {
                    let status = sys_sendto(fd, ptr, len, dest);
                    inline_of(Payload::WriteMsg { buf: ptr, len, dest }, status)
                },
                move || Payload::WriteMsg { buf: ptr, len, dest },
            )
        };
        map_transfer(completion)
    }
}
