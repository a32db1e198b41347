//! The event loop: backend selection, the per-thread driver, object
//! factories, timers and user events.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::combiner;
use crate::context;
use crate::object::{AioObject, Kind, Object};
use crate::op::{self, Op, Payload};
use crate::pool::{OpPool, PoolId};
use crate::status::Status;
use crate::sys::{
    self, Selector, SysEvent, WakeMsg, WAKE_CMD_EMPTY, WAKE_CMD_QUIT, WAKE_CMD_USER_EVENT,
    WAKE_MSG_SIZE,
};
use crate::tag::{self, Tag, TAG_ERROR, TAG_READ, TAG_WRITE};
use crate::timeout::TimeoutQueue;

/// Registration data for the wake channel. Object pointers are 64-byte
/// aligned, so this value can never collide with one.
const WAKE_TOKEN: u64 = 1;

/// Blocking cap for one `select` call.
const SELECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Multiplexer implementation backing a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Whatever the host does best (epoll on Linux).
    OsDefault,
    Select,
    Poll,
    EPoll,
    KQueue,
    Iocp,
}

pub(crate) struct LoopState {
    selector: Selector,
    wake_rd: File,
    wake_wr: File,
    thread_counter: AtomicU32,
    timeouts: TimeoutQueue,
    pub(crate) pool: OpPool,
    t0: Instant,
}

impl LoopState {
    pub(crate) fn selector(&self) -> &Selector {
        &self.selector
    }

    pub(crate) fn timeouts(&self) -> &TimeoutQueue {
        &self.timeouts
    }

    /// Monotonic microseconds since the loop was created.
    pub(crate) fn now_us(&self) -> u64 {
        self.t0.elapsed().as_micros() as u64
    }

    pub(crate) fn post_wake(&self, msg: WakeMsg) {
        let _ = (&self.wake_wr).write(&msg.to_bytes());
    }

    /// Arm `op`'s backend timer for a single expiry after its configured
    /// timeout.
    pub(crate) unsafe fn start_op_timer(&self, op: *mut Op) {
        self.start_timer(op, (*op).timeout, false);
    }

    pub(crate) unsafe fn start_timer(&self, op: *mut Op, us: u64, periodic: bool) {
        let timer = (*op).timer;
        debug_assert!(!timer.is_null());
        let fd = (*timer).kind.fd();
        let value = libc::timespec {
            tv_sec: (us / 1_000_000) as libc::time_t,
            tv_nsec: ((us % 1_000_000) * 1000) as libc::c_long,
        };
        let interval = if periodic {
            value
        } else {
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            }
        };
        let its = libc::itimerspec {
            it_interval: interval,
            it_value: value,
        };
        if let Err(err) = syscall!(timerfd_settime(fd, 0, &its, ptr::null_mut())) {
            error!("timerfd_settime failed for fd {}: {}", fd, err);
            return;
        }
        let data = tag::ptr_encode(timer as usize, op::generation(op));
        if let Err(err) = self.selector.update(fd, data, true, false) {
            error!("timer arm failed for fd {}: {}", fd, err);
        }
    }

    /// Disarm `op`'s backend timer and swallow any queued expirations.
    pub(crate) unsafe fn stop_op_timer(&self, op: *mut Op) {
        let timer = (*op).timer;
        if timer.is_null() {
            return;
        }
        let fd = (*timer).kind.fd();
        let its: libc::itimerspec = std::mem::zeroed();
        let _ = syscall!(timerfd_settime(fd, 0, &its, ptr::null_mut()));
        let _ = self.selector.update(fd, timer as u64, false, false);
        let mut buf = [0u8; 8];
        while libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) > 0 {}
    }
}

/// Create a backend timer object bound to `op` and register it disarmed.
pub(crate) fn new_timer_object(state: &Arc<LoopState>, op: *mut Op) -> io::Result<*mut Object> {
    let fd = syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
    ))?;
    let timer = Object::new_boxed(Arc::clone(state), Kind::Timer { fd, op });
    if let Err(err) = state.selector.register(fd, timer as u64) {
        unsafe { drop(Box::from_raw(timer)) };
        let _ = syscall!(close(fd));
        return Err(err);
    }
    Ok(timer)
}

/// Multiplexer-backed event loop. Worker threads enter with [`run`]; all
/// other methods may be called from any thread.
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    state: Arc<LoopState>,
}

impl EventLoop {
    pub fn new(method: Method) -> io::Result<EventLoop> {
        let [wake_rd, wake_wr] = sys::pipe()?;
        let selector = match method {
            Method::OsDefault => default_selector(&wake_wr)?,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Method::EPoll => Selector::epoll()?,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Method::EPoll => return Err(io::ErrorKind::Unsupported.into()),
            Method::Select | Method::Poll => Selector::poll(wake_wr.as_raw_fd()),
            Method::KQueue | Method::Iocp => return Err(io::ErrorKind::Unsupported.into()),
        };
        selector.register(wake_rd.as_raw_fd(), WAKE_TOKEN)?;
        selector.update(wake_rd.as_raw_fd(), WAKE_TOKEN, true, false)?;
        Ok(EventLoop {
            state: Arc::new(LoopState {
                selector,
                wake_rd,
                wake_wr,
                thread_counter: AtomicU32::new(0),
                timeouts: TimeoutQueue::new(),
                pool: OpPool::new(),
                t0: Instant::now(),
            }),
        })
    }

    /// Watch a socket. The loop takes over the descriptor: it is closed
    /// when the object is deleted.
    pub fn socket_io(&self, socket: RawFd) -> io::Result<AioObject> {
        self.new_io_object(Kind::Socket(socket))
    }

    /// Watch an arbitrary pollable descriptor (pipe, character device,
    /// ...).
    pub fn device_io(&self, fd: RawFd) -> io::Result<AioObject> {
        self.new_io_object(Kind::Device(fd))
    }

    fn new_io_object(&self, kind: Kind) -> io::Result<AioObject> {
        let fd = kind.fd();
        let obj = Object::new_boxed(Arc::clone(&self.state), kind);
        if let Err(err) = self.state.selector.register(fd, obj as u64) {
            unsafe { drop(Box::from_raw(obj)) };
            return Err(err);
        }
        Ok(AioObject::from_ptr(obj))
    }

    /// Create a user event firing `cb` on a loop thread, either manually
    /// through [`UserEvent::activate`] or periodically through
    /// [`UserEvent::start_timer`].
    pub fn user_event(&self, cb: impl FnMut() + Send + 'static) -> io::Result<UserEvent> {
        let op = Box::into_raw(Box::new(Op::idle(PoolId::Unpooled)));
        unsafe {
            (*op).payload = Payload::UserEvent {
                counter: 0,
                cb: Box::new(cb),
            };
        }
        match new_timer_object(&self.state, op) {
            Ok(timer) => {
                unsafe { (*op).timer = timer };
                Ok(UserEvent { op })
            }
            Err(err) => {
                unsafe { drop(Box::from_raw(op)) };
                Err(err)
            }
        }
    }

    /// Enter the loop as a worker. Returns when a quit posted through
    /// [`post_quit`] is observed by this thread.
    ///
    /// [`post_quit`]: EventLoop::post_quit
    pub fn run(&self) {
        let state = &self.state;
        let thread_id = state.thread_counter.fetch_add(1, Ordering::AcqRel) as i64;
        context::set_thread_id(thread_id);
        trace!("loop thread {} entering", thread_id);

        let mut events: Vec<SysEvent> = Vec::new();
        loop {
            unsafe { context::flush_once() };
            let timeout = if context::has_finished() {
                Duration::ZERO
            } else {
                SELECT_TIMEOUT
            };
            match state.selector.select(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("selector failure: {}", err);
                    continue;
                }
            }

            // Round-robin the coarse timeout sweep across workers.
            let now = state.now_us();
            let workers = state.thread_counter.load(Ordering::Acquire) as u64;
            if workers > 0 && (now / 1_000_000) % workers == thread_id as u64 {
                state.timeouts.sweep(now);
            }

            for i in 0..events.len() {
                let event = events[i];
                if event.data == WAKE_TOKEN {
                    if self.drain_wake() {
                        unsafe { context::flush_all() };
                        state.thread_counter.fetch_sub(1, Ordering::AcqRel);
                        context::set_thread_id(-1);
                        trace!("loop thread {} leaving", thread_id);
                        return;
                    }
                    continue;
                }
                unsafe { dispatch(state, event) };
            }
        }
    }

    /// Read wake messages until the pipe drains or a quit shows up.
    /// Returns true on quit; unconsumed messages stay behind for the other
    /// workers.
    fn drain_wake(&self) -> bool {
        let state = &self.state;
        let mut quit = false;
        let mut buf = [0u8; WAKE_MSG_SIZE];
        loop {
            match (&state.wake_rd).read(&mut buf) {
                Ok(n) if n == WAKE_MSG_SIZE => {
                    let msg = WakeMsg::from_bytes(&buf);
                    match msg.cmd {
                        WAKE_CMD_QUIT => {
                            quit = true;
                            break;
                        }
                        WAKE_CMD_USER_EVENT => unsafe {
                            fire_user_event(msg.data as *mut Op);
                        },
                        WAKE_CMD_EMPTY => {}
                        other => error!("unknown wake message {}", other),
                    }
                }
                _ => break,
            }
        }
        // Re-arm before returning so the remaining workers wake up too.
        let fd = state.wake_rd.as_raw_fd();
        if let Err(err) = state.selector.update(fd, WAKE_TOKEN, true, false) {
            error!("wake channel re-arm failed: {}", err);
        }
        quit
    }

    /// Ask every worker currently in [`run`] to leave.
    ///
    /// [`run`]: EventLoop::run
    pub fn post_quit(&self) {
        let workers = self.state.thread_counter.load(Ordering::Acquire).max(1);
        for _ in 0..workers {
            self.state.post_wake(WakeMsg {
                cmd: WAKE_CMD_QUIT,
                data: 0,
            });
        }
    }

    /// Wake every worker without any work attached; `select` returns and
    /// the loop takes a fresh iteration.
    pub fn post_empty(&self) {
        let workers = self.state.thread_counter.load(Ordering::Acquire).max(1);
        for _ in 0..workers {
            self.state.post_wake(WakeMsg {
                cmd: WAKE_CMD_EMPTY,
                data: 0,
            });
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Timer objects in the freelists keep the state alive through
        // their back-references; break that up front.
        self.state.pool.purge();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn default_selector(_wake_wr: &File) -> io::Result<Selector> {
    Selector::epoll()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn default_selector(wake_wr: &File) -> io::Result<Selector> {
    Ok(Selector::poll(wake_wr.as_raw_fd()))
}

/// Route one readiness event: timers cancel (or fire) their op, I/O
/// objects accumulate event bits and the zero-to-nonzero observer drives
/// the combiner.
unsafe fn dispatch(state: &Arc<LoopState>, event: SysEvent) {
    let (ptr_bits, low) = tag::ptr_decode(event.data);
    let obj = ptr_bits as *mut Object;
    if obj.is_null() {
        return;
    }

    if let Kind::Timer { fd, op } = (*obj).kind {
        dispatch_timer(state, obj, fd, op, low);
        return;
    }

    let mut mask: Tag = 0;
    if event.readable {
        mask |= TAG_READ;
    }
    if event.writable {
        mask |= TAG_WRITE;
    }
    if event.error {
        mask |= TAG_ERROR;
    }
    if mask == 0 {
        return;
    }
    let prev = (*obj).tag.fetch_add(mask, Ordering::AcqRel);
    if prev == 0 {
        combiner::run(obj, mask, ptr::null_mut(), op::Action::None);
    }
}

unsafe fn dispatch_timer(
    state: &Arc<LoopState>,
    timer: *mut Object,
    fd: RawFd,
    op: *mut Op,
    low: u64,
) {
    let mut buf = [0u8; 8];
    if libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) <= 0 {
        return;
    }

    if let Payload::UserEvent { counter, .. } = &mut (*op).payload {
        let mut rearm = true;
        if *counter > 0 {
            *counter -= 1;
            if *counter == 0 {
                state.stop_op_timer(op);
                rearm = false;
            }
        }
        if rearm {
            let data = tag::ptr_encode(timer as usize, op::generation(op));
            if let Err(err) = state.selector.update(fd, data, true, false) {
                error!("timer re-arm failed for fd {}: {}", fd, err);
            }
        }
        fire_user_event(op);
    } else {
        op::op_cancel(op, op::generation_with(op, low), Status::Timeout);
    }
}

unsafe fn fire_user_event(op: *mut Op) {
    if let Payload::UserEvent { cb, .. } = &mut (*op).payload {
        cb();
    }
}

/// A timer- or manually-driven event delivering its callback on a loop
/// thread.
#[derive(Debug, Clone, Copy)]
pub struct UserEvent {
    op: *mut Op,
}

unsafe impl Send for UserEvent {}
unsafe impl Sync for UserEvent {}

impl UserEvent {
    fn state(&self) -> Arc<LoopState> {
        unsafe { Arc::clone(&(*(*self.op).timer).base) }
    }

    /// Fire the callback once, on whichever loop thread picks the wakeup
    /// first.
    pub fn activate(&self) {
        self.state().post_wake(WakeMsg {
            cmd: WAKE_CMD_USER_EVENT,
            data: self.op as u64,
        });
    }

    /// Fire the callback every `period_us` microseconds. A positive
    /// `count` stops the timer after that many expirations; zero keeps it
    /// running until [`UserEvent::stop_timer`].
    pub fn start_timer(&self, period_us: u64, count: i64) {
        let state = self.state();
        unsafe {
            if let Payload::UserEvent { counter, .. } = &mut (*self.op).payload {
                *counter = count;
            }
            state.start_timer(self.op, period_us, true);
        }
    }

    pub fn stop_timer(&self) {
        let state = self.state();
        unsafe { state.stop_op_timer(self.op) };
    }

    /// Stop and free the event. The caller must make sure no activation is
    /// still in flight.
    pub fn delete(self) {
        let state = self.state();
        unsafe {
            state.stop_op_timer(self.op);
            let timer = (*self.op).timer;
            let fd = (*timer).kind.fd();
            let _ = state.selector.deregister(fd);
            let _ = syscall!(close(fd));
            drop(Box::from_raw(timer));
            drop(Box::from_raw(self.op));
        }
    }
}
