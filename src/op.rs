//! Operation root: one heap record per in-flight asynchronous operation.
//!
//! An operation's `tag` packs a monotonically increasing generation with
//! its current status (`generation << 8 | status`). Completion, timeout and
//! cancellation all race through [`set_status`]: a compare-and-swap from
//! `(generation, Pending)` to `(generation, terminal)`. Whoever wins owns
//! delivery; everybody else observes a terminal status (or a newer
//! generation, when the op was already recycled) and backs off. The
//! generation is bumped when the op returns to its pool, which is what
//! makes stale timer firings and timeout-wheel entries harmless.

use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::combiner;
use crate::flags::Flags;
use crate::object::{self, Object};
use crate::pool::PoolId;
use crate::sock::HostAddress;
use crate::status::Status;
use crate::tag::PTR_TAG_MASK;

/// Cap on completion callbacks invoked inline on the submitting thread per
/// loop iteration; everything past it goes through the finish queue.
pub(crate) const MAX_SYNCHRONOUS_FINISHED: u32 = 32;

const STATUS_BITS: u32 = 8;
const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;

/// Result of a completed operation, handed to its callback.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub status: Status,
    /// Bytes transferred; zero for connect and accept.
    pub bytes: usize,
    /// Datagram source (read_msg) or peer address (accept).
    pub peer: Option<HostAddress>,
    /// The accepted socket, for accept operations. Ownership passes to the
    /// callback.
    pub accepted: Option<RawFd>,
}

pub(crate) type Callback = Box<dyn FnOnce(Completion) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Read,
    Write,
}

/// Intent kinds travelling through an object's announcement queue.
/// Finish and Continue are only produced by completion-flavoured backends;
/// the readiness selectors drive everything through Start/Cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    Start,
    Cancel,
    #[allow(dead_code)]
    Finish,
    #[allow(dead_code)]
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Waiting,
    Running,
    Cancelling,
}

/// Per-opcode state. One variant per operation kind; execute/finish
/// dispatch on it.
pub(crate) enum Payload {
    None,
    Connect {
        dest: HostAddress,
        started: bool,
    },
    Accept {
        accepted: RawFd,
        peer: HostAddress,
    },
    Read {
        buf: *mut u8,
        len: usize,
        transferred: usize,
    },
    Write {
        buf: *const u8,
        len: usize,
        transferred: usize,
    },
    ReadMsg {
        buf: *mut u8,
        len: usize,
        transferred: usize,
        peer: HostAddress,
    },
    WriteMsg {
        buf: *const u8,
        len: usize,
        dest: HostAddress,
    },
    UserEvent {
        counter: i64,
        cb: EventCallback,
    },
}

impl Payload {
    pub(crate) fn side(&self) -> Side {
        match self {
            Payload::Connect { .. } | Payload::Write { .. } | Payload::WriteMsg { .. } => {
                Side::Write
            }
            _ => Side::Read,
        }
    }
}

pub(crate) struct Op {
    /// `generation << 8 | status`.
    pub(crate) tag: AtomicU64,
    pub(crate) pool_id: PoolId,
    // Links for the object's read/write queue, or for the per-thread
    // finish list; an op is on at most one of them at a time.
    pub(crate) prev: *mut Op,
    pub(crate) next: *mut Op,
    pub(crate) queued: bool,
    pub(crate) object: *mut Object,
    pub(crate) callback: Option<Callback>,
    pub(crate) flags: Flags,
    /// Requested timeout in µs; zero means none.
    pub(crate) timeout: u64,
    /// Absolute expiry in loop µs once armed; zero while unarmed.
    pub(crate) deadline: u64,
    /// Backend timer object, for realtime timeouts and user events.
    pub(crate) timer: *mut Object,
    pub(crate) running: RunState,
    pub(crate) payload: Payload,
}

impl Op {
    pub(crate) fn idle(pool_id: PoolId) -> Op {
        Op {
            tag: AtomicU64::new(0),
            pool_id,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            queued: false,
            object: ptr::null_mut(),
            callback: None,
            flags: Flags::NONE,
            timeout: 0,
            deadline: 0,
            timer: ptr::null_mut(),
            running: RunState::Waiting,
            payload: Payload::None,
        }
    }
}

pub(crate) unsafe fn generation(op: *const Op) -> u64 {
    (*op).tag.load(Ordering::Acquire) >> STATUS_BITS
}

pub(crate) unsafe fn status(op: *const Op) -> Status {
    Status::from_u8(((*op).tag.load(Ordering::Acquire) & STATUS_MASK) as u8)
}

/// Transition `(generation, Pending)` to `(generation, status)`. Returns
/// false when the op already completed, was cancelled, or was recycled
/// under a newer generation.
pub(crate) unsafe fn set_status(op: *const Op, generation: u64, status: Status) -> bool {
    let current = (generation << STATUS_BITS) | Status::Pending as u64;
    let next = (generation << STATUS_BITS) | status as u64;
    (*op)
        .tag
        .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Unconditional status write. Only valid while the op is owned by a
/// single thread (freshly allocated, or inside the combiner).
pub(crate) unsafe fn force_status(op: *const Op, status: Status) {
    let gen = generation(op);
    (*op)
        .tag
        .store((gen << STATUS_BITS) | status as u64, Ordering::Release);
}

/// Reconstruct a full generation from the low bits carried by a tagged
/// timer registration. A firing from a previous arming differs in those
/// bits and fails the [`set_status`] compare.
pub(crate) unsafe fn generation_with(op: *const Op, low: u64) -> u64 {
    (generation(op) & !PTR_TAG_MASK) | (low & PTR_TAG_MASK)
}

/// Cancel `op` with `status` if it is still pending under `generation`;
/// stale cancels are dropped silently.
pub(crate) unsafe fn op_cancel(op: *mut Op, generation: u64, status: Status) {
    if set_status(op, generation, status) {
        combiner::combiner_call((*op).object, 1, op, Action::Cancel);
    }
}

pub(crate) fn completion_of(payload: &Payload, status: Status) -> Completion {
    let (bytes, peer, accepted) = match payload {
        Payload::Accept { accepted, peer } => (0, Some(*peer), Some(*accepted)),
        Payload::Read { transferred, .. } | Payload::Write { transferred, .. } => {
            (*transferred, None, None)
        }
        Payload::ReadMsg {
            transferred, peer, ..
        } => (*transferred, Some(*peer), None),
        Payload::WriteMsg { len, .. } => (*len, None, None),
        _ => (0, None, None),
    };
    Completion {
        status,
        bytes,
        peer,
        accepted,
    }
}

/// Allocate and bind an operation to `obj`. Recycles from the per-loop
/// pool when possible; realtime timeouts come from the timer pool so the
/// kernel timer travels with the op.
pub(crate) unsafe fn alloc_op(
    obj: *mut Object,
    flags: Flags,
    timeout: u64,
    payload: Payload,
    callback: Option<Callback>,
) -> *mut Op {
    let state = &*(*obj).base;
    let mut pool_id = if timeout > 0 && flags.contains(Flags::REALTIME) {
        PoolId::Timer
    } else {
        PoolId::Plain
    };

    let op = match state.pool.acquire(pool_id) {
        Some(op) => op,
        None => {
            let op = Box::into_raw(Box::new(Op::idle(pool_id)));
            if pool_id == PoolId::Timer {
                match crate::base::new_timer_object(&(*obj).base, op) {
                    Ok(timer) => (*op).timer = timer,
                    Err(err) => {
                        // Fall back to the coarse timeout sweep.
                        log::error!("timer creation failed: {}", err);
                        pool_id = PoolId::Plain;
                        (*op).pool_id = pool_id;
                    }
                }
            }
            op
        }
    };

    let gen = generation(op);
    (*op)
        .tag
        .store((gen << STATUS_BITS) | Status::Pending as u64, Ordering::Release);
    (*op).prev = ptr::null_mut();
    (*op).next = ptr::null_mut();
    (*op).queued = false;
    (*op).object = obj;
    (*op).callback = callback;
    (*op).flags = flags;
    (*op).timeout = timeout;
    (*op).deadline = 0;
    (*op).running = RunState::Waiting;
    (*op).payload = payload;
    object::add_ref(obj);
    op
}

/// Return a finished op to its pool, bumping the generation so anything
/// still pointing at it (timeout entries, tagged timer registrations)
/// turns stale.
pub(crate) unsafe fn release_to_pool(op: *mut Op) {
    debug_assert!((*op).pool_id != PoolId::Unpooled);
    let state = &*(*(*op).object).base;
    let gen = generation(op);
    (*op).tag.store((gen + 1) << STATUS_BITS, Ordering::Release);
    (*op).callback = None;
    (*op).payload = Payload::None;
    (*op).queued = false;
    (*op).running = RunState::Waiting;
    (*op).deadline = 0;
    (*op).timeout = 0;
    (*op).flags = Flags::NONE;
    (*op).object = ptr::null_mut();
    state.pool.release(op);
}

/// Finish hook: deliver the callback and recycle the op. Runs on whichever
/// thread flushes the finish queue the op was parked on.
pub(crate) unsafe fn finish_op(op: *mut Op) {
    let obj = (*op).object;
    let st = status(op);
    let cb = (*op).callback.take();
    let completion = completion_of(&(*op).payload, st);
    release_to_pool(op);
    if let Some(cb) = cb {
        cb(completion);
    }
    object::release_ref(obj);
}
