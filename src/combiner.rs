//! The combiner: serialising executor for a single I/O object.
//!
//! Whoever moves the object's state word from zero to nonzero owns the
//! object until the word settles back to zero. Everyone else publishes an
//! increment and (for op-carrying intents) pushes onto the announcement
//! queue, then returns — producers never wait. The owner drains
//! announcements, dispatches start/cancel/finish, drives the read and
//! write queues against readiness, reconciles multiplexer registration,
//! and retries exit until no new work arrived while it ran.

use std::ptr;
use std::sync::atomic::Ordering;

use log::{error, trace};

use crate::aio;
use crate::context;
use crate::object::{self, Object, Queues};
use crate::op::{self, Action, Op, RunState, Side};
use crate::status::Status;
use crate::tag::{
    self, Tag, TAG_CANCELIO, TAG_DELETE, TAG_ERROR_MASK, TAG_READ_MASK, TAG_WRITE_MASK,
};

/// Publish `increment` against `obj` and either become the combiner owner
/// or leave the intent behind for the current owner.
pub(crate) unsafe fn combiner_call(obj: *mut Object, increment: Tag, op: *mut Op, action: Action) {
    if (*obj).tag.fetch_add(increment, Ordering::AcqRel) == 0 {
        run(obj, increment, op, action);
    } else if !op.is_null() {
        (*obj).announcements.push(op, action);
    }
}

/// Cancel both queues with `Canceled`. Safe to race from any number of
/// threads; the flag is set once and consumed by whichever thread owns the
/// combiner.
pub(crate) unsafe fn cancel_io(obj: *mut Object) {
    set_flag(obj, TAG_CANCELIO);
}

/// Mark the object for deletion; the combiner cancels whatever is queued
/// and drops the owner's reference once it holds the object.
pub(crate) unsafe fn delete_object(obj: *mut Object) {
    set_flag(obj, TAG_DELETE | TAG_CANCELIO);
}

// The single-bit flags cannot go through fetch_add: two concurrent adds of
// a one-bit field would carry into the neighbouring bit.
unsafe fn set_flag(obj: *mut Object, bits: Tag) {
    let mut current = (*obj).tag.load(Ordering::Acquire);
    loop {
        if current & bits == bits {
            return;
        }
        match (*obj).tag.compare_exchange_weak(
            current,
            current | bits,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if current == 0 {
                    run(obj, bits, ptr::null_mut(), Action::None);
                }
                return;
            }
            Err(observed) => current = observed,
        }
    }
}

/// Owner-side drain loop. `tag_value` is the state-word delta the caller
/// published; `new_op` (if any) is the caller's own intent, consumed
/// directly instead of through the announcement queue so it is never
/// executed twice.
pub(crate) unsafe fn run(obj: *mut Object, tag_value: Tag, mut new_op: *mut Op, new_action: Action) {
    let has_fd = (*obj).kind.is_pollable();
    let mut current = tag_value;

    while current != 0 {
        let queues = &mut *(*obj).queues.get();
        let had_read = !queues.read.is_empty();
        let had_write = !queues.write.is_empty();

        if current & TAG_ERROR_MASK != 0 {
            // Hangup. Reads may still drain buffered data; writes cannot.
            let fd = (*obj).kind.fd();
            let mut available: libc::c_int = 0;
            if syscall!(ioctl(fd, libc::FIONREAD, &mut available as *mut libc::c_int)).is_err() {
                available = 0;
            }
            if available == 0 {
                cancel_list(obj, queues, Side::Read, Status::Disconnected);
            }
            cancel_list(obj, queues, Side::Write, Status::Disconnected);
        }

        if current & TAG_CANCELIO != 0 {
            cancel_list(obj, queues, Side::Read, Status::Canceled);
            cancel_list(obj, queues, Side::Write, Status::Canceled);
        }

        if current & TAG_DELETE != 0 {
            trace!("combiner: deleting object fd {}", (*obj).kind.fd());
            // Intents that raced the delete are cancelled here; nothing
            // may enqueue once the delete bit is up. Entries already
            // published in the counter may still be in flight, so spin for
            // at least that many.
            let pending = tag::opcount(current);
            let mut drained: Tag = 0;
            loop {
                match (*obj).announcements.pop() {
                    Some((raced, action)) => {
                        drained += 1;
                        match action {
                            Action::Start => {
                                let gen = op::generation(raced);
                                if op::set_status(raced, gen, Status::Canceled) {
                                    release_op(obj, queues, raced);
                                }
                            }
                            Action::Cancel | Action::Finish => release_op(obj, queues, raced),
                            Action::Continue | Action::None => {}
                        }
                    }
                    None if drained >= pending => break,
                    None => std::hint::spin_loop(),
                }
            }
            cancel_list(obj, queues, Side::Read, Status::Canceled);
            cancel_list(obj, queues, Side::Write, Status::Canceled);
            object::release_ref(obj);
            return;
        }

        let pending = tag::opcount(current);
        let mut enqueued: Tag = 0;
        let mut need_start = current;
        if pending != 0 {
            if !new_op.is_null() {
                process_action(obj, queues, new_op, new_action, &mut need_start);
                enqueued = 1;
                new_op = ptr::null_mut();
            } else {
                // The counter is published before the entry is pushed, so
                // briefly spin for stragglers.
                while enqueued < pending {
                    match (*obj).announcements.pop() {
                        Some((op, action)) => {
                            process_action(obj, queues, op, action, &mut need_start);
                            enqueued += 1;
                        }
                        None => std::hint::spin_loop(),
                    }
                }
            }
        }

        if need_start & TAG_READ_MASK != 0 {
            execute_list(obj, queues, Side::Read);
        }
        if need_start & TAG_WRITE_MASK != 0 {
            execute_list(obj, queues, Side::Write);
        }

        if has_fd {
            let mut need_update = false;
            let mut readable = false;
            let mut writable = false;
            if !queues.read.is_empty() {
                if !had_read || current & TAG_READ_MASK != 0 {
                    need_update = true;
                    readable = true;
                }
            } else if had_read && current & TAG_READ_MASK == 0 {
                need_update = true;
            }
            if !queues.write.is_empty() {
                if !had_write || current & TAG_WRITE_MASK != 0 {
                    // Write arming takes the whole mask.
                    readable = false;
                    writable = true;
                    need_update = true;
                }
            } else if had_write && current & TAG_WRITE_MASK == 0 {
                need_update = true;
            }
            if need_update {
                let fd = (*obj).kind.fd();
                let base = &*(*obj).base;
                if let Err(err) = base.selector().update(fd, obj as u64, readable, writable) {
                    error!("multiplexer update failed for fd {}: {}", fd, err);
                }
            }
        }

        let processed = tag::make_processed(current, enqueued);
        let prev = (*obj).tag.fetch_sub(processed, Ordering::AcqRel);
        current = prev - processed;
    }
}

unsafe fn process_action(
    obj: *mut Object,
    queues: &mut Queues,
    op: *mut Op,
    action: Action,
    need_start: &mut Tag,
) {
    match action {
        Action::Start => {
            arm_timeout(obj, op);
            let (list, mask) = match (*op).payload.side() {
                Side::Read => (&mut queues.read, TAG_READ_MASK),
                Side::Write => (&mut queues.write, TAG_WRITE_MASK),
            };
            list.push_back(op);
            // A freshly queued head gets one synchronous attempt; an op
            // that already ran once (inline fast path) waits for
            // readiness.
            if list.head == op && (*op).running == RunState::Waiting {
                *need_start |= mask;
            }
        }
        Action::Cancel | Action::Finish => {
            if action == Action::Cancel {
                (*op).running = RunState::Cancelling;
            }
            release_op(obj, queues, op);
        }
        Action::Continue => {
            let (list, mask) = match (*op).payload.side() {
                Side::Read => (&mut queues.read, TAG_READ_MASK),
                Side::Write => (&mut queues.write, TAG_WRITE_MASK),
            };
            if list.head == op {
                *need_start |= mask;
            }
        }
        Action::None => {}
    }
}

/// Drive a queue until its head blocks or it empties. Heads whose status
/// turned terminal under a racing cancel are left for the cancel's own
/// action to collect.
unsafe fn execute_list(obj: *mut Object, queues: &mut Queues, side: Side) {
    loop {
        let head = match side {
            Side::Read => queues.read.head,
            Side::Write => queues.write.head,
        };
        if head.is_null() {
            return;
        }
        (*head).running = RunState::Running;
        let status = aio::execute_op(head);
        if status == Status::Pending {
            return;
        }
        let gen = op::generation(head);
        if !op::set_status(head, gen, status) {
            return;
        }
        release_op(obj, queues, head);
    }
}

unsafe fn cancel_list(obj: *mut Object, queues: &mut Queues, side: Side, status: Status) {
    loop {
        let op = match side {
            Side::Read => queues.read.pop_front(),
            Side::Write => queues.write.pop_front(),
        };
        if op.is_null() {
            return;
        }
        let gen = op::generation(op);
        if op::set_status(op, gen, status) {
            disarm_timeout(obj, op);
            context::push_finished(op);
        }
        // Already terminal: an in-flight cancel action owns delivery.
    }
}

/// Unlink, disarm and park a finished op on this thread's finish queue.
pub(crate) unsafe fn release_op(obj: *mut Object, queues: &mut Queues, op: *mut Op) {
    if (*op).queued {
        match (*op).payload.side() {
            Side::Read => queues.read.remove(op),
            Side::Write => queues.write.remove(op),
        }
    }
    disarm_timeout(obj, op);
    context::push_finished(op);
}

/// First entry into the combiner arms the timeout: a precise backend timer
/// for realtime ops, the coarse per-loop sweep otherwise. Arming is
/// deferred until the op is reachable from the combiner so a timeout can
/// never fire for an op that is not yet queued anywhere.
pub(crate) unsafe fn arm_timeout(obj: *mut Object, op: *mut Op) {
    if (*op).timeout == 0 || (*op).deadline != 0 {
        return;
    }
    let base = &*(*obj).base;
    (*op).deadline = base.now_us() + (*op).timeout;
    if !(*op).timer.is_null() {
        base.start_op_timer(op);
    } else {
        base.timeouts().insert((*op).deadline, op, op::generation(op));
    }
}

unsafe fn disarm_timeout(obj: *mut Object, op: *mut Op) {
    if (*op).deadline != 0 && !(*op).timer.is_null() {
        (*(*obj).base).stop_op_timer(op);
    }
    (*op).deadline = 0;
}
