//! Per-thread loop context: the finish queue, the synchronous-completion
//! budget, and the worker's loop thread id.
//!
//! Completed operations are parked here and their callbacks run in FIFO
//! order when the list is flushed: at the top of every driver iteration on
//! loop threads, or before a submitting call returns on threads that are
//! not running the loop (so a completion can never be stranded on a thread
//! with no driver).

use std::cell::Cell;
use std::ptr;

use crate::op::{self, Op};

thread_local! {
    static FINISH_HEAD: Cell<*mut Op> = Cell::new(ptr::null_mut());
    static FINISH_TAIL: Cell<*mut Op> = Cell::new(ptr::null_mut());
    static FINISHED_SYNC: Cell<u32> = Cell::new(0);
    static THREAD_ID: Cell<i64> = Cell::new(-1);
    static FLUSHING: Cell<bool> = Cell::new(false);
}

pub(crate) fn push_finished(op: *mut Op) {
    unsafe {
        (*op).prev = ptr::null_mut();
        (*op).next = ptr::null_mut();
    }
    let tail = FINISH_TAIL.with(|t| t.get());
    if tail.is_null() {
        FINISH_HEAD.with(|h| h.set(op));
    } else {
        unsafe { (*tail).next = op };
    }
    FINISH_TAIL.with(|t| t.set(op));
}

pub(crate) fn has_finished() -> bool {
    FINISH_HEAD.with(|h| !h.get().is_null())
}

/// Run the finish hooks queued so far, in order. Completions produced by
/// the callbacks themselves land on a fresh list and wait for the next
/// flush. Also opens a new synchronous-completion budget window.
pub(crate) unsafe fn flush_once() {
    FINISHED_SYNC.with(|c| c.set(0));
    let mut cur = FINISH_HEAD.with(|h| h.replace(ptr::null_mut()));
    FINISH_TAIL.with(|t| t.set(ptr::null_mut()));
    while !cur.is_null() {
        let next = (*cur).next;
        op::finish_op(cur);
        cur = next;
    }
}

/// Flush until empty; used on threads without a driver and on loop exit.
pub(crate) unsafe fn flush_all() {
    let reentered = FLUSHING.with(|f| f.replace(true));
    if reentered {
        // A callback higher up the stack is already draining.
        return;
    }
    while has_finished() {
        flush_once();
    }
    FLUSHING.with(|f| f.set(false));
}

/// Flush this thread's completions unless a driver on this thread will.
pub(crate) unsafe fn flush_if_user_thread() {
    if thread_id() < 0 {
        flush_all();
    }
}

/// Count a synchronous completion; returns the running total for this
/// budget window.
pub(crate) fn bump_finished_sync() -> u32 {
    FINISHED_SYNC.with(|c| {
        let n = c.get() + 1;
        c.set(n);
        n
    })
}

pub(crate) fn thread_id() -> i64 {
    THREAD_ID.with(|t| t.get())
}

pub(crate) fn set_thread_id(id: i64) {
    THREAD_ID.with(|t| t.set(id));
}
