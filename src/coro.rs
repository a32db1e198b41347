//! Stackful coroutines for the blocking-style I/O helpers.
//!
//! Built on `getcontext`/`makecontext`/`swapcontext`. A coroutine is
//! resumed with [`Coroutine::call`] and gives control back with
//! [`yield_now`]; the resumer's context is saved per coroutine, so nested
//! resumption works.
//!
//! The yield callback is the piece the I/O helpers rely on: a closure
//! registered just before yielding runs on the *resumer's* stack, after
//! the switch has committed. Publishing an operation there (instead of
//! before the yield) closes the window where a completion could try to
//! resume a coroutine that has not finished suspending yet.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::{self, NonNull};

const MIN_STACK_SIZE: usize = 64 * 1024;
const STACK_ALIGN: usize = 64;

struct Inner {
    ctx: libc::ucontext_t,
    ret: libc::ucontext_t,
    stack: Vec<u8>,
    entry: Option<Box<dyn FnOnce()>>,
    started: bool,
    finished: bool,
}

thread_local! {
    static CURRENT: Cell<*mut Inner> = Cell::new(ptr::null_mut());
    static YIELD_CB: RefCell<Option<Box<dyn FnOnce()>>> = RefCell::new(None);
}

extern "C" fn trampoline() {
    let co = CURRENT.with(|c| c.get());
    unsafe {
        if let Some(entry) = (*co).entry.take() {
            entry();
        }
        (*co).finished = true;
    }
    // Returning enters `uc_link`: the saved context of whoever called us.
}

/// Handle to a stackful coroutine. Copyable; the coroutine lives until
/// [`Coroutine::delete`].
#[derive(Debug, Clone, Copy)]
pub struct Coroutine {
    inner: NonNull<Inner>,
}

impl Coroutine {
    /// Create a suspended coroutine with its own stack. `stack_size` is
    /// raised to a small minimum; the first `call` runs `entry` from the
    /// top.
    pub fn new(stack_size: usize, entry: impl FnOnce() + 'static) -> Coroutine {
        let stack_size = stack_size.max(MIN_STACK_SIZE);
        let inner = Box::new(Inner {
            ctx: unsafe { mem::zeroed() },
            ret: unsafe { mem::zeroed() },
            stack: vec![0; stack_size + STACK_ALIGN],
            entry: Some(Box::new(entry)),
            started: false,
            finished: false,
        });
        Coroutine {
            inner: NonNull::new(Box::into_raw(inner)).expect("allocation failed"),
        }
    }

    /// Resume the coroutine until it yields or finishes. Returns true once
    /// the entry function has run to completion. Any yield callback the
    /// coroutine registered runs here, on the caller's stack, before this
    /// returns.
    pub fn call(self) -> bool {
        let co = self.inner.as_ptr();
        unsafe {
            assert!(!(*co).finished, "resuming a finished coroutine");
            if !(*co).started {
                (*co).started = true;
                libc::getcontext(&mut (*co).ctx);
                let base = (*co).stack.as_mut_ptr() as usize;
                let aligned = (base + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
                (*co).ctx.uc_stack.ss_sp = aligned as *mut libc::c_void;
                (*co).ctx.uc_stack.ss_size = (*co).stack.len() - (aligned - base);
                (*co).ctx.uc_stack.ss_flags = 0;
                (*co).ctx.uc_link = &mut (*co).ret;
                libc::makecontext(&mut (*co).ctx, trampoline, 0);
            }
            let prev = CURRENT.with(|c| c.replace(co));
            libc::swapcontext(&mut (*co).ret, &(*co).ctx);
            CURRENT.with(|c| c.set(prev));
            if let Some(cb) = YIELD_CB.with(|y| y.borrow_mut().take()) {
                cb();
            }
            (*co).finished
        }
    }

    pub fn finished(self) -> bool {
        unsafe { (*self.inner.as_ptr()).finished }
    }

    /// Free the coroutine. Must not be called while it is suspended
    /// mid-operation; finish or cancel its I/O first.
    pub fn delete(self) {
        unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
    }
}

/// The coroutine currently running on this thread, if any.
pub fn current() -> Option<Coroutine> {
    let co = CURRENT.with(|c| c.get());
    NonNull::new(co).map(|inner| Coroutine { inner })
}

pub fn is_main() -> bool {
    CURRENT.with(|c| c.get()).is_null()
}

/// Suspend the current coroutine, returning control to its resumer.
pub fn yield_now() {
    let co = CURRENT.with(|c| c.get());
    assert!(!co.is_null(), "yield outside a coroutine");
    unsafe {
        libc::swapcontext(&mut (*co).ctx, &(*co).ret);
    }
}

/// Register a closure to run on the resumer's stack immediately after the
/// next [`yield_now`] suspends. Consumed once.
pub(crate) fn set_yield_callback(cb: impl FnOnce() + 'static) {
    YIELD_CB.with(|y| *y.borrow_mut() = Some(Box::new(cb)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn runs_to_completion_across_yields() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = Rc::clone(&log);
        let co = Coroutine::new(0, move || {
            inner.borrow_mut().push(1);
            yield_now();
            inner.borrow_mut().push(3);
        });

        assert!(!co.call());
        log.borrow_mut().push(2);
        assert!(co.call());
        assert!(co.finished());
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        co.delete();
    }

    #[test]
    fn yield_callback_runs_on_resumer_stack_after_switch() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let in_co = Rc::clone(&order);
        let for_cb = Rc::clone(&order);
        let co = Coroutine::new(0, move || {
            in_co.borrow_mut().push("before yield");
            set_yield_callback(move || for_cb.borrow_mut().push("callback"));
            yield_now();
            in_co.borrow_mut().push("resumed");
        });

        co.call();
        order.borrow_mut().push("after call");
        assert!(is_main());
        co.call();
        assert_eq!(
            *order.borrow(),
            vec!["before yield", "callback", "after call", "resumed"]
        );
        co.delete();
    }

    #[test]
    fn current_tracks_the_running_coroutine() {
        assert!(current().is_none());
        let co = Coroutine::new(0, || {
            assert!(current().is_some());
            assert!(!is_main());
        });
        co.call();
        assert!(current().is_none());
        co.delete();
    }
}
