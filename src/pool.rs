//! Per-loop freelists recycling operation records.
//!
//! Two pools: plain ops, and ops that own a backend timer. Keeping the
//! timer ops separate means a recycled realtime operation reuses its
//! kernel timer instead of creating a fresh one. Pools never migrate ops
//! between loops; whatever is free when the loop drops is freed with it.

use std::sync::Mutex;

use crate::op::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolId {
    Plain,
    Timer,
    /// Never recycled (user events own their op for life).
    Unpooled,
}

struct OpBox(*mut Op);

// Ops in the freelist are not referenced by anything else.
unsafe impl Send for OpBox {}

pub(crate) struct OpPool {
    plain: Mutex<Vec<OpBox>>,
    timer: Mutex<Vec<OpBox>>,
}

impl OpPool {
    pub(crate) fn new() -> OpPool {
        OpPool {
            plain: Mutex::new(Vec::new()),
            timer: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn acquire(&self, id: PoolId) -> Option<*mut Op> {
        let list = match id {
            PoolId::Plain => &self.plain,
            PoolId::Timer => &self.timer,
            PoolId::Unpooled => return None,
        };
        list.lock().unwrap().pop().map(|b| b.0)
    }

    pub(crate) unsafe fn release(&self, op: *mut Op) {
        let list = match (*op).pool_id {
            PoolId::Plain => &self.plain,
            PoolId::Timer => &self.timer,
            PoolId::Unpooled => unreachable!("unpooled op released"),
        };
        list.lock().unwrap().push(OpBox(op));
    }
}

impl OpPool {
    /// Free everything currently pooled. Timer objects keep the loop state
    /// alive through their back-reference, so the owning handle purges the
    /// pools on drop rather than waiting for the state's own destructor.
    pub(crate) fn purge(&self) {
        for list in [&self.plain, &self.timer] {
            for OpBox(op) in list.lock().unwrap().drain(..) {
                unsafe {
                    let timer = (*op).timer;
                    if !timer.is_null() {
                        let timer = Box::from_raw(timer);
                        let _ = syscall!(close(timer.kind.fd()));
                        drop(timer);
                    }
                    drop(Box::from_raw(op));
                }
            }
        }
    }
}

impl Drop for OpPool {
    fn drop(&mut self) {
        self.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_in_lifo_order() {
        let pool = OpPool::new();
        let a = Box::into_raw(Box::new(Op::idle(PoolId::Plain)));
        let b = Box::into_raw(Box::new(Op::idle(PoolId::Plain)));
        unsafe {
            pool.release(a);
            pool.release(b);
        }
        assert_eq!(pool.acquire(PoolId::Plain), Some(b));
        assert_eq!(pool.acquire(PoolId::Plain), Some(a));
        assert_eq!(pool.acquire(PoolId::Plain), None);
        // Hand them back so the pool frees them.
        unsafe {
            pool.release(a);
            pool.release(b);
        }
    }
}
