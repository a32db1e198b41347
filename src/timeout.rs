//! Deadline-ordered timeout structure, one per loop.
//!
//! Entries are `(end_time, op, generation)`. Removal on completion is
//! lazy: the sweep revalidates the generation through the op's status CAS,
//! so an entry for an op that already finished (and was recycled) simply
//! fails the compare and is dropped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::op::{self, Op};
use crate::status::Status;

struct Entry {
    end_time: u64,
    op: *mut Op,
    generation: u64,
}

// The op pointer is only dereferenced through the generation-checked
// cancel path, which tolerates recycled ops.
unsafe impl Send for Entry {}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.end_time == other.end_time
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Inverted so the binary heap pops the nearest deadline first.
    fn cmp(&self, other: &Entry) -> Ordering {
        other.end_time.cmp(&self.end_time)
    }
}

pub(crate) struct TimeoutQueue {
    heap: Mutex<BinaryHeap<Entry>>,
}

impl TimeoutQueue {
    pub(crate) fn new() -> TimeoutQueue {
        TimeoutQueue {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub(crate) fn insert(&self, end_time: u64, op: *mut Op, generation: u64) {
        self.heap.lock().unwrap().push(Entry {
            end_time,
            op,
            generation,
        });
    }

    fn pop_expired(&self, now: u64) -> Vec<(*mut Op, u64)> {
        let mut heap = self.heap.lock().unwrap();
        let mut expired = Vec::new();
        while let Some(entry) = heap.peek() {
            if entry.end_time > now {
                break;
            }
            let entry = heap.pop().unwrap();
            expired.push((entry.op, entry.generation));
        }
        expired
    }

    /// Cancel every expired entry with `Timeout`. Cancellation may enter
    /// the combiner, so it runs outside the heap lock.
    pub(crate) fn sweep(&self, now: u64) {
        for (op, generation) in self.pop_expired(now) {
            unsafe { op::op_cancel(op, generation, Status::Timeout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolId;

    #[test]
    fn pops_nearest_deadline_first() {
        let queue = TimeoutQueue::new();
        let a = Box::into_raw(Box::new(Op::idle(PoolId::Plain)));
        let b = Box::into_raw(Box::new(Op::idle(PoolId::Plain)));
        let c = Box::into_raw(Box::new(Op::idle(PoolId::Plain)));
        queue.insert(300, c, 0);
        queue.insert(100, a, 0);
        queue.insert(200, b, 0);

        assert_eq!(queue.pop_expired(50), vec![]);
        assert_eq!(queue.pop_expired(150), vec![(a, 0)]);
        assert_eq!(queue.pop_expired(1000), vec![(b, 0), (c, 0)]);

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }
}
