//! I/O object root: identity of anything the loop watches.
//!
//! The only field multiple threads mutate is the atomic state word `tag`;
//! the intrusive read/write queues are touched exclusively by the thread
//! currently owning the combiner, and the announcement queue's push side
//! is protected by a one-word spinlock. See `combiner` for the ownership
//! protocol.

use std::cell::{Cell, UnsafeCell};
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::base::LoopState;
use crate::op::{Action, Op};
use crate::tag::TAG_DELETE;

/// Intrusive doubly-linked list of operations, linked through `Op::prev`
/// and `Op::next`. Single-writer: only the combiner owner mutates it.
pub(crate) struct OpList {
    pub(crate) head: *mut Op,
    pub(crate) tail: *mut Op,
}

impl OpList {
    pub(crate) fn new() -> OpList {
        OpList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) unsafe fn push_back(&mut self, op: *mut Op) {
        debug_assert!(!(*op).queued);
        (*op).prev = self.tail;
        (*op).next = ptr::null_mut();
        if self.tail.is_null() {
            self.head = op;
        } else {
            (*self.tail).next = op;
        }
        self.tail = op;
        (*op).queued = true;
    }

    pub(crate) unsafe fn remove(&mut self, op: *mut Op) {
        if !(*op).queued {
            return;
        }
        if (*op).prev.is_null() {
            self.head = (*op).next;
        } else {
            (*(*op).prev).next = (*op).next;
        }
        if (*op).next.is_null() {
            self.tail = (*op).prev;
        } else {
            (*(*op).next).prev = (*op).prev;
        }
        (*op).prev = ptr::null_mut();
        (*op).next = ptr::null_mut();
        (*op).queued = false;
    }

    pub(crate) unsafe fn pop_front(&mut self) -> *mut Op {
        let op = self.head;
        if !op.is_null() {
            self.remove(op);
        }
        op
    }
}

pub(crate) struct Queues {
    pub(crate) read: OpList,
    pub(crate) write: OpList,
}

struct Announcement {
    op: *mut Op,
    action: Action,
    next: *mut Announcement,
}

/// Multi-producer intent list. Producers publish their entry count through
/// the object's state word *before* pushing, so the consumer may observe
/// the count early and must spin until the entry materialises.
pub(crate) struct AnnouncementQueue {
    lock: AtomicBool,
    head: Cell<*mut Announcement>,
    tail: Cell<*mut Announcement>,
}

impl AnnouncementQueue {
    fn new() -> AnnouncementQueue {
        AnnouncementQueue {
            lock: AtomicBool::new(false),
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    pub(crate) fn push(&self, op: *mut Op, action: Action) {
        let node = Box::into_raw(Box::new(Announcement {
            op,
            action,
            next: ptr::null_mut(),
        }));
        self.acquire();
        let tail = self.tail.get();
        if tail.is_null() {
            self.head.set(node);
        } else {
            unsafe { (*tail).next = node };
        }
        self.tail.set(node);
        self.release();
    }

    pub(crate) fn pop(&self) -> Option<(*mut Op, Action)> {
        self.acquire();
        let node = self.head.get();
        let result = if node.is_null() {
            None
        } else {
            let node = unsafe { Box::from_raw(node) };
            self.head.set(node.next);
            if node.next.is_null() {
                self.tail.set(ptr::null_mut());
            }
            Some((node.op, node.action))
        };
        self.release();
        result
    }
}

impl Drop for AnnouncementQueue {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Kind {
    Socket(RawFd),
    Device(RawFd),
    /// Backend timer; `op` is the single operation it drives.
    Timer {
        fd: RawFd,
        op: *mut Op,
    },
}

impl Kind {
    pub(crate) fn fd(&self) -> RawFd {
        match *self {
            Kind::Socket(fd) | Kind::Device(fd) | Kind::Timer { fd, .. } => fd,
        }
    }

    pub(crate) fn is_pollable(&self) -> bool {
        matches!(self, Kind::Socket(_) | Kind::Device(_))
    }
}

// 64-byte alignment frees the low pointer bits for timer generations (see
// `tag::ptr_encode`).
#[repr(align(64))]
pub(crate) struct Object {
    pub(crate) tag: AtomicU64,
    pub(crate) refs: AtomicU64,
    pub(crate) kind: Kind,
    pub(crate) base: Arc<LoopState>,
    pub(crate) queues: UnsafeCell<Queues>,
    pub(crate) announcements: AnnouncementQueue,
}

// The queues are combiner-owned and the announcement queue is internally
// synchronised; everything else is atomic or immutable after creation.
unsafe impl Send for Object {}
unsafe impl Sync for Object {}

impl Object {
    pub(crate) fn new_boxed(base: Arc<LoopState>, kind: Kind) -> *mut Object {
        Box::into_raw(Box::new(Object {
            tag: AtomicU64::new(0),
            refs: AtomicU64::new(1),
            kind,
            base,
            queues: UnsafeCell::new(Queues {
                read: OpList::new(),
                write: OpList::new(),
            }),
            announcements: AnnouncementQueue::new(),
        }))
    }
}

pub(crate) unsafe fn add_ref(obj: *mut Object) {
    (*obj).refs.fetch_add(1, Ordering::AcqRel);
}

/// Drop one reference; the last one out with the delete bit set runs the
/// destructor.
pub(crate) unsafe fn release_ref(obj: *mut Object) {
    if (*obj).refs.fetch_sub(1, Ordering::AcqRel) == 1
        && (*obj).tag.load(Ordering::Acquire) & TAG_DELETE != 0
    {
        destroy(obj);
    }
}

/// Deregister, close and free. Only reached once: after the combiner has
/// drained the object with the delete bit set and the last reference is
/// gone.
pub(crate) unsafe fn destroy(obj: *mut Object) {
    let boxed = Box::from_raw(obj);
    if boxed.kind.is_pollable() {
        let fd = boxed.kind.fd();
        let _ = boxed.base.selector().deregister(fd);
        let _ = syscall!(close(fd));
    }
    drop(boxed);
}

/// Handle to an I/O object registered with an [`crate::EventLoop`].
///
/// Copyable so completion callbacks can keep issuing follow-up operations;
/// the underlying object stays alive until [`AioObject::delete`] has been
/// called *and* all in-flight operations have finished. Using a handle
/// after `delete` is a contract violation.
#[derive(Debug, Clone, Copy)]
pub struct AioObject {
    ptr: NonNull<Object>,
}

unsafe impl Send for AioObject {}
unsafe impl Sync for AioObject {}

impl AioObject {
    pub(crate) fn from_ptr(ptr: *mut Object) -> AioObject {
        AioObject {
            ptr: NonNull::new(ptr).expect("null object"),
        }
    }

    pub(crate) fn as_ptr(self) -> *mut Object {
        self.ptr.as_ptr()
    }
}
