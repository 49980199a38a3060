//! Wait queue infrastructure for blocking synchronization
//!
//! A wait queue is a list of waiter entries, each backed by a task and a
//! wake callback. Tasks park an entry on the queue, publish their state and
//! suspend; wakers walk the list invoking each entry's callback (default:
//! re-ready the backing task).
//!
//! Following the usual discipline, non-exclusive waiters are inserted at
//! the head and exclusive waiters at the tail, so a `wake(1)` drains
//! every non-exclusive waiter it passes but stops after one exclusive
//! wake succeeds.
//!
//! [`WaitList`] is the lock-free-standing list for embedding under another
//! primitive's lock (Completion does this); [`WaitQueue`] wraps one in its
//! own IRQ-safe lock for standalone use.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::IrqSpinlock;
use crate::task::{self, TaskId};

/// Waiter entry flags
pub mod flags {
    /// Wake at most one waiter with this flag per requested exclusive wake.
    pub const WQ_FLAG_EXCLUSIVE: u32 = 1 << 0;
}

/// Wake callback: return `true` if the wake succeeded (counts against the
/// exclusive budget).
pub type WakeFn = fn(&WaitQueueEntry) -> bool;

/// Default wake: mark the backing task READY and re-queue it if needed.
pub fn default_wake_function(entry: &WaitQueueEntry) -> bool {
    task::wake_task(entry.task())
}

/// One waiter parked on a wait queue.
pub struct WaitQueueEntry {
    tid: TaskId,
    flags: AtomicU32,
    func: WakeFn,
}

impl WaitQueueEntry {
    /// Entry for `tid` with the default wake function.
    pub fn new(tid: TaskId) -> Arc<Self> {
        Self::with_wake_fn(tid, default_wake_function)
    }

    /// Entry with a custom wake callback.
    pub fn with_wake_fn(tid: TaskId, func: WakeFn) -> Arc<Self> {
        Arc::new(Self {
            tid,
            flags: AtomicU32::new(0),
            func,
        })
    }

    /// The task this entry parks.
    pub fn task(&self) -> TaskId {
        self.tid
    }

    fn is_exclusive(&self) -> bool {
        self.flags.load(Ordering::Acquire) & flags::WQ_FLAG_EXCLUSIVE != 0
    }
}

/// Bare waiter list, for embedding under an owning primitive's lock.
pub(crate) struct WaitList {
    waiters: VecDeque<Arc<WaitQueueEntry>>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Head-insert a non-exclusive waiter.
    pub(crate) fn add(&mut self, entry: Arc<WaitQueueEntry>) {
        entry
            .flags
            .fetch_and(!flags::WQ_FLAG_EXCLUSIVE, Ordering::Release);
        self.waiters.push_front(entry);
    }

    /// Tail-insert an exclusive waiter.
    pub(crate) fn add_exclusive(&mut self, entry: Arc<WaitQueueEntry>) {
        entry
            .flags
            .fetch_or(flags::WQ_FLAG_EXCLUSIVE, Ordering::Release);
        self.waiters.push_back(entry);
    }

    /// Unlink an entry; idempotent.
    pub(crate) fn remove(&mut self, entry: &Arc<WaitQueueEntry>) {
        if let Some(pos) = self
            .waiters
            .iter()
            .position(|e| Arc::ptr_eq(e, entry))
        {
            self.waiters.remove(pos);
        }
    }

    /// Wake waiters in list order; stop after `nr_exclusive` exclusive
    /// wakes have succeeded (0 = no limit). Returns the number woken.
    ///
    /// This is the "already locked" wake: the caller holds whatever lock
    /// protects this list.
    pub(crate) fn wake(&mut self, nr_exclusive: usize) -> usize {
        // Snapshot so callbacks may remove entries without upsetting the
        // walk.
        let snapshot: Vec<Arc<WaitQueueEntry>> = self.waiters.iter().cloned().collect();
        let mut remaining = nr_exclusive;
        let mut woken = 0;

        for entry in snapshot {
            if (entry.func)(&entry) {
                woken += 1;
                if entry.is_exclusive() && nr_exclusive > 0 {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }
        woken
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Standalone wait queue: a [`WaitList`] under its own IRQ-safe lock, so
/// wakes may come from interrupt context.
pub struct WaitQueue {
    list: IrqSpinlock<WaitList>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            list: IrqSpinlock::new(WaitList::new()),
        }
    }

    /// Park a non-exclusive waiter (head insert).
    pub fn add(&self, entry: &Arc<WaitQueueEntry>) {
        self.list.lock().add(entry.clone());
    }

    /// Park an exclusive waiter (tail insert).
    pub fn add_exclusive(&self, entry: &Arc<WaitQueueEntry>) {
        self.list.lock().add_exclusive(entry.clone());
    }

    /// Unlink a waiter; idempotent.
    pub fn remove(&self, entry: &Arc<WaitQueueEntry>) {
        self.list.lock().remove(entry);
    }

    /// Wake waiters; `nr_exclusive = 0` wakes all. Returns the number
    /// woken.
    pub fn wake(&self, nr_exclusive: usize) -> usize {
        self.list.lock().wake(nr_exclusive)
    }

    /// Wake a single exclusive waiter. Returns whether one was woken.
    pub fn wake_one(&self) -> bool {
        self.wake(1) > 0
    }

    /// Wake everyone.
    pub fn wake_all(&self) -> usize {
        self.wake(0)
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
