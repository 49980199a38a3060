//! Priority-based scheduler
//!
//! `MAX_PRIORITY` FIFO run queues (band 0 is the highest priority) plus a
//! bitmap with bit *p* set iff band *p* is non-empty, giving cheap
//! highest-priority lookup. A band's list holds the RUNNING, READY and
//! BLOCKED tasks of that priority; blocked tasks are skipped by selection
//! and only SLEEPING/EXITED tasks leave the list.
//!
//! Placement policy lives behind the [`SchedClass`] trait so a second
//! policy (e.g. time-sliced round robin) can be swapped in without touching
//! the lifecycle code. [`FifoClass`] is the only implementation today:
//! FIFO within a band, strict priority across bands.

use alloc::collections::VecDeque;

use bitflags::bitflags;

use super::{KERNEL, MAX_PRIORITY, TaskId, TaskState, TaskTable};
use crate::arch::{self, SavedContext};
use crate::{pr_debug, printk, printkln};

bitflags! {
    /// Modifier flags for enqueue/dequeue operations. The FIFO class takes
    /// none today; the parameter is part of the class interface so other
    /// policies can define some.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u32 {}
}

/// Successor snapshot taken atomically with a dequeue.
///
/// When the current task leaves its band (sleep, exit), the task that
/// followed it is the fair next choice, but by selection time the current
/// task is no longer in the queue to anchor a scan. The snapshot records
/// the choice at removal time, tagged with the task it was computed for so
/// a later dequeue cannot be mistaken for it.
#[derive(Debug, Clone, Copy)]
struct Successor {
    of: TaskId,
    next: Option<TaskId>,
}

/// Run queue state owned by the scheduler.
pub(crate) struct RunQueue {
    queues: [VecDeque<TaskId>; MAX_PRIORITY],
    /// Bit *p* set iff `queues[p]` is non-empty.
    bitmap: u32,
    current: Option<TaskId>,
    successor: Option<Successor>,
}

impl RunQueue {
    pub(crate) const fn new() -> Self {
        Self {
            queues: [const { VecDeque::new() }; MAX_PRIORITY],
            bitmap: 0,
            current: None,
            successor: None,
        }
    }

    pub(crate) fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub(crate) fn set_current(&mut self, tid: Option<TaskId>) {
        self.current = tid;
    }

    /// Bitmap/queue agreement: bit *p* set iff band *p* non-empty.
    pub(crate) fn bitmap(&self) -> u32 {
        self.bitmap
    }

    pub(crate) fn band(&self, priority: usize) -> &VecDeque<TaskId> {
        &self.queues[priority]
    }

    fn insert_tail(&mut self, priority: usize, tid: TaskId) {
        self.queues[priority].push_back(tid);
        self.bitmap |= 1 << priority;
    }

    fn unlink(&mut self, priority: usize, tid: TaskId) -> bool {
        let queue = &mut self.queues[priority];
        let Some(pos) = queue.iter().position(|&t| t == tid) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.bitmap &= !(1 << priority);
        }
        true
    }

    /// First non-BLOCKED task in the band, front to back.
    fn first_runnable(&self, table: &TaskTable, priority: usize) -> Option<TaskId> {
        self.queues[priority]
            .iter()
            .copied()
            .find(|&tid| is_runnable(table, tid))
    }

    /// Next non-BLOCKED task after `tid` in its band, wrapping around but
    /// never yielding `tid` itself.
    fn next_runnable_after(&self, table: &TaskTable, priority: usize, tid: TaskId) -> Option<TaskId> {
        let queue = &self.queues[priority];
        let pos = queue.iter().position(|&t| t == tid)?;
        let len = queue.len();
        for step in 1..len {
            let candidate = queue[(pos + step) % len];
            if is_runnable(table, candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn is_runnable(table: &TaskTable, tid: TaskId) -> bool {
    table
        .get(tid)
        .is_some_and(|task| task.state != TaskState::Blocked)
}

/// Scheduling policy interface.
///
/// All methods run under the kernel lock; implementations mutate the run
/// queue and the `queued` membership flag together so the bitmap invariant
/// and the "at most one queue" invariant hold at every return.
pub trait SchedClass: Send + Sync {
    /// One-time policy state setup.
    fn init(&self, rq: &mut RunQueue);

    /// Insert `tid` at the tail of its priority band.
    fn enqueue_task(&self, rq: &mut RunQueue, table: &mut TaskTable, tid: TaskId, flags: QueueFlags);

    /// Remove `tid` from its band, snapshotting its successor first.
    fn dequeue_task(&self, rq: &mut RunQueue, table: &mut TaskTable, tid: TaskId, flags: QueueFlags);

    /// Choose the next task to run and mark it RUNNING.
    fn pick_next_task(&self, rq: &mut RunQueue, table: &mut TaskTable) -> Option<TaskId>;

    /// Log the runnable tasks at the current task's priority.
    fn dump(&self, rq: &RunQueue, table: &TaskTable);
}

/// Strict-priority, FIFO-within-band policy.
pub struct FifoClass;

/// The boot-time scheduling class.
pub const SCHED_CLASS_FIFO: &dyn SchedClass = &FifoClass;

impl SchedClass for FifoClass {
    fn init(&self, rq: &mut RunQueue) {
        rq.successor = None;
    }

    fn enqueue_task(
        &self,
        rq: &mut RunQueue,
        table: &mut TaskTable,
        tid: TaskId,
        _flags: QueueFlags,
    ) {
        let Some(task) = table.get_mut(tid) else {
            crate::pr_err!("sched: enqueue of unknown task {:?}", tid);
            return;
        };
        if task.queued {
            // Membership invariant violation by the caller; diagnose, don't
            // corrupt the queue.
            crate::pr_err!("sched: task '{}' already queued", task.name);
            return;
        }
        task.queued = true;
        let priority = task.priority as usize;
        rq.insert_tail(priority, tid);
    }

    fn dequeue_task(
        &self,
        rq: &mut RunQueue,
        table: &mut TaskTable,
        tid: TaskId,
        _flags: QueueFlags,
    ) {
        let Some(task) = table.get_mut(tid) else {
            return;
        };
        if !task.queued {
            return;
        }
        let priority = task.priority as usize;
        task.queued = false;

        // Snapshot the successor before unlinking; pick_next_task may need
        // it if `tid` is the task being scheduled away from.
        let next = rq.next_runnable_after(table, priority, tid);
        rq.successor = Some(Successor { of: tid, next });
        rq.unlink(priority, tid);
    }

    fn pick_next_task(&self, rq: &mut RunQueue, table: &mut TaskTable) -> Option<TaskId> {
        let current = rq.current;
        let successor = rq.successor.take();
        let current_info =
            current.and_then(|tid| table.get(tid).map(|task| (task.priority as usize, task.state)));

        let mut chosen = None;
        for priority in 0..MAX_PRIORITY {
            if rq.bitmap & (1 << priority) == 0 {
                continue;
            }

            let candidate = match (current, current_info) {
                (Some(cur), Some((cur_priority, cur_state))) if cur_priority == priority => {
                    if cur_state == TaskState::Exited || cur_state == TaskState::Sleeping {
                        // The current task already left this band; prefer
                        // the successor snapshotted at its removal.
                        let snapshot = successor
                            .filter(|s| s.of == cur)
                            .and_then(|s| s.next)
                            .filter(|&next| {
                                table.get(next).is_some_and(|t| t.queued)
                                    && is_runnable(table, next)
                            });
                        snapshot.or_else(|| rq.first_runnable(table, priority))
                    } else {
                        // Round-robin within the band; a still-runnable
                        // current task keeps the CPU when it has no peers,
                        // so a higher band never falls through to a lower
                        // one while it stays runnable.
                        rq.next_runnable_after(table, priority, cur)
                            .or_else(|| is_runnable(table, cur).then_some(cur))
                    }
                }
                _ => rq.first_runnable(table, priority),
            };

            if let Some(tid) = candidate {
                chosen = Some(tid);
                break;
            }
        }

        let tid = chosen?;
        if let Some(task) = table.get_mut(tid) {
            task.state = TaskState::Running;
        }
        rq.current = Some(tid);
        Some(tid)
    }

    fn dump(&self, rq: &RunQueue, table: &TaskTable) {
        printk!("\ntasks:");
        if let Some(current) = rq.current
            && let Some(task) = table.get(current)
        {
            for &tid in rq.band(task.priority as usize) {
                if let Some(t) = table.get(tid) {
                    printk!(" {} ", t.name);
                }
            }
        }
        printkln!();
    }
}

/// Pick the next task and hand the CPU to it.
///
/// The only place a context switch happens. Must be called with the
/// critical section held; blocking primitives call it after moving the
/// current task out of the runnable set, the idle loop calls it after
/// every interrupt wakeup.
pub fn task_schedule() {
    debug_assert!(
        arch::in_critical_section(),
        "task_schedule without critical section"
    );

    let (old_ctx, new_ctx) = {
        let mut kernel = KERNEL.lock();
        let state = &mut *kernel;
        let class = state.sched.class;

        let Some(old) = state.sched.rq.current() else {
            // Boot thread before task_create_init; nothing to switch from.
            return;
        };

        let Some(next) = class.pick_next_task(&mut state.sched.rq, &mut state.table) else {
            // Nothing runnable. With a live idle task this only happens
            // when every other task is blocked; stay on the current one.
            pr_debug!("task_schedule: no runnable task");
            return;
        };

        if next == old {
            return;
        }

        super::set_current_raw(Some(next));
        if let Some(task) = state.table.get_mut(old)
            && task.state == TaskState::Running
        {
            task.state = TaskState::Ready;
        }

        let old_ctx = match state.table.get_mut(old) {
            Some(task) => &mut task.context as *mut SavedContext,
            None => return,
        };
        let new_ctx = match state.table.get(next) {
            Some(task) => &task.context as *const SavedContext,
            None => return,
        };
        (old_ctx, new_ctx)
    };

    // Task records are boxed, so the context pointers stay valid after the
    // kernel lock drops; the critical section stays held across the switch.
    unsafe { arch::context_switch(old_ctx, new_ctx) };
}

/// Log the runnable tasks at the current priority (diagnostic only).
pub fn dump_run_queue() {
    let kernel = KERNEL.lock();
    kernel.sched.class.dump(&kernel.sched.rq, &kernel.table);
}
