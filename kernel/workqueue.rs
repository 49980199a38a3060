//! Workqueue infrastructure for deferred work execution
//!
//! A workqueue owns one dedicated worker task that serializes deferred
//! callbacks: producers append [`Work`] items (directly or via a oneshot
//! timer for delayed work) and wake the worker; the worker drains the list
//! in FIFO order. Sequence counters (`insert_sequence`/`remove_sequence`)
//! let [`flush_workqueue`] wait for exactly the work that existed at call
//! time, not work queued during the flush.
//!
//! A process-wide default queue ("events", the keventd) serves callers
//! that do not need their own worker; it is created once by
//! [`init_workqueues`] and never destroyed in normal operation.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::arch::{IrqReturn, IrqSpinlock};
use crate::completion::Completion;
use crate::error::Result;
use crate::task::{self, Priority, TaskId, TaskState};
use crate::timer::{self, MAX_SCHEDULE_TIMEOUT, TimerHandle, schedule_timeout};
use crate::waitqueue::{WaitQueue, WaitQueueEntry};

/// Worker task stack size.
pub const WQ_STACK_SIZE: usize = 0x2000;

/// Worker tasks run just below the highest priority.
const WORKER_PRIORITY: Priority = 1;

// ============================================================================
// Work
// ============================================================================

/// Work item state flags
mod work_flags {
    /// Item is queued (or timer-armed) and not yet executed.
    pub const WORK_PENDING: u32 = 1 << 0;
}

/// Work callback. `FnMut`: the same item may be queued and run repeatedly.
pub type WorkFn = Box<dyn FnMut() + Send + 'static>;

/// A deferred callback, queueable on a [`Workqueue`].
///
/// The pending flag makes queueing idempotent: a work item sits in at most
/// one queue at a time, and re-queueing while pending is a no-op. The flag
/// clears just before the callback runs, so the callback itself may
/// re-queue the item.
pub struct Work {
    state: AtomicU32,
    func: Mutex<WorkFn>,
}

impl Work {
    pub fn new<F: FnMut() + Send + 'static>(func: F) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU32::new(0),
            func: Mutex::new(Box::new(func)),
        })
    }

    /// Whether the item is queued or timer-armed.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) & work_flags::WORK_PENDING != 0
    }

    fn try_set_pending(&self) -> bool {
        let prev = self
            .state
            .fetch_or(work_flags::WORK_PENDING, Ordering::AcqRel);
        prev & work_flags::WORK_PENDING == 0
    }

    fn clear_pending(&self) {
        self.state
            .fetch_and(!work_flags::WORK_PENDING, Ordering::Release);
    }

    fn execute(&self) {
        // Clear before running so the callback may re-queue this item.
        self.clear_pending();
        let mut func = self.func.lock();
        (*func)();
    }
}

/// A [`Work`] paired with a oneshot timer for delayed queueing.
pub struct DelayedWork {
    work: Arc<Work>,
    timer: Mutex<TimerHandle>,
}

impl DelayedWork {
    pub fn new<F: FnMut() + Send + 'static>(func: F) -> Arc<Self> {
        Arc::new(Self {
            work: Work::new(func),
            timer: Mutex::new(TimerHandle::NULL),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.work.is_pending()
    }

    /// The underlying work item (e.g. for a direct `queue_work`).
    pub fn work(&self) -> &Arc<Work> {
        &self.work
    }
}

/// Cancel a delayed work's timer before it fires. Returns whether a timer
/// was disarmed; on success the item may be queued again.
pub fn cancel_delayed_work(dwork: &DelayedWork) -> bool {
    let handle = core::mem::replace(&mut *dwork.timer.lock(), TimerHandle::NULL);
    if timer::timer_delete(handle) {
        dwork.work.clear_pending();
        true
    } else {
        false
    }
}

// ============================================================================
// Workqueue
// ============================================================================

struct WorkqueueInner {
    worklist: VecDeque<Arc<Work>>,
    /// Items ever queued.
    insert_sequence: u64,
    /// Items fully executed. Invariant: `remove_sequence <= insert_sequence`.
    remove_sequence: u64,
    worker: Option<TaskId>,
    stopping: bool,
}

/// A queue of deferred work with one worker task.
pub struct Workqueue {
    name: String,
    inner: IrqSpinlock<WorkqueueInner>,
    /// Worker parks here while the list is empty.
    more_work: WaitQueue,
    /// Flushers park here; woken per completed item.
    work_done: WaitQueue,
    /// Signalled once the worker loop has fully wound down.
    exit: Completion,
}

impl Workqueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observed sequence counters `(inserted, completed)`.
    pub fn sequences(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.insert_sequence, inner.remove_sequence)
    }
}

/// Create a workqueue and start its worker task.
pub fn create_workqueue(name: &str) -> Result<Arc<Workqueue>> {
    let wq = Arc::new(Workqueue {
        name: String::from(name),
        inner: IrqSpinlock::new(WorkqueueInner {
            worklist: VecDeque::new(),
            insert_sequence: 0,
            remove_sequence: 0,
            worker: None,
            stopping: false,
        }),
        more_work: WaitQueue::new(),
        work_done: WaitQueue::new(),
        exit: Completion::new(),
    });

    let tid = task::task_alloc(name, WQ_STACK_SIZE, WORKER_PRIORITY)?;
    let worker_wq = wq.clone();
    if let Err(err) = task::task_create(tid, move || {
        worker_main(&worker_wq);
        0
    }) {
        let _ = task::task_free(tid);
        return Err(err);
    }
    wq.inner.lock().worker = Some(tid);
    Ok(wq)
}

/// Worker task body: drain the list, sleep when it is empty, wind down
/// when the queue is being destroyed.
fn worker_main(wq: &Workqueue) {
    let tid = task::current_task_id();
    let entry = WaitQueueEntry::new(tid);

    loop {
        wq.more_work.add(&entry);

        if wq.inner.lock().stopping {
            wq.more_work.remove(&entry);
            break;
        }

        if wq.inner.lock().worklist.is_empty() {
            task::set_task_state(tid, TaskState::Sleeping);
            schedule_timeout(MAX_SCHEDULE_TIMEOUT);
        }
        wq.more_work.remove(&entry);

        run_workqueue(wq);
    }

    wq.exit.complete();
}

/// Execute every queued item, bumping `remove_sequence` and waking
/// flushers per item.
fn run_workqueue(wq: &Workqueue) {
    loop {
        let work = wq.inner.lock().worklist.pop_front();
        let Some(work) = work else { break };

        work.execute();

        wq.inner.lock().remove_sequence += 1;
        wq.work_done.wake(1);
    }
}

/// Queue a work item for execution. Returns `false` if it was already
/// pending.
pub fn queue_work(wq: &Workqueue, work: &Arc<Work>) -> bool {
    if !work.try_set_pending() {
        return false;
    }
    {
        let mut inner = wq.inner.lock();
        inner.worklist.push_back(work.clone());
        inner.insert_sequence += 1;
    }
    wq.more_work.wake(1);
    true
}

/// Queue a work item after `delay` ticks, via a oneshot timer whose
/// callback performs the append. Returns `false` if already pending.
pub fn queue_delayed_work(wq: &Arc<Workqueue>, dwork: &Arc<DelayedWork>, delay: u64) -> bool {
    if !dwork.work.try_set_pending() {
        return false;
    }

    let wq = wq.clone();
    let work = dwork.work.clone();
    let handle = timer::oneshot_add(delay, move |_now| {
        {
            let mut inner = wq.inner.lock();
            inner.worklist.push_back(work.clone());
            inner.insert_sequence += 1;
        }
        wq.more_work.wake(1);
        IrqReturn::Reschedule
    });
    *dwork.timer.lock() = handle;
    true
}

/// Wait until every item queued before this call has executed. Items
/// queued concurrently (including from running callbacks) are not waited
/// for.
pub fn flush_workqueue(wq: &Workqueue) {
    let tid = task::current_task_id();
    let entry = WaitQueueEntry::new(tid);
    let sequence_needed = wq.inner.lock().insert_sequence;

    loop {
        {
            let inner = wq.inner.lock();
            if inner.remove_sequence >= sequence_needed {
                break;
            }
        }
        wq.work_done.add(&entry);
        task::set_task_state(tid, TaskState::Sleeping);
        schedule_timeout(MAX_SCHEDULE_TIMEOUT);
        wq.work_done.remove(&entry);
    }
    wq.work_done.remove(&entry);
}

/// Flush, stop the worker, wait for it to wind down, release its record.
pub fn destroy_workqueue(wq: Arc<Workqueue>) {
    flush_workqueue(&wq);

    let worker = {
        let mut inner = wq.inner.lock();
        inner.stopping = true;
        inner.worker.take()
    };
    wq.more_work.wake(1);
    wq.exit.wait();

    if let Some(tid) = worker {
        // The worker exits right after completing `exit`; by the time the
        // completion wake reaches us it has left the CPU for good. A
        // record still mid-exit stays allocated.
        if task::task_free(tid).is_err() {
            crate::pr_debug!("destroy_workqueue: worker '{}' not yet reaped", wq.name());
        }
    }
}

// ============================================================================
// Default workqueue (keventd)
// ============================================================================

static KEVENTD: Mutex<Option<Arc<Workqueue>>> = Mutex::new(None);

/// Create the process-wide "events" queue. Called once at boot.
pub fn init_workqueues() -> Result<()> {
    let wq = create_workqueue("events")?;
    *KEVENTD.lock() = Some(wq);
    Ok(())
}

fn keventd() -> Arc<Workqueue> {
    KEVENTD
        .lock()
        .clone()
        .expect("workqueues not initialized; init_workqueues not called")
}

/// Queue onto the default workqueue.
pub fn schedule_work(work: &Arc<Work>) -> bool {
    queue_work(&keventd(), work)
}

/// Delayed queue onto the default workqueue.
pub fn schedule_delayed_work(dwork: &Arc<DelayedWork>, delay: u64) -> bool {
    queue_delayed_work(&keventd(), dwork, delay)
}

/// Flush the default workqueue.
pub fn flush_scheduled_work() {
    flush_workqueue(&keventd());
}

/// Whether the calling task is the default queue's worker.
pub fn current_is_keventd() -> bool {
    let Some(wq) = KEVENTD.lock().clone() else {
        return false;
    };
    let worker = wq.inner.lock().worker;
    worker.is_some() && worker == task::current_task()
}

/// Drop the default workqueue handle (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    *KEVENTD.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim;
    use crate::test_support::{boot_with_tester, kernel_test};
    use std::sync::Mutex as StdMutex;

    fn make_queue(name: &str) -> Arc<Workqueue> {
        create_workqueue(name).unwrap()
    }

    #[test]
    fn queue_work_is_idempotent_while_pending() {
        kernel_test(|| {
            boot_with_tester();
            let wq = make_queue("test");
            let work = Work::new(|| {});

            assert!(queue_work(&wq, &work));
            assert!(!queue_work(&wq, &work));
            assert_eq!(wq.sequences(), (1, 0));

            run_workqueue(&wq);
            assert_eq!(wq.sequences(), (1, 1));
            assert!(!work.is_pending());

            // Executed items can be queued again.
            assert!(queue_work(&wq, &work));
        });
    }

    #[test]
    fn items_run_in_fifo_order() {
        kernel_test(|| {
            boot_with_tester();
            let wq = make_queue("test");
            static ORDER: StdMutex<Vec<u32>> = StdMutex::new(Vec::new());
            ORDER.lock().unwrap().clear();

            for i in 0..3u32 {
                let work = Work::new(move || ORDER.lock().unwrap().push(i));
                assert!(queue_work(&wq, &work));
            }
            run_workqueue(&wq);
            assert_eq!(*ORDER.lock().unwrap(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn flush_waits_for_prior_work_only() {
        kernel_test(|| {
            boot_with_tester();
            static WQ: StdMutex<Option<Arc<Workqueue>>> = StdMutex::new(None);
            static RAN: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());
            RAN.lock().unwrap().clear();

            let wq = make_queue("test");
            *WQ.lock().unwrap() = Some(wq.clone());

            // First item re-queues a successor from inside its callback;
            // flush must wait for the first two items but not the
            // successor.
            let successor = Work::new(|| RAN.lock().unwrap().push("successor"));
            let s = successor.clone();
            let head = Work::new(move || {
                RAN.lock().unwrap().push("head");
                let wq = WQ.lock().unwrap().clone().unwrap();
                assert!(queue_work(&wq, &s));
            });
            let second = Work::new(|| RAN.lock().unwrap().push("second"));

            assert!(queue_work(&wq, &head));
            assert!(queue_work(&wq, &second));

            // The worker "runs" at our suspension point.
            let drained = wq.clone();
            sim::push_switch_action(move || {
                run_workqueue(&drained);
            });
            flush_workqueue(&wq);

            let ran = RAN.lock().unwrap().clone();
            assert!(ran.starts_with(&["head", "second"]));
            let (inserted, completed) = wq.sequences();
            assert_eq!(inserted, 3);
            assert!(completed >= 2);
        });
    }

    #[test]
    fn flush_returns_immediately_when_idle() {
        kernel_test(|| {
            boot_with_tester();
            let wq = make_queue("test");
            flush_workqueue(&wq);
            assert_eq!(wq.sequences(), (0, 0));
        });
    }

    #[test]
    fn delayed_work_queues_after_timer_fires() {
        kernel_test(|| {
            boot_with_tester();
            crate::timer::timer_init();
            let _ = sim::advance_ticks(1); // baseline

            let wq = make_queue("test");
            static HITS: StdMutex<u32> = StdMutex::new(0);
            *HITS.lock().unwrap() = 0;

            let dwork = DelayedWork::new(|| *HITS.lock().unwrap() += 1);
            assert!(queue_delayed_work(&wq, &dwork, 5));
            assert!(dwork.is_pending());
            assert!(!queue_delayed_work(&wq, &dwork, 5));

            assert_eq!(wq.sequences(), (0, 0));
            let ret = sim::advance_ticks(10);
            assert_eq!(ret, IrqReturn::Reschedule);
            assert_eq!(wq.sequences().0, 1);

            run_workqueue(&wq);
            assert_eq!(*HITS.lock().unwrap(), 1);
        });
    }

    #[test]
    fn cancel_delayed_work_disarms_the_timer() {
        kernel_test(|| {
            boot_with_tester();
            crate::timer::timer_init();
            let _ = sim::advance_ticks(1);

            let wq = make_queue("test");
            let dwork = DelayedWork::new(|| {});
            assert!(queue_delayed_work(&wq, &dwork, 5));
            assert!(cancel_delayed_work(&dwork));
            assert!(!dwork.is_pending());
            assert!(!cancel_delayed_work(&dwork));

            let _ = sim::advance_ticks(10);
            assert_eq!(wq.sequences(), (0, 0));

            // Cancelled items can be re-queued.
            assert!(queue_delayed_work(&wq, &dwork, 3));
        });
    }

    #[test]
    fn destroy_stops_the_worker() {
        kernel_test(|| {
            boot_with_tester();
            let wq = make_queue("doomed");
            let work = Work::new(|| {});
            assert!(queue_work(&wq, &work));

            // Simulate the worker: drain, then wind down when destroy
            // flips `stopping`.
            let drained = wq.clone();
            sim::push_switch_action(move || {
                run_workqueue(&drained);
            });
            let winding = wq.clone();
            sim::push_switch_action(move || {
                worker_main(&winding);
            });
            destroy_workqueue(wq);
        });
    }

    #[test]
    fn keventd_family_uses_the_default_queue() {
        kernel_test(|| {
            boot_with_tester();
            init_workqueues().unwrap();

            static HITS: StdMutex<u32> = StdMutex::new(0);
            *HITS.lock().unwrap() = 0;
            let work = Work::new(|| *HITS.lock().unwrap() += 1);
            assert!(schedule_work(&work));
            assert!(!schedule_work(&work));

            let wq = keventd();
            assert_eq!(wq.name(), "events");
            assert!(!current_is_keventd());

            let drained = wq.clone();
            sim::push_switch_action(move || {
                run_workqueue(&drained);
            });
            flush_scheduled_work();
            assert_eq!(*HITS.lock().unwrap(), 1);
        });
    }
}
