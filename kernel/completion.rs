//! Completion: wait for another task to finish an action
//!
//! A `done` counter with an embedded wait list under one lock. `complete`
//! banks one event and wakes one exclusive waiter; `complete_all` saturates
//! the counter so no waiter, present or future, ever blocks again
//! (shutdown signaling).

use crate::arch::IrqSpinlock;
use crate::task::{self, TaskState};
use crate::timer::{MAX_SCHEDULE_TIMEOUT, schedule_timeout};
use crate::waitqueue::{WaitList, WaitQueueEntry};

/// `complete_all` parks `done` here; large enough that decrements from
/// `wait` never drain it in practice.
const COMPLETE_ALL_SENTINEL: u32 = u32::MAX / 2;

struct CompletionInner {
    done: u32,
    waiters: WaitList,
}

/// One-shot/multi-shot event counter.
pub struct Completion {
    inner: IrqSpinlock<CompletionInner>,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(CompletionInner {
                done: 0,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Re-arm a completion for reuse. Waiters must be gone.
    pub fn reinit(&self) {
        self.inner.lock().done = 0;
    }

    /// Whether a `wait` would return without blocking.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done > 0
    }

    /// Bank one event and wake one exclusive waiter.
    pub fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.done = inner.done.saturating_add(1);
        inner.waiters.wake(1);
    }

    /// Saturate the counter and wake every waiter. After this, `wait`
    /// never blocks again.
    pub fn complete_all(&self) {
        let mut inner = self.inner.lock();
        inner.done = inner.done.saturating_add(COMPLETE_ALL_SENTINEL);
        inner.waiters.wake(0);
    }

    /// Block until an event is available, then consume it.
    pub fn wait(&self) {
        let tid = task::current_task_id();
        let entry = WaitQueueEntry::new(tid);
        {
            let mut inner = self.inner.lock();
            if inner.done > 0 {
                inner.done -= 1;
                return;
            }
            inner.waiters.add_exclusive(entry.clone());
        }

        loop {
            task::set_task_state(tid, TaskState::Sleeping);
            schedule_timeout(MAX_SCHEDULE_TIMEOUT);

            let mut inner = self.inner.lock();
            if inner.done > 0 {
                inner.done -= 1;
                inner.waiters.remove(&entry);
                return;
            }
        }
    }

    /// Bounded [`wait`](Self::wait): give up after `timeout` ticks.
    ///
    /// Returns 0 on timeout, nonzero when the completion arrived.
    pub fn wait_timeout(&self, timeout: u64) -> u64 {
        let tid = task::current_task_id();
        let entry = WaitQueueEntry::new(tid);
        {
            let mut inner = self.inner.lock();
            if inner.done > 0 {
                inner.done -= 1;
                return timeout.max(1);
            }
            if timeout == 0 {
                return 0;
            }
            inner.waiters.add_exclusive(entry.clone());
        }

        let mut remaining = timeout;
        loop {
            task::set_task_state(tid, TaskState::Sleeping);
            remaining = schedule_timeout(remaining);

            let mut inner = self.inner.lock();
            if inner.done > 0 {
                inner.done -= 1;
                inner.waiters.remove(&entry);
                return 1;
            }
            if remaining == 0 {
                inner.waiters.remove(&entry);
                return 0;
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim;
    use crate::test_support::{boot_with_tester, kernel_test};

    #[test]
    fn precompleted_wait_returns_immediately() {
        kernel_test(|| {
            boot_with_tester();
            let c = Completion::new();
            c.complete();
            assert!(c.is_done());
            c.wait();
            assert!(!c.is_done());
        });
    }

    #[test]
    fn complete_all_never_blocks_again() {
        kernel_test(|| {
            boot_with_tester();
            let c = Completion::new();
            c.complete_all();
            for _ in 0..64 {
                c.wait();
            }
            assert!(c.is_done());

            // Still immediate for bounded waits.
            assert!(c.wait_timeout(10) > 0);
        });
    }

    #[test]
    fn wait_blocks_until_complete() {
        kernel_test(|| {
            boot_with_tester();
            static DONE: Completion = Completion::new();
            DONE.reinit();

            // The completing task runs at the switch inside our suspend.
            sim::push_switch_action(|| {
                DONE.complete();
            });
            DONE.wait();
            assert!(!DONE.is_done());
        });
    }

    #[test]
    fn wait_timeout_expires_without_completion() {
        kernel_test(|| {
            boot_with_tester();
            crate::timer::timer_init();
            let _ = sim::advance_ticks(1); // baseline

            // No one completes; the armed sleep timer brings us back. The
            // sleep happens at the switch, so fire it from there.
            sim::push_switch_action(|| {
                let _ = sim::advance_ticks(20);
            });
            let c = Completion::new();
            assert_eq!(c.wait_timeout(10), 0);
        });
    }

    #[test]
    fn wait_timeout_sees_late_completion() {
        kernel_test(|| {
            boot_with_tester();
            crate::timer::timer_init();
            let _ = sim::advance_ticks(1);

            static DONE: Completion = Completion::new();
            DONE.reinit();
            sim::push_switch_action(|| {
                DONE.complete();
            });
            assert!(DONE.wait_timeout(50) > 0);
        });
    }

    #[test]
    fn reinit_rearms_after_complete_all() {
        kernel_test(|| {
            boot_with_tester();
            let c = Completion::new();
            c.complete_all();
            c.wait();
            c.reinit();
            assert!(!c.is_done());
        });
    }
}
