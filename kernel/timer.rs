//! Software timer infrastructure
//!
//! A single time-ordered list of armed timers, advanced once per hardware
//! tick. Insertion is a linear sorted walk, fine for the small active-timer
//! counts this kernel sees. Callers identify timers by [`TimerHandle`]; the
//! list owns the records, so an armed timer cannot be aliased or re-armed
//! behind the list's back.
//!
//! [`timer_tick`] runs from the platform's periodic interrupt. A callback
//! that requests a reschedule short-circuits the rest of the expired list
//! for that tick: the switch it asked for takes precedence over draining.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{self, IrqReturn, IrqSpinlock};
use crate::task::{self, TaskState};
use crate::task::sched::{QueueFlags, task_schedule};

/// "Block until explicitly woken": no timer is armed.
pub const MAX_SCHEDULE_TIMEOUT: u64 = u64::MAX;

/// Identity of an armed timer; stays valid until the timer fires (oneshot)
/// or is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Handle that never names a live timer.
    pub const NULL: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Timer callback. Runs in interrupt context with the timer popped off the
/// list; the return value propagates to the interrupt epilogue.
pub type TimerFn = Box<dyn FnMut(u64) -> IrqReturn + Send>;

struct Timer {
    handle: TimerHandle,
    /// Absolute expiry in ticks.
    expires_at: u64,
    /// Re-arm interval; 0 = oneshot.
    period: u64,
    callback: TimerFn,
}

struct TimerList {
    /// Sorted ascending by `expires_at`; ties keep insertion order.
    timers: Vec<Timer>,
    /// The first tick only establishes the "now" baseline.
    ticked_once: bool,
    /// Timer currently executing its callback, and whether the callback
    /// deleted it (suppresses the periodic re-arm).
    firing: Option<(TimerHandle, bool)>,
}

static TIMERS: IrqSpinlock<TimerList> = IrqSpinlock::new(TimerList {
    timers: Vec::new(),
    ticked_once: false,
    firing: None,
});

/// Wrap-safe "a is at or after b" on the tick counter.
fn time_after_eq(a: u64, b: u64) -> bool {
    a.wrapping_sub(b) as i64 >= 0
}

fn insert_sorted(list: &mut Vec<Timer>, timer: Timer) {
    let pos = list
        .iter()
        .position(|t| t.expires_at > timer.expires_at)
        .unwrap_or(list.len());
    list.insert(pos, timer);
}

fn timer_add(delay: u64, period: u64, callback: TimerFn) -> TimerHandle {
    let handle = TimerHandle(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
    let timer = Timer {
        handle,
        expires_at: arch::current_time().wrapping_add(delay),
        period,
        callback,
    };
    let mut list = TIMERS.lock();
    insert_sorted(&mut list.timers, timer);
    handle
}

/// Arm a timer that fires once after `delay` ticks (minimum 1).
pub fn oneshot_add<F>(delay: u64, callback: F) -> TimerHandle
where
    F: FnMut(u64) -> IrqReturn + Send + 'static,
{
    timer_add(delay.max(1), 0, Box::new(callback))
}

/// Arm a timer that fires every `period` ticks (minimum 1).
pub fn periodic_add<F>(period: u64, callback: F) -> TimerHandle
where
    F: FnMut(u64) -> IrqReturn + Send + 'static,
{
    let period = period.max(1);
    timer_add(period, period, Box::new(callback))
}

/// Disarm a timer. Idempotent: deleting a fired or unknown handle is a
/// no-op returning `false`.
pub fn timer_delete(handle: TimerHandle) -> bool {
    if !handle.is_valid() {
        return false;
    }

    let mut list = TIMERS.lock();
    if let Some((firing, cancelled)) = &mut list.firing
        && *firing == handle
    {
        // Deleted from inside its own callback: the record is popped off
        // the list right now; just suppress the re-arm.
        *cancelled = true;
        return true;
    }
    if let Some(pos) = list.timers.iter().position(|t| t.handle == handle) {
        list.timers.remove(pos);
        true
    } else {
        false
    }
}

/// Number of armed timers.
pub fn timer_count() -> usize {
    TIMERS.lock().timers.len()
}

/// Advance the timer list to `now`. Called from the periodic interrupt.
///
/// Fires expired callbacks in non-decreasing expiry order. Periodic timers
/// re-arm at `now + period` before the next entry is considered. If a
/// callback requests a reschedule, the remaining expired timers wait for
/// the next tick.
pub fn timer_tick(now: u64) -> IrqReturn {
    {
        let mut list = TIMERS.lock();
        if !list.ticked_once {
            list.ticked_once = true;
            return IrqReturn::Reschedule;
        }
    }

    loop {
        // Pop one expired timer; the callback runs without the list lock
        // so it may arm or delete timers itself.
        let mut timer = {
            let mut list = TIMERS.lock();
            let expired = list
                .timers
                .first()
                .is_some_and(|t| time_after_eq(now, t.expires_at));
            if !expired {
                break;
            }
            let timer = list.timers.remove(0);
            list.firing = Some((timer.handle, false));
            timer
        };
        let ret = (timer.callback)(now);

        {
            let mut list = TIMERS.lock();
            let cancelled = matches!(list.firing.take(), Some((_, true)));
            if timer.period > 0 && !cancelled {
                timer.expires_at = now.wrapping_add(timer.period);
                insert_sorted(&mut list.timers, timer);
            }
        }

        if ret == IrqReturn::Reschedule {
            return IrqReturn::Reschedule;
        }
    }

    IrqReturn::NoReschedule
}

/// Suspend the current task for `ticks`, or until explicitly woken when
/// `ticks == MAX_SCHEDULE_TIMEOUT`. The caller has already published why
/// it is waiting (waiter entry, task state); this only leaves the CPU.
///
/// Returns `MAX_SCHEDULE_TIMEOUT` for the unbounded form and 0 after a
/// timed sleep has elapsed.
pub fn schedule_timeout(ticks: u64) -> u64 {
    if ticks != MAX_SCHEDULE_TIMEOUT {
        task::task_sleep(ticks);
        return 0;
    }

    let tid = task::current_task_id();
    let _cs = arch::enter_critical();
    {
        let mut kernel = task::KERNEL.lock();
        let state = kernel.table.get(tid).map(|t| t.state);
        match state {
            // A wake raced in between publishing the wait and getting
            // here; blocking now would lose it.
            Some(TaskState::Sleeping) | Some(TaskState::Blocked) => {
                kernel.dequeue(tid, QueueFlags::empty());
            }
            _ => return MAX_SCHEDULE_TIMEOUT,
        }
    }
    task_schedule();
    MAX_SCHEDULE_TIMEOUT
}

/// Register the tick handler with the platform's periodic timer.
pub fn timer_init() {
    arch::set_periodic_timer(timer_tick, crate::cmdline::tick_ms());
}

/// Reset timer state (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    let mut list = TIMERS.lock();
    list.timers.clear();
    list.ticked_once = false;
    list.firing = None;
}
