//! Hosted simulation backend
//!
//! Stands in for the machine layer when the kernel is built for a hosted
//! target (unit tests, tooling). Time does not flow on its own: tests call
//! [`advance_ticks`] to fire the registered periodic handler, and may queue
//! [`push_switch_action`] closures that run at the next context switch to
//! script what "the other task" does at a suspension point.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use super::{IrqReturn, TickHandler};

/// Opaque saved execution context (simulation: just tracks initialization).
pub struct SavedContext {
    initialized: bool,
}

impl SavedContext {
    pub(crate) const fn zeroed() -> Self {
        Self { initialized: false }
    }
}

static INTS_ENABLED: AtomicBool = AtomicBool::new(true);
static NOW: AtomicU64 = AtomicU64::new(0);
static SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);
static TICK: Mutex<Option<(TickHandler, u64)>> = Mutex::new(None);

type SwitchAction = Box<dyn FnOnce() + Send>;

/// One-shot closures popped in FIFO order, one per context switch.
static ACTIONS: Mutex<VecDeque<SwitchAction>> = Mutex::new(VecDeque::new());

pub(super) fn disable_ints() {
    INTS_ENABLED.store(false, Ordering::SeqCst);
}

pub(super) fn enable_ints() {
    INTS_ENABLED.store(true, Ordering::SeqCst);
}

pub(super) fn idle() {}

pub(super) fn current_time() -> u64 {
    NOW.load(Ordering::SeqCst)
}

pub(super) fn set_periodic_timer(handler: TickHandler, interval_ms: u64) {
    *TICK.lock() = Some((handler, interval_ms));
}

pub(super) fn task_context_init(
    ctx: &mut SavedContext,
    _stack_top: *mut u8,
    _entry: extern "C" fn() -> !,
) {
    ctx.initialized = true;
}

pub(super) unsafe fn context_switch(old: *mut SavedContext, new: *const SavedContext) {
    unsafe {
        debug_assert!(
            (*new).initialized,
            "switch to a context that was never initialized"
        );
        (*old).initialized = true;
    }
    SWITCH_COUNT.fetch_add(1, Ordering::SeqCst);

    // Run at most one scripted action per switch. The action models the
    // code the switched-to task would execute before control comes back.
    let action = ACTIONS.lock().pop_front();
    if let Some(action) = action {
        action();
    }
}

/// Whether interrupts are currently (simulated as) enabled.
pub fn ints_enabled() -> bool {
    INTS_ENABLED.load(Ordering::SeqCst)
}

/// Advance the clock tick by tick, invoking the registered periodic
/// handler for each step. Returns `Reschedule` if any step requested one.
pub fn advance_ticks(n: u64) -> IrqReturn {
    let mut ret = IrqReturn::NoReschedule;
    for _ in 0..n {
        let now = NOW.fetch_add(1, Ordering::SeqCst) + 1;
        let handler = *TICK.lock();
        if let Some((handler, _)) = handler
            && handler(now) == IrqReturn::Reschedule
        {
            ret = IrqReturn::Reschedule;
        }
    }
    ret
}

/// Interval the periodic handler was registered with, if any.
pub fn tick_interval_ms() -> Option<u64> {
    TICK.lock().map(|(_, interval)| interval)
}

/// Queue a closure to run inside the next context switch.
pub fn push_switch_action<F: FnOnce() + Send + 'static>(action: F) {
    ACTIONS.lock().push_back(Box::new(action));
}

/// Number of context switches performed since the last [`reset`].
pub fn switch_count() -> u64 {
    SWITCH_COUNT.load(Ordering::SeqCst)
}

/// Restore the backend to its boot state (test isolation).
pub fn reset() {
    NOW.store(0, Ordering::SeqCst);
    SWITCH_COUNT.store(0, Ordering::SeqCst);
    INTS_ENABLED.store(true, Ordering::SeqCst);
    *TICK.lock() = None;
    ACTIONS.lock().clear();
    super::reset_critical();
}
