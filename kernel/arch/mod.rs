//! Architecture interface for the scheduling core
//!
//! Everything machine-specific is consumed through the narrow API in this
//! module: interrupt enable/disable, the opaque saved execution context and
//! the switch between two of them, the idle instruction, and the platform
//! tick source. The kernel never inspects a [`SavedContext`]; it only hands
//! contexts to [`context_switch`].
//!
//! Two backends exist:
//! - `platform` (bare metal, `target_os = "none"`): `extern "C"` bindings
//!   implemented by the board support code.
//! - [`sim`] (hosted builds and unit tests): a deterministic in-process
//!   model with a manually advanced tick counter.
//!
//! # Critical section
//!
//! Mutual exclusion in this kernel is a single nestable interrupt-disabled
//! region: [`enter_critical`] disables interrupts on the 0→1 depth
//! transition and the returned guard re-enables them on the 1→0 transition.
//! [`IrqSpinlock`] layers a spinlock on top of it so every shared structure
//! gets guard-scoped release on all exit paths.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "none")]
mod platform;
#[cfg(target_os = "none")]
use platform as backend;

#[cfg(not(target_os = "none"))]
pub mod sim;
#[cfg(not(target_os = "none"))]
use sim as backend;

pub use backend::SavedContext;

/// Value an interrupt handler hands back to the platform epilogue.
///
/// Handlers may request a reschedule but never perform one; the switch
/// happens when control returns to a point that calls `task_schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum IrqReturn {
    /// Resume the interrupted task directly.
    NoReschedule,
    /// Run `task_schedule` before resuming.
    Reschedule,
}

/// Periodic tick callback registered with the platform timer.
pub type TickHandler = fn(now: u64) -> IrqReturn;

/// Nesting depth of the critical section. Single logical CPU: one counter.
static CRIT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Scoped handle on the kernel critical section.
///
/// Interrupts stay disabled for as long as at least one of these is alive.
/// Not `Send`: a critical section never migrates off the CPU that opened it.
pub struct CriticalSection {
    _not_send: PhantomData<*mut ()>,
}

/// Enter the critical section, disabling interrupts on first entry.
pub fn enter_critical() -> CriticalSection {
    if CRIT_DEPTH.fetch_add(1, Ordering::AcqRel) == 0 {
        backend::disable_ints();
    }
    CriticalSection {
        _not_send: PhantomData,
    }
}

/// Whether any critical section is currently open.
pub fn in_critical_section() -> bool {
    CRIT_DEPTH.load(Ordering::Acquire) > 0
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        exit_one();
    }
}

/// Leave the critical section a freshly scheduled task starts inside.
///
/// The scheduler always switches contexts with the critical section held,
/// so a task's first instruction runs with interrupts disabled and no guard
/// on its own stack. The trampoline calls this exactly once to balance it.
pub(crate) fn exit_startup_critical() {
    exit_one();
}

fn exit_one() {
    let prev = CRIT_DEPTH.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "critical section underflow");
    if prev == 1 {
        backend::enable_ints();
    }
}

/// Spinlock that holds the critical section for the guard's lifetime.
///
/// Safe to take from interrupt context; the interrupt-disable on first
/// entry means the lock can never be contended against an interrupt handler
/// on the same CPU.
pub struct IrqSpinlock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let crit = enter_critical();
        IrqSpinlockGuard {
            inner: self.inner.lock(),
            _crit: crit,
        }
    }

    /// Non-blocking acquire, for paths that run in interrupt context and
    /// must not spin on a lock the interrupted code may hold.
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let crit = enter_critical();
        match self.inner.try_lock() {
            Some(inner) => Some(IrqSpinlockGuard { inner, _crit: crit }),
            None => None,
        }
    }
}

/// Guard for [`IrqSpinlock`]. Field order matters: the spinlock is released
/// before the critical section closes.
pub struct IrqSpinlockGuard<'a, T> {
    inner: spin::MutexGuard<'a, T>,
    _crit: CriticalSection,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Wait for the next interrupt (idle loop body).
pub fn idle() {
    backend::idle();
}

/// Monotonic tick counter supplied by the platform timer driver.
pub fn current_time() -> u64 {
    backend::current_time()
}

/// Register the periodic tick callback with the platform timer.
pub fn set_periodic_timer(handler: TickHandler, interval_ms: u64) {
    backend::set_periodic_timer(handler, interval_ms);
}

/// Build the initial saved context so the task's first execution begins at
/// `entry` on the given stack.
pub(crate) fn task_context_init(
    ctx: &mut SavedContext,
    stack_top: *mut u8,
    entry: extern "C" fn() -> !,
) {
    backend::task_context_init(ctx, stack_top, entry);
}

/// Swap register sets: save into `old`, resume from `new`.
///
/// # Safety
///
/// Both pointers must refer to live task contexts, `new` must have been
/// initialized by [`task_context_init`] or a previous switch, and the
/// critical section must be held across the call.
pub(crate) unsafe fn context_switch(old: *mut SavedContext, new: *const SavedContext) {
    unsafe { backend::context_switch(old, new) }
}

/// Reset the critical-section depth (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset_critical() {
    CRIT_DEPTH.store(0, Ordering::SeqCst);
}
