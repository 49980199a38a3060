//! Bare-metal backend: bindings to the board support layer
//!
//! The symbols below are provided by the platform's architecture code
//! (context switch assembly, interrupt controller glue, timer driver).
//! The kernel treats the saved context as an opaque register snapshot.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::{IrqReturn, TickHandler};

/// Space reserved for the architecture's register snapshot. The layout is
/// owned entirely by the context-switch assembly.
#[repr(C, align(16))]
pub struct SavedContext {
    _opaque: [u8; 512],
}

impl SavedContext {
    pub(crate) const fn zeroed() -> Self {
        Self { _opaque: [0; 512] }
    }
}

unsafe extern "C" {
    fn arch_disable_ints();
    fn arch_enable_ints();
    fn arch_idle();
    fn arch_task_context_init(
        ctx: *mut SavedContext,
        stack_top: *mut u8,
        entry: extern "C" fn() -> !,
    );
    fn arch_context_switch(old: *mut SavedContext, new: *const SavedContext);
    fn platform_current_time() -> u64;
    fn platform_set_periodic_timer(handler: extern "C" fn(u64) -> u32, interval_ms: u64);
}

pub(super) fn disable_ints() {
    unsafe { arch_disable_ints() }
}

pub(super) fn enable_ints() {
    unsafe { arch_enable_ints() }
}

pub(super) fn idle() {
    unsafe { arch_idle() }
}

pub(super) fn current_time() -> u64 {
    unsafe { platform_current_time() }
}

static TICK_HANDLER: AtomicUsize = AtomicUsize::new(0);

extern "C" fn tick_thunk(now: u64) -> u32 {
    let raw = TICK_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let handler: TickHandler = unsafe { core::mem::transmute(raw) };
    match handler(now) {
        IrqReturn::Reschedule => 1,
        IrqReturn::NoReschedule => 0,
    }
}

pub(super) fn set_periodic_timer(handler: TickHandler, interval_ms: u64) {
    TICK_HANDLER.store(handler as usize, Ordering::Release);
    unsafe { platform_set_periodic_timer(tick_thunk, interval_ms) }
}

pub(super) fn task_context_init(
    ctx: &mut SavedContext,
    stack_top: *mut u8,
    entry: extern "C" fn() -> !,
) {
    unsafe { arch_task_context_init(ctx, stack_top, entry) }
}

pub(super) unsafe fn context_switch(old: *mut SavedContext, new: *const SavedContext) {
    unsafe { arch_context_switch(old, new) }
}
