//! Shared scaffolding for hosted unit tests
//!
//! Kernel state is global, so tests serialize behind one lock and reset
//! every subsystem before running. `boot_with_tester` stands up the
//! canonical two-task world most scheduling tests want: the init/idle task
//! plus a mid-priority "tester" task that the test body runs as.

use std::sync::Mutex;

use crate::task::{self, TaskId};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` with exclusive, freshly reset kernel state.
pub fn kernel_test<F: FnOnce()>(f: F) {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    reset_all();
    f();
}

fn reset_all() {
    crate::arch::sim::reset();
    crate::printk::reset();
    crate::console::reset();
    crate::cmdline::reset();
    crate::timer::reset();
    crate::workqueue::reset();
    task::reset();
}

/// Boot the scheduler with the init/idle task plus a priority-5 "tester"
/// task, and make the tester current (the test body plays its role).
/// Returns `(init, tester)`.
pub fn boot_with_tester() -> (TaskId, TaskId) {
    task::task_init();
    let init = task::task_create_init().unwrap();
    let tester = task::task_alloc("tester", 0, 5).unwrap();
    task::task_create(tester, || 0).unwrap();

    task::task_yield();
    assert_eq!(task::current_task(), Some(tester));
    (init, tester)
}
