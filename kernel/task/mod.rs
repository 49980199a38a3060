//! Task management
//!
//! Task records live in an arena table addressed by stable [`TaskId`]
//! handles; run queues and waiter lists hold ids, never aliased links, and
//! each record's `queued` flag makes "a task is in at most one run queue"
//! checkable. All shared scheduler state sits in one [`KernelState`] behind
//! a single IRQ-safe lock; the lock plus the nestable critical section in
//! `arch` are the only mutual-exclusion mechanisms in this core.
//!
//! Lifecycle: records are created with [`task_alloc`] (identity and sizing
//! only), armed with [`task_create`] (stack + initial context, then handed
//! to the scheduler), and reclaimed with [`task_free`] once EXITED. A task
//! changes its own state only through [`task_sleep`], [`task_exit`] and
//! [`task_yield`].

pub mod sched;

use alloc::alloc::{Layout, alloc, dealloc};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::{self, IrqReturn, IrqSpinlock, SavedContext};
use crate::error::{KernelError, Result};
use crate::pr_debug;
use sched::{QueueFlags, RunQueue, SCHED_CLASS_FIFO, SchedClass};

/// Number of priority bands; 0 is the highest priority.
pub const MAX_PRIORITY: usize = 8;

/// Priority given to tasks that do not ask for one.
pub const DEFAULT_PRIORITY: u32 = (MAX_PRIORITY - 2) as u32;

/// The lowest band, reserved for the idle/init task.
pub const IDLE_PRIORITY: usize = MAX_PRIORITY - 1;

/// Stack size used when `task_alloc` is given 0.
pub const STACK_DEFAULT_SIZE: usize = 0x800;

/// Task priority: `0..MAX_PRIORITY`, lower number wins.
pub type Priority = u32;

/// Stable handle into the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u32);

impl TaskId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

const NO_TASK: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Allocated, not yet handed to the scheduler.
    Creating,
    /// Runnable, waiting in a run queue.
    Ready,
    /// Owns the CPU.
    Running,
    /// Off the run queue until a timer wake.
    Sleeping,
    /// Parked on a semaphore or wait queue; skipped by selection.
    Blocked,
    /// Terminal; record remains until freed.
    Exited,
    /// Reserved; no current policy suspends tasks.
    Suspended,
}

/// A task's routine. Runs once when the task is first scheduled; the return
/// value becomes the exit code.
pub type TaskEntry = Box<dyn FnOnce() -> i32 + Send + 'static>;

/// Owned stack region, released when the task record is freed.
struct Stack {
    ptr: NonNull<u8>,
    size: usize,
}

const STACK_ALIGN: usize = 16;

impl Stack {
    fn alloc(size: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).map_err(|_| KernelError::InvalidArgument)?;
        let ptr = unsafe { alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Self { ptr, size }),
            None => Err(KernelError::OutOfMemory),
        }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.size) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, STACK_ALIGN).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// Safety: the region is exclusively owned and only the owning task runs on it.
unsafe impl Send for Stack {}

/// One task record.
pub struct Task {
    pub name: String,
    pub priority: Priority,
    pub state: TaskState,
    stack_size: usize,
    stack: Option<Stack>,
    /// Opaque register snapshot; written by context init and every switch,
    /// never inspected here.
    pub(crate) context: SavedContext,
    entry: Option<TaskEntry>,
    /// Exit code, valid once `state == Exited`.
    pub ret: i32,
    /// Run-queue membership flag; updated together with queue mutations.
    pub(crate) queued: bool,
}

/// Arena of boxed task records with slot reuse.
///
/// Boxing keeps each record at a stable address, which the context switch
/// relies on: it dereferences raw context pointers after the kernel lock
/// has been dropped.
pub(crate) struct TaskTable {
    slots: Vec<Option<Box<Task>>>,
    free: Vec<u32>,
}

impl TaskTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, task: Task) -> Result<TaskId> {
        let boxed = try_box(task)?;
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(boxed);
            return Ok(TaskId(index));
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| KernelError::OutOfMemory)?;
        self.slots.push(Some(boxed));
        Ok(TaskId((self.slots.len() - 1) as u32))
    }

    fn remove(&mut self, tid: TaskId) -> Option<Box<Task>> {
        let slot = self.slots.get_mut(tid.index())?;
        let task = slot.take()?;
        self.free.push(tid.0);
        Some(task)
    }

    pub(crate) fn get(&self, tid: TaskId) -> Option<&Task> {
        self.slots.get(tid.index())?.as_deref()
    }

    pub(crate) fn get_mut(&mut self, tid: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(tid.index())?.as_deref_mut()
    }
}

/// Fallible boxing: task records must surface allocation failure instead
/// of aborting.
fn try_box(task: Task) -> Result<Box<Task>> {
    let layout = Layout::new::<Task>();
    let ptr = unsafe { alloc(layout) } as *mut Task;
    if ptr.is_null() {
        return Err(KernelError::OutOfMemory);
    }
    unsafe {
        ptr.write(task);
        Ok(Box::from_raw(ptr))
    }
}

/// Scheduler half of the kernel state: queue structure plus the active
/// policy.
pub(crate) struct Scheduler {
    pub(crate) rq: RunQueue,
    pub(crate) class: &'static dyn SchedClass,
}

/// All mutable scheduler/task state, behind one lock.
pub(crate) struct KernelState {
    pub(crate) table: TaskTable,
    pub(crate) sched: Scheduler,
}

impl KernelState {
    pub(crate) const fn new() -> Self {
        Self {
            table: TaskTable::new(),
            sched: Scheduler {
                rq: RunQueue::new(),
                class: SCHED_CLASS_FIFO,
            },
        }
    }

    pub(crate) fn enqueue(&mut self, tid: TaskId, flags: QueueFlags) {
        let class = self.sched.class;
        class.enqueue_task(&mut self.sched.rq, &mut self.table, tid, flags);
    }

    pub(crate) fn dequeue(&mut self, tid: TaskId, flags: QueueFlags) {
        let class = self.sched.class;
        class.dequeue_task(&mut self.sched.rq, &mut self.table, tid, flags);
    }

    pub(crate) fn set_state(&mut self, tid: TaskId, state: TaskState) {
        if let Some(task) = self.table.get_mut(tid) {
            task.state = state;
        }
    }
}

pub(crate) static KERNEL: IrqSpinlock<KernelState> = IrqSpinlock::new(KernelState::new());

/// Lock-free mirror of the current task id, for readers that must not take
/// the kernel lock.
static CURRENT: AtomicU32 = AtomicU32::new(NO_TASK);

pub(crate) fn set_current_raw(tid: Option<TaskId>) {
    CURRENT.store(tid.map_or(NO_TASK, |t| t.0), Ordering::Release);
}

/// Id of the task currently owning the CPU, if tasking is up.
pub fn current_task() -> Option<TaskId> {
    match CURRENT.load(Ordering::Acquire) {
        NO_TASK => None,
        raw => Some(TaskId(raw)),
    }
}

/// Id of the current task.
///
/// # Panics
///
/// Panics if called before `task_create_init`; blocking primitives have no
/// meaning without a current task.
pub fn current_task_id() -> TaskId {
    current_task().expect("no current task; task_create_init not called")
}

/// Initialize the scheduler with the default (FIFO) policy.
pub fn task_init() {
    set_sched_class(SCHED_CLASS_FIFO);
}

/// Install a scheduling policy and run its init hook.
pub fn set_sched_class(class: &'static dyn SchedClass) {
    let mut kernel = KERNEL.lock();
    kernel.sched.class = class;
    class.init(&mut kernel.sched.rq);
}

/// Turn the boot thread into the init/idle task.
///
/// The record has no owned stack: the boot stack is already live under our
/// feet and belongs to the platform. The init task sits alone in the lowest
/// band so there is always something runnable.
pub fn task_create_init() -> Result<TaskId> {
    let task = Task {
        name: String::from("init"),
        priority: IDLE_PRIORITY as u32,
        state: TaskState::Running,
        stack_size: STACK_DEFAULT_SIZE,
        stack: None,
        context: SavedContext::zeroed(),
        entry: None,
        ret: 0,
        queued: false,
    };

    let mut kernel = KERNEL.lock();
    let tid = kernel.table.insert(task)?;
    kernel.enqueue(tid, QueueFlags::empty());
    kernel.sched.rq.set_current(Some(tid));
    drop(kernel);

    set_current_raw(Some(tid));
    Ok(tid)
}

/// Allocate a task record: identity and sizing only, no stack yet.
///
/// `stack_size == 0` selects [`STACK_DEFAULT_SIZE`] at create time. The
/// priority is validated here and never clamped.
pub fn task_alloc(name: &str, stack_size: usize, priority: Priority) -> Result<TaskId> {
    if name.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    if priority as usize >= MAX_PRIORITY {
        return Err(KernelError::InvalidArgument);
    }

    let task = Task {
        name: String::from(name),
        priority,
        state: TaskState::Creating,
        stack_size,
        stack: None,
        context: SavedContext::zeroed(),
        entry: None,
        ret: 0,
        queued: false,
    };
    KERNEL.lock().table.insert(task)
}

/// Arm an allocated task: stack, initial context, then hand it to the
/// scheduler (CREATING → READY).
pub fn task_create<F>(tid: TaskId, entry: F) -> Result<()>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let stack_size = {
        let kernel = KERNEL.lock();
        let task = kernel.table.get(tid).ok_or(KernelError::NoProcess)?;
        if task.state != TaskState::Creating {
            return Err(KernelError::Busy);
        }
        if task.stack_size == 0 {
            STACK_DEFAULT_SIZE
        } else {
            task.stack_size
        }
    };

    let stack = Stack::alloc(stack_size)?;

    let mut kernel = KERNEL.lock();
    let Some(task) = kernel.table.get_mut(tid) else {
        return Err(KernelError::NoProcess);
    };
    task.stack_size = stack_size;
    let stack_top = stack.top();
    task.stack = Some(stack);
    task.entry = Some(Box::new(entry));
    arch::task_context_init(&mut task.context, stack_top, initial_task_func);
    task.state = TaskState::Ready;
    kernel.enqueue(tid, QueueFlags::empty());
    Ok(())
}

/// First code every new task runs.
///
/// The context built by `task_create` resumes here with the critical
/// section held (the switch that started us happened inside one); leave it
/// exactly once, run the task routine, and exit with its return value.
extern "C" fn initial_task_func() -> ! {
    arch::exit_startup_critical();

    let entry = {
        let tid = current_task_id();
        KERNEL.lock().table.get_mut(tid).and_then(|t| t.entry.take())
    };
    let ret = match entry {
        Some(entry) => entry(),
        None => 0,
    };
    task_exit(ret)
}

/// Sleep for at least `ticks` timer ticks.
///
/// Arms a oneshot timer that re-readies this task, leaves the run queue
/// and schedules. Returns after the timer has fired and the scheduler has
/// picked this task again.
pub fn task_sleep(ticks: u64) {
    let tid = current_task_id();
    let _cs = arch::enter_critical();

    crate::timer::oneshot_add(ticks, move |_now| {
        if wake_task(tid) {
            IrqReturn::Reschedule
        } else {
            IrqReturn::NoReschedule
        }
    });

    {
        let mut kernel = KERNEL.lock();
        kernel.set_state(tid, TaskState::Sleeping);
        kernel.dequeue(tid, QueueFlags::empty());
    }
    sched::task_schedule();
}

/// Terminate the current task with `code`. Never returns.
pub fn task_exit(code: i32) -> ! {
    let tid = current_task_id();
    {
        let _cs = arch::enter_critical();
        {
            let mut kernel = KERNEL.lock();
            if let Some(task) = kernel.table.get_mut(tid) {
                task.state = TaskState::Exited;
                task.ret = code;
            }
            kernel.dequeue(tid, QueueFlags::empty());
        }
        sched::task_schedule();
    }
    // The record is EXITED and off every queue; being scheduled again is a
    // scheduler bug, not a recoverable state.
    unreachable!("exited task '{:?}' resumed", tid);
}

/// Release an EXITED (or never-created) task's stack and record.
pub fn task_free(tid: TaskId) -> Result<()> {
    let mut kernel = KERNEL.lock();
    let task = kernel.table.get(tid).ok_or(KernelError::NoProcess)?;
    match task.state {
        TaskState::Ready | TaskState::Running => Err(KernelError::Busy),
        _ if task.queued => Err(KernelError::Busy),
        _ => {
            kernel.table.remove(tid);
            Ok(())
        }
    }
}

/// Voluntarily give peers at the same priority a turn.
pub fn task_yield() {
    let _cs = arch::enter_critical();
    sched::task_schedule();
}

/// The idle loop: wait for an interrupt, then reschedule.
///
/// Run by the boot thread after `task_create_init` once all boot-time
/// tasks exist.
pub fn idle_loop() -> ! {
    loop {
        let _cs = arch::enter_critical();
        arch::idle();
        sched::task_schedule();
    }
}

/// Make a sleeping/blocked task runnable again, re-queueing it if it is
/// not already in a run queue. Returns whether a task was woken.
pub(crate) fn wake_task(tid: TaskId) -> bool {
    let mut kernel = KERNEL.lock();
    let Some(task) = kernel.table.get(tid) else {
        pr_debug!("wake_task: no such task {:?}", tid);
        return false;
    };
    let (state, queued) = (task.state, task.queued);
    match state {
        TaskState::Sleeping | TaskState::Blocked => {
            kernel.set_state(tid, TaskState::Ready);
            if !queued {
                kernel.enqueue(tid, QueueFlags::empty());
            }
            true
        }
        _ => false,
    }
}

/// State flip without queue motion (semaphore wake path: blocked waiters
/// never left the run queue).
pub(crate) fn set_task_state(tid: TaskId, state: TaskState) {
    KERNEL.lock().set_state(tid, state);
}

/// Read a task's state (diagnostics and tests).
pub fn task_state(tid: TaskId) -> Option<TaskState> {
    KERNEL.lock().table.get(tid).map(|t| t.state)
}

/// Read a task's exit code once it has exited.
pub fn task_exit_code(tid: TaskId) -> Option<i32> {
    let kernel = KERNEL.lock();
    let task = kernel.table.get(tid)?;
    (task.state == TaskState::Exited).then_some(task.ret)
}

/// Reset all task state (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    *KERNEL.lock() = KernelState::new();
    set_current_raw(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{boot_with_tester, kernel_test};

    #[test]
    fn alloc_validates_arguments() {
        kernel_test(|| {
            task_init();
            assert_eq!(
                task_alloc("", 0, 1).unwrap_err(),
                KernelError::InvalidArgument
            );
            assert_eq!(
                task_alloc("t", 0, MAX_PRIORITY as u32).unwrap_err(),
                KernelError::InvalidArgument
            );
            assert!(task_alloc("t", 0, (MAX_PRIORITY - 1) as u32).is_ok());
        });
    }

    #[test]
    fn create_defaults_stack_size_and_readies() {
        kernel_test(|| {
            boot_with_tester();
            let tid = task_alloc("worker", 0, 2).unwrap();
            assert_eq!(task_state(tid), Some(TaskState::Creating));

            task_create(tid, || 7).unwrap();
            let kernel = KERNEL.lock();
            let task = kernel.table.get(tid).unwrap();
            assert_eq!(task.state, TaskState::Ready);
            assert_eq!(task.stack_size, STACK_DEFAULT_SIZE);
            assert!(task.queued);
            assert!(task.stack.is_some());
        });
    }

    #[test]
    fn create_twice_is_rejected() {
        kernel_test(|| {
            boot_with_tester();
            let tid = task_alloc("once", 0, 2).unwrap();
            task_create(tid, || 0).unwrap();
            assert_eq!(task_create(tid, || 0).unwrap_err(), KernelError::Busy);
        });
    }

    #[test]
    fn free_rejects_runnable_tasks() {
        kernel_test(|| {
            let (_, tester) = boot_with_tester();
            let tid = task_alloc("victim", 0, 2).unwrap();
            task_create(tid, || 0).unwrap();

            assert_eq!(task_free(tid).unwrap_err(), KernelError::Busy);
            assert_eq!(task_free(tester).unwrap_err(), KernelError::Busy);

            // Never-created records can be freed directly.
            let fresh = task_alloc("fresh", 0, 2).unwrap();
            assert!(task_free(fresh).is_ok());
            assert!(task_state(fresh).is_none());
        });
    }

    #[test]
    fn slots_are_reused_after_free() {
        kernel_test(|| {
            task_init();
            let a = task_alloc("a", 0, 2).unwrap();
            task_free(a).unwrap();
            let b = task_alloc("b", 0, 2).unwrap();
            assert_eq!(a, b);
        });
    }

    #[test]
    fn trampoline_runs_entry_and_exits() {
        kernel_test(|| {
            boot_with_tester();
            let tid = task_alloc("runner", 0, 2).unwrap();
            task_create(tid, || 42).unwrap();

            // Simulate the first switch into the task: the scheduler picks
            // it, and "its" first instructions run the trampoline.
            task_yield();
            assert_eq!(current_task(), Some(tid));
            // Entry + exit, as the trampoline would drive them.
            let entry = {
                let _cs = arch::enter_critical();
                KERNEL.lock().table.get_mut(tid).and_then(|t| t.entry.take())
            };
            let ret = entry.map(|f| f()).unwrap_or(0);
            {
                let _cs = arch::enter_critical();
                let mut kernel = KERNEL.lock();
                if let Some(task) = kernel.table.get_mut(tid) {
                    task.state = TaskState::Exited;
                    task.ret = ret;
                }
                kernel.dequeue(tid, QueueFlags::empty());
                drop(kernel);
                sched::task_schedule();
            }

            assert_eq!(task_exit_code(tid), Some(42));
            assert!(task_free(tid).is_ok());
        });
    }
}
