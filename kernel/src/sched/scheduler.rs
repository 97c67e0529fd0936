//! Core scheduler state: the task table and the tick-driven quantum logic
//! that sits on top of [`super::percpu_queue`].

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::percpu_queue::{PerCpuScheduler, PERCPU_SCHED};
use super::task::{Task, TaskContext};
use super::{TaskId, TaskState, BOOT_CPU};

/// All live tasks, keyed by ID. The per-CPU queues only carry `TaskId`s;
/// this is where the actual TCBs live.
static TASKS: Mutex<BTreeMap<TaskId, Task>> = Mutex::new(BTreeMap::new());

/// The task currently running on each CPU (index by CPU id).
static CURRENT: Mutex<[Option<TaskId>; 16]> = Mutex::new([None; 16]);

/// Ticks since boot, counted by [`tick`]; load balancing runs every 100 of
/// them regardless of which CPU happens to be driving the clock.
static TICK_COUNT: AtomicU32 = AtomicU32::new(0);

/// How often (in ticks) [`tick`] attempts a cross-CPU load balance.
const LOAD_BALANCE_INTERVAL: u32 = 100;

fn idle_task_id() -> TaskId {
    TaskId(0)
}

/// Installs the per-CPU queues and the idle task for the boot CPU.
pub fn init() {
    *PERCPU_SCHED.lock() = Some(PerCpuScheduler::new());
    PERCPU_SCHED.lock().as_ref().unwrap().set_cpu_count(1);

    // The idle task never actually context-switches through its saved
    // state in this build, but `Task::new` still needs a non-null stack
    // pointer to initialize a context from.
    let idle = Task::new(
        idle_task_id(),
        String::from("idle"),
        crate::arch::idle as usize,
        0x1000,
    );
    TASKS.lock().insert(idle_task_id(), idle);
    CURRENT.lock()[BOOT_CPU] = Some(idle_task_id());
}

/// Registers a new task and enqueues it on the least-loaded CPU.
#[cfg(feature = "alloc")]
pub fn spawn(name: String, entry_point: usize, stack_top: usize) -> TaskId {
    let id = super::task::alloc_task_id();
    let task = Task::new(id, name, entry_point, stack_top);
    TASKS.lock().insert(id, task);

    let guard = PERCPU_SCHED.lock();
    if let Some(ref sched) = *guard {
        let cpu = sched.find_least_loaded();
        sched.push(cpu, id);
    }
    id
}

/// Picks the next task to run on `cpu`: its own queue first, falling back
/// to stealing from the busiest neighbor, and finally the idle task.
fn pick_next(cpu: usize) -> TaskId {
    let guard = PERCPU_SCHED.lock();
    let Some(ref sched) = *guard else {
        return idle_task_id();
    };
    if let Some(id) = sched.pop(cpu) {
        return id;
    }
    sched.steal_for(cpu).unwrap_or_else(idle_task_id)
}

/// Called once per timer tick for the running CPU. Ages the current
/// task's quantum and, when it expires, re-detects its workload class
/// (see [`super::task::detect_workload_class`]), assigns it a fresh
/// quantum, and preempts it in favor of whatever [`pick_next`] returns.
/// Every [`LOAD_BALANCE_INTERVAL`] ticks also attempts a cross-CPU
/// rebalance, independent of whether this tick preempted anything.
pub fn tick(cpu: usize) {
    if TICK_COUNT.fetch_add(1, Ordering::Relaxed) % LOAD_BALANCE_INTERVAL == LOAD_BALANCE_INTERVAL - 1 {
        let guard = PERCPU_SCHED.lock();
        if let Some(ref sched) = *guard {
            sched.rebalance();
        }
    }

    let mut tasks = TASKS.lock();
    let current_id = CURRENT.lock()[cpu].unwrap_or_else(idle_task_id);

    let expired = match tasks.get_mut(&current_id) {
        Some(task) if task.id != idle_task_id() => {
            task.time_slice = task.time_slice.saturating_sub(1);
            task.time_slice == 0
        }
        _ => false,
    };

    if !expired {
        return;
    }

    if let Some(task) = tasks.get_mut(&current_id) {
        task.record_run(u64::from(task.quantum), false);
        task.state = TaskState::Ready;
    }
    drop(tasks);

    {
        let guard = PERCPU_SCHED.lock();
        if let Some(ref sched) = *guard {
            if current_id != idle_task_id() {
                sched.push(cpu, current_id);
            }
        }
    }

    switch_to(cpu, pick_next(cpu));
}

/// Voluntary yield: the currently running task gives up the CPU before its
/// quantum expires (e.g. it's about to block), which widens its next
/// quantum instead of narrowing it.
pub fn yield_current(cpu: usize) {
    let current_id = CURRENT.lock()[cpu].unwrap_or_else(idle_task_id);
    if current_id == idle_task_id() {
        return;
    }

    let mut tasks = TASKS.lock();
    if let Some(task) = tasks.get_mut(&current_id) {
        let consumed = u64::from(task.quantum.saturating_sub(task.time_slice));
        task.record_run(consumed, true);
        task.state = TaskState::Ready;
    }
    drop(tasks);

    let guard = PERCPU_SCHED.lock();
    if let Some(ref sched) = *guard {
        sched.push(cpu, current_id);
    }
    drop(guard);

    switch_to(cpu, pick_next(cpu));
}

/// The task currently running on `cpu`, or the idle task if none has been
/// scheduled there yet.
pub fn current(cpu: usize) -> TaskId {
    CURRENT.lock()[cpu].unwrap_or_else(idle_task_id)
}

/// Marks `id`'s task as a zombie without reaping it -- there is no parent
/// task to collect the exit status, so the slot simply stops being
/// scheduled. Returns `false` if `id` names no live task.
#[cfg(feature = "alloc")]
pub fn terminate(id: TaskId) -> bool {
    let mut tasks = TASKS.lock();
    match tasks.get_mut(&id) {
        Some(task) => {
            task.state = TaskState::Zombie;
            true
        }
        None => false,
    }
}

/// Blocks the current task on I/O: charges the elapsed `ticks` to its
/// I/O-wait accounting (pushing it toward [`super::task::SchedClass::Io`]
/// on the next classification) and relinquishes the CPU like a voluntary
/// yield.
pub fn block_for_io(cpu: usize, ticks: u64) {
    let current_id = CURRENT.lock()[cpu].unwrap_or_else(idle_task_id);
    if current_id == idle_task_id() {
        return;
    }

    let mut tasks = TASKS.lock();
    if let Some(task) = tasks.get_mut(&current_id) {
        task.record_io_wait(ticks);
        task.state = TaskState::Blocked;
    }
    drop(tasks);

    let guard = PERCPU_SCHED.lock();
    if let Some(ref sched) = *guard {
        sched.push(cpu, current_id);
    }
    drop(guard);

    switch_to(cpu, pick_next(cpu));
}

/// Reads out a task's `TaskContext::X86_64` variant as a raw pointer.
/// Only ever dereferenced while `TASKS` is guaranteed not to remove the
/// entry it came from (see the `SAFETY` note at the call site).
fn context_ptr(task: &mut Task) -> *mut crate::arch::x86_64::context::X86_64Context {
    let TaskContext::X86_64(ctx) = &mut task.context;
    ctx as *mut _
}

/// Switches execution from whichever task is current on `cpu` to `next`:
/// installs `next`'s address space (if it has one) as the one
/// `mm::page_fault` resolves faults against, then performs the actual
/// register and stack-pointer save/restore via the architecture's context
/// trampoline. Bookkeeping (`CURRENT`, task state, quantum) is updated
/// before the trampoline runs so it's consistent by the time the outgoing
/// task is resumed elsewhere and reads its own state back.
fn switch_to(cpu: usize, next: TaskId) {
    let current_id = CURRENT.lock()[cpu].unwrap_or_else(idle_task_id);
    if current_id == next {
        return;
    }

    let (from_ptr, to_ptr) = {
        let mut tasks = TASKS.lock();

        if let Some(space) = crate::mm::page_fault::take_current_address_space() {
            if let Some(outgoing) = tasks.get_mut(&current_id) {
                outgoing.address_space = Some(space);
            }
        }
        if let Some(task) = tasks.get_mut(&next) {
            task.state = TaskState::Running;
            task.current_cpu = Some(cpu as u8);
            task.time_slice = task.quantum;
            if let Some(space) = task.address_space.take() {
                crate::mm::page_fault::set_current_address_space(space);
            }
        }

        let from_ptr = tasks.get_mut(&current_id).map(context_ptr);
        let to_ptr = tasks.get_mut(&next).map(context_ptr);
        (from_ptr, to_ptr)
    };

    CURRENT.lock()[cpu] = Some(next);

    if let (Some(from), Some(to)) = (from_ptr, to_ptr) {
        // SAFETY: both pointers were read from live entries in `TASKS`
        // just above. This kernel drives exactly one CPU (`BOOT_CPU`), so
        // nothing else can remove those entries or move the map's backing
        // storage between here and the trampoline returning; the
        // trampoline itself only touches CPU registers and the two
        // pointed-to `X86_64Context` structs.
        unsafe {
            crate::arch::x86_64::context::switch_context(&mut *from, &*to);
        }
    }
}

/// Runs the boot CPU's idle loop. Real preemption and load balancing both
/// happen out-of-band via [`tick`], driven by the timer interrupt handler;
/// this just parks the CPU between ticks.
pub fn run_forever() -> ! {
    loop {
        crate::arch::idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_enqueues_on_least_loaded_cpu() {
        init();
        let id = spawn(String::from("t1"), 0, 0x1000);
        assert!(TASKS.lock().contains_key(&id));
    }

    #[test]
    fn freshly_spawned_task_starts_interactive_with_a_5_tick_quantum() {
        init();
        let id = spawn(String::from("t2"), 0, 0x1000);
        let task = TASKS.lock();
        let task = task.get(&id).unwrap();
        assert_eq!(task.sched_class, super::super::task::SchedClass::Interactive);
        assert_eq!(task.quantum, 5);
    }

    #[test]
    fn repeated_involuntary_preemption_reclassifies_compute_with_a_20_tick_quantum() {
        init();
        let id = spawn(String::from("t3"), 0, 0x1000);
        let mut tasks = TASKS.lock();
        let task = tasks.get_mut(&id).unwrap();
        for _ in 0..3 {
            task.record_run(u64::from(task.quantum), false);
        }
        assert_eq!(task.sched_class, super::super::task::SchedClass::Compute);
        assert_eq!(task.quantum, 20);
    }

    #[test]
    fn io_wait_reclassifies_task_with_a_10_tick_quantum() {
        init();
        let id = spawn(String::from("t4"), 0, 0x1000);
        let mut tasks = TASKS.lock();
        let task = tasks.get_mut(&id).unwrap();
        task.record_run(1, true);
        task.record_io_wait(50);
        assert_eq!(task.sched_class, super::super::task::SchedClass::Io);
        assert_eq!(task.quantum, 10);
    }

    #[test]
    fn tick_triggers_load_balance_every_hundred_ticks() {
        init();
        let before = TICK_COUNT.load(Ordering::Relaxed);
        for _ in 0..LOAD_BALANCE_INTERVAL {
            tick(BOOT_CPU);
        }
        assert_eq!(TICK_COUNT.load(Ordering::Relaxed), before + LOAD_BALANCE_INTERVAL);
    }
}
