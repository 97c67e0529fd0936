//! Adaptive-quantum per-CPU scheduler with work stealing.
//!
//! Each CPU owns a [`percpu_queue::PerCpuQueue`] of ready [`TaskId`]s. A CPU
//! with an empty queue steals half of the busiest neighbor's queue rather
//! than contending on a single global run queue. Within a CPU, [`task::Task`]
//! quanta grow or shrink from run to run based on whether the task yielded
//! voluntarily or ran to the end of its slice -- see
//! [`task::Task::record_run`].

pub mod percpu_queue;
pub mod scheduler;
pub mod task;

pub use task::{Priority, SchedClass, Task};

#[cfg(feature = "alloc")]
extern crate alloc;

/// Identifies a schedulable task. Opaque outside this module; nothing else
/// in the kernel needs to know how IDs are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, sitting in a per-CPU queue
    Ready,
    /// Currently executing on a CPU
    Running,
    /// Waiting on a timer, I/O, or a lock
    Blocked,
    /// Exited, pending reap
    Zombie,
}

/// Number of CPUs this build of the kernel is prepared to schedule across.
/// Secondary-CPU bring-up is out of scope, so this is always 1 in practice,
/// but the queue arrays and load balancer are sized and written for more.
pub const BOOT_CPU: usize = 0;

/// Initializes the scheduler: brings up the per-CPU queues and spawns the
/// idle task for the boot CPU.
pub fn init() {
    println!("[SCHED] initializing per-CPU scheduler");
    scheduler::init();
    println!("[SCHED] scheduler initialized");
}

/// Enters the scheduler's main loop. Only returns if every task exits,
/// which in practice never happens -- the idle task never exits.
pub fn run() -> ! {
    println!("[SCHED] entering scheduler main loop");
    scheduler::run_forever()
}
