//! Task management and task control block (TCB) implementation

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{TaskId, TaskState};

/// Task priority levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Real-time highest priority
    RealTimeHigh = 0,
    /// Real-time normal priority
    RealTimeNormal = 10,
    /// Real-time low priority
    RealTimeLow = 20,
    /// System high priority
    SystemHigh = 30,
    /// System normal priority
    SystemNormal = 40,
    /// Normal priority
    #[default]
    Normal = 60,
    /// Below-normal priority
    Low = 70,
    /// Idle priority
    Idle = 99,
}

/// Workload class. A task is re-classified every time its quantum expires,
/// using the signals accumulated in [`TaskStats`] since the last
/// classification; the class then determines the length of its next
/// quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Static priority in the real-time band. Shortest quantum so a
    /// real-time task is rescheduled promptly after every slice.
    Realtime,
    /// Many voluntary yields and a low CPU-time fraction: a task that keeps
    /// giving up the CPU on its own, typically waiting on user input or
    /// another task rather than computing.
    Interactive,
    /// I/O-wait fraction over threshold: blocks on device or network I/O
    /// more often than it runs.
    Io,
    /// CPU-time fraction over threshold: consistently runs to the end of
    /// its quantum. Longest quantum to amortize context-switch overhead.
    Compute,
}

impl SchedClass {
    /// Quantum handed to a task newly classified into this class, in timer
    /// ticks.
    pub fn quantum_ticks(self) -> u32 {
        match self {
            SchedClass::Realtime => 2,
            SchedClass::Interactive => 5,
            SchedClass::Io => 10,
            SchedClass::Compute => 20,
        }
    }
}

/// Highest (numerically largest) priority value still considered part of
/// the real-time band (see [`Priority`]).
const REALTIME_PRIORITY_FLOOR: u8 = Priority::RealTimeLow as u8;

/// I/O-wait fraction, in tenths, above which a task is classified [`Io`](SchedClass::Io).
const IO_WAIT_THRESHOLD_TENTHS: u64 = 3;

/// Re-derives a task's workload class from its priority and accumulated
/// run statistics. Called whenever a quantum expires, so the *next*
/// quantum reflects the task's most recent behavior rather than whatever
/// it was classified as at spawn time.
pub fn detect_workload_class(priority: Priority, stats: &TaskStats) -> SchedClass {
    if (priority as u8) <= REALTIME_PRIORITY_FLOOR {
        return SchedClass::Realtime;
    }

    let runtime = stats.runtime.load(Ordering::Relaxed);
    let io_wait = stats.io_wait.load(Ordering::Relaxed);
    let voluntary = stats.voluntary_switches.load(Ordering::Relaxed);
    let involuntary = stats.involuntary_switches.load(Ordering::Relaxed);
    let run_count = voluntary + involuntary;

    // Never scheduled yet: start interactive, the most forgiving class.
    if run_count == 0 {
        return SchedClass::Interactive;
    }

    let active = (runtime + io_wait).max(1);
    if io_wait * 10 >= active * IO_WAIT_THRESHOLD_TENTHS {
        return SchedClass::Io;
    }

    // Ran to the end of its quantum at least half the time: CPU-bound.
    if involuntary * 2 >= run_count {
        return SchedClass::Compute;
    }

    SchedClass::Interactive
}

/// CPU affinity mask
#[derive(Debug, Clone)]
pub struct CpuSet {
    /// Bitmap of allowed CPUs (bit N = CPU N)
    mask: u64,
}

impl CpuSet {
    /// Create new CPU set with all CPUs allowed
    pub fn all() -> Self {
        Self { mask: !0u64 }
    }

    /// Create new CPU set with single CPU
    pub fn single(cpu: u8) -> Self {
        Self { mask: 1u64 << cpu }
    }

    /// Check if CPU is in set
    pub fn contains(&self, cpu: u8) -> bool {
        (self.mask & (1u64 << cpu)) != 0
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Task statistics used to drive workload classification.
#[derive(Debug, Default)]
pub struct TaskStats {
    /// Total time spent running (in ticks)
    pub runtime: AtomicU64,
    /// Total time spent blocked waiting on I/O (in ticks), as opposed to
    /// sitting ready in a run queue. See [`Task::record_io_wait`].
    pub io_wait: AtomicU64,
    /// Number of times scheduled
    pub run_count: AtomicU64,
    /// Number of times the task gave up the CPU before its quantum expired
    /// -- a high ratio marks it interactive.
    pub voluntary_switches: AtomicU64,
    /// Number of times the task ran its full quantum and was preempted --
    /// a high ratio marks it compute-bound.
    pub involuntary_switches: AtomicU64,
    /// Last time scheduled (in ticks)
    pub last_run: AtomicU64,
}

/// Architecture-specific task context
#[derive(Debug)]
pub enum TaskContext {
    /// x86_64 task context
    #[cfg(target_arch = "x86_64")]
    X86_64(crate::arch::x86_64::context::X86_64Context),
}

impl TaskContext {
    /// Create new task context for entry point
    #[cfg(target_arch = "x86_64")]
    pub fn new(entry_point: usize, stack_base: usize) -> Self {
        TaskContext::X86_64(crate::arch::x86_64::context::X86_64Context::new(
            entry_point,
            stack_base,
        ))
    }
}


/// Task Control Block (TCB)
pub struct Task {
    /// Task ID
    pub id: TaskId,
    /// Task name
    #[cfg(feature = "alloc")]
    pub name: String,
    /// Task state
    pub state: TaskState,
    /// Scheduling priority
    pub priority: Priority,
    /// Scheduling class
    pub sched_class: SchedClass,
    /// CPU affinity
    pub cpu_affinity: CpuSet,
    /// Current CPU (if running)
    pub current_cpu: Option<u8>,
    /// Time slice remaining in the current quantum (in ticks)
    pub time_slice: u32,
    /// Length of the quantum last handed to this task; the adaptive
    /// scheduler grows or shrinks this from one quantum to the next.
    pub quantum: u32,
    /// Task statistics
    pub stats: TaskStats,
    /// Architecture-specific context
    pub context: TaskContext,
    /// Kernel stack pointer
    pub kernel_stack: usize,
    /// This task's virtual memory map. `None` for tasks that never fault
    /// or mmap against a private address space (the idle task, and any
    /// kernel-only task that just shares the kernel's own mappings).
    /// Moved into [`crate::mm::page_fault`] on every context switch that
    /// makes this task current, and moved back out when it's switched
    /// away from.
    #[cfg(feature = "alloc")]
    pub address_space: Option<crate::mm::AddressSpace>,
}

impl Task {
    /// Create new task
    #[cfg(feature = "alloc")]
    pub fn new(id: TaskId, name: String, entry_point: usize, stack_base: usize) -> Self {
        Self {
            id,
            name,
            state: TaskState::Ready,
            priority: Priority::default(),
            sched_class: SchedClass::Interactive,
            cpu_affinity: CpuSet::default(),
            current_cpu: None,
            time_slice: SchedClass::Interactive.quantum_ticks(),
            quantum: SchedClass::Interactive.quantum_ticks(),
            stats: TaskStats::default(),
            context: TaskContext::new(entry_point, stack_base),
            kernel_stack: stack_base,
            address_space: None,
        }
    }

    /// Check if task can run on given CPU
    pub fn can_run_on(&self, cpu: u8) -> bool {
        self.cpu_affinity.contains(cpu)
    }

    /// Record that the task ran for `ticks` and whether it gave up the CPU
    /// voluntarily or was preempted at quantum expiry, then re-detect its
    /// workload class and assign the matching quantum for its next run.
    pub fn record_run(&mut self, ticks: u64, voluntary: bool) {
        self.stats.runtime.fetch_add(ticks, Ordering::Relaxed);
        self.stats.run_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_run
            .store(crate::arch::timer::get_ticks(), Ordering::Relaxed);

        if voluntary {
            self.stats
                .voluntary_switches
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats
                .involuntary_switches
                .fetch_add(1, Ordering::Relaxed);
        }

        self.sched_class = detect_workload_class(self.priority, &self.stats);
        self.quantum = self.sched_class.quantum_ticks();
        self.time_slice = self.quantum;
    }

    /// Record that the task blocked waiting on I/O for `ticks` rather than
    /// running or sitting ready, then re-detect its workload class (this
    /// is the signal that can push it into [`SchedClass::Io`]).
    pub fn record_io_wait(&mut self, ticks: u64) {
        self.stats.io_wait.fetch_add(ticks, Ordering::Relaxed);
        self.sched_class = detect_workload_class(self.priority, &self.stats);
        self.quantum = self.sched_class.quantum_ticks();
    }

    /// Calculate dynamic priority: tasks that have waited longer get a
    /// boosted (lower-numbered) effective priority so they aren't starved
    /// by a steady stream of higher-priority arrivals.
    pub fn effective_priority(&self) -> u8 {
        match self.sched_class {
            SchedClass::Realtime => self.priority as u8,
            SchedClass::Interactive | SchedClass::Io | SchedClass::Compute => {
                let wait_time =
                    crate::arch::timer::get_ticks() - self.stats.last_run.load(Ordering::Relaxed);
                let boost = (wait_time / PRIORITY_BOOST_INTERVAL).min(20) as u8;
                (self.priority as u8).saturating_sub(boost)
            }
        }
    }
}

/// Interval for priority boosting (in ticks)
pub const PRIORITY_BOOST_INTERVAL: u64 = 100;

/// Task ID allocator
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new task ID
pub fn alloc_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_priority_always_classifies_realtime() {
        let stats = TaskStats::default();
        assert_eq!(
            detect_workload_class(Priority::RealTimeHigh, &stats),
            SchedClass::Realtime
        );
    }

    #[test]
    fn unscheduled_task_starts_interactive() {
        let stats = TaskStats::default();
        assert_eq!(
            detect_workload_class(Priority::Normal, &stats),
            SchedClass::Interactive
        );
    }

    #[test]
    fn high_io_wait_fraction_classifies_io() {
        let stats = TaskStats::default();
        stats.runtime.store(10, Ordering::Relaxed);
        stats.io_wait.store(20, Ordering::Relaxed);
        stats.voluntary_switches.store(3, Ordering::Relaxed);
        assert_eq!(
            detect_workload_class(Priority::Normal, &stats),
            SchedClass::Io
        );
    }

    #[test]
    fn mostly_involuntary_preemption_classifies_compute() {
        let stats = TaskStats::default();
        stats.runtime.store(100, Ordering::Relaxed);
        stats.involuntary_switches.store(5, Ordering::Relaxed);
        stats.voluntary_switches.store(1, Ordering::Relaxed);
        assert_eq!(
            detect_workload_class(Priority::Normal, &stats),
            SchedClass::Compute
        );
    }

    #[test]
    fn quantum_table_matches_class() {
        assert_eq!(SchedClass::Realtime.quantum_ticks(), 2);
        assert_eq!(SchedClass::Interactive.quantum_ticks(), 5);
        assert_eq!(SchedClass::Io.quantum_ticks(), 10);
        assert_eq!(SchedClass::Compute.quantum_ticks(), 20);
    }
}
