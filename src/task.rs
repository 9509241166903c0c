//! # Tasks
//!
//! Task model and the task-manager half of the per-core kernel API.
//!
//! Each core owns a fixed pool of [`TaskControlBlock`]s and a matching arena
//! of stacks; nothing here allocates. Tasks are named by generation-checked
//! [`TaskHandle`]s, so a handle kept after its task was deleted (or after its
//! slot was recycled) resolves to [`KernelError::NoTask`] instead of aliasing
//! a new task.
//!
//! ## Lifecycle
//!
//! 1. `task_create` reserves a slot, fills the stack with
//!    [`STACK_FILL_PATTERN`], asks the port for an execution context whose
//!    trampoline ([`TaskStart::run`]) calls the entry function, and readies
//!    the task.
//! 2. The scheduler moves the task between Ready, Running, and Blocked.
//! 3. When the entry function returns, the trampoline deletes the task. A
//!    self-deleting task is marked Terminated and switches away; its slot
//!    and context are reaped by the next flow that runs on the core.

use core::cell::UnsafeCell;
use core::ops::BitOr;
use core::ptr::NonNull;

use heapless::String;
use tracing::{debug, info, trace};

use crate::arch::{ContextId, StackRegion};
use crate::config::{
    ms_to_ticks, us_to_ticks, DEFAULT_PRIORITY, DEFAULT_STACK_SIZE, MAX_CORES,
    MAX_TASKS_PER_CORE, MIN_STACK_SIZE, PRIORITY_IDLE, STACK_FILL_PATTERN, TASK_NAME_LEN,
};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::scheduler::NO_DEADLINE;

/// Entry function of a task. Receives the core it runs on and the argument
/// given at creation. Returning deletes the task.
pub type TaskFn = fn(&'static Core, usize);

/// Longest task name kept; longer names are truncated.
pub const TASK_NAME_MAX: usize = TASK_NAME_LEN - 1;

/// Fixed-capacity task name.
pub type TaskName = String<TASK_NAME_MAX>;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///   create   ┌─────────┐  select_next   ┌─────────┐
///  ────────► │  Ready  │ ─────────────► │ Running │
///            └─────────┘ ◄───────────── └─────────┘
///              ▲  ▲      preempt/yield     │   │
///     unblock/ │  │ resume        suspend  │   │ block/delay
///      timeout │  └────── Suspended ◄──────┘   ▼
///              └─────────────────────── ┌─────────┐
///                                       │ Blocked │
///                                       └─────────┘
///   entry returns / delete ──► Terminated ──► (slot reaped) Inactive
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Free pool slot.
    Inactive,
    /// Runnable, waiting in the ready list.
    Ready,
    /// Executing on its core.
    Running,
    /// Waiting for a primitive, a delay, or a notification.
    Blocked,
    /// Parked until `task_resume`. Also the state of a slot under
    /// construction.
    Suspended,
    /// Finished; waiting to be reaped.
    Terminated,
}

/// Task attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(pub u8);

impl TaskFlags {
    pub const NONE: TaskFlags = TaskFlags(0);
    pub const PERIODIC: TaskFlags = TaskFlags(1 << 0);
    pub const REALTIME: TaskFlags = TaskFlags(1 << 1);
    pub const SAFETY: TaskFlags = TaskFlags(1 << 2);
    pub const PRIVILEGED: TaskFlags = TaskFlags(1 << 3);

    #[inline]
    pub const fn contains(self, other: TaskFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TaskFlags {
    type Output = TaskFlags;

    fn bitor(self, rhs: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 | rhs.0)
    }
}

/// What a Blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Delay,
    Notification,
    Mutex,
    Semaphore,
    Event,
    CondVar,
    ReadLock,
    WriteLock,
    QueueSend,
    QueueReceive,
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Parameters for [`Core::task_create`].
///
/// ```ignore
/// let params = TaskParams::new("control", control_loop)
///     .priority(200)
///     .periodic(1_000)
///     .flags(TaskFlags::REALTIME);
/// core.task_create(params)?;
/// ```
#[derive(Debug)]
pub struct TaskParams {
    pub name: &'static str,
    pub entry: Option<TaskFn>,
    pub arg: usize,
    /// `0..=255`, higher is more urgent.
    pub priority: u8,
    /// Requested stack size in bytes. Below `MIN_STACK_SIZE` the default
    /// size is used.
    pub stack_size: usize,
    /// Caller-supplied stack; the core's arena stack is used otherwise.
    pub stack: Option<&'static mut [u32]>,
    /// Core to run on. `None` or an out-of-range value means the creating
    /// core.
    pub core_affinity: Option<usize>,
    /// Release period in µs; `0` is aperiodic.
    pub period_us: u32,
    /// Relative deadline in µs; `0` defaults to the period.
    pub deadline_us: u32,
    pub flags: TaskFlags,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            name: "task",
            entry: None,
            arg: 0,
            priority: DEFAULT_PRIORITY,
            stack_size: 1024,
            stack: None,
            core_affinity: None,
            period_us: 0,
            deadline_us: 0,
            flags: TaskFlags::NONE,
        }
    }
}

impl TaskParams {
    pub fn new(name: &'static str, entry: TaskFn) -> Self {
        Self {
            name,
            entry: Some(entry),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn stack(mut self, stack: &'static mut [u32]) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn core(mut self, core: usize) -> Self {
        self.core_affinity = Some(core);
        self
    }

    /// Make the task periodic; its relative deadline defaults to the period.
    pub fn periodic(mut self, period_us: u32) -> Self {
        self.period_us = period_us;
        self.flags = self.flags | TaskFlags::PERIODIC;
        self
    }

    pub fn deadline(mut self, deadline_us: u32) -> Self {
        self.deadline_us = deadline_us;
        self
    }

    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }
}

/// Per-task run statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub run_count: u32,
    pub total_time_us: u64,
    pub max_exec_us: u64,
    pub deadlines_missed: u32,
    pub preemptions: u32,
}

impl TaskStats {
    pub const fn new() -> Self {
        Self {
            run_count: 0,
            total_time_us: 0,
            max_exec_us: 0,
            deadlines_missed: 0,
            preemptions: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Reference to a task: owning core, pool slot, and the slot generation at
/// the time the task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    core: u8,
    slot: u8,
    generation: u16,
}

impl TaskHandle {
    #[inline]
    pub fn core(&self) -> usize {
        self.core as usize
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block.
///
/// Lives in its core's [`TaskPool`] and is only touched under that core's
/// critical section.
#[derive(Debug)]
pub struct TaskControlBlock {
    pub(crate) name: TaskName,
    pub(crate) id: u32,
    pub(crate) core: usize,
    pub(crate) flags: TaskFlags,
    pub(crate) state: TaskState,

    pub(crate) base_priority: u8,
    /// Never below `base_priority`; raised only by priority inheritance.
    pub(crate) effective_priority: u8,

    /// Absolute deadline in µs on the tick clock, `NO_DEADLINE` if none.
    pub(crate) deadline: u64,
    /// A miss of the current `deadline` was already reported.
    pub(crate) deadline_reported: bool,
    pub(crate) period_us: u32,
    pub(crate) relative_deadline_us: u32,

    pub(crate) context: Option<ContextId>,
    pub(crate) stack: Option<StackRegion>,
    pub(crate) overflow_reported: bool,
    pub(crate) entry: Option<TaskFn>,
    pub(crate) arg: usize,

    /// Tick at which a timed wait expires.
    pub(crate) wake_time: u64,
    /// Result of the last blocking wait.
    pub(crate) wait_result: Result<()>,
    pub(crate) blocked_on: Option<WaitKind>,
    /// Event wait encoding: `mask | mode << 31`; matched bits after a wake.
    pub(crate) blocked_reason: u32,
    pub(crate) notify_value: u32,

    pub(crate) stats: TaskStats,
}

impl TaskControlBlock {
    /// An unallocated TCB.
    pub const fn empty() -> Self {
        Self {
            name: String::new(),
            id: 0,
            core: 0,
            flags: TaskFlags::NONE,
            state: TaskState::Inactive,
            base_priority: 0,
            effective_priority: 0,
            deadline: NO_DEADLINE,
            deadline_reported: false,
            period_us: 0,
            relative_deadline_us: 0,
            context: None,
            stack: None,
            overflow_reported: false,
            entry: None,
            arg: 0,
            wake_time: 0,
            wait_result: Ok(()),
            blocked_on: None,
            blocked_reason: 0,
            notify_value: 0,
            stats: TaskStats::new(),
        }
    }

    /// Fill a reserved TCB from creation parameters. The task is left
    /// Suspended (not schedulable) until the caller readies it.
    pub(crate) fn init(&mut self, id: u32, core: usize, params: &TaskParams) {
        *self = Self::empty();
        for c in params.name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
        self.id = id;
        self.core = core;
        self.flags = params.flags;
        self.state = TaskState::Suspended;
        self.base_priority = params.priority;
        self.effective_priority = params.priority;
        self.period_us = params.period_us;
        self.relative_deadline_us = if params.deadline_us != 0 {
            params.deadline_us
        } else {
            params.period_us
        };
        if params.period_us > 0 {
            self.flags = self.flags | TaskFlags::PERIODIC;
        }
        self.entry = params.entry;
        self.arg = params.arg;
    }

    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.period_us > 0
    }

    /// Whether the stack guard word was overwritten. Tasks without a kernel
    /// managed stack never report overflow.
    pub(crate) fn stack_overflowed(&self) -> bool {
        self.stack.map_or(false, |s| !s.guard_intact())
    }
}

// ---------------------------------------------------------------------------
// Task pool
// ---------------------------------------------------------------------------

struct Slot {
    generation: u16,
    tcb: TaskControlBlock,
}

/// Fixed pool of TCBs for one core.
pub(crate) struct TaskPool {
    core: u8,
    slots: [Slot; MAX_TASKS_PER_CORE],
}

impl TaskPool {
    pub(crate) fn new(core: usize) -> Self {
        Self {
            core: core as u8,
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                tcb: TaskControlBlock::empty(),
            }),
        }
    }

    /// Reserve a free slot. The TCB is Suspended until initialised and
    /// readied.
    pub(crate) fn allocate(&mut self) -> Option<TaskHandle> {
        let core = self.core;
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.tcb.state == TaskState::Inactive)?;
        slot.tcb.state = TaskState::Suspended;
        Some(TaskHandle {
            core,
            slot: index as u8,
            generation: slot.generation,
        })
    }

    /// Return a slot to the pool. Every outstanding handle to it goes stale.
    pub(crate) fn free(&mut self, h: TaskHandle) {
        if self.get(h).is_none() {
            return;
        }
        let slot = &mut self.slots[h.slot()];
        slot.tcb = TaskControlBlock::empty();
        slot.generation = slot.generation.wrapping_add(1);
    }

    fn slot(&self, h: TaskHandle) -> Option<&Slot> {
        if h.core != self.core {
            return None;
        }
        self.slots
            .get(h.slot())
            .filter(|s| s.generation == h.generation && s.tcb.state != TaskState::Inactive)
    }

    pub(crate) fn get(&self, h: TaskHandle) -> Option<&TaskControlBlock> {
        self.slot(h).map(|s| &s.tcb)
    }

    pub(crate) fn get_mut(&mut self, h: TaskHandle) -> Option<&mut TaskControlBlock> {
        self.slot(h)?;
        Some(&mut self.slots[h.slot()].tcb)
    }

    /// Live tasks with their handles.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (TaskHandle, &TaskControlBlock)> + '_ {
        let core = self.core;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.tcb.state != TaskState::Inactive)
            .map(move |(i, s)| {
                let h = TaskHandle {
                    core,
                    slot: i as u8,
                    generation: s.generation,
                };
                (h, &s.tcb)
            })
    }

    pub(crate) fn live_count(&self) -> usize {
        self.iter().count()
    }
}

// ---------------------------------------------------------------------------
// Stack arena
// ---------------------------------------------------------------------------

const ARENA_WORDS: usize = DEFAULT_STACK_SIZE / 4;

/// One default-sized stack per pool slot. A slot's stack belongs to the
/// task occupying that slot.
pub(crate) struct StackArena {
    stacks: [UnsafeCell<[u32; ARENA_WORDS]>; MAX_TASKS_PER_CORE],
}

// Slot ownership is arbitrated by the task pool under the core's critical
// section; each stack has a single user at a time.
unsafe impl Sync for StackArena {}

impl StackArena {
    pub(crate) fn new() -> Self {
        Self {
            stacks: core::array::from_fn(|_| UnsafeCell::new([0; ARENA_WORDS])),
        }
    }

    /// The lowest `bytes` of the arena stack of `slot`, or `None` if the
    /// request exceeds an arena stack.
    pub(crate) fn region(&self, slot: usize, bytes: usize) -> Option<StackRegion> {
        let words = bytes / 4;
        if words > ARENA_WORDS {
            return None;
        }
        let cell = self.stacks.get(slot)?;
        let base = NonNull::new(cell.get().cast::<u32>())?;
        // The slot was just reserved for the caller, so this stack is unused.
        Some(unsafe { StackRegion::from_raw(base, words) })
    }
}

// ---------------------------------------------------------------------------
// Trampoline
// ---------------------------------------------------------------------------

/// Everything a fresh execution context needs to begin running its task.
pub struct TaskStart {
    pub(crate) core: &'static Core,
    pub(crate) task: TaskHandle,
    pub(crate) entry: TaskFn,
    pub(crate) arg: usize,
}

impl TaskStart {
    pub fn task(&self) -> TaskHandle {
        self.task
    }

    /// Body of every task context: finish the switch that started it, run
    /// the entry function, then delete the task.
    pub fn run(self) -> ! {
        self.core.after_switch();
        trace!(core = self.core.id(), slot = self.task.slot(), "task started");
        (self.entry)(self.core, self.arg);
        self.core.task_exit()
    }
}

fn idle_entry(core: &'static Core, _arg: usize) {
    core.idle_loop()
}

// ---------------------------------------------------------------------------
// Task manager API
// ---------------------------------------------------------------------------

impl Core {
    /// Create a task on this core and hand it to the scheduler. May preempt
    /// the caller.
    pub fn task_create(&'static self, mut params: TaskParams) -> Result<TaskHandle> {
        let entry = params.entry.ok_or(KernelError::Param)?;
        if let Some(core) = params.core_affinity {
            if core < MAX_CORES && core != self.id() {
                return Err(KernelError::Param);
            }
        }
        let stack_bytes = if params.stack_size < MIN_STACK_SIZE {
            DEFAULT_STACK_SIZE
        } else {
            params.stack_size
        };
        let supplied = params.stack.take();
        if let Some(s) = &supplied {
            if s.len() * 4 < MIN_STACK_SIZE {
                return Err(KernelError::Param);
            }
        }

        let id = self.shared().next_task_id();
        let handle = self.with(|inner| {
            let h = inner.tasks.allocate().ok_or(KernelError::NoMem)?;
            if let Some(tcb) = inner.tasks.get_mut(h) {
                tcb.init(id, self.id(), &params);
            }
            Ok(h)
        })?;

        let stack = match supplied {
            Some(s) => Some(StackRegion::from_static(s)),
            None => self.stacks().region(handle.slot(), stack_bytes),
        };
        let Some(stack) = stack else {
            self.with(|inner| inner.tasks.free(handle));
            return Err(KernelError::NoMem);
        };
        stack.fill();

        let start = TaskStart {
            core: self,
            task: handle,
            entry,
            arg: params.arg,
        };
        let ctx = match self.platform().create(Some(stack), start) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.with(|inner| inner.tasks.free(handle));
                return Err(e);
            }
        };

        self.with(|inner| {
            let now = inner.sched.now_us();
            if let Some(tcb) = inner.tasks.get_mut(handle) {
                tcb.context = Some(ctx);
                tcb.stack = Some(stack);
                if tcb.is_periodic() {
                    tcb.deadline = now + tcb.relative_deadline_us as u64;
                }
            }
            inner.sched.ready(&mut inner.tasks, handle);
        });
        info!(
            core = self.id(),
            id,
            name = params.name,
            priority = params.priority,
            "task created"
        );
        self.dispatch();
        Ok(handle)
    }

    /// Delete a task. `None` deletes the caller and does not return.
    pub fn task_delete(&self, task: Option<TaskHandle>) -> Result<()> {
        let me = self.current_task();
        let target = task.or(me).ok_or(KernelError::NoTask)?;
        if Some(target) == me && !self.in_isr() {
            if Some(target) == self.idle_task() {
                return Err(KernelError::Param);
            }
            self.task_exit();
        }

        let ctx = self.with(|inner| {
            let tcb = inner.tasks.get(target).ok_or(KernelError::NoTask)?;
            if Some(target) == inner.sched.idle() || Some(target) == inner.sched.current() {
                return Err(KernelError::State);
            }
            let ctx = tcb.context;
            inner.sched.unready(target);
            inner.tasks.free(target);
            Ok(ctx)
        })?;
        if let Some(ctx) = ctx {
            self.platform().destroy(ctx);
        }
        info!(core = self.id(), slot = target.slot(), "task deleted");
        Ok(())
    }

    /// Terminate the calling task. Its slot and context are reaped by the
    /// next flow of control that runs on this core.
    pub fn task_exit(&self) -> ! {
        let now = self.platform().now_us();
        let plan = self.with(|inner| {
            let me = inner.sched.current()?;
            if Some(me) == inner.sched.idle() {
                return None;
            }
            inner.sched.unready(me);
            if let Some(tcb) = inner.tasks.get_mut(me) {
                tcb.state = TaskState::Terminated;
            }
            inner.zombie = Some(me);
            debug!(core = self.id(), slot = me.slot(), "task exiting");
            inner.plan_switch(now, true)
        });
        match plan {
            Some(plan) => self.perform(Some(plan)),
            None => self.panic("Idle task exited"),
        }
        // A terminated context is never resumed.
        loop {
            self.platform().wait_for_interrupt();
        }
    }

    /// Park a task until [`task_resume`](Self::task_resume). `None` parks
    /// the caller.
    pub fn task_suspend(&self, task: Option<TaskHandle>) -> Result<()> {
        let me = self.current_task();
        let target = task.or(me).ok_or(KernelError::NoTask)?;
        let is_self = Some(target) == me;
        self.with(|inner| {
            if Some(target) == inner.sched.idle() {
                return Err(KernelError::Param);
            }
            let tcb = inner.tasks.get_mut(target).ok_or(KernelError::NoTask)?;
            if tcb.state == TaskState::Terminated {
                return Err(KernelError::State);
            }
            tcb.state = TaskState::Suspended;
            inner.sched.unready(target);
            if is_self {
                inner.sched.request_switch();
            }
            Ok(())
        })?;
        debug!(core = self.id(), slot = target.slot(), "task suspended");
        if is_self && !self.in_isr() {
            let _ = self.switch_away(target);
        }
        Ok(())
    }

    pub fn task_resume(&self, task: TaskHandle) -> Result<()> {
        self.with(|inner| {
            let tcb = inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            if tcb.state != TaskState::Suspended {
                return Err(KernelError::State);
            }
            inner.sched.ready(&mut inner.tasks, task);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup and attributes
    // -----------------------------------------------------------------------

    /// The running task (the idle task when nothing else runs).
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.with(|inner| inner.sched.current())
    }

    pub fn idle_task(&self) -> Option<TaskHandle> {
        self.with(|inner| inner.sched.idle())
    }

    pub fn task_by_id(&self, id: u32) -> Option<TaskHandle> {
        self.with(|inner| inner.tasks.iter().find(|(_, t)| t.id == id).map(|(h, _)| h))
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskHandle> {
        self.with(|inner| {
            inner
                .tasks
                .iter()
                .find(|(_, t)| t.name.as_str() == name)
                .map(|(h, _)| h)
        })
    }

    fn read_task<R>(&self, task: TaskHandle, f: impl FnOnce(&TaskControlBlock) -> R) -> Result<R> {
        self.with(|inner| inner.tasks.get(task).map(f).ok_or(KernelError::NoTask))
    }

    pub fn task_name(&self, task: TaskHandle) -> Result<TaskName> {
        self.read_task(task, |t| t.name.clone())
    }

    pub fn task_id(&self, task: TaskHandle) -> Result<u32> {
        self.read_task(task, |t| t.id)
    }

    pub fn task_state(&self, task: TaskHandle) -> Result<TaskState> {
        self.read_task(task, |t| t.state)
    }

    /// Effective priority (base plus any inheritance boost).
    pub fn task_priority(&self, task: TaskHandle) -> Result<u8> {
        self.read_task(task, |t| t.effective_priority)
    }

    pub fn task_base_priority(&self, task: TaskHandle) -> Result<u8> {
        self.read_task(task, |t| t.base_priority)
    }

    pub fn task_core(&self, task: TaskHandle) -> Result<usize> {
        self.read_task(task, |t| t.core)
    }

    pub fn task_flags(&self, task: TaskHandle) -> Result<TaskFlags> {
        self.read_task(task, |t| t.flags)
    }

    pub fn task_deadline(&self, task: TaskHandle) -> Result<u64> {
        self.read_task(task, |t| t.deadline)
    }

    pub fn task_stats(&self, task: TaskHandle) -> Result<TaskStats> {
        self.read_task(task, |t| t.stats)
    }

    pub fn task_set_priority(&self, task: TaskHandle, priority: u8) -> Result<()> {
        self.with(|inner| {
            inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            inner.sched.set_priority(&mut inner.tasks, task, priority);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    /// Live tasks on this core, the idle task included.
    pub fn task_count(&self) -> usize {
        self.with(|inner| inner.tasks.live_count())
    }

    // -----------------------------------------------------------------------
    // Timing
    // -----------------------------------------------------------------------

    /// Give up the CPU to the next task of equal or higher precedence.
    pub fn task_yield(&self) {
        self.with(|inner| inner.sched.yield_current(&mut inner.tasks));
        self.dispatch();
    }

    /// Switch away from a delayed task. Expiry of the delay itself is
    /// reported by the tick as `Timeout` and is not an error here.
    fn sleep(&self, me: TaskHandle) -> Result<()> {
        match self.switch_away(me) {
            Err(KernelError::Timeout) => Ok(()),
            other => other,
        }
    }

    /// Sleep for `ticks` ticks. Zero returns immediately.
    pub fn task_delay(&self, ticks: u32) -> Result<()> {
        if ticks == 0 {
            return Ok(());
        }
        let me = self.task_context()?;
        let parked = self.with(|inner| {
            let wake = inner.sched.ticks() + ticks as u64;
            inner.park_until(wake, WaitKind::Delay).is_some()
        });
        if parked {
            self.sleep(me)?;
        }
        Ok(())
    }

    pub fn task_delay_ms(&self, ms: u32) -> Result<()> {
        let ticks = ms_to_ticks(ms as u64).max(u64::from(ms > 0));
        self.task_delay(ticks.min(u32::MAX as u64 - 1) as u32)
    }

    /// Sleep until `*prev_wake + period` and advance `prev_wake`, giving a
    /// drift-free cadence. Returns at once if that tick already passed.
    pub fn task_delay_until(&self, prev_wake: &mut u64, period: u32) -> Result<()> {
        let me = self.task_context()?;
        let next = *prev_wake + period as u64;
        *prev_wake = next;
        let parked = self.with(|inner| inner.park_until(next, WaitKind::Delay).is_some());
        if parked {
            self.sleep(me)?;
        }
        Ok(())
    }

    /// End the current job of a periodic task: set the next job's deadline
    /// and sleep one period. No-op for aperiodic tasks.
    pub fn task_wait_for_period(&self) -> Result<()> {
        let me = self.task_context()?;
        let period_ticks = self.with(|inner| {
            let (period, relative) = match inner.tasks.get(me) {
                Some(t) if t.is_periodic() => (t.period_us, t.relative_deadline_us),
                _ => return None,
            };
            let release = inner.sched.now_us() + period as u64;
            inner
                .sched
                .set_deadline(&mut inner.tasks, me, release + relative as u64);
            Some(us_to_ticks(period as u64).max(1))
        });
        match period_ticks {
            Some(ticks) => self.task_delay(ticks.min(u32::MAX as u64 - 1) as u32),
            None => Ok(()),
        }
    }

    /// `true` if the calling task has never missed a deadline.
    pub fn task_deadline_met(&self) -> bool {
        self.with(|inner| {
            inner
                .sched
                .current()
                .and_then(|h| inner.tasks.get(h))
                .map_or(true, |t| t.stats.deadlines_missed == 0)
        })
    }

    /// Microseconds left until the calling task's deadline; `0` if it has
    /// passed or the task has none.
    pub fn task_slack(&self) -> u64 {
        self.with(|inner| {
            let now = inner.sched.now_us();
            inner
                .sched
                .current()
                .and_then(|h| inner.tasks.get(h))
                .filter(|t| t.deadline != NO_DEADLINE)
                .map_or(0, |t| t.deadline.saturating_sub(now))
        })
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Wait for a notification value. Returns it, or `0` if the wait timed
    /// out.
    pub fn notify_wait(&self, clear_on_exit: bool, timeout: Timeout) -> Result<u32> {
        let me = self.current_task().ok_or(KernelError::State)?;
        let take = |tcb: &mut TaskControlBlock| {
            let value = tcb.notify_value;
            if clear_on_exit {
                tcb.notify_value = 0;
            }
            value
        };

        let ready = self.with(|inner| {
            let tcb = inner.tasks.get_mut(me).ok_or(KernelError::NoTask)?;
            if tcb.notify_value != 0 || timeout.is_no_wait() {
                return Ok(Some(take(tcb)));
            }
            Ok(None)
        })?;
        if let Some(value) = ready {
            return Ok(value);
        }

        self.task_context()?;
        let parked = self.with(|inner| {
            // A notification may have landed since the first check.
            if inner.tasks.get(me).map_or(false, |t| t.notify_value != 0) {
                return false;
            }
            inner.park(timeout, WaitKind::Notification).is_some()
        });
        if parked {
            let _ = self.switch_away(me);
        }
        self.with(|inner| inner.tasks.get_mut(me).map(take).ok_or(KernelError::NoTask))
    }

    /// Overwrite a task's notification value and wake it if it waits for
    /// one. Callable from interrupt context.
    pub fn notify(&self, task: TaskHandle, value: u32) -> Result<()> {
        self.with(|inner| {
            let tcb = inner.tasks.get_mut(task).ok_or(KernelError::NoTask)?;
            tcb.notify_value = value;
            if inner.is_waiting_on(task, WaitKind::Notification) {
                inner.wake(task, Ok(()));
            }
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    /// Binary-semaphore style notify.
    pub fn notify_give(&self, task: TaskHandle) -> Result<()> {
        self.notify(task, 1)
    }

    /// Take a notification given with [`notify_give`](Self::notify_give).
    pub fn notify_take(&self, timeout: Timeout) -> Result<()> {
        match self.notify_wait(true, timeout)? {
            0 => Err(KernelError::Timeout),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Stack checks
    // -----------------------------------------------------------------------

    /// Bytes of the task's stack never written since creation.
    pub fn stack_high_water(&self, task: TaskHandle) -> Result<usize> {
        self.read_task(task, |t| t.stack.map_or(0, |s| s.untouched_bytes()))
    }

    /// `true` while the stack guard word is intact.
    pub fn check_stack(&self, task: TaskHandle) -> Result<bool> {
        self.read_task(task, |t| !t.stack_overflowed())
    }

    // -----------------------------------------------------------------------
    // Idle task
    // -----------------------------------------------------------------------

    /// Turn the calling flow of control into this core's idle task. The
    /// caller keeps running; it is resumed whenever nothing else is ready.
    pub fn adopt_idle(&self) -> Result<TaskHandle> {
        let ctx = self.platform().adopt()?;
        let id = self.shared().next_task_id();
        let params = TaskParams {
            name: "idle",
            priority: PRIORITY_IDLE,
            ..TaskParams::default()
        };
        let adopted = self.with(|inner| {
            if inner.sched.idle().is_some() || inner.sched.is_running() {
                return Err(KernelError::State);
            }
            let h = inner.tasks.allocate().ok_or(KernelError::NoMem)?;
            if let Some(tcb) = inner.tasks.get_mut(h) {
                tcb.init(id, self.id(), &params);
                tcb.context = Some(ctx);
                tcb.state = TaskState::Running;
            }
            inner.sched.set_idle(h);
            inner.sched.set_current(h);
            Ok(h)
        });
        if adopted.is_err() {
            self.platform().destroy(ctx);
        }
        adopted
    }

    /// Create a dedicated idle task running [`idle_loop`](Self::idle_loop).
    pub fn create_idle(&'static self) -> Result<TaskHandle> {
        if self.idle_task().is_some() {
            return Err(KernelError::State);
        }
        let params = TaskParams::new("idle", idle_entry)
            .priority(PRIORITY_IDLE)
            .stack_size(MIN_STACK_SIZE);
        let h = self.task_create(params)?;
        self.with(|inner| {
            inner.sched.unready(h);
            inner.sched.set_idle(h);
            if let Some(tcb) = inner.tasks.get_mut(h) {
                tcb.state = TaskState::Ready;
            }
        });
        Ok(h)
    }

    /// Body of the idle task: run the idle hook, drain IPI events, and wait
    /// for the next interrupt.
    pub fn idle_loop(&self) -> ! {
        loop {
            if let Some(hook) = self.hooks().idle {
                hook(self);
            }
            self.handle_ipi();
            self.dispatch();
            self.platform().wait_for_interrupt();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing;
    use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

    fn nop(_: &'static Core, _: usize) {}

    #[test]
    fn test_tcb_initialization() {
        let mut tcb = TaskControlBlock::empty();
        assert_eq!(tcb.state, TaskState::Inactive);

        let params = TaskParams::new("a-rather-long-task-name", nop)
            .priority(42)
            .periodic(5_000);
        tcb.init(7, 0, &params);

        assert_eq!(tcb.name.as_str(), "a-rather-long-t");
        assert_eq!(tcb.name.len(), TASK_NAME_MAX);
        assert_eq!(tcb.id, 7);
        assert_eq!(tcb.state, TaskState::Suspended);
        assert_eq!(tcb.base_priority, 42);
        assert_eq!(tcb.effective_priority, 42);
        assert_eq!(tcb.relative_deadline_us, 5_000);
        assert!(tcb.flags.contains(TaskFlags::PERIODIC));
        assert_eq!(tcb.deadline, NO_DEADLINE);
    }

    #[test]
    fn test_explicit_deadline_overrides_period() {
        let mut tcb = TaskControlBlock::empty();
        let params = TaskParams::new("t", nop).periodic(10_000).deadline(2_000);
        tcb.init(1, 0, &params);
        assert_eq!(tcb.relative_deadline_us, 2_000);
        assert_eq!(tcb.period_us, 10_000);
    }

    #[test]
    fn test_pool_handles_go_stale() {
        let mut pool = TaskPool::new(1);
        let h = pool.allocate().expect("slot");
        assert_eq!(h.core(), 1);
        assert!(pool.get(h).is_some());

        pool.free(h);
        assert!(pool.get(h).is_none());

        let again = pool.allocate().expect("slot");
        assert_eq!(again.slot(), h.slot());
        assert_ne!(again, h);
        assert!(pool.get(h).is_none());
        assert!(pool.get(again).is_some());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = TaskPool::new(0);
        for _ in 0..MAX_TASKS_PER_CORE {
            assert!(pool.allocate().is_some());
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.live_count(), MAX_TASKS_PER_CORE);
    }

    #[test]
    fn test_flags() {
        let f = TaskFlags::REALTIME | TaskFlags::SAFETY;
        assert!(f.contains(TaskFlags::REALTIME));
        assert!(!f.contains(TaskFlags::PRIVILEGED));
        assert!(f.contains(TaskFlags::NONE));
    }

    // --- Kernel-level behaviour on the hosted port ---

    static ORDER_LOG: [AtomicUsize; 3] = [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)];
    static ORDER_NEXT: AtomicUsize = AtomicUsize::new(0);

    fn record_order(_: &'static Core, prio: usize) {
        let i = ORDER_NEXT.fetch_add(1, Ordering::SeqCst);
        ORDER_LOG[i].store(prio, Ordering::SeqCst);
    }

    #[test]
    fn test_priority_selection_order() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        for prio in [10u8, 90, 50] {
            let params = TaskParams::new("p", record_order).priority(prio).arg(prio as usize);
            core.task_create(params).expect("create");
        }
        core.start();
        let order: Vec<usize> = ORDER_LOG.iter().map(|a| a.load(Ordering::SeqCst)).collect();
        assert_eq!(order, vec![90, 50, 10]);
        // Every task ran to completion and was reaped.
        assert_eq!(core.task_count(), 1);
    }

    static DELAY_WOKE_AT: AtomicU64 = AtomicU64::new(0);

    fn sleeper(core: &'static Core, ticks: usize) {
        core.task_delay(ticks as u32).expect("delay");
        DELAY_WOKE_AT.store(core.ticks(), Ordering::SeqCst);
    }

    #[test]
    fn test_delay_wakes_exactly_on_time() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        let t = core
            .task_create(TaskParams::new("sleeper", sleeper).arg(10))
            .expect("create");
        core.start();

        assert_eq!(core.task_state(t), Ok(TaskState::Blocked));
        for _ in 0..9 {
            core.tick_handler();
        }
        assert_eq!(core.task_state(t), Ok(TaskState::Blocked));
        assert_eq!(DELAY_WOKE_AT.load(Ordering::SeqCst), 0);

        core.tick_handler();
        assert_eq!(DELAY_WOKE_AT.load(Ordering::SeqCst), 10);
        assert_eq!(core.task_state(t), Err(KernelError::NoTask));
    }

    static DELAY_OUTCOMES: AtomicU32 = AtomicU32::new(0);

    fn checked_sleeper(core: &'static Core, _: usize) {
        let mut outcomes = 0;
        if core.task_delay(2) == Ok(()) {
            outcomes += 1;
        }
        if core.task_delay(50) == Ok(()) {
            outcomes += 10;
        }
        DELAY_OUTCOMES.store(outcomes, Ordering::SeqCst);
    }

    #[test]
    fn test_delay_reports_expiry_and_early_wake_as_ok() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        let t = core
            .task_create(TaskParams::new("checked", checked_sleeper))
            .expect("create");
        core.start();

        core.tick_handler();
        core.tick_handler();
        // First delay expired; the second one is in progress.
        assert_eq!(core.task_state(t), Ok(TaskState::Blocked));
        core.unblock(t).expect("unblock");
        assert_eq!(DELAY_OUTCOMES.load(Ordering::SeqCst), 11);
    }

    static CADENCE: [AtomicU64; 3] = [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)];

    fn periodic_worker(core: &'static Core, _: usize) {
        let mut wake = core.ticks();
        for slot in CADENCE.iter() {
            core.task_delay_until(&mut wake, 5).expect("delay_until");
            slot.store(core.ticks(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delay_until_keeps_cadence() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        core.task_create(TaskParams::new("cadence", periodic_worker))
            .expect("create");
        core.start();
        for _ in 0..15 {
            core.tick_handler();
        }
        let seen: Vec<u64> = CADENCE.iter().map(|a| a.load(Ordering::SeqCst)).collect();
        assert_eq!(seen, vec![5, 10, 15]);
    }

    static NOTIFY_TAKEN: AtomicU32 = AtomicU32::new(0);

    fn notified(core: &'static Core, _: usize) {
        if core.notify_take(Timeout::FOREVER).is_ok() {
            NOTIFY_TAKEN.fetch_add(1, Ordering::SeqCst);
        }
        if core.notify_take(Timeout::ticks(3)) == Err(KernelError::Timeout) {
            NOTIFY_TAKEN.fetch_add(10, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notify_give_and_take() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        let t = core.task_create(TaskParams::new("n", notified)).expect("create");
        core.start();
        assert_eq!(core.task_state(t), Ok(TaskState::Blocked));

        core.notify_give(t).expect("give");
        assert_eq!(NOTIFY_TAKEN.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            core.tick_handler();
        }
        assert_eq!(NOTIFY_TAKEN.load(Ordering::SeqCst), 11);
    }

    fn parked(core: &'static Core, _: usize) {
        loop {
            let _ = core.task_delay(1_000);
        }
    }

    #[test]
    fn test_suspend_resume_and_delete() {
        let core = testing::core();
        core.adopt_idle().expect("idle");
        let t = core.task_create(TaskParams::new("victim", parked)).expect("create");
        core.start();

        assert_eq!(core.task_resume(t), Err(KernelError::State));
        core.task_suspend(Some(t)).expect("suspend");
        assert_eq!(core.task_state(t), Ok(TaskState::Suspended));
        core.task_resume(t).expect("resume");
        // Resumed, ran, and went back to sleep.
        assert_eq!(core.task_state(t), Ok(TaskState::Blocked));

        core.task_delete(Some(t)).expect("delete");
        assert_eq!(core.task_state(t), Err(KernelError::NoTask));
        assert_eq!(core.task_delete(Some(t)), Err(KernelError::NoTask));
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let core = testing::core();
        let missing_entry = TaskParams::default();
        assert_eq!(core.task_create(missing_entry).err(), Some(KernelError::Param));

        let foreign = TaskParams::new("x", nop).core(1);
        assert_eq!(core.task_create(foreign).err(), Some(KernelError::Param));

        let huge = TaskParams::new("x", nop).stack_size(DEFAULT_STACK_SIZE * 2);
        assert_eq!(core.task_create(huge).err(), Some(KernelError::NoMem));

        // Out-of-range affinity falls back to the creating core.
        let fallback = TaskParams::new("x", nop).core(MAX_CORES + 3);
        let h = core.task_create(fallback).expect("create");
        assert_eq!(core.task_core(h), Ok(0));
    }

    #[test]
    fn test_lookup_and_attributes() {
        let core = testing::core();
        let h = core
            .task_create(TaskParams::new("sensor", nop).priority(77).periodic(4_000))
            .expect("create");
        let id = core.task_id(h).expect("id");
        assert!(id >= 1);
        assert_eq!(core.task_by_id(id), Some(h));
        assert_eq!(core.task_by_name("sensor"), Some(h));
        assert_eq!(core.task_by_name("nobody"), None);
        assert_eq!(core.task_name(h).expect("name").as_str(), "sensor");
        assert_eq!(core.task_priority(h), Ok(77));
        assert_eq!(core.task_deadline(h), Ok(4_000));

        core.task_set_priority(h, 12).expect("set");
        assert_eq!(core.task_priority(h), Ok(12));
        assert_eq!(core.task_base_priority(h), Ok(12));
    }

    #[test]
    fn test_task_pool_full() {
        let core = testing::core();
        for _ in 0..MAX_TASKS_PER_CORE {
            core.task_create(TaskParams::new("fill", nop).stack_size(MIN_STACK_SIZE))
                .expect("create");
        }
        let extra = core.task_create(TaskParams::new("extra", nop));
        assert_eq!(extra.err(), Some(KernelError::NoMem));
    }

    #[test]
    fn test_stack_high_water_and_guard() {
        let core = testing::core();
        let h = core
            .task_create(TaskParams::new("s", nop).stack_size(1024))
            .expect("create");
        assert_eq!(core.stack_high_water(h), Ok(1024));
        assert_eq!(core.check_stack(h), Ok(true));

        let stack = core
            .with(|inner| inner.tasks.get(h).and_then(|t| t.stack))
            .expect("stack");
        unsafe { stack.base().as_ptr().add(200).write(0) };
        assert_eq!(core.stack_high_water(h), Ok(800));

        unsafe { stack.base().as_ptr().write(0) };
        assert_eq!(core.check_stack(h), Ok(false));
    }

    const STACK_WORDS: usize = 256;

    #[test]
    fn test_caller_supplied_stack() {
        let core = testing::core();
        let mem: &'static mut [u32] = Box::leak(vec![0u32; STACK_WORDS].into_boxed_slice());
        let base = mem.as_ptr();
        let h = core
            .task_create(TaskParams::new("own", nop).stack(mem))
            .expect("create");
        let stack = core
            .with(|inner| inner.tasks.get(h).and_then(|t| t.stack))
            .expect("stack");
        assert_eq!(stack.base().as_ptr() as *const u32, base);
        assert_eq!(core.stack_high_water(h), Ok(STACK_WORDS * 4));

        let tiny: &'static mut [u32] = Box::leak(vec![0u32; 8].into_boxed_slice());
        let rejected = core.task_create(TaskParams::new("tiny", nop).stack(tiny));
        assert_eq!(rejected.err(), Some(KernelError::Param));
    }
}
