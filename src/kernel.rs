//! # Kernel
//!
//! [`Core`] is the per-core kernel context. Every kernel operation is a
//! method on the `Core` it runs on, so nothing in the kernel asks "which
//! core am I?": the context is threaded through explicitly.
//!
//! ## Startup Sequence
//!
//! ```text
//! board init
//!   ├─► SharedRegion::new(cores)        ← cross-core memory, once
//!   └─► per core:
//!         ├─► Core::new(id, platform, shared, hooks)
//!         ├─► core.adopt_idle()  or  core.create_idle()
//!         ├─► core.task_create(..)       ← register tasks (×N)
//!         ├─► shared.signal_ready(id)
//!         └─► core.start()               ← first switch
//!               └─► timer ISR: core.tick_handler()
//! ```
//!
//! ## Switching
//!
//! Scheduling decisions are made under the core's critical section, but the
//! switch itself ([`ExecutionContext::switch`]) always runs outside it:
//! [`CoreInner::plan_switch`] commits the decision and returns the two
//! contexts, then the caller performs the switch. A switch requested while
//! the scheduler is locked or while an ISR is active stays pending until
//! `unlock` or the outermost `isr_exit`. Blocking operations force the switch
//! regardless of the lock.
//!
//! [`ExecutionContext::switch`]: crate::arch::ExecutionContext::switch

use core::cell::{RefCell, RefMut};
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use critical_section::{CriticalSection, Mutex as CsMutex};
use tracing::{debug, error, info, warn};

use crate::arch::{ContextId, Platform};
use crate::config::ticks_to_ms;
use crate::error::{KernelError, Result, Timeout};
use crate::ipc::MailboxMessage;
use crate::multicore::SharedRegion;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::sync::critical_section;
use crate::task::{StackArena, TaskHandle, TaskPool, TaskState, WaitKind};

// ---------------------------------------------------------------------------
// Kernel state and hooks
// ---------------------------------------------------------------------------

/// Life-cycle state of one core's kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelState {
    Init = 0,
    Running = 1,
    /// Stopped by a `STOP` IPI; ticks are ignored until `resume`.
    Suspended = 2,
    Panic = 3,
}

impl KernelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => KernelState::Running,
            2 => KernelState::Suspended,
            3 => KernelState::Panic,
            _ => KernelState::Init,
        }
    }
}

/// Application callbacks. Every hook runs outside the kernel's critical
/// section.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Each pass of the idle loop.
    pub idle: Option<fn(&Core)>,
    /// First tick past a task's absolute deadline, with the lateness in µs.
    /// The miss is counted in [`KernelStats`] whether or not a hook is set.
    pub deadline_miss: Option<fn(&Core, TaskHandle, u64)>,
    /// Corrupted stack guard found while switching away from `TaskHandle`.
    pub stack_overflow: fn(&Core, TaskHandle),
    /// Unrecoverable kernel error.
    pub panic: fn(&Core, &str) -> !,
    /// IPI events numbered `USER` and above.
    pub ipi: Option<fn(&Core, u32)>,
    /// Mailbox messages drained by `process_pending` that are not RPCs.
    pub message: Option<fn(&Core, &MailboxMessage)>,
}

fn default_stack_overflow(core: &Core, _task: TaskHandle) {
    core.panic("Stack overflow")
}

fn default_panic(core: &Core, msg: &str) -> ! {
    panic!("core {}: {}", core.id(), msg)
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            idle: None,
            deadline_miss: None,
            stack_overflow: default_stack_overflow,
            panic: default_panic,
            ipi: None,
            message: None,
        }
    }
}

/// Kernel counters for one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub deadline_misses: u32,
    pub stack_overflows: u32,
    pub uptime_ms: u64,
}

// ---------------------------------------------------------------------------
// Core-local state
// ---------------------------------------------------------------------------

/// A committed context switch, performed outside the critical section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Planned {
    from: Option<ContextId>,
    to: ContextId,
    /// Outgoing task whose stack guard was found corrupted.
    overflowed: Option<TaskHandle>,
}

/// Everything guarded by the core's critical section.
pub(crate) struct CoreInner {
    pub(crate) tasks: TaskPool,
    pub(crate) sched: Scheduler,
    /// Self-deleted task awaiting reaping.
    pub(crate) zombie: Option<TaskHandle>,
}

impl CoreInner {
    fn new(core: usize) -> Self {
        Self {
            tasks: TaskPool::new(core),
            sched: Scheduler::new(),
            zombie: None,
        }
    }

    /// Block the running task on `kind`. The caller must then switch away
    /// with [`Core::switch_away`].
    pub(crate) fn park(&mut self, timeout: Timeout, kind: WaitKind) -> Option<TaskHandle> {
        let me = self.sched.block_current(&mut self.tasks, timeout)?;
        if let Some(tcb) = self.tasks.get_mut(me) {
            tcb.blocked_on = Some(kind);
        }
        Some(me)
    }

    /// Block the running task until tick `wake`. `None` if `wake` already
    /// passed.
    pub(crate) fn park_until(&mut self, wake: u64, kind: WaitKind) -> Option<TaskHandle> {
        let me = self.sched.current()?;
        if !self.sched.delay_until(&mut self.tasks, wake) {
            return None;
        }
        if let Some(tcb) = self.tasks.get_mut(me) {
            tcb.blocked_on = Some(kind);
        }
        Some(me)
    }

    /// Wake a Blocked task with `result` as its wait outcome. Returns
    /// `false` if the task is stale or not blocked.
    pub(crate) fn wake(&mut self, h: TaskHandle, result: Result<()>) -> bool {
        match self.tasks.get_mut(h) {
            Some(tcb) if tcb.state == TaskState::Blocked => {
                tcb.wait_result = result;
                tcb.blocked_on = None;
            }
            _ => return false,
        }
        self.sched.unblock(&mut self.tasks, h);
        true
    }

    /// `true` if `h` is live and Blocked on `kind`.
    pub(crate) fn is_waiting_on(&self, h: TaskHandle, kind: WaitKind) -> bool {
        self.tasks
            .get(h)
            .map_or(false, |t| t.state == TaskState::Blocked && t.blocked_on == Some(kind))
    }

    pub(crate) fn effective_priority(&self, h: TaskHandle) -> u8 {
        self.tasks.get(h).map_or(0, |t| t.effective_priority)
    }

    /// Commit the next switch. Unless `force`d, nothing happens while no
    /// switch is pending or the scheduler is locked.
    pub(crate) fn plan_switch(&mut self, now_us: u64, force: bool) -> Option<Planned> {
        if !self.sched.is_running() {
            return None;
        }
        if !force && (!self.sched.switch_pending() || self.sched.is_locked()) {
            return None;
        }
        let sw = self.sched.switch_target(&mut self.tasks, now_us)?;
        let to = self.tasks.get(sw.to).and_then(|t| t.context)?;

        let mut overflowed = None;
        let from = match sw.from.and_then(|h| self.tasks.get_mut(h).map(|t| (h, t))) {
            Some((h, tcb)) => {
                if !tcb.overflow_reported && tcb.stack_overflowed() {
                    tcb.overflow_reported = true;
                    overflowed = Some(h);
                }
                tcb.context
            }
            None => None,
        };
        Some(Planned { from, to, overflowed })
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

/// Per-core kernel context.
pub struct Core {
    id: usize,
    platform: &'static dyn Platform,
    shared: &'static SharedRegion,
    hooks: Hooks,
    inner: CsMutex<RefCell<CoreInner>>,
    stacks: StackArena,
    isr_nesting: AtomicU32,
    state: AtomicU8,
    deadline_misses: AtomicU32,
    stack_overflows: AtomicU32,
}

impl Core {
    /// Build the kernel context for core `id`. `Param` if `id` is not one
    /// of the cores configured in `shared`.
    pub fn new(
        id: usize,
        platform: &'static dyn Platform,
        shared: &'static SharedRegion,
        hooks: Hooks,
    ) -> Result<Self> {
        if id >= shared.num_cores() {
            return Err(KernelError::Param);
        }
        Ok(Self {
            id,
            platform,
            shared,
            hooks,
            inner: CsMutex::new(RefCell::new(CoreInner::new(id))),
            stacks: StackArena::new(),
            isr_nesting: AtomicU32::new(0),
            state: AtomicU8::new(KernelState::Init as u8),
            deadline_misses: AtomicU32::new(0),
            stack_overflows: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn shared(&self) -> &'static SharedRegion {
        self.shared
    }

    #[inline]
    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    #[inline]
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub(crate) fn stacks(&self) -> &StackArena {
        &self.stacks
    }

    /// Run `f` on the core-local state inside a critical section. Never
    /// nest calls, and never switch or call hooks inside `f`.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut CoreInner) -> R) -> R {
        critical_section(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Core-local state for callers that also hold other objects' state in
    /// the same critical section.
    pub(crate) fn inner<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, CoreInner> {
        self.inner.borrow_ref_mut(cs)
    }

    // -----------------------------------------------------------------------
    // Kernel state
    // -----------------------------------------------------------------------

    pub fn state(&self) -> KernelState {
        KernelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: KernelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Leave the `Suspended` state entered through a `STOP` IPI.
    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            KernelState::Suspended as u8,
            KernelState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Enter the panic state and call the panic hook.
    pub fn panic(&self, msg: &str) -> ! {
        self.set_state(KernelState::Panic);
        error!(core = self.id, msg, "kernel panic");
        (self.hooks.panic)(self, msg)
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
            stack_overflows: self.stack_overflows.load(Ordering::Relaxed),
            uptime_ms: ticks_to_ms(self.ticks()),
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler control
    // -----------------------------------------------------------------------

    /// Start scheduling. Requires an idle task; without one the panic hook
    /// is invoked with `"No idle task"`.
    ///
    /// With an adopted idle task this returns once the idle flow is
    /// scheduled again. With a created idle task there is no flow to return
    /// to, and the first task is launched directly.
    pub fn start(&self) {
        let now = self.platform.now_us();
        let fresh = self.with(|inner| {
            inner.sched.idle()?;
            inner.sched.set_running(now);
            Some(inner.sched.current().is_none())
        });
        let Some(fresh) = fresh else {
            self.panic("No idle task");
        };
        self.set_state(KernelState::Running);
        info!(core = self.id, "scheduler started");

        if fresh {
            let plan = self.with(|inner| inner.plan_switch(now, true));
            self.perform(plan);
        } else {
            self.dispatch();
        }
    }

    pub fn is_running(&self) -> bool {
        self.with(|inner| inner.sched.is_running())
    }

    /// Disable preemption. Nests.
    pub fn lock(&self) {
        self.with(|inner| inner.sched.lock());
    }

    /// Re-enable preemption; the outermost unlock runs a pending switch.
    pub fn unlock(&self) {
        if self.with(|inner| inner.sched.unlock()) {
            self.dispatch();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.with(|inner| inner.sched.is_locked())
    }

    pub fn ticks(&self) -> u64 {
        self.with(|inner| inner.sched.ticks())
    }

    /// Deadline clock in µs (ticks scaled by the tick period).
    pub fn now_us(&self) -> u64 {
        self.with(|inner| inner.sched.now_us())
    }

    pub fn select_next(&self) -> Option<TaskHandle> {
        self.with(|inner| inner.sched.select_next())
    }

    /// Request a reschedule; performed now unless locked or in an ISR.
    pub fn switch_request(&self) {
        self.with(|inner| inner.sched.request_switch());
        self.dispatch();
    }

    /// Block the calling task until [`unblock`](Self::unblock),
    /// [`wake`](Self::wake), or the timeout.
    pub fn block(&self, timeout: Timeout) -> Result<()> {
        let me = self.task_context()?;
        if timeout.is_no_wait() {
            return Err(KernelError::Timeout);
        }
        self.with(|inner| inner.park(timeout, WaitKind::Delay));
        self.switch_away(me)
    }

    /// Make a blocked task ready; its wait returns `Ok`.
    pub fn unblock(&self, task: TaskHandle) -> Result<()> {
        self.wake(task, false)
    }

    /// Make a blocked task ready, reporting `Timeout` to it if
    /// `timeout_expired`. Tasks that are not blocked are left alone.
    pub fn wake(&self, task: TaskHandle, timeout_expired: bool) -> Result<()> {
        self.with(|inner| {
            inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            let result = if timeout_expired {
                Err(KernelError::Timeout)
            } else {
                Ok(())
            };
            inner.wake(task, result);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    /// Raise a task's effective priority to at least `priority`.
    pub fn priority_inherit(&self, task: TaskHandle, priority: u8) -> Result<()> {
        self.with(|inner| {
            inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            inner.sched.priority_inherit(&mut inner.tasks, task, priority);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    /// Drop a task's effective priority back to its base priority.
    pub fn priority_restore(&self, task: TaskHandle) -> Result<()> {
        self.with(|inner| {
            inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            inner.sched.priority_restore(&mut inner.tasks, task);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    /// Assign a new absolute deadline (µs on the deadline clock).
    pub fn set_deadline(&self, task: TaskHandle, deadline_us: u64) -> Result<()> {
        self.with(|inner| {
            inner.tasks.get(task).ok_or(KernelError::NoTask)?;
            inner.sched.set_deadline(&mut inner.tasks, task, deadline_us);
            Ok(())
        })?;
        self.dispatch();
        Ok(())
    }

    pub fn validate(&self) -> bool {
        self.with(|inner| inner.sched.validate(&inner.tasks))
    }

    pub fn validate_or_panic(&self) {
        if !self.validate() {
            self.panic("Scheduler invariant violated");
        }
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.with(|inner| inner.sched.stats())
    }

    pub fn reset_stats(&self) {
        self.with(|inner| inner.sched.reset_stats());
        self.deadline_misses.store(0, Ordering::Relaxed);
        self.stack_overflows.store(0, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Interrupts and time
    // -----------------------------------------------------------------------

    pub fn isr_enter(&self) {
        self.isr_nesting.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave an ISR; the outermost exit performs a pending switch.
    pub fn isr_exit(&self) {
        let prev = self
            .isr_nesting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev == 1 {
            self.dispatch();
        }
    }

    #[inline]
    pub fn in_isr(&self) -> bool {
        self.isr_nesting.load(Ordering::Acquire) > 0
    }

    /// Advance the scheduler by one tick.
    pub fn tick(&self) {
        let missed = self.with(|inner| inner.sched.tick(&mut inner.tasks));
        if let Some(miss) = missed {
            self.deadline_misses.fetch_add(1, Ordering::Relaxed);
            warn!(
                core = self.id,
                slot = miss.task.slot(),
                lateness_us = miss.lateness_us,
                "deadline missed"
            );
            if let Some(hook) = self.hooks.deadline_miss {
                hook(self, miss.task, miss.lateness_us);
            }
        }
        self.dispatch();
    }

    /// Timer interrupt body: drain IPI events, tick, and switch on exit if
    /// needed.
    pub fn tick_handler(&self) {
        self.isr_enter();
        self.handle_ipi();
        if self.state() != KernelState::Suspended {
            self.tick();
        }
        self.isr_exit();
    }

    // -----------------------------------------------------------------------
    // Switching
    // -----------------------------------------------------------------------

    /// The calling task, if the caller may block.
    pub(crate) fn task_context(&self) -> Result<TaskHandle> {
        if self.in_isr() {
            return Err(KernelError::Isr);
        }
        self.with(|inner| match inner.sched.current() {
            Some(cur) if inner.sched.is_running() && Some(cur) != inner.sched.idle() => Ok(cur),
            _ => Err(KernelError::State),
        })
    }

    /// Run a pending switch if preemption is allowed right now.
    pub(crate) fn dispatch(&self) {
        if self.in_isr() {
            return;
        }
        let now = self.platform.now_us();
        let plan = self.with(|inner| inner.plan_switch(now, false));
        self.perform(plan);
    }

    /// Switch away from the task `me`, which has just parked itself, and
    /// return its wait result once it runs again.
    pub(crate) fn switch_away(&self, me: TaskHandle) -> Result<()> {
        let now = self.platform.now_us();
        let plan = self.with(|inner| inner.plan_switch(now, true));
        self.perform(plan);
        self.with(|inner| inner.tasks.get(me).map_or(Err(KernelError::NoTask), |t| t.wait_result))
    }

    pub(crate) fn perform(&self, plan: Option<Planned>) {
        let Some(plan) = plan else { return };
        if let Some(task) = plan.overflowed {
            self.stack_overflows.fetch_add(1, Ordering::Relaxed);
            error!(core = self.id, slot = task.slot(), "stack overflow");
            (self.hooks.stack_overflow)(self, task);
        }
        match plan.from {
            Some(from) => {
                self.platform.switch(from, plan.to);
                self.after_switch();
            }
            None => self.platform.start_first(plan.to),
        }
    }

    /// First thing every flow does when it gains the CPU: reap a task that
    /// deleted itself on the way out.
    pub(crate) fn after_switch(&self) {
        let reaped = self.with(|inner| {
            let zombie = inner.zombie.take()?;
            let ctx = inner.tasks.get(zombie).and_then(|t| t.context);
            inner.tasks.free(zombie);
            Some((zombie, ctx))
        });
        if let Some((task, ctx)) = reaped {
            if let Some(ctx) = ctx {
                self.platform.destroy(ctx);
            }
            debug!(core = self.id, slot = task.slot(), "task reaped");
        }
    }
}

// ---------------------------------------------------------------------------
// Hosted test harness
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::arch::hosted::HostedPort;
    use std::boxed::Box;
    use std::vec::Vec;

    pub(crate) fn port() -> &'static HostedPort {
        Box::leak(Box::new(HostedPort::new()))
    }

    pub(crate) fn shared(cores: usize) -> &'static SharedRegion {
        Box::leak(Box::new(SharedRegion::new(cores)))
    }

    pub(crate) fn core_on(
        id: usize,
        port: &'static HostedPort,
        shared: &'static SharedRegion,
        hooks: Hooks,
    ) -> &'static Core {
        Box::leak(Box::new(Core::new(id, port, shared, hooks).expect("core")))
    }

    /// A single unstarted core with default hooks.
    pub(crate) fn core() -> &'static Core {
        core_with(Hooks::default())
    }

    pub(crate) fn core_with(hooks: Hooks) -> &'static Core {
        core_on(0, port(), shared(1), hooks)
    }

    /// A started single core whose idle task is the calling test thread.
    pub(crate) fn running(hooks: Hooks) -> &'static Core {
        let core = core_with(hooks);
        core.adopt_idle().expect("adopt idle");
        core.start();
        core
    }

    /// `n` unstarted cores sharing one port and shared region.
    pub(crate) fn system(n: usize) -> Vec<&'static Core> {
        let port = port();
        let shared = shared(n);
        (0..n).map(|id| core_on(id, port, shared, Hooks::default())).collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
