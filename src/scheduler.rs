//! # EDF Scheduler
//!
//! Per-core Earliest-Deadline-First scheduling state. The scheduler owns no
//! tasks: it orders [`TaskHandle`]s that live in the core's [`TaskPool`] and
//! is always driven under the core's critical section.
//!
//! ## Ordering
//!
//! Task `a` precedes task `b` iff `a.deadline < b.deadline`, or the
//! deadlines are equal and `a.effective_priority > b.effective_priority`.
//! Tasks without a deadline carry [`NO_DEADLINE`] and therefore sort after
//! every task that has one, ordered among themselves by priority. Equal keys
//! insert after the existing equals, so a yielding task moves to the back of
//! its class.
//!
//! ## Lists
//!
//! ```text
//!   ready   [ T3(d=5) | T1(d=9) | T4(d=9,p=10) | T2(none) ]   head runs
//!   delayed [ T5(wake=12) | T6(wake=40) ]                     sorted by wake
//!   idle    T0                                                 never listed
//! ```
//!
//! The running task stays in the ready list. The idle task is never in it:
//! [`Scheduler::select_next`] returns the head or, if the list is empty,
//! the idle task.
//!
//! ## Tick
//!
//! Every tick:
//! 1. Advance the tick counter.
//! 2. Move expired delay entries (`wake_time <= ticks`) to the ready list,
//!    marking tasks that were still blocked with a `Timeout` result.
//! 3. Check the running task's absolute deadline; report a miss once per
//!    deadline.
//! 4. Request a switch if the ready head now precedes the running task.

use heapless::Vec;
use tracing::{debug, trace};

use crate::config::{MAX_TASKS_PER_CORE, TICK_PERIOD_US};
use crate::error::{KernelError, Timeout};
use crate::task::{TaskControlBlock, TaskHandle, TaskPool, TaskState};

/// Deadline of a task without timing constraints. Sorts after every real
/// deadline.
pub const NO_DEADLINE: u64 = u64::MAX;

type HandleList = Vec<TaskHandle, MAX_TASKS_PER_CORE>;

/// `true` if `a` must run before `b`.
#[inline]
pub(crate) fn edf_precedes(a: &TaskControlBlock, b: &TaskControlBlock) -> bool {
    if a.deadline != b.deadline {
        a.deadline < b.deadline
    } else {
        a.effective_priority > b.effective_priority
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub context_switches: u32,
    pub ticks: u64,
    pub ready_count: usize,
}

/// Outcome of a planned context switch: the outgoing task (if any) and the
/// incoming one. State, statistics, and `current` are already updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Switch {
    pub from: Option<TaskHandle>,
    pub to: TaskHandle,
}

/// A deadline overrun observed by [`Scheduler::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeadlineMiss {
    pub task: TaskHandle,
    pub lateness_us: u64,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Per-core scheduling state.
pub struct Scheduler {
    ready: HandleList,
    delayed: HandleList,
    current: Option<TaskHandle>,
    idle: Option<TaskHandle>,
    lock_count: u32,
    switch_pending: bool,
    running: bool,
    ticks: u64,
    context_switches: u32,
    last_switch_us: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: Vec::new(),
            delayed: Vec::new(),
            current: None,
            idle: None,
            lock_count: 0,
            switch_pending: false,
            running: false,
            ticks: 0,
            context_switches: 0,
            last_switch_us: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[inline]
    pub fn current(&self) -> Option<TaskHandle> {
        self.current
    }

    #[inline]
    pub fn idle(&self) -> Option<TaskHandle> {
        self.idle
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Deadline clock: ticks scaled to microseconds.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.ticks * TICK_PERIOD_US as u64
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    #[inline]
    pub fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            context_switches: self.context_switches,
            ticks: self.ticks,
            ready_count: self.ready.len(),
        }
    }

    pub fn reset_stats(&mut self) {
        self.context_switches = 0;
    }

    #[cfg(test)]
    pub(crate) fn is_delayed(&self, h: TaskHandle) -> bool {
        self.delayed.contains(&h)
    }

    /// Ready list in scheduling order.
    #[cfg(test)]
    pub(crate) fn ready_list(&self) -> &[TaskHandle] {
        &self.ready
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn set_idle(&mut self, idle: TaskHandle) {
        self.idle = Some(idle);
    }

    /// Make `h` the running flow without a context switch. Used when the
    /// boot flow is adopted as the idle task.
    pub(crate) fn set_current(&mut self, h: TaskHandle) {
        self.current = Some(h);
    }

    pub(crate) fn set_running(&mut self, now_us: u64) {
        self.running = true;
        self.switch_pending = true;
        self.last_switch_us = now_us;
    }

    pub(crate) fn lock(&mut self) {
        self.lock_count = self.lock_count.saturating_add(1);
    }

    /// Returns `true` when the outermost lock was released.
    pub(crate) fn unlock(&mut self) -> bool {
        if self.lock_count == 0 {
            return false;
        }
        self.lock_count -= 1;
        self.lock_count == 0
    }

    pub(crate) fn request_switch(&mut self) {
        self.switch_pending = true;
    }

    // -----------------------------------------------------------------------
    // Ready list
    // -----------------------------------------------------------------------

    fn insert_ready(&mut self, tasks: &TaskPool, h: TaskHandle) {
        if Some(h) == self.idle || self.ready.contains(&h) {
            return;
        }
        let Some(new) = tasks.get(h) else { return };
        let pos = self
            .ready
            .iter()
            .position(|&other| tasks.get(other).map_or(true, |o| edf_precedes(new, o)))
            .unwrap_or(self.ready.len());
        if self.ready.insert(pos, h).is_err() {
            tracing::error!(slot = h.slot(), "ready list overflow");
        }
    }

    fn remove_ready(&mut self, h: TaskHandle) -> bool {
        match self.ready.iter().position(|&x| x == h) {
            Some(pos) => {
                self.ready.remove(pos);
                true
            }
            None => false,
        }
    }

    fn resort(&mut self, tasks: &TaskPool, h: TaskHandle) {
        if self.remove_ready(h) {
            self.insert_ready(tasks, h);
        }
    }

    /// Whether `h` should displace the running task.
    fn preempts(&self, tasks: &TaskPool, h: TaskHandle) -> bool {
        match self.current {
            None => true,
            Some(cur) if cur == h => false,
            Some(cur) if Some(cur) == self.idle => true,
            Some(cur) => match (tasks.get(h), tasks.get(cur)) {
                (Some(a), Some(b)) => edf_precedes(a, b),
                (Some(_), None) => true,
                _ => false,
            },
        }
    }

    /// Mark `h` Ready and insert it in EDF order. Returns `true` and sets
    /// the switch-pending flag if `h` should preempt the running task.
    pub(crate) fn ready(&mut self, tasks: &mut TaskPool, h: TaskHandle) -> bool {
        let Some(tcb) = tasks.get_mut(h) else { return false };
        if tcb.state != TaskState::Running {
            tcb.state = TaskState::Ready;
        }
        self.insert_ready(tasks, h);
        let preempt = self.running && self.preempts(tasks, h);
        if preempt {
            self.switch_pending = true;
        }
        preempt
    }

    /// Take `h` off the ready and delay lists without changing its state.
    pub(crate) fn unready(&mut self, h: TaskHandle) {
        self.remove_ready(h);
        self.remove_delay(h);
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Block the running task. A finite `timeout` also enters it in the
    /// delay list so [`tick`](Self::tick) wakes it with `Timeout`.
    pub(crate) fn block_current(&mut self, tasks: &mut TaskPool, timeout: Timeout) -> Option<TaskHandle> {
        let cur = self.current?;
        if Some(cur) == self.idle {
            return None;
        }
        self.remove_ready(cur);
        let tcb = tasks.get_mut(cur)?;
        tcb.state = TaskState::Blocked;
        tcb.wait_result = Ok(());
        if let Some(n) = timeout.finite() {
            self.insert_delay(tasks, cur, self.ticks + n as u64);
        }
        debug!(slot = cur.slot(), timeout = timeout.0, "task blocked");
        Some(cur)
    }

    /// Return a Blocked task to the ready list. Returns `true` if it should
    /// preempt the running task. Tasks in any other state are left alone.
    pub(crate) fn unblock(&mut self, tasks: &mut TaskPool, h: TaskHandle) -> bool {
        match tasks.get(h) {
            Some(tcb) if tcb.state == TaskState::Blocked => {}
            _ => return false,
        }
        self.remove_delay(h);
        trace!(slot = h.slot(), "task unblocked");
        self.ready(tasks, h)
    }

    // -----------------------------------------------------------------------
    // Delay list
    // -----------------------------------------------------------------------

    pub(crate) fn insert_delay(&mut self, tasks: &mut TaskPool, h: TaskHandle, wake_time: u64) {
        self.remove_delay(h);
        let Some(tcb) = tasks.get_mut(h) else { return };
        tcb.wake_time = wake_time;
        let pos = self
            .delayed
            .iter()
            .position(|&other| tasks.get(other).map_or(true, |o| wake_time < o.wake_time))
            .unwrap_or(self.delayed.len());
        if self.delayed.insert(pos, h).is_err() {
            tracing::error!(slot = h.slot(), "delay list overflow");
        }
    }

    pub(crate) fn remove_delay(&mut self, h: TaskHandle) -> bool {
        match self.delayed.iter().position(|&x| x == h) {
            Some(pos) => {
                self.delayed.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Block the running task until the absolute tick `wake_time`. Returns
    /// `false` if the time has already passed.
    pub(crate) fn delay_until(&mut self, tasks: &mut TaskPool, wake_time: u64) -> bool {
        if wake_time <= self.ticks {
            return false;
        }
        let Some(cur) = self.block_current(tasks, Timeout::FOREVER) else {
            return false;
        };
        self.insert_delay(tasks, cur, wake_time);
        true
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance time by one tick. Returns the deadline miss of the running
    /// task, if this tick is the first to observe it.
    pub(crate) fn tick(&mut self, tasks: &mut TaskPool) -> Option<DeadlineMiss> {
        self.ticks += 1;

        while let Some(&h) = self.delayed.first() {
            let expired = tasks.get(h).map_or(true, |t| t.wake_time <= self.ticks);
            if !expired {
                break;
            }
            self.delayed.remove(0);
            if let Some(tcb) = tasks.get_mut(h) {
                if tcb.state == TaskState::Blocked {
                    tcb.wait_result = Err(KernelError::Timeout);
                    self.ready(tasks, h);
                }
            }
        }

        let now = self.now_us();
        let mut missed = None;
        if let Some(cur) = self.current.filter(|&c| Some(c) != self.idle) {
            if let Some(tcb) = tasks.get_mut(cur) {
                if tcb.deadline != NO_DEADLINE && now > tcb.deadline && !tcb.deadline_reported {
                    tcb.deadline_reported = true;
                    tcb.stats.deadlines_missed += 1;
                    missed = Some(DeadlineMiss {
                        task: cur,
                        lateness_us: now - tcb.deadline,
                    });
                }
            }
        }

        if self.running {
            if let Some(next) = self.ready.first().copied() {
                if self.preempts(tasks, next) {
                    self.switch_pending = true;
                }
            }
        }

        missed
    }

    // -----------------------------------------------------------------------
    // Selection and switching
    // -----------------------------------------------------------------------

    /// Head of the ready list, or the idle task if nothing is ready.
    pub fn select_next(&self) -> Option<TaskHandle> {
        self.ready.first().copied().or(self.idle)
    }

    /// Commit to running the selected task. Updates task states,
    /// execution-time statistics, and `current`. Returns `None` when the
    /// selected task is already running.
    pub(crate) fn switch_target(&mut self, tasks: &mut TaskPool, now_us: u64) -> Option<Switch> {
        self.switch_pending = false;
        let next = self.select_next()?;
        if Some(next) == self.current {
            // Woken before it managed to switch away.
            if let Some(tcb) = tasks.get_mut(next) {
                tcb.state = TaskState::Running;
            }
            return None;
        }
        tasks.get(next)?;

        let prev = self.current;
        let ran = now_us.saturating_sub(self.last_switch_us);
        if let Some(tcb) = prev.and_then(|p| tasks.get_mut(p)) {
            if tcb.state == TaskState::Running {
                tcb.state = TaskState::Ready;
                tcb.stats.preemptions += 1;
            }
            tcb.stats.total_time_us += ran;
            tcb.stats.max_exec_us = tcb.stats.max_exec_us.max(ran);
        }

        if let Some(tcb) = tasks.get_mut(next) {
            tcb.state = TaskState::Running;
            tcb.stats.run_count += 1;
        }

        self.current = Some(next);
        self.context_switches = self.context_switches.wrapping_add(1);
        self.last_switch_us = now_us;
        debug!(
            from = prev.map_or(-1, |p| p.slot() as i32),
            to = next.slot(),
            "context switch"
        );
        Some(Switch { from: prev, to: next })
    }

    /// Move the running task to the back of its equal-key class.
    pub(crate) fn yield_current(&mut self, tasks: &mut TaskPool) {
        let Some(cur) = self.current else { return };
        if !self.remove_ready(cur) {
            return;
        }
        if let Some(tcb) = tasks.get_mut(cur) {
            tcb.state = TaskState::Ready;
        }
        self.insert_ready(tasks, cur);
        self.switch_pending = true;
    }

    // -----------------------------------------------------------------------
    // Priority and deadline changes
    // -----------------------------------------------------------------------

    /// Raise the effective priority of `h` to `ceiling`. Never lowers it.
    pub(crate) fn priority_inherit(&mut self, tasks: &mut TaskPool, h: TaskHandle, ceiling: u8) {
        let Some(tcb) = tasks.get_mut(h) else { return };
        if ceiling <= tcb.effective_priority {
            return;
        }
        debug!(slot = h.slot(), from = tcb.effective_priority, to = ceiling, "priority inherited");
        tcb.effective_priority = ceiling;
        self.resort(tasks, h);
    }

    /// Drop the effective priority of `h` back to its base priority.
    pub(crate) fn priority_restore(&mut self, tasks: &mut TaskPool, h: TaskHandle) {
        let Some(tcb) = tasks.get_mut(h) else { return };
        if tcb.effective_priority == tcb.base_priority {
            return;
        }
        tcb.effective_priority = tcb.base_priority;
        self.resort(tasks, h);
        self.switch_pending = true;
    }

    /// Set a new base priority; the effective priority follows unless it is
    /// currently raised above the new base by inheritance.
    pub(crate) fn set_priority(&mut self, tasks: &mut TaskPool, h: TaskHandle, priority: u8) {
        let Some(tcb) = tasks.get_mut(h) else { return };
        let inherited = tcb.effective_priority > tcb.base_priority;
        tcb.base_priority = priority;
        if !inherited || priority > tcb.effective_priority {
            tcb.effective_priority = priority;
        }
        self.resort(tasks, h);
        self.switch_pending = true;
    }

    /// Give `h` a new absolute deadline and re-sort it.
    pub(crate) fn set_deadline(&mut self, tasks: &mut TaskPool, h: TaskHandle, deadline_us: u64) {
        let Some(tcb) = tasks.get_mut(h) else { return };
        tcb.deadline = deadline_us;
        tcb.deadline_reported = false;
        self.resort(tasks, h);
        self.switch_pending = true;
    }

    // -----------------------------------------------------------------------
    // Consistency
    // -----------------------------------------------------------------------

    /// Check the list invariants: the ready list is in EDF order and holds
    /// only live Ready/Running tasks, the delay list is in wake order.
    pub fn validate(&self, tasks: &TaskPool) -> bool {
        let mut prev: Option<&TaskControlBlock> = None;
        for &h in self.ready.iter() {
            let Some(tcb) = tasks.get(h) else { return false };
            if !matches!(tcb.state, TaskState::Ready | TaskState::Running) {
                return false;
            }
            if let Some(p) = prev {
                if edf_precedes(tcb, p) {
                    return false;
                }
            }
            prev = Some(tcb);
        }

        let mut last_wake = 0;
        for &h in self.delayed.iter() {
            let Some(tcb) = tasks.get(h) else { return false };
            if tcb.wake_time < last_wake {
                return false;
            }
            last_wake = tcb.wake_time;
        }
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskParams, TaskPool};

    fn nop(_: &'static crate::kernel::Core, _: usize) {}

    fn spawn(pool: &mut TaskPool, prio: u8, deadline: u64) -> TaskHandle {
        let params = TaskParams::new("t", nop).priority(prio);
        let h = pool.allocate().expect("pool full");
        let tcb = pool.get_mut(h).expect("fresh slot");
        tcb.init(h.slot() as u32 + 1, 0, &params);
        tcb.deadline = deadline;
        h
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_ready_order_by_priority_without_deadlines() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let low = spawn(&mut pool, 10, NO_DEADLINE);
        let high = spawn(&mut pool, 90, NO_DEADLINE);
        let mid = spawn(&mut pool, 50, NO_DEADLINE);
        for h in [low, high, mid] {
            s.ready(&mut pool, h);
        }
        assert_eq!(s.ready_list(), &[high, mid, low]);
        assert_eq!(s.select_next(), Some(high));
    }

    #[test]
    fn test_deadline_beats_priority() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let urgent = spawn(&mut pool, 1, 500);
        let important = spawn(&mut pool, 200, 1_000);
        let background = spawn(&mut pool, 255, NO_DEADLINE);
        for h in [background, important, urgent] {
            s.ready(&mut pool, h);
        }
        assert_eq!(s.ready_list(), &[urgent, important, background]);
    }

    #[test]
    fn test_equal_keys_are_fifo_and_yield_rotates() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let a = spawn(&mut pool, 50, NO_DEADLINE);
        let b = spawn(&mut pool, 50, NO_DEADLINE);
        s.ready(&mut pool, a);
        s.ready(&mut pool, b);
        assert_eq!(s.ready_list(), &[a, b]);

        s.set_running(0);
        let sw = s.switch_target(&mut pool, 0).expect("switch");
        assert_eq!(sw.to, a);
        s.yield_current(&mut pool);
        assert_eq!(s.ready_list(), &[b, a]);
        assert_eq!(s.switch_target(&mut pool, 10).map(|sw| sw.to), Some(b));
    }

    #[test]
    fn test_idle_selected_only_when_nothing_ready() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let idle = spawn(&mut pool, 0, NO_DEADLINE);
        s.set_idle(idle);
        s.ready(&mut pool, idle);
        assert!(s.ready_list().is_empty());
        assert_eq!(s.select_next(), Some(idle));

        let t = spawn(&mut pool, 1, NO_DEADLINE);
        s.ready(&mut pool, t);
        assert_eq!(s.select_next(), Some(t));
    }

    #[test]
    fn test_ready_list_stays_sorted_under_random_operations() {
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        for _round in 0..50 {
            let mut pool = TaskPool::new(0);
            let mut s = Scheduler::new();
            let mut live = std::vec::Vec::new();
            for _ in 0..MAX_TASKS_PER_CORE {
                let deadline = match rng.next() % 4 {
                    0 => NO_DEADLINE,
                    _ => rng.next() % 50,
                };
                let h = spawn(&mut pool, (rng.next() % 256) as u8, deadline);
                live.push(h);
            }
            for _op in 0..200 {
                let h = live[(rng.next() % live.len() as u64) as usize];
                match rng.next() % 5 {
                    0 | 1 => {
                        s.ready(&mut pool, h);
                    }
                    2 => s.unready(h),
                    3 => {
                        s.ready(&mut pool, h);
                        s.priority_inherit(&mut pool, h, (rng.next() % 256) as u8);
                    }
                    _ => s.set_deadline(&mut pool, h, rng.next() % 50),
                }
                assert!(s.validate(&pool));
            }
        }
    }

    #[test]
    fn test_tick_wakes_delayed_with_timeout() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let t = spawn(&mut pool, 10, NO_DEADLINE);
        s.ready(&mut pool, t);
        s.set_running(0);
        s.switch_target(&mut pool, 0);
        assert_eq!(s.current(), Some(t));

        s.block_current(&mut pool, Timeout::ticks(3));
        assert_eq!(pool.get(t).map(|x| x.state), Some(TaskState::Blocked));
        assert!(s.is_delayed(t));

        s.tick(&mut pool);
        s.tick(&mut pool);
        assert_eq!(pool.get(t).map(|x| x.state), Some(TaskState::Blocked));
        s.tick(&mut pool);
        let tcb = pool.get(t).expect("live");
        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.wait_result, Err(KernelError::Timeout));
        assert!(!s.is_delayed(t));
        assert!(s.validate(&pool));
    }

    #[test]
    fn test_deadline_miss_reported_once() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let t = spawn(&mut pool, 10, 1_500);
        s.ready(&mut pool, t);
        s.set_running(0);
        s.switch_target(&mut pool, 0);

        assert_eq!(s.tick(&mut pool), None); // now = 1000
        let miss = s.tick(&mut pool).expect("miss at 2000");
        assert_eq!(miss.task, t);
        assert_eq!(miss.lateness_us, 500);
        assert_eq!(s.tick(&mut pool), None);
        assert_eq!(pool.get(t).map(|x| x.stats.deadlines_missed), Some(1));

        s.set_deadline(&mut pool, t, 4_500);
        assert_eq!(s.tick(&mut pool), None); // now = 4000
        assert!(s.tick(&mut pool).is_some());
    }

    #[test]
    fn test_inheritance_resorts_and_restore_returns_to_base() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let low = spawn(&mut pool, 10, NO_DEADLINE);
        let mid = spawn(&mut pool, 50, NO_DEADLINE);
        s.ready(&mut pool, low);
        s.ready(&mut pool, mid);
        assert_eq!(s.ready_list(), &[mid, low]);

        s.priority_inherit(&mut pool, low, 90);
        assert_eq!(s.ready_list(), &[low, mid]);
        s.priority_inherit(&mut pool, low, 20);
        assert_eq!(pool.get(low).map(|t| t.effective_priority), Some(90));

        s.priority_restore(&mut pool, low);
        assert_eq!(pool.get(low).map(|t| t.effective_priority), Some(10));
        assert_eq!(s.ready_list(), &[mid, low]);
    }

    #[test]
    fn test_delay_until_in_past_does_not_block() {
        let mut pool = TaskPool::new(0);
        let mut s = Scheduler::new();
        let t = spawn(&mut pool, 10, NO_DEADLINE);
        s.ready(&mut pool, t);
        s.set_running(0);
        s.switch_target(&mut pool, 0);
        s.tick(&mut pool);
        assert!(!s.delay_until(&mut pool, 1));
        assert!(s.delay_until(&mut pool, 4));
        assert_eq!(pool.get(t).map(|x| x.wake_time), Some(4));
    }
}
