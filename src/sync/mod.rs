//! # Synchronization Primitives
//!
//! Blocking primitives for tasks of one core, plus the spinlock used for
//! state shared between cores.
//!
//! | Primitive      | Wait order          | Blocking calls              |
//! |----------------|---------------------|-----------------------------|
//! | [`Mutex`]      | effective priority  | `lock`                      |
//! | [`Semaphore`]  | FIFO                | `wait`                      |
//! | [`EventFlags`] | all satisfied wake  | `wait`                      |
//! | [`CondVar`]    | FIFO                | `wait`                      |
//! | [`RwLock`]     | FIFO per class      | `read_lock`, `write_lock`   |
//! | [`Spinlock`]   | none (busy-wait)    | `acquire`                   |
//!
//! Every primitive except [`Spinlock`] is core-local: its waiters are tasks
//! of the [`Core`] passed to each call, and its state is only touched under
//! that core's critical section, together with the scheduler, so that
//! queueing a waiter and blocking it is one atomic step.
//!
//! A waiter that times out removes itself from the wait queue before it
//! returns. Deleting a primitive wakes every waiter with
//! [`KernelError::Deleted`].
//!
//! [`Core`]: crate::kernel::Core
//! [`KernelError::Deleted`]: crate::error::KernelError::Deleted

use critical_section::CriticalSection;
use heapless::Vec;

use crate::config::MAX_TASKS_PER_CORE;
use crate::error::{KernelError, Result};
use crate::kernel::CoreInner;
use crate::task::{TaskHandle, WaitKind};

mod condvar;
mod event;
mod mutex;
mod rwlock;
mod semaphore;
mod spinlock;

pub use condvar::CondVar;
pub use event::{EventFlags, EventMode};
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinCell, Spinlock};

/// Execute a closure within a critical section.
///
/// All core-local kernel state is accessed through this. On Cortex-M it
/// masks interrupts (via `cortex-m`'s single-core implementation); on a host
/// it takes a process-wide lock.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     let mut state = shared.borrow_ref_mut(cs);
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

// ---------------------------------------------------------------------------
// Wait queue
// ---------------------------------------------------------------------------

pub(crate) type WaitList = Vec<TaskHandle, MAX_TASKS_PER_CORE>;

/// Tasks waiting on a primitive. Entries may be stale (task deleted or
/// already woken by a timeout); they are skipped and dropped when popped.
pub(crate) struct WaitQueue {
    waiters: WaitList,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self { waiters: Vec::new() }
    }

    /// Drop entries that no longer wait on `kind`.
    fn prune(&mut self, inner: &CoreInner, kind: WaitKind) {
        self.waiters.retain(|&h| inner.is_waiting_on(h, kind));
    }

    /// Append `h`.
    pub(crate) fn push_fifo(&mut self, inner: &CoreInner, kind: WaitKind, h: TaskHandle) -> Result<()> {
        if self.waiters.is_full() {
            self.prune(inner, kind);
        }
        self.waiters.push(h).map_err(|_| KernelError::NoMem)
    }

    /// Insert `h` after every waiter of equal or higher effective priority.
    pub(crate) fn push_by_priority(
        &mut self,
        inner: &CoreInner,
        kind: WaitKind,
        h: TaskHandle,
    ) -> Result<()> {
        if self.waiters.is_full() {
            self.prune(inner, kind);
        }
        let prio = inner.effective_priority(h);
        let pos = self
            .waiters
            .iter()
            .position(|&w| inner.effective_priority(w) < prio)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, h).map_err(|_| KernelError::NoMem)
    }

    /// Remove and return the first task still Blocked on `kind`.
    pub(crate) fn pop_waiter(&mut self, inner: &CoreInner, kind: WaitKind) -> Option<TaskHandle> {
        while !self.waiters.is_empty() {
            let h = self.waiters.remove(0);
            if inner.is_waiting_on(h, kind) {
                return Some(h);
            }
        }
        None
    }

    /// Remove and return every task still Blocked on `kind`.
    pub(crate) fn take_all(&mut self, inner: &CoreInner, kind: WaitKind) -> WaitList {
        let mut live = WaitList::new();
        for h in self.waiters.iter().copied() {
            if inner.is_waiting_on(h, kind) {
                // Same capacity as the source list.
                let _ = live.push(h);
            }
        }
        self.waiters.clear();
        live
    }

    pub(crate) fn remove(&mut self, h: TaskHandle) {
        self.waiters.retain(|&w| w != h);
    }

    /// Whether any entry still waits on `kind`.
    pub(crate) fn any_waiting(&self, inner: &CoreInner, kind: WaitKind) -> bool {
        self.waiters.iter().any(|&h| inner.is_waiting_on(h, kind))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.waiters.iter().copied()
    }

    /// Wake every live waiter with `Deleted`.
    pub(crate) fn wake_all_deleted(&mut self, inner: &mut CoreInner, kind: WaitKind) -> usize {
        let waiters = self.take_all(inner, kind);
        for &h in waiters.iter() {
            inner.wake(h, Err(KernelError::Deleted));
        }
        waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskParams, TaskState};

    fn nop(_: &'static crate::kernel::Core, _: usize) {}

    fn blocked(inner: &mut CoreInner, prio: u8, kind: WaitKind) -> TaskHandle {
        let h = inner.tasks.allocate().expect("slot");
        if let Some(tcb) = inner.tasks.get_mut(h) {
            tcb.init(1, 0, &TaskParams::new("w", nop).priority(prio));
            tcb.state = TaskState::Blocked;
            tcb.blocked_on = Some(kind);
        }
        h
    }

    #[test]
    fn test_priority_order_is_fifo_among_equals() {
        let core = crate::kernel::testing::core();
        core.with(|inner| {
            let mut q = WaitQueue::new();
            let a = blocked(inner, 10, WaitKind::Mutex);
            let b = blocked(inner, 50, WaitKind::Mutex);
            let c = blocked(inner, 50, WaitKind::Mutex);
            let d = blocked(inner, 5, WaitKind::Mutex);
            for h in [a, b, c, d] {
                q.push_by_priority(inner, WaitKind::Mutex, h).expect("push");
            }
            let order: std::vec::Vec<_> = q.iter().collect();
            assert_eq!(order, [b, c, a, d]);
        });
    }

    #[test]
    fn test_pop_skips_tasks_no_longer_waiting() {
        let core = crate::kernel::testing::core();
        core.with(|inner| {
            let mut q = WaitQueue::new();
            let gone = blocked(inner, 1, WaitKind::Semaphore);
            let other = blocked(inner, 1, WaitKind::Event);
            let live = blocked(inner, 1, WaitKind::Semaphore);
            for h in [gone, other, live] {
                q.push_fifo(inner, WaitKind::Semaphore, h).expect("push");
            }
            inner.tasks.free(gone);
            assert_eq!(q.pop_waiter(inner, WaitKind::Semaphore), Some(live));
            assert_eq!(q.pop_waiter(inner, WaitKind::Semaphore), None);
        });
    }

    #[test]
    fn test_delete_wakes_with_deleted() {
        let core = crate::kernel::testing::core();
        core.with(|inner| {
            let mut q = WaitQueue::new();
            let a = blocked(inner, 1, WaitKind::CondVar);
            let b = blocked(inner, 1, WaitKind::CondVar);
            q.push_fifo(inner, WaitKind::CondVar, a).expect("push");
            q.push_fifo(inner, WaitKind::CondVar, b).expect("push");
            assert_eq!(q.wake_all_deleted(inner, WaitKind::CondVar), 2);
            for h in [a, b] {
                let tcb = inner.tasks.get(h).expect("live");
                assert_eq!(tcb.state, TaskState::Ready);
                assert_eq!(tcb.wait_result, Err(KernelError::Deleted));
            }
            assert!(!q.any_waiting(inner, WaitKind::CondVar));
        });
    }
}
