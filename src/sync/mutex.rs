//! Priority-inheritance mutex.
//!
//! ```text
//!   L locks ──► H.lock() blocks ──► L boosted to H's priority
//!   L.unlock() ──► L restored, ownership handed to H, H woken
//! ```

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex as CsMutex};
use tracing::debug;

use super::{critical_section, WaitQueue};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::{Core, CoreInner};
use crate::task::{TaskHandle, WaitKind};

struct MutexState {
    owner: Option<TaskHandle>,
    /// Owner's effective priority when it acquired the lock.
    owner_priority: u8,
    waiters: WaitQueue,
    deleted: bool,
}

/// Non-recursive mutex with priority inheritance. Waiters are served in
/// order of effective priority, FIFO among equals.
pub struct Mutex {
    state: CsMutex<RefCell<MutexState>>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: CsMutex::new(RefCell::new(MutexState {
                owner: None,
                owner_priority: 0,
                waiters: WaitQueue::new(),
                deleted: false,
            })),
        }
    }

    /// Acquire the mutex. A task that already holds it gets `Busy`.
    pub fn lock(&self, core: &Core, timeout: Timeout) -> Result<()> {
        let me = core.task_context()?;
        let parked = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut guard = core.inner(cs);
            let inner = &mut *guard;
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.owner_priority = inner.effective_priority(me);
                    Ok(false)
                }
                Some(owner) if owner == me => Err(KernelError::Busy),
                Some(_) if timeout.is_no_wait() => Err(KernelError::Busy),
                Some(owner) => {
                    st.waiters.push_by_priority(inner, WaitKind::Mutex, me)?;
                    let mine = inner.effective_priority(me);
                    if mine > inner.effective_priority(owner) {
                        inner.sched.priority_inherit(&mut inner.tasks, owner, mine);
                    }
                    inner.park(timeout, WaitKind::Mutex);
                    Ok(true)
                }
            }
        })?;
        if !parked {
            return Ok(());
        }

        let woke = core.switch_away(me);
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.owner == Some(me) {
                return Ok(());
            }
            st.waiters.remove(me);
            Err(woke.err().unwrap_or(KernelError::Timeout))
        })
    }

    pub fn try_lock(&self, core: &Core) -> Result<()> {
        self.lock(core, Timeout::NO_WAIT)
    }

    /// Release the mutex and hand it to the highest-priority waiter.
    /// `State` if the caller is not the owner.
    pub fn unlock(&self, core: &Core) -> Result<()> {
        let me = core.current_task().ok_or(KernelError::State)?;
        critical_section(|cs| {
            let mut guard = core.inner(cs);
            self.release_in(cs, &mut guard, me)
        })?;
        core.dispatch();
        Ok(())
    }

    /// Unlock on behalf of `me` with the core state already borrowed.
    pub(crate) fn release_in(
        &self,
        cs: CriticalSection<'_>,
        inner: &mut CoreInner,
        me: TaskHandle,
    ) -> Result<()> {
        let mut st = self.state.borrow_ref_mut(cs);
        if st.owner != Some(me) {
            return Err(KernelError::State);
        }

        // Back to the priority held before this mutex was taken.
        inner.sched.priority_restore(&mut inner.tasks, me);
        let base = inner.tasks.get(me).map_or(0, |t| t.base_priority);
        if st.owner_priority > base {
            inner.sched.priority_inherit(&mut inner.tasks, me, st.owner_priority);
        }

        match st.waiters.pop_waiter(inner, WaitKind::Mutex) {
            Some(next) => {
                st.owner = Some(next);
                st.owner_priority = inner.effective_priority(next);
                inner.wake(next, Ok(()));
                debug!(slot = next.slot(), "mutex handed over");
            }
            None => st.owner = None,
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        critical_section(|cs| self.state.borrow_ref(cs).owner.is_some())
    }

    pub fn owner(&self) -> Option<TaskHandle> {
        critical_section(|cs| self.state.borrow_ref(cs).owner)
    }

    /// Destroy the mutex, waking every waiter with `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.owner = None;
            st.waiters.wake_all_deleted(&mut inner, WaitKind::Mutex);
        });
        core.dispatch();
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{testing, Hooks};
    use crate::task::TaskParams;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    static PI_LOCK: Mutex = Mutex::new();
    static PI_LOG: [AtomicU32; 4] = [
        AtomicU32::new(0),
        AtomicU32::new(0),
        AtomicU32::new(0),
        AtomicU32::new(0),
    ];

    fn high(core: &'static Core, _: usize) {
        PI_LOCK.lock(core, Timeout::FOREVER).expect("lock");
        // Ownership was handed over directly.
        let owned = PI_LOCK.owner() == core.current_task();
        PI_LOG[2].store(owned as u32, Ordering::SeqCst);
        PI_LOCK.unlock(core).expect("unlock");
    }

    fn low(core: &'static Core, _: usize) {
        let me = core.current_task().expect("me");
        PI_LOCK.lock(core, Timeout::FOREVER).expect("lock");
        core.task_create(TaskParams::new("H", high).priority(200))
            .expect("create");
        // H is now blocked on the mutex and has boosted us.
        PI_LOG[0].store(core.task_priority(me).unwrap_or(0) as u32, Ordering::SeqCst);
        PI_LOCK.unlock(core).expect("unlock");
        PI_LOG[1].store(core.task_priority(me).unwrap_or(0) as u32, Ordering::SeqCst);
        PI_LOG[3].store(core.task_base_priority(me).unwrap_or(0) as u32, Ordering::SeqCst);
    }

    #[test]
    fn test_priority_inheritance_is_transient() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("L", low).priority(10))
            .expect("create");
        assert_eq!(PI_LOG[0].load(Ordering::SeqCst), 200);
        assert_eq!(PI_LOG[2].load(Ordering::SeqCst), 1);
        assert_eq!(PI_LOG[1].load(Ordering::SeqCst), 10);
        assert_eq!(PI_LOG[3].load(Ordering::SeqCst), 10);
        assert!(!PI_LOCK.is_locked());
    }

    static ERRS: Mutex = Mutex::new();
    static ERR_CODES: AtomicUsize = AtomicUsize::new(0);

    fn misuse(core: &'static Core, _: usize) {
        let mut seen = 0;
        if ERRS.unlock(core) == Err(KernelError::State) {
            seen |= 1;
        }
        ERRS.lock(core, Timeout::FOREVER).expect("lock");
        if ERRS.lock(core, Timeout::FOREVER) == Err(KernelError::Busy) {
            seen |= 2;
        }
        ERRS.unlock(core).expect("unlock");
        ERR_CODES.store(seen, Ordering::SeqCst);
    }

    #[test]
    fn test_recursive_lock_and_foreign_unlock() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("m", misuse)).expect("create");
        assert_eq!(ERR_CODES.load(Ordering::SeqCst), 3);
    }

    static CONTENDED: Mutex = Mutex::new();
    static INSIDE: AtomicU32 = AtomicU32::new(0);
    static MAX_INSIDE: AtomicU32 = AtomicU32::new(0);
    static ROUNDS: AtomicU32 = AtomicU32::new(0);

    fn contender(core: &'static Core, _: usize) {
        for _ in 0..5 {
            CONTENDED.lock(core, Timeout::FOREVER).expect("lock");
            let now = INSIDE.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_INSIDE.fetch_max(now, Ordering::SeqCst);
            // Sleep while holding the lock so the others pile up.
            let _ = core.task_delay(1);
            INSIDE.fetch_sub(1, Ordering::SeqCst);
            CONTENDED.unlock(core).expect("unlock");
            ROUNDS.fetch_add(1, Ordering::SeqCst);
            core.task_yield();
        }
    }

    #[test]
    fn test_single_holder_under_contention() {
        let core = testing::running(Hooks::default());
        for prio in [20u8, 30, 40, 30] {
            core.task_create(TaskParams::new("c", contender).priority(prio))
                .expect("create");
        }
        for _ in 0..200 {
            if ROUNDS.load(Ordering::SeqCst) == 20 {
                break;
            }
            core.tick_handler();
        }
        assert_eq!(ROUNDS.load(Ordering::SeqCst), 20);
        assert_eq!(MAX_INSIDE.load(Ordering::SeqCst), 1);
    }

    static TIMED: Mutex = Mutex::new();
    static TIMED_RESULT: AtomicUsize = AtomicUsize::new(0);

    fn holder(core: &'static Core, _: usize) {
        TIMED.lock(core, Timeout::FOREVER).expect("lock");
        let _ = core.task_delay(100);
        TIMED.unlock(core).expect("unlock");
    }

    fn impatient(core: &'static Core, _: usize) {
        let r = TIMED.lock(core, Timeout::ticks(3));
        let code = match r {
            Err(KernelError::Timeout) => 1,
            Err(KernelError::Busy) => 2,
            _ => 3,
        };
        let busy = TIMED.try_lock(core) == Err(KernelError::Busy);
        TIMED_RESULT.store(code + if busy { 10 } else { 0 }, Ordering::SeqCst);
    }

    #[test]
    fn test_timed_lock_expires_and_leaves_queue() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("hold", holder).priority(5))
            .expect("create");
        let waiter = core
            .task_create(TaskParams::new("wait", impatient).priority(50))
            .expect("create");
        for _ in 0..3 {
            core.tick_handler();
        }
        assert_eq!(TIMED_RESULT.load(Ordering::SeqCst), 11);
        assert!(core.task_state(waiter).is_err());
        let holder_task = TIMED.owner().expect("still held");
        // The waiter's boost stays until the holder unlocks.
        assert_eq!(core.task_priority(holder_task), Ok(50));
        assert!(critical_section(|cs| TIMED.state.borrow_ref(cs).waiters.iter().count() == 0));
    }

    static DOOMED: Mutex = Mutex::new();
    static DOOMED_RESULT: AtomicUsize = AtomicUsize::new(0);

    fn doomed_holder(core: &'static Core, _: usize) {
        DOOMED.lock(core, Timeout::FOREVER).expect("lock");
        let _ = core.task_delay(1_000);
    }

    fn doomed_waiter(core: &'static Core, _: usize) {
        if DOOMED.lock(core, Timeout::FOREVER) == Err(KernelError::Deleted) {
            DOOMED_RESULT.store(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delete_wakes_waiters() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("h", doomed_holder)).expect("create");
        core.task_create(TaskParams::new("w", doomed_waiter)).expect("create");
        DOOMED.delete(core);
        assert_eq!(DOOMED_RESULT.load(Ordering::SeqCst), 1);
        assert!(!DOOMED.is_locked());
    }
}
