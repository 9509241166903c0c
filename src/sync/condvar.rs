//! Condition variable paired with a [`Mutex`].

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::{critical_section, Mutex, WaitQueue};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::task::WaitKind;

struct CondVarState {
    waiters: WaitQueue,
    deleted: bool,
}

/// Monitor-style condition variable.
///
/// `wait` queues the caller, blocks it and releases the mutex in a single
/// critical section, so a `signal` issued by whoever takes the mutex next
/// always finds the waiter queued.
pub struct CondVar {
    state: CsMutex<RefCell<CondVarState>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            state: CsMutex::new(RefCell::new(CondVarState {
                waiters: WaitQueue::new(),
                deleted: false,
            })),
        }
    }

    /// Release `mutex`, wait for a signal, and re-acquire `mutex` before
    /// returning. The caller must hold `mutex` (`State` otherwise). The
    /// wait result (`Ok`, `Timeout`, or `Deleted`) is returned with the
    /// mutex held again.
    pub fn wait(&self, core: &Core, mutex: &Mutex, timeout: Timeout) -> Result<()> {
        let me = core.task_context()?;
        if timeout.is_no_wait() {
            return Err(KernelError::Timeout);
        }
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut guard = core.inner(cs);
            let inner = &mut *guard;
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if mutex.owner() != Some(me) {
                return Err(KernelError::State);
            }
            st.waiters.push_fifo(inner, WaitKind::CondVar, me)?;
            inner.park(timeout, WaitKind::CondVar);
            mutex.release_in(cs, inner, me)
        })?;

        let woke = core.switch_away(me);
        if woke.is_err() {
            critical_section(|cs| self.state.borrow_ref_mut(cs).waiters.remove(me));
        }
        mutex.lock(core, Timeout::FOREVER)?;
        woke
    }

    /// Wake the oldest waiter. Callable from interrupt context.
    pub fn signal(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            if let Some(h) = st.waiters.pop_waiter(&inner, WaitKind::CondVar) {
                inner.wake(h, Ok(()));
            }
        });
        core.dispatch();
    }

    /// Wake every waiter.
    pub fn broadcast(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            for h in st.waiters.take_all(&inner, WaitKind::CondVar) {
                inner.wake(h, Ok(()));
            }
        });
        core.dispatch();
    }

    /// Destroy the condition variable, waking every waiter with `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.waiters.wake_all_deleted(&mut inner, WaitKind::CondVar);
        });
        core.dispatch();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{testing, Hooks};
    use crate::task::TaskParams;
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    static LOCK: Mutex = Mutex::new();
    static COND: CondVar = CondVar::new();
    static READY: AtomicBool = AtomicBool::new(false);
    static DONE: AtomicU32 = AtomicU32::new(0);

    fn producer(core: &'static Core, _: usize) {
        LOCK.lock(core, Timeout::FOREVER).expect("lock");
        READY.store(true, Ordering::SeqCst);
        COND.signal(core);
        LOCK.unlock(core).expect("unlock");
    }

    fn consumer(core: &'static Core, _: usize) {
        LOCK.lock(core, Timeout::FOREVER).expect("lock");
        // The producer runs first and blocks on LOCK, so it can only signal
        // once the wait below has released the mutex.
        core.task_create(TaskParams::new("producer", producer).priority(200))
            .expect("create");
        while !READY.load(Ordering::SeqCst) {
            COND.wait(core, &LOCK, Timeout::FOREVER).expect("wait");
        }
        let held = LOCK.owner() == core.current_task();
        LOCK.unlock(core).expect("unlock");
        DONE.store(if held { 1 } else { 2 }, Ordering::SeqCst);
    }

    #[test]
    fn test_signal_right_after_release_is_not_lost() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("consumer", consumer).priority(10))
            .expect("create");
        assert_eq!(DONE.load(Ordering::SeqCst), 1);
        assert!(!LOCK.is_locked());
    }

    static TLOCK: Mutex = Mutex::new();
    static TCOND: CondVar = CondVar::new();
    static TRESULT: AtomicU32 = AtomicU32::new(0);

    fn timed_waiter(core: &'static Core, _: usize) {
        let mut code = 0;
        if TCOND.wait(core, &TLOCK, Timeout::ticks(5)) == Err(KernelError::State) {
            code += 1;
        }
        TLOCK.lock(core, Timeout::FOREVER).expect("lock");
        if TCOND.wait(core, &TLOCK, Timeout::ticks(5)) == Err(KernelError::Timeout) {
            code += 10;
        }
        if TLOCK.owner() == core.current_task() {
            code += 100;
        }
        TLOCK.unlock(core).expect("unlock");
        TRESULT.store(code, Ordering::SeqCst);
    }

    #[test]
    fn test_wait_requires_mutex_and_reacquires_on_timeout() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("tw", timed_waiter)).expect("create");
        assert!(!TLOCK.is_locked());
        for _ in 0..5 {
            core.tick_handler();
        }
        assert_eq!(TRESULT.load(Ordering::SeqCst), 111);
    }

    static BLOCK: Mutex = Mutex::new();
    static BCOND: CondVar = CondVar::new();
    static WOKEN: AtomicU32 = AtomicU32::new(0);

    fn sleeper(core: &'static Core, _: usize) {
        BLOCK.lock(core, Timeout::FOREVER).expect("lock");
        if BCOND.wait(core, &BLOCK, Timeout::FOREVER).is_ok() {
            WOKEN.fetch_add(1, Ordering::SeqCst);
        }
        BLOCK.unlock(core).expect("unlock");
    }

    #[test]
    fn test_signal_wakes_one_broadcast_wakes_all() {
        let core = testing::running(Hooks::default());
        for _ in 0..3 {
            core.task_create(TaskParams::new("s", sleeper)).expect("create");
        }
        // No waiter: nothing is remembered.
        COND_EMPTY.signal(core);
        BCOND.signal(core);
        assert_eq!(WOKEN.load(Ordering::SeqCst), 1);
        BCOND.broadcast(core);
        assert_eq!(WOKEN.load(Ordering::SeqCst), 3);
    }

    static COND_EMPTY: CondVar = CondVar::new();
}
