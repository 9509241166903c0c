//! Counting semaphore with FIFO waiters.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::{critical_section, WaitQueue};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::task::WaitKind;

struct SemaphoreState {
    count: i32,
    max: i32,
    waiters: WaitQueue,
    deleted: bool,
}

/// Counting semaphore. The count stays within `0..=max`.
///
/// `signal` with a waiter present hands the unit straight to the oldest
/// waiter instead of incrementing the count.
pub struct Semaphore {
    state: CsMutex<RefCell<SemaphoreState>>,
}

impl Semaphore {
    /// `max == 0` means unbounded (`i32::MAX`). `initial` is clamped to
    /// `0..=max`.
    pub const fn new(initial: i32, max: i32) -> Self {
        let max = if max <= 0 { i32::MAX } else { max };
        let count = if initial < 0 {
            0
        } else if initial > max {
            max
        } else {
            initial
        };
        Self {
            state: CsMutex::new(RefCell::new(SemaphoreState {
                count,
                max,
                waiters: WaitQueue::new(),
                deleted: false,
            })),
        }
    }

    /// Binary semaphore, initially empty.
    pub const fn binary() -> Self {
        Self::new(0, 1)
    }

    /// Take one unit. `Busy` with `NO_WAIT` when the count is zero.
    pub fn wait(&self, core: &Core, timeout: Timeout) -> Result<()> {
        let fast = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if st.count > 0 {
                st.count -= 1;
                return Ok(true);
            }
            if timeout.is_no_wait() {
                return Err(KernelError::Busy);
            }
            Ok(false)
        })?;
        if fast {
            return Ok(());
        }

        let me = core.task_context()?;
        let parked = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            // A unit may have been signalled in between.
            if st.count > 0 {
                st.count -= 1;
                return Ok(false);
            }
            st.waiters.push_fifo(&inner, WaitKind::Semaphore, me)?;
            inner.park(timeout, WaitKind::Semaphore);
            Ok(true)
        })?;
        if !parked {
            return Ok(());
        }

        let woke = core.switch_away(me);
        if woke.is_err() {
            critical_section(|cs| self.state.borrow_ref_mut(cs).waiters.remove(me));
        }
        woke
    }

    pub fn try_wait(&self, core: &Core) -> Result<()> {
        self.wait(core, Timeout::NO_WAIT)
    }

    /// Release one unit. `Full` if the count is already at its maximum.
    /// Callable from interrupt context.
    pub fn signal(&self, core: &Core) -> Result<()> {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if let Some(next) = st.waiters.pop_waiter(&inner, WaitKind::Semaphore) {
                inner.wake(next, Ok(()));
                return Ok(());
            }
            if st.count >= st.max {
                return Err(KernelError::Full);
            }
            st.count += 1;
            Ok(())
        })?;
        core.dispatch();
        Ok(())
    }

    pub fn count(&self) -> i32 {
        critical_section(|cs| self.state.borrow_ref(cs).count)
    }

    pub fn max_count(&self) -> i32 {
        critical_section(|cs| self.state.borrow_ref(cs).max)
    }

    /// Destroy the semaphore, waking every waiter with `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.waiters.wake_all_deleted(&mut inner, WaitKind::Semaphore);
        });
        core.dispatch();
    }
}
