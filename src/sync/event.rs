//! Event flag group.
//!
//! A waiting task's condition is stored in its TCB as
//! `mask | mode << 31`; when `set` satisfies it, the field is overwritten
//! with the matched bits, which the waiter returns.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;
use tracing::trace;

use super::{critical_section, WaitList, WaitQueue};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::task::WaitKind;

/// Usable flag bits; bit 31 encodes the wait mode.
pub const EVENT_MASK: u32 = 0x7FFF_FFFF;

const MODE_ALL: u32 = 1 << 31;

/// How a waiter's mask is matched against the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Any bit of the mask.
    Any,
    /// Every bit of the mask.
    All,
}

impl EventMode {
    fn encode(self, mask: u32) -> u32 {
        match self {
            EventMode::Any => mask,
            EventMode::All => mask | MODE_ALL,
        }
    }

    fn decode(reason: u32) -> (u32, EventMode) {
        let mode = if reason & MODE_ALL != 0 {
            EventMode::All
        } else {
            EventMode::Any
        };
        (reason & EVENT_MASK, mode)
    }

    /// Matched bits if `flags` satisfy `mask` under this mode.
    fn matches(self, flags: u32, mask: u32) -> Option<u32> {
        let hit = flags & mask;
        let ok = match self {
            EventMode::Any => hit != 0,
            EventMode::All => hit == mask,
        };
        ok.then_some(hit)
    }
}

struct EventState {
    flags: u32,
    waiters: WaitQueue,
    deleted: bool,
}

/// Group of 31 event flags. Every waiter satisfied by a `set` wakes.
pub struct EventFlags {
    state: CsMutex<RefCell<EventState>>,
}

impl EventFlags {
    pub const fn new() -> Self {
        Self {
            state: CsMutex::new(RefCell::new(EventState {
                flags: 0,
                waiters: WaitQueue::new(),
                deleted: false,
            })),
        }
    }

    /// Wait until `mask` is satisfied under `mode` and return the matched
    /// bits. `Timeout` if it is not satisfied in time (immediately for
    /// `NO_WAIT`); `Param` for an empty mask.
    pub fn wait(
        &self,
        core: &Core,
        mask: u32,
        mode: EventMode,
        clear_on_exit: bool,
        timeout: Timeout,
    ) -> Result<u32> {
        let mask = mask & EVENT_MASK;
        if mask == 0 {
            return Err(KernelError::Param);
        }
        let me = if timeout.is_no_wait() {
            None
        } else {
            Some(core.task_context()?)
        };

        let immediate = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if let Some(hit) = mode.matches(st.flags, mask) {
                if clear_on_exit {
                    st.flags &= !hit;
                }
                return Ok(Some(hit));
            }
            let Some(me) = me else {
                return Err(KernelError::Timeout);
            };
            let mut inner = core.inner(cs);
            st.waiters.push_fifo(&inner, WaitKind::Event, me)?;
            inner.park(timeout, WaitKind::Event);
            if let Some(tcb) = inner.tasks.get_mut(me) {
                tcb.blocked_reason = mode.encode(mask);
            }
            Ok(None)
        })?;
        if let Some(hit) = immediate {
            return Ok(hit);
        }
        let Some(me) = me else {
            return Err(KernelError::Timeout);
        };

        let woke = core.switch_away(me);
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if let Err(e) = woke {
                st.waiters.remove(me);
                return Err(e);
            }
            let hit = core
                .inner(cs)
                .tasks
                .get(me)
                .map_or(0, |t| t.blocked_reason);
            if clear_on_exit {
                st.flags &= !hit;
            }
            Ok(hit)
        })
    }

    /// OR `bits` into the flags and wake every waiter now satisfied.
    /// Returns the new flag value. Callable from interrupt context.
    pub fn set(&self, core: &Core, bits: u32) -> Result<u32> {
        let flags = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut guard = core.inner(cs);
            let inner = &mut *guard;
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            st.flags |= bits & EVENT_MASK;

            let mut satisfied = WaitList::new();
            for h in st.waiters.iter() {
                if !inner.is_waiting_on(h, WaitKind::Event) {
                    continue;
                }
                let Some(tcb) = inner.tasks.get_mut(h) else { continue };
                let (mask, mode) = EventMode::decode(tcb.blocked_reason);
                if let Some(hit) = mode.matches(st.flags, mask) {
                    tcb.blocked_reason = hit;
                    let _ = satisfied.push(h);
                }
            }
            for &h in satisfied.iter() {
                st.waiters.remove(h);
                inner.wake(h, Ok(()));
            }
            trace!(flags = st.flags, woken = satisfied.len(), "event flags set");
            Ok(st.flags)
        })?;
        core.dispatch();
        Ok(flags)
    }

    /// Clear `bits` and return the flags as they were before.
    pub fn clear(&self, bits: u32) -> u32 {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let prior = st.flags;
            st.flags &= !bits;
            prior
        })
    }

    pub fn get(&self) -> u32 {
        critical_section(|cs| self.state.borrow_ref(cs).flags)
    }

    /// Destroy the group, waking every waiter with `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.waiters.wake_all_deleted(&mut inner, WaitKind::Event);
        });
        core.dispatch();
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{testing, Hooks};
    use crate::task::TaskParams;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_mode_encoding() {
        let reason = EventMode::All.encode(0b1010);
        assert_eq!(EventMode::decode(reason), (0b1010, EventMode::All));
        assert_eq!(EventMode::decode(0b11), (0b11, EventMode::Any));
        assert_eq!(EventMode::Any.matches(0b0100, 0b0110), Some(0b0100));
        assert_eq!(EventMode::All.matches(0b0100, 0b0110), None);
    }

    #[test]
    fn test_non_blocking_wait() {
        let core = testing::core();
        let ev = EventFlags::new();
        assert_eq!(
            ev.wait(core, 0, EventMode::Any, false, Timeout::NO_WAIT),
            Err(KernelError::Param)
        );
        assert_eq!(
            ev.wait(core, 0b1, EventMode::Any, false, Timeout::NO_WAIT),
            Err(KernelError::Timeout)
        );
        ev.set(core, 0b0110).expect("set");
        assert_eq!(ev.wait(core, 0b0010, EventMode::Any, true, Timeout::NO_WAIT), Ok(0b0010));
        assert_eq!(ev.get(), 0b0100);
        assert_eq!(ev.clear(0b0100), 0b0100);
        assert_eq!(ev.get(), 0);
    }

    static FLAGS: EventFlags = EventFlags::new();
    static GOT: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];

    fn any_waiter(core: &'static Core, slot: usize) {
        let hit = FLAGS
            .wait(core, 0b0011, EventMode::Any, false, Timeout::FOREVER)
            .expect("any");
        GOT[slot].store(hit, Ordering::SeqCst);
    }

    fn all_waiter(core: &'static Core, slot: usize) {
        let hit = FLAGS
            .wait(core, 0b0101, EventMode::All, true, Timeout::FOREVER)
            .expect("all");
        GOT[slot].store(hit, Ordering::SeqCst);
    }

    #[test]
    fn test_set_wakes_every_satisfied_waiter() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("any0", any_waiter).arg(0)).expect("create");
        core.task_create(TaskParams::new("any1", any_waiter).arg(1)).expect("create");
        core.task_create(TaskParams::new("all", all_waiter).arg(2)).expect("create");

        FLAGS.set(core, 0b0001).expect("set");
        assert_eq!(GOT[0].load(Ordering::SeqCst), 0b0001);
        assert_eq!(GOT[1].load(Ordering::SeqCst), 0b0001);
        assert_eq!(GOT[2].load(Ordering::SeqCst), 0);

        FLAGS.set(core, 0b0100).expect("set");
        assert_eq!(GOT[2].load(Ordering::SeqCst), 0b0101);
        // The ALL waiter cleared its bits on exit.
        assert_eq!(FLAGS.get(), 0);
    }

    static LATE: EventFlags = EventFlags::new();
    static LATE_RESULT: AtomicU32 = AtomicU32::new(0);

    fn late_waiter(core: &'static Core, _: usize) {
        if LATE.wait(core, 0b1, EventMode::Any, false, Timeout::ticks(2)) == Err(KernelError::Timeout) {
            LATE_RESULT.store(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_wait_times_out() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("late", late_waiter)).expect("create");
        core.tick_handler();
        assert_eq!(LATE_RESULT.load(Ordering::SeqCst), 0);
        core.tick_handler();
        assert_eq!(LATE_RESULT.load(Ordering::SeqCst), 1);
        assert!(critical_section(|cs| LATE.state.borrow_ref(cs).waiters.iter().count() == 0));
    }
}
