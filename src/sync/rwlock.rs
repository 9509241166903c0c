//! Reader-writer lock.
//!
//! Acquisition prefers writers: a new reader queues while a writer holds
//! the lock or waits for it. Release prefers readers: `write_unlock` admits
//! every queued reader before any queued writer. Under a steady stream of
//! readers a writer can therefore wait indefinitely.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::{critical_section, WaitQueue};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::{Core, CoreInner};
use crate::task::{TaskHandle, WaitKind};

struct RwState {
    readers: u32,
    writer: Option<TaskHandle>,
    read_waiters: WaitQueue,
    write_waiters: WaitQueue,
    deleted: bool,
}

impl RwState {
    fn grant_one_writer(&mut self, inner: &mut CoreInner) -> bool {
        match self.write_waiters.pop_waiter(inner, WaitKind::WriteLock) {
            Some(w) => {
                self.writer = Some(w);
                inner.wake(w, Ok(()));
                true
            }
            None => false,
        }
    }

    fn grant_readers(&mut self, inner: &mut CoreInner) -> bool {
        let readers = self.read_waiters.take_all(inner, WaitKind::ReadLock);
        for &r in readers.iter() {
            inner.wake(r, Ok(()));
        }
        self.readers += readers.len() as u32;
        !readers.is_empty()
    }

    /// Hand the lock to whoever queued for it and can now hold it. Queued
    /// readers are admitted once no writer holds or waits for the lock.
    fn admit(&mut self, inner: &mut CoreInner, readers_first: bool) {
        if self.deleted || self.writer.is_some() {
            return;
        }
        if readers_first && self.grant_readers(inner) {
            return;
        }
        if self.readers == 0 && self.grant_one_writer(inner) {
            return;
        }
        if !self.write_waiters.any_waiting(inner, WaitKind::WriteLock) {
            self.grant_readers(inner);
        }
    }
}

pub struct RwLock {
    state: CsMutex<RefCell<RwState>>,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            state: CsMutex::new(RefCell::new(RwState {
                readers: 0,
                writer: None,
                read_waiters: WaitQueue::new(),
                write_waiters: WaitQueue::new(),
                deleted: false,
            })),
        }
    }

    /// Take a shared lock. Granted at once only if no writer holds or waits
    /// for the lock.
    pub fn read_lock(&self, core: &Core, timeout: Timeout) -> Result<()> {
        self.acquire(core, timeout, WaitKind::ReadLock)
    }

    /// Take the exclusive lock.
    pub fn write_lock(&self, core: &Core, timeout: Timeout) -> Result<()> {
        self.acquire(core, timeout, WaitKind::WriteLock)
    }

    fn acquire(&self, core: &Core, timeout: Timeout, kind: WaitKind) -> Result<()> {
        let me = core.task_context()?;
        let parked = critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            let free = match kind {
                WaitKind::ReadLock => {
                    st.writer.is_none() && !st.write_waiters.any_waiting(&inner, WaitKind::WriteLock)
                }
                _ => st.writer.is_none() && st.readers == 0,
            };
            if free {
                match kind {
                    WaitKind::ReadLock => st.readers += 1,
                    _ => st.writer = Some(me),
                }
                return Ok(false);
            }
            if timeout.is_no_wait() {
                return Err(KernelError::Busy);
            }
            let queue = match kind {
                WaitKind::ReadLock => &mut st.read_waiters,
                _ => &mut st.write_waiters,
            };
            queue.push_fifo(&inner, kind, me)?;
            inner.park(timeout, kind);
            Ok(true)
        })?;
        if !parked {
            return Ok(());
        }

        // A wake with `Ok` means the releaser already granted the lock.
        let woke = core.switch_away(me);
        if woke.is_err() {
            critical_section(|cs| {
                let mut st = self.state.borrow_ref_mut(cs);
                let mut inner = core.inner(cs);
                st.read_waiters.remove(me);
                st.write_waiters.remove(me);
                // A writer giving up may have been all that held readers back.
                st.admit(&mut inner, false);
            });
            core.dispatch();
        }
        woke
    }

    /// Drop a shared lock. The last reader admits one queued writer, or the
    /// queued readers if no writer is waiting.
    pub fn read_unlock(&self, core: &Core) -> Result<()> {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            if st.readers == 0 {
                return Err(KernelError::State);
            }
            st.readers -= 1;
            st.admit(&mut inner, false);
            Ok(())
        })?;
        core.dispatch();
        Ok(())
    }

    /// Drop the exclusive lock; admits every queued reader, or else one
    /// queued writer. `State` if the caller is not the writer.
    pub fn write_unlock(&self, core: &Core) -> Result<()> {
        let me = core.current_task();
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            if st.writer.is_none() || st.writer != me {
                return Err(KernelError::State);
            }
            st.writer = None;
            st.admit(&mut inner, true);
            Ok(())
        })?;
        core.dispatch();
        Ok(())
    }

    pub fn reader_count(&self) -> u32 {
        critical_section(|cs| self.state.borrow_ref(cs).readers)
    }

    pub fn writer(&self) -> Option<TaskHandle> {
        critical_section(|cs| self.state.borrow_ref(cs).writer)
    }

    /// Destroy the lock, waking every waiter with `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.read_waiters.wake_all_deleted(&mut inner, WaitKind::ReadLock);
            st.write_waiters.wake_all_deleted(&mut inner, WaitKind::WriteLock);
        });
        core.dispatch();
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
