//! Cross-core spinlock.
//!
//! Acquire is a test-and-set with `Acquire` ordering; release is a full
//! fence followed by a `Release` store. Hold times must stay short: the
//! waiting core burns cycles.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};

use super::critical_section;

const NO_OWNER: u8 = u8::MAX;

/// Busy-wait lock for state shared between cores.
pub struct Spinlock {
    locked: AtomicBool,
    owner: AtomicU8,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU8::new(NO_OWNER),
        }
    }

    /// Spin until the lock is taken on behalf of `core`.
    pub fn acquire(&self, core: usize) {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        self.owner.store(core as u8, Ordering::Relaxed);
    }

    pub fn try_acquire(&self, core: usize) -> bool {
        if self.locked.swap(true, Ordering::Acquire) {
            return false;
        }
        self.owner.store(core as u8, Ordering::Relaxed);
        true
    }

    pub fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Core currently holding the lock.
    pub fn owner_core(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            core => Some(core as usize),
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// A value guarded by a [`Spinlock`]. Access also masks local interrupts,
/// so an ISR on the holding core cannot spin on the lock forever.
pub struct SpinCell<T> {
    lock: Spinlock,
    value: UnsafeCell<T>,
}

// Access to `value` is serialized by `lock`.
unsafe impl<T: Send> Sync for SpinCell<T> {}

impl<T> SpinCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Spinlock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access, on behalf of `core`.
    pub fn with<R>(&self, core: usize, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|_| {
            self.lock.acquire(core);
            let result = f(unsafe { &mut *self.value.get() });
            self.lock.release();
            result
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
