//! # Architecture Abstraction Layer
//!
//! The kernel never touches registers directly. Everything it needs from the
//! hardware goes through two traits:
//!
//! - [`ExecutionContext`]: create, switch, and destroy a task's saved
//!   register state. A switch is a suspension point: `switch(from, to)`
//!   returns only when `from` is scheduled again.
//! - [`Platform`]: monotonic time, the inter-core doorbell, and the idle
//!   wait instruction.
//!
//! Critical sections come from the `critical-section` crate, whose
//! implementation is supplied by the port (`cortex-m`'s
//! `critical-section-single-core` on Cortex-M, `critical-section/std` on a
//! host).
//!
//! Ports:
//! - [`hosted`]: OS threads with a hand-off baton (feature `std`, tests).
//! - [`cortex_m4`]: PendSV/SysTick port for single-core Cortex-M4.

use core::ptr::NonNull;

use crate::config::STACK_FILL_PATTERN;
use crate::error::Result;
use crate::task::TaskStart;

#[cfg(any(test, feature = "std"))]
pub mod hosted;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

/// Port-issued identifier of a saved execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

/// A task stack: `words` 32-bit words starting at `base` (lowest address).
///
/// The lowest word is the overflow guard. The region stays valid for as
/// long as the owning task exists: it either lives in the core's stack
/// arena or was handed in by the creator as `&'static mut [u32]`.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    base: NonNull<u32>,
    words: usize,
}

// The region is only written by its task and read by the kernel for
// sentinel scans, which tolerate a concurrently moving stack pointer.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Describe `words` words of stack starting at `base`.
    ///
    /// # Safety
    /// `base..base + words` must be valid, exclusively owned task stack
    /// memory for the lifetime of the task.
    pub unsafe fn from_raw(base: NonNull<u32>, words: usize) -> Self {
        Self { base, words }
    }

    /// Borrow a caller-supplied stack for the rest of the program.
    pub fn from_static(stack: &'static mut [u32]) -> Self {
        let words = stack.len();
        // A slice pointer is never null, even for an empty slice.
        let base = NonNull::from(stack).cast::<u32>();
        Self { base, words }
    }

    /// Lowest address of the stack.
    pub fn base(&self) -> NonNull<u32> {
        self.base
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn size_bytes(&self) -> usize {
        self.words * 4
    }

    /// One past the highest word; the initial stack pointer of a
    /// full-descending stack.
    pub fn top(&self) -> *mut u32 {
        // In bounds: `words` is the length of the region.
        unsafe { self.base.as_ptr().add(self.words) }
    }

    /// Overwrite the whole region with the fill pattern.
    pub(crate) fn fill(&self) {
        for i in 0..self.words {
            unsafe { self.base.as_ptr().add(i).write_volatile(STACK_FILL_PATTERN) };
        }
    }

    /// Whether the guard word at the lowest address still holds the fill
    /// pattern.
    pub(crate) fn guard_intact(&self) -> bool {
        self.words == 0 || self.word(0) == STACK_FILL_PATTERN
    }

    /// Bytes never touched since the fill, counted from the low end.
    pub(crate) fn untouched_bytes(&self) -> usize {
        let untouched = (0..self.words)
            .position(|i| self.word(i) != STACK_FILL_PATTERN)
            .unwrap_or(self.words);
        untouched * 4
    }

    fn word(&self, index: usize) -> u32 {
        unsafe { self.base.as_ptr().add(index).read_volatile() }
    }
}

/// Saved register state of tasks.
///
/// Implementations keep their own table of contexts; the kernel only holds
/// [`ContextId`]s.
pub trait ExecutionContext: Sync {
    /// Build a context that, when first switched to, calls
    /// [`TaskStart::run`] on `stack`.
    fn create(&self, stack: Option<StackRegion>, start: TaskStart) -> Result<ContextId>;

    /// Register the calling flow of control as a context, so it can be
    /// switched away from and back to. Used to turn the boot flow into a
    /// core's idle task.
    fn adopt(&self) -> Result<ContextId>;

    /// Save the caller as `from` and resume `to`. Returns when `from` is
    /// resumed.
    fn switch(&self, from: ContextId, to: ContextId);

    /// Resume `to` without saving the caller. Used for the first task on a
    /// core that has no adopted boot flow.
    fn start_first(&self, to: ContextId) -> !;

    /// Release a context that will never run again. Never called on the
    /// running context.
    fn destroy(&self, ctx: ContextId);
}

/// Services the kernel consumes from the board.
pub trait Platform: ExecutionContext {
    /// Monotonic time in microseconds, used for execution-time statistics.
    fn now_us(&self) -> u64;

    /// Ring the doorbell of `core` after an IPI event was posted to its
    /// channel. Ports without a hardware doorbell leave this empty: the
    /// target drains its channel on its next tick.
    fn notify_core(&self, _core: usize) {}

    /// Wait for the next interrupt from the idle loop.
    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }
}
