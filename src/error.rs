//! # Kernel Errors
//!
//! Every kernel entry point reports failure through [`KernelError`]. Errors
//! are plain return values: nothing in the kernel unwinds, and the only
//! non-returning failure path is the panic hook.

use thiserror::Error;

/// Failure reported by a kernel operation.
///
/// Each variant maps to a stable numeric code (see [`KernelError::code`])
/// so that foreign callers and trace records can carry it as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Unclassified failure.
    #[error("kernel error")]
    Generic,
    /// A fixed pool (TCBs, stacks, buffers, RPC slots, shared heap) is
    /// exhausted.
    #[error("out of memory")]
    NoMem,
    /// An argument is out of range or malformed.
    #[error("invalid parameter")]
    Param,
    /// The object is in the wrong state for the request, e.g. unlocking a
    /// mutex held by another task.
    #[error("invalid state")]
    State,
    /// A finite wait expired.
    #[error("timed out")]
    Timeout,
    /// A non-blocking request would have blocked.
    #[error("resource busy")]
    Busy,
    /// A bounded buffer has no room.
    #[error("full")]
    Full,
    /// A bounded buffer has nothing to hand out.
    #[error("empty")]
    Empty,
    /// The object was destroyed while the caller waited on it.
    #[error("object deleted")]
    Deleted,
    /// A blocking call was made from interrupt context.
    #[error("not allowed from interrupt context")]
    Isr,
    /// The handle refers to no live task.
    #[error("no such task")]
    NoTask,
    /// A deadline was violated.
    #[error("deadline missed")]
    Deadline,
    /// A hardware or software fault was detected.
    #[error("fault")]
    Fault,
}

impl KernelError {
    /// Stable numeric code; success is `0` and never produced here.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::Generic => -1,
            KernelError::NoMem => -2,
            KernelError::Param => -3,
            KernelError::State => -4,
            KernelError::Timeout => -5,
            KernelError::Busy => -6,
            KernelError::Full => -7,
            KernelError::Empty => -8,
            KernelError::Deleted => -9,
            KernelError::Isr => -10,
            KernelError::NoTask => -11,
            KernelError::Deadline => -12,
            KernelError::Fault => -13,
        }
    }
}

/// Kernel result type.
pub type Result<T> = core::result::Result<T, KernelError>;

/// How long a blocking call may wait, in ticks.
///
/// `Timeout::NO_WAIT` makes a blocking call return at once and
/// `Timeout::FOREVER` waits without a time limit. Any other value is a
/// finite tick budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeout(pub u32);

impl Timeout {
    /// Return immediately instead of blocking.
    pub const NO_WAIT: Timeout = Timeout(0);
    /// Block until the condition is met.
    pub const FOREVER: Timeout = Timeout(u32::MAX);

    /// A finite wait of `n` ticks.
    pub const fn ticks(n: u32) -> Timeout {
        Timeout(n)
    }

    pub const fn is_no_wait(self) -> bool {
        self.0 == 0
    }

    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }

    /// Tick budget for a finite wait, `None` for `NO_WAIT` and `FOREVER`.
    pub const fn finite(self) -> Option<u32> {
        if self.is_no_wait() || self.is_forever() {
            None
        } else {
            Some(self.0)
        }
    }
}

impl From<u32> for Timeout {
    fn from(ticks: u32) -> Self {
        Timeout(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_and_negative() {
        let all = [
            KernelError::Generic,
            KernelError::NoMem,
            KernelError::Param,
            KernelError::State,
            KernelError::Timeout,
            KernelError::Busy,
            KernelError::Full,
            KernelError::Empty,
            KernelError::Deleted,
            KernelError::Isr,
            KernelError::NoTask,
            KernelError::Deadline,
            KernelError::Fault,
        ];
        for (i, e) in all.iter().enumerate() {
            assert_eq!(e.code(), -(i as i32) - 1);
        }
    }

    #[test]
    fn test_timeout_classes() {
        assert!(Timeout::NO_WAIT.is_no_wait());
        assert!(Timeout::FOREVER.is_forever());
        assert_eq!(Timeout::ticks(10).finite(), Some(10));
        assert_eq!(Timeout::FOREVER.finite(), None);
        assert_eq!(Timeout::from(0), Timeout::NO_WAIT);
    }
}
