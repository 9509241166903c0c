//! # Jezgro Configuration
//!
//! Compile-time constants governing the kernel core. All limits are fixed
//! at compile time: task pools, mailboxes, and the buffer pool are sized
//! here and never grow.

/// Number of processor cores the kernel can coordinate.
/// Bounds the mailbox array, IPI channels, and core-ready flags in the
/// shared region.
pub const MAX_CORES: usize = 6;

/// Task control blocks available in each core's pool. The idle task
/// occupies one of them.
pub const MAX_TASKS_PER_CORE: usize = 16;

/// Task name buffer length in bytes, including the terminator the name
/// would carry on the wire. Names are truncated to `TASK_NAME_LEN - 1`.
pub const TASK_NAME_LEN: usize = 16;

/// Stack size used when the caller asks for less than `MIN_STACK_SIZE`.
/// Also the size of each per-slot stack in the core's stack arena.
pub const DEFAULT_STACK_SIZE: usize = 2048;

/// Smallest stack the kernel will hand to a task.
pub const MIN_STACK_SIZE: usize = 512;

/// Scheduler tick frequency in Hz.
pub const TICK_FREQ_HZ: u32 = 1000;

/// Length of one tick in microseconds.
pub const TICK_PERIOD_US: u32 = 1_000_000 / TICK_FREQ_HZ;

/// Highest task priority (priorities are `0..=255`, higher is more urgent).
pub const MAX_PRIORITY: u8 = 255;

/// Priority of the idle task.
pub const PRIORITY_IDLE: u8 = 0;

/// Priority given to tasks created from `TaskParams::default()`.
pub const DEFAULT_PRIORITY: u8 = 128;

/// Word written over every fresh stack. The lowest word doubles as the
/// overflow guard.
pub const STACK_FILL_PATTERN: u32 = 0xDEAD_BEEF;

/// Largest record a message queue may carry.
pub const IPC_MAX_MSG_SIZE: usize = 64;

/// Conventional depth for application message queues.
pub const IPC_DEFAULT_QUEUE_DEPTH: usize = 16;

/// Payload bytes in one mailbox slot.
pub const MAILBOX_MSG_SIZE: usize = 32;

/// Slots in each core's mailbox.
pub const MAILBOX_SLOTS: usize = 8;

/// Buffers in the global zero-copy pool.
pub const BUFFER_POOL_SIZE: usize = 32;

/// Capacity of one pooled buffer in bytes.
pub const BUFFER_SIZE: usize = 256;

/// Numbered rendezvous points available to `SharedRegion::barrier`.
pub const BARRIER_COUNT: usize = 16;

/// Concurrently outstanding cross-core calls, system-wide.
pub const RPC_SLOTS: usize = 8;

/// System clock frequency in Hz (STM32F4 HSI default), used by the
/// Cortex-M4 port to program SysTick.
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Convert ticks to milliseconds (truncating).
pub const fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / TICK_FREQ_HZ as u64
}

/// Convert milliseconds to ticks (truncating).
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * TICK_FREQ_HZ as u64 / 1000
}

/// Convert microseconds to ticks, rounding up so a non-zero duration never
/// becomes a zero-tick wait.
pub const fn us_to_ticks(us: u64) -> u64 {
    (us * TICK_FREQ_HZ as u64 + 999_999) / 1_000_000
}

/// Convert ticks to microseconds.
pub const fn ticks_to_us(ticks: u64) -> u64 {
    ticks * TICK_PERIOD_US as u64
}
