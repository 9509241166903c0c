//! # Jezgro
//!
//! Scheduling-and-coordination core of a multi-core real-time kernel.
//!
//! ## Overview
//!
//! Every core runs its own preemptive Earliest-Deadline-First scheduler.
//! Tasks never migrate: a task is created on one core and lives there until
//! it is deleted. Cores cooperate only through the [`SharedRegion`], using
//! mailboxes, a zero-copy buffer pool, synchronous RPC, inter-processor
//! events and barriers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │              Core (kernel.rs), one per CPU              │
//! │   start() · tick_handler() · isr_enter/exit · hooks     │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   Task Manager     │  Sync Primitives  │
//! │  scheduler.rs│   task.rs          │  sync/            │
//! │  ─ EDF ready │   ─ create/delete  │  ─ Mutex (PI)     │
//! │  ─ delays    │   ─ delay/period   │  ─ Semaphore      │
//! │  ─ tick()    │   ─ notify         │  ─ Event/CondVar  │
//! │  ─ lock      │                    │  ─ RwLock/Spin    │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │        IPC (ipc/) · Multicore (multicore.rs)            │
//! │  MessageQueue · Mailbox · BufferPool · RPC · IPI        │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch Port (arch/): hosted threads · Cortex-M4 PendSV  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! The ready list is ordered by absolute deadline, earliest first; tasks
//! without a deadline sort after every task with one. Equal deadlines are
//! broken by effective priority (higher first), then by arrival. A newly
//! ready task preempts the running one if it sorts strictly earlier.
//!
//! Priorities only order tasks that share a deadline, and they drive
//! priority inheritance: a task blocked on a [`Mutex`](sync::Mutex) lends
//! its priority to the holder.
//!
//! ## Memory Model
//!
//! - **No heap**: pools are fixed at compile time (see [`config`])
//! - **Handles, not pointers**: tasks are referenced by generation-checked
//!   [`TaskHandle`]s
//! - **Core-local state** sits behind the core's critical section
//! - **Cross-core state** sits behind spinlocks in the [`SharedRegion`]
//!
//! ## Features
//!
//! - `std`: hosted port on OS threads
//! - `firmware`: demo firmware binary for a Cortex-M4 board

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod multicore;
pub mod scheduler;
pub mod sync;
pub mod task;

pub use error::{KernelError, Result, Timeout};
pub use kernel::{Core, Hooks, KernelState, KernelStats};
pub use multicore::SharedRegion;
pub use task::{TaskHandle, TaskParams, TaskState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate version as a string, same as [`VERSION`].
pub fn version() -> &'static str {
    VERSION
}
