//! # Inter-Process Communication
//!
//! ```text
//!   same core                         across cores
//!   ─────────                         ────────────
//!   MessageQueue ── ring buffer       Mailbox ── 8 slots per core, spinlocked
//!     blocking send/receive             └─ BufferPool ── zero-copy handles
//!                                       └─ RPC ── call a function on a core
//! ```
//!
//! Cross-core structures live in the [`SharedRegion`]; a sender never
//! touches the receiving core's scheduler. It posts into shared memory and
//! raises an IPI event, and the receiver picks the message up on its own
//! core.
//!
//! [`SharedRegion`]: crate::multicore::SharedRegion

use core::sync::atomic::{AtomicU32, Ordering};

mod buffer;
mod mailbox;
mod queue;
mod rpc;

pub use buffer::BufferHandle;
pub(crate) use buffer::BufferPool;
pub use mailbox::MailboxMessage;
pub(crate) use mailbox::Mailbox;
pub use queue::MessageQueue;
pub use rpc::RpcFn;
pub(crate) use rpc::RpcTable;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

pub const MSG_GENERIC: u32 = 0x0000;
/// RPC request; payload is the call slot and its generation.
pub const MSG_RPC: u32 = 0x0001;
pub const MSG_RPC_REPLY: u32 = 0x0002;
pub const MSG_SCHEDULER: u32 = 0x0003;
/// Buffer transfer; payload is the buffer index and the user type.
pub const MSG_BUFFER: u32 = 0x0004;
pub const MSG_SHUTDOWN: u32 = 0x0005;
/// First application-defined type.
pub const MSG_USER: u32 = 0x0100;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-core IPC counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcStats {
    pub messages_sent: u32,
    pub messages_received: u32,
    pub send_failures: u32,
    pub receive_timeouts: u32,
    pub buffers_allocated: u32,
    pub buffers_freed: u32,
}

pub(crate) struct IpcCounters {
    pub(crate) messages_sent: AtomicU32,
    pub(crate) messages_received: AtomicU32,
    pub(crate) send_failures: AtomicU32,
    pub(crate) receive_timeouts: AtomicU32,
    pub(crate) buffers_allocated: AtomicU32,
    pub(crate) buffers_freed: AtomicU32,
}

impl IpcCounters {
    pub(crate) const fn new() -> Self {
        Self {
            messages_sent: AtomicU32::new(0),
            messages_received: AtomicU32::new(0),
            send_failures: AtomicU32::new(0),
            receive_timeouts: AtomicU32::new(0),
            buffers_allocated: AtomicU32::new(0),
            buffers_freed: AtomicU32::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> IpcStats {
        IpcStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            receive_timeouts: self.receive_timeouts.load(Ordering::Relaxed),
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            buffers_freed: self.buffers_freed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for c in [
            &self.messages_sent,
            &self.messages_received,
            &self.send_failures,
            &self.receive_timeouts,
            &self.buffers_allocated,
            &self.buffers_freed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
