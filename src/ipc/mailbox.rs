//! Per-core mailboxes.
//!
//! Each core owns [`MAILBOX_SLOTS`] slots in the shared region. Any core may
//! post into any mailbox under that mailbox's spinlock; only the owning
//! core takes messages out. Messages are delivered oldest first.

use tracing::{trace, warn};

use super::{IpcCounters, MSG_GENERIC};
use crate::config::{MAILBOX_MSG_SIZE, MAILBOX_SLOTS};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::multicore::IPI_WAKEUP;

/// One mailbox message as seen by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxMessage {
    pub sender: usize,
    pub msg_type: u32,
    len: u8,
    data: [u8; MAILBOX_MSG_SIZE],
}

impl MailboxMessage {
    /// `Param` if `data` exceeds [`MAILBOX_MSG_SIZE`].
    pub fn new(sender: usize, msg_type: u32, data: &[u8]) -> Result<Self> {
        if data.len() > MAILBOX_MSG_SIZE {
            return Err(KernelError::Param);
        }
        let mut msg = Self {
            sender,
            msg_type,
            len: data.len() as u8,
            data: [0; MAILBOX_MSG_SIZE],
        };
        msg.data[..data.len()].copy_from_slice(data);
        Ok(msg)
    }

    const fn empty() -> Self {
        Self {
            sender: 0,
            msg_type: MSG_GENERIC,
            len: 0,
            data: [0; MAILBOX_MSG_SIZE],
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Little-endian `u32` at byte `offset` of the payload.
    pub(crate) fn word(&self, offset: usize) -> Option<u32> {
        let bytes = self.payload().get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Empty,
    Full,
}

#[derive(Clone, Copy)]
struct Slot {
    status: SlotStatus,
    /// Post order, for oldest-first delivery.
    seq: u32,
    msg: MailboxMessage,
}

/// Slot array of one core, guarded by a `SpinCell` in the shared region.
pub(crate) struct Mailbox {
    slots: [Slot; MAILBOX_SLOTS],
    next_seq: u32,
}

impl Mailbox {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [Slot {
                status: SlotStatus::Empty,
                seq: 0,
                msg: MailboxMessage::empty(),
            }; MAILBOX_SLOTS],
            next_seq: 0,
        }
    }

    fn post(&mut self, msg: MailboxMessage) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.status == SlotStatus::Empty)
            .ok_or(KernelError::Full)?;
        slot.status = SlotStatus::Full;
        slot.seq = self.next_seq;
        slot.msg = msg;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(())
    }

    /// Remove the oldest message accepted by `filter`.
    fn take_where(&mut self, filter: impl Fn(&MailboxMessage) -> bool) -> Option<MailboxMessage> {
        let base = self.next_seq;
        let slot = self
            .slots
            .iter_mut()
            .filter(|s| s.status == SlotStatus::Full && filter(&s.msg))
            // Age relative to the next sequence number survives wrap-around.
            .max_by_key(|s| base.wrapping_sub(s.seq))?;
        slot.status = SlotStatus::Empty;
        Some(slot.msg)
    }

    fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.status == SlotStatus::Full).count()
    }
}

impl Core {
    /// Post a message into `target`'s mailbox and wake that core. `Full`
    /// when every slot is occupied.
    pub fn mailbox_send(&self, target: usize, msg_type: u32, data: &[u8]) -> Result<()> {
        let shared = self.shared();
        if target >= shared.num_cores() {
            return Err(KernelError::Param);
        }
        let msg = MailboxMessage::new(self.id(), msg_type, data)?;
        let stats = shared.counters(self.id());
        match shared.mailbox(target).with(self.id(), |mb| mb.post(msg)) {
            Ok(()) => {
                IpcCounters::bump(&stats.messages_sent);
                trace!(core = self.id(), target, msg_type, "mailbox send");
                self.send_ipi(target, IPI_WAKEUP)
            }
            Err(e) => {
                IpcCounters::bump(&stats.send_failures);
                warn!(core = self.id(), target, msg_type, "mailbox full");
                Err(e)
            }
        }
    }

    /// Take the oldest message addressed to this core. Waiting polls once
    /// per tick, so it needs task context; `Empty` with `NO_WAIT`.
    pub fn mailbox_receive(&self, timeout: Timeout) -> Result<MailboxMessage> {
        self.mailbox_receive_where(timeout, |_| true)
    }

    pub(crate) fn mailbox_receive_where(
        &self,
        timeout: Timeout,
        filter: impl Fn(&MailboxMessage) -> bool + Copy,
    ) -> Result<MailboxMessage> {
        let start = self.ticks();
        loop {
            if let Some(msg) = self.mailbox_take(filter) {
                return Ok(msg);
            }
            if timeout.is_no_wait() {
                return Err(KernelError::Empty);
            }
            if let Some(limit) = timeout.finite() {
                if self.ticks().saturating_sub(start) >= u64::from(limit) {
                    IpcCounters::bump(&self.shared().counters(self.id()).receive_timeouts);
                    return Err(KernelError::Timeout);
                }
            }
            self.task_context()?;
            self.task_delay(1)?;
        }
    }

    pub(crate) fn mailbox_take(
        &self,
        filter: impl Fn(&MailboxMessage) -> bool,
    ) -> Option<MailboxMessage> {
        let shared = self.shared();
        let msg = shared.mailbox(self.id()).with(self.id(), |mb| mb.take_where(filter))?;
        IpcCounters::bump(&shared.counters(self.id()).messages_received);
        Some(msg)
    }

    /// Messages waiting in `core`'s mailbox; `0` for an unknown core.
    pub fn mailbox_pending(&self, core: usize) -> usize {
        let shared = self.shared();
        if core >= shared.num_cores() {
            return 0;
        }
        shared.mailbox(core).with(self.id(), |mb| mb.pending())
    }

    /// Send to every other core; returns how many sends succeeded.
    pub fn mailbox_broadcast(&self, msg_type: u32, data: &[u8]) -> u32 {
        (0..self.shared().num_cores())
            .filter(|&c| c != self.id())
            .filter(|&c| self.mailbox_send(c, msg_type, data).is_ok())
            .count() as u32
    }
}
