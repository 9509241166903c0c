//! Synchronous calls into another core.
//!
//! A call claims one of [`RPC_SLOTS`] descriptors in the shared region,
//! mails its ticket (slot index and generation) to the target and raises a
//! `CALL` IPI. The target runs the function from its IPI path and marks the
//! slot done; the caller polls once per tick until then.
//!
//! A caller that gives up frees its slot at once. The generation bump on
//! the next claim makes any late pickup or completion of the abandoned call
//! a no-op.

use tracing::{debug, warn};

use super::{MailboxMessage, MSG_RPC};
use crate::config::RPC_SLOTS;
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::multicore::IPI_CALL;
use crate::sync::SpinCell;

/// Function executed on the target core.
pub type RpcFn = fn(usize) -> i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Free,
    Pending,
    Running,
    Done,
}

#[derive(Clone, Copy)]
struct Call {
    state: CallState,
    generation: u32,
    func: Option<RpcFn>,
    arg: usize,
    result: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    index: usize,
    generation: u32,
}

impl Ticket {
    fn encode(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&(self.index as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    fn decode(msg: &MailboxMessage) -> Option<Self> {
        let index = msg.word(0)? as usize;
        (index < RPC_SLOTS).then_some(Self {
            index,
            generation: msg.word(4)?,
        })
    }
}

pub(crate) struct RpcTable {
    calls: SpinCell<[Call; RPC_SLOTS]>,
}

impl RpcTable {
    pub(crate) const fn new() -> Self {
        Self {
            calls: SpinCell::new(
                [Call {
                    state: CallState::Free,
                    generation: 0,
                    func: None,
                    arg: 0,
                    result: 0,
                }; RPC_SLOTS],
            ),
        }
    }

    fn claim(&self, core: usize, func: RpcFn, arg: usize) -> Option<Ticket> {
        self.calls.with(core, |calls| {
            let (index, call) = calls
                .iter_mut()
                .enumerate()
                .find(|(_, c)| c.state == CallState::Free)?;
            call.generation = call.generation.wrapping_add(1);
            call.state = CallState::Pending;
            call.func = Some(func);
            call.arg = arg;
            call.result = 0;
            Some(Ticket {
                index,
                generation: call.generation,
            })
        })
    }

    /// Target side: move a live pending call to running.
    fn begin(&self, core: usize, t: Ticket) -> Option<(RpcFn, usize)> {
        self.calls.with(core, |calls| {
            let call = &mut calls[t.index];
            if call.generation != t.generation || call.state != CallState::Pending {
                return None;
            }
            call.state = CallState::Running;
            Some((call.func?, call.arg))
        })
    }

    fn complete(&self, core: usize, t: Ticket, result: i32) {
        self.calls.with(core, |calls| {
            let call = &mut calls[t.index];
            if call.generation == t.generation && call.state == CallState::Running {
                call.result = result;
                call.state = CallState::Done;
            }
        })
    }

    /// Caller side: take the result and free the slot if the call is done.
    fn collect(&self, core: usize, t: Ticket) -> Option<i32> {
        self.calls.with(core, |calls| {
            let call = &mut calls[t.index];
            if call.generation != t.generation || call.state != CallState::Done {
                return None;
            }
            call.state = CallState::Free;
            call.func = None;
            Some(call.result)
        })
    }

    fn abandon(&self, core: usize, t: Ticket) {
        self.calls.with(core, |calls| {
            let call = &mut calls[t.index];
            if call.generation == t.generation {
                call.state = CallState::Free;
                call.func = None;
            }
        })
    }

    pub(crate) fn free_slots(&self, core: usize) -> usize {
        self.calls
            .with(core, |calls| calls.iter().filter(|c| c.state == CallState::Free).count())
    }
}

impl Core {
    /// Run `func(arg)` on core `target` and return its result.
    ///
    /// Waiting requires task context and polls once per tick. `Param` for
    /// an unknown target or this core, `NoMem` when every call slot is in
    /// use, `Timeout` if the target has not finished in time. Mailbox
    /// errors from posting the request are returned as is.
    pub fn call_on_core(&self, target: usize, func: RpcFn, arg: usize, timeout: Timeout) -> Result<i32> {
        if target >= self.shared().num_cores() || target == self.id() {
            return Err(KernelError::Param);
        }
        if !timeout.is_no_wait() {
            self.task_context()?;
        }
        let table = self.shared().rpc();
        let ticket = table.claim(self.id(), func, arg).ok_or(KernelError::NoMem)?;
        if let Err(e) = self.mailbox_send(target, MSG_RPC, &ticket.encode()) {
            table.abandon(self.id(), ticket);
            return Err(e);
        }
        if let Err(e) = self.send_ipi(target, IPI_CALL) {
            table.abandon(self.id(), ticket);
            return Err(e);
        }

        let start = self.ticks();
        loop {
            if let Some(result) = table.collect(self.id(), ticket) {
                return Ok(result);
            }
            let expired = match timeout.finite() {
                Some(limit) => self.ticks().saturating_sub(start) >= u64::from(limit),
                None => timeout.is_no_wait(),
            };
            if expired {
                table.abandon(self.id(), ticket);
                warn!(core = self.id(), target, slot = ticket.index, "rpc timed out");
                return Err(KernelError::Timeout);
            }
            self.task_delay(1)?;
        }
    }

    /// Call `func(arg)` on every other core in turn; returns how many
    /// calls succeeded.
    pub fn call_on_all(&self, func: RpcFn, arg: usize, timeout: Timeout) -> u32 {
        (0..self.shared().num_cores())
            .filter(|&c| c != self.id())
            .filter(|&c| self.call_on_core(c, func, arg, timeout).is_ok())
            .count() as u32
    }

    /// Drain this core's mailbox: run RPC requests, and hand every other
    /// message to the message hook. Without a hook, non-RPC messages stay
    /// queued for `mailbox_receive`. Returns the messages consumed.
    pub fn process_pending(&self) -> usize {
        let hook = self.hooks().message;
        let mut consumed = 0;
        loop {
            let next = match hook {
                Some(_) => self.mailbox_take(|_| true),
                None => self.mailbox_take(|m| m.msg_type == MSG_RPC),
            };
            let Some(msg) = next else { break };
            consumed += 1;
            if msg.msg_type == MSG_RPC {
                self.serve_rpc(&msg);
            } else if let Some(hook) = hook {
                hook(self, &msg);
            }
        }
        consumed
    }

    fn serve_rpc(&self, msg: &MailboxMessage) {
        let Some(ticket) = Ticket::decode(msg) else {
            warn!(core = self.id(), sender = msg.sender, "malformed rpc request");
            return;
        };
        let table = self.shared().rpc();
        let Some((func, arg)) = table.begin(self.id(), ticket) else {
            debug!(core = self.id(), slot = ticket.index, "stale rpc dropped");
            return;
        };
        let result = func(arg);
        table.complete(self.id(), ticket, result);
    }
}
