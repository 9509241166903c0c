//! Reference-counted buffer pool for zero-copy transfers between cores.
//!
//! A transfer moves the handle, never the bytes: `buffer_send` takes a
//! reference on behalf of the receiver and mails the index. Both sides
//! release their reference when done; the buffer returns to the pool when
//! the count reaches zero.

use tracing::debug;

use super::{IpcCounters, MSG_BUFFER};
use crate::config::{BUFFER_POOL_SIZE, BUFFER_SIZE};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::sync::SpinCell;

/// Handle to one pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u8);

impl BufferHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: u32) -> Option<Self> {
        (index < BUFFER_POOL_SIZE as u32).then_some(Self(index as u8))
    }
}

#[derive(Clone, Copy)]
struct Entry {
    refs: u32,
    len: usize,
    owner: usize,
    data: [u8; BUFFER_SIZE],
}

impl Entry {
    const FREE: Entry = Entry {
        refs: 0,
        len: 0,
        owner: 0,
        data: [0; BUFFER_SIZE],
    };
}

pub(crate) struct BufferPool {
    entries: SpinCell<[Entry; BUFFER_POOL_SIZE]>,
}

impl BufferPool {
    pub(crate) const fn new() -> Self {
        Self {
            entries: SpinCell::new([Entry::FREE; BUFFER_POOL_SIZE]),
        }
    }

    /// Run `f` on a live buffer; `State` if it has been released.
    fn with_live<R>(
        &self,
        core: usize,
        h: BufferHandle,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Result<R> {
        self.entries.with(core, |entries| {
            let entry = entries.get_mut(h.index()).ok_or(KernelError::Param)?;
            if entry.refs == 0 {
                return Err(KernelError::State);
            }
            Ok(f(entry))
        })
    }

    pub(crate) fn available(&self, core: usize) -> usize {
        self.entries
            .with(core, |entries| entries.iter().filter(|e| e.refs == 0).count())
    }
}

impl Core {
    /// Take a free buffer holding `size` valid bytes, with one reference
    /// owned by the caller. `None` if `size` exceeds [`BUFFER_SIZE`] or the
    /// pool is exhausted.
    pub fn buffer_alloc(&self, size: usize) -> Option<BufferHandle> {
        if size > BUFFER_SIZE {
            return None;
        }
        let owner = self.id();
        let h = self.shared().buffers().entries.with(owner, |entries| {
            let (i, entry) = entries.iter_mut().enumerate().find(|(_, e)| e.refs == 0)?;
            *entry = Entry {
                refs: 1,
                len: size,
                owner,
                ..Entry::FREE
            };
            Some(BufferHandle(i as u8))
        })?;
        IpcCounters::bump(&self.shared().counters(owner).buffers_allocated);
        debug!(core = owner, buffer = h.index(), size, "buffer allocated");
        Some(h)
    }

    /// Add a reference.
    pub fn buffer_ref(&self, h: BufferHandle) -> Result<()> {
        self.shared().buffers().with_live(self.id(), h, |e| e.refs += 1)
    }

    /// Drop a reference; the last one returns the buffer to the pool.
    pub fn buffer_release(&self, h: BufferHandle) -> Result<()> {
        let freed = self.shared().buffers().with_live(self.id(), h, |e| {
            e.refs -= 1;
            e.refs == 0
        })?;
        if freed {
            IpcCounters::bump(&self.shared().counters(self.id()).buffers_freed);
            debug!(core = self.id(), buffer = h.index(), "buffer freed");
        }
        Ok(())
    }

    /// Copy `data` in at `offset`, growing the valid length as needed.
    /// Returns the bytes written, which stop at the buffer's capacity.
    pub fn buffer_write(&self, h: BufferHandle, offset: usize, data: &[u8]) -> Result<usize> {
        if offset > BUFFER_SIZE {
            return Err(KernelError::Param);
        }
        self.shared().buffers().with_live(self.id(), h, |e| {
            let n = data.len().min(BUFFER_SIZE - offset);
            e.data[offset..offset + n].copy_from_slice(&data[..n]);
            e.len = e.len.max(offset + n);
            n
        })
    }

    /// Copy valid bytes from `offset` into `out`; returns the bytes read.
    pub fn buffer_read(&self, h: BufferHandle, offset: usize, out: &mut [u8]) -> Result<usize> {
        if offset > BUFFER_SIZE {
            return Err(KernelError::Param);
        }
        self.shared().buffers().with_live(self.id(), h, |e| {
            let valid = e.len.saturating_sub(offset);
            let n = valid.min(out.len());
            out[..n].copy_from_slice(&e.data[offset..offset + n]);
            n
        })
    }

    pub fn buffer_len(&self, h: BufferHandle) -> Result<usize> {
        self.shared().buffers().with_live(self.id(), h, |e| e.len)
    }

    pub fn buffer_ref_count(&self, h: BufferHandle) -> Result<u32> {
        self.shared()
            .buffers()
            .entries
            .with(self.id(), |entries| entries.get(h.index()).map(|e| e.refs))
            .ok_or(KernelError::Param)
    }

    /// Core that allocated the buffer.
    pub fn buffer_owner(&self, h: BufferHandle) -> Result<usize> {
        self.shared().buffers().with_live(self.id(), h, |e| e.owner)
    }

    /// Hand `h` to `target` without copying. The receiver's reference is
    /// taken here; the caller keeps its own.
    pub fn buffer_send(&self, target: usize, h: BufferHandle, msg_type: u32) -> Result<()> {
        self.buffer_ref(h)?;
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&(h.index() as u32).to_le_bytes());
        payload[4..].copy_from_slice(&msg_type.to_le_bytes());
        if let Err(e) = self.mailbox_send(target, MSG_BUFFER, &payload) {
            self.buffer_release(h)?;
            return Err(e);
        }
        Ok(())
    }

    /// Take the oldest buffer transfer addressed to this core, with the
    /// sender's message type. Other mailbox messages stay queued.
    pub fn buffer_receive(&self, timeout: Timeout) -> Result<(BufferHandle, u32)> {
        let msg = self.mailbox_receive_where(timeout, |m| m.msg_type == MSG_BUFFER)?;
        let h = msg
            .word(0)
            .and_then(BufferHandle::from_index)
            .ok_or(KernelError::Generic)?;
        Ok((h, msg.word(4).unwrap_or(0)))
    }
}
