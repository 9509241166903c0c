//! # Multicore Support
//!
//! [`SharedRegion`] is the memory every core can see. Each core's
//! scheduler, tasks and synchronization objects stay private to its
//! [`Core`]; only the structures below cross core boundaries, and each is
//! either an atomic or sits behind a [`SpinCell`].
//!
//! ```text
//!  SharedRegion
//!  ├── task-id counter           AtomicU32
//!  ├── core-ready flags          [AtomicBool; MAX_CORES]
//!  ├── IPI channels              [AtomicU32; MAX_CORES]   one bit per event
//!  ├── barriers                  [Barrier; BARRIER_COUNT] sense-reversing
//!  ├── shared heap               SpinCell<Heap>           bump allocator
//!  ├── mailboxes                 [SpinCell<Mailbox>; MAX_CORES]
//!  ├── buffer pool               BufferPool
//!  ├── RPC descriptors           RpcTable
//!  └── IPC statistics            [IpcCounters; MAX_CORES]
//! ```
//!
//! ## IPI events
//!
//! An IPI sets a bit in the target core's channel and rings its doorbell
//! ([`Platform::notify_core`]). The target drains the channel in
//! [`Core::handle_ipi`], called from every tick and every idle pass.
//!
//! | Event           | Action on the target          |
//! |-----------------|-------------------------------|
//! | `IPI_SCHEDULE`  | reschedule                    |
//! | `IPI_WAKEUP`    | none (the drain is the point) |
//! | `IPI_STOP`      | enter `KernelState::Suspended`|
//! | `IPI_CALL`      | `process_pending`             |
//! | `IPI_USER..`    | IPI hook                      |
//!
//! A core that has not started yet keeps its events latched until its first
//! tick. Nothing acknowledges delivery; use [`SharedRegion::wait_core_ready`]
//! before relying on a peer.
//!
//! [`Platform::notify_core`]: crate::arch::Platform::notify_core

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{debug, info, trace};

use crate::config::{BARRIER_COUNT, MAX_CORES};
use crate::error::{KernelError, Result};
use crate::ipc::{BufferPool, IpcCounters, IpcStats, Mailbox, RpcTable};
use crate::kernel::{Core, KernelState};
use crate::sync::SpinCell;

pub const IPI_SCHEDULE: u32 = 1;
pub const IPI_WAKEUP: u32 = 2;
pub const IPI_STOP: u32 = 3;
pub const IPI_CALL: u32 = 4;
/// First application event; delivered to the IPI hook.
pub const IPI_USER: u32 = 16;
/// Events are bit positions in a 32-bit channel.
pub const IPI_MAX_EVENT: u32 = 31;

/// Spinlock owner recorded for region-level operations that are not made
/// on behalf of a particular core.
const REGION_OWNER: usize = MAX_CORES;

// ---------------------------------------------------------------------------
// Barrier
// ---------------------------------------------------------------------------

struct Barrier {
    arrived: AtomicU32,
    sense: AtomicBool,
}

impl Barrier {
    const fn new() -> Self {
        Self {
            arrived: AtomicU32::new(0),
            sense: AtomicBool::new(false),
        }
    }

    fn wait(&self, participants: u32) {
        let my_sense = !self.sense.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == participants {
            self.arrived.store(0, Ordering::Relaxed);
            self.sense.store(my_sense, Ordering::Release);
        } else {
            while self.sense.load(Ordering::Acquire) != my_sense {
                spin_loop();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared heap
// ---------------------------------------------------------------------------

struct Heap {
    free: Option<&'static mut [u8]>,
    capacity: usize,
}

impl Heap {
    fn alloc(&mut self, size: usize, align: usize) -> Option<&'static mut [u8]> {
        let free = self.free.take()?;
        let addr = free.as_ptr() as usize;
        let pad = addr.wrapping_neg() & (align - 1);
        if pad.checked_add(size).map_or(true, |end| end > free.len()) {
            self.free = Some(free);
            return None;
        }
        let (_, rest) = free.split_at_mut(pad);
        let (block, rest) = rest.split_at_mut(size);
        self.free = Some(rest);
        Some(block)
    }

    fn available(&self) -> usize {
        self.free.as_ref().map_or(0, |f| f.len())
    }
}

// ---------------------------------------------------------------------------
// Shared region
// ---------------------------------------------------------------------------

/// Cross-core memory. Create one, place it where every core can reach it,
/// and pass it to each [`Core::new`].
pub struct SharedRegion {
    num_cores: usize,
    next_task_id: AtomicU32,
    ready: [AtomicBool; MAX_CORES],
    ipi: [AtomicU32; MAX_CORES],
    barriers: [Barrier; BARRIER_COUNT],
    heap: SpinCell<Heap>,
    mailboxes: [SpinCell<Mailbox>; MAX_CORES],
    buffers: BufferPool,
    rpc: RpcTable,
    stats: [IpcCounters; MAX_CORES],
}

impl SharedRegion {
    /// Region for `cores` cores, clamped to `1..=MAX_CORES`.
    pub const fn new(cores: usize) -> Self {
        let num_cores = if cores == 0 {
            1
        } else if cores > MAX_CORES {
            MAX_CORES
        } else {
            cores
        };
        Self {
            num_cores,
            next_task_id: AtomicU32::new(1),
            ready: [const { AtomicBool::new(false) }; MAX_CORES],
            ipi: [const { AtomicU32::new(0) }; MAX_CORES],
            barriers: [const { Barrier::new() }; BARRIER_COUNT],
            heap: SpinCell::new(Heap {
                free: None,
                capacity: 0,
            }),
            mailboxes: [const { SpinCell::new(Mailbox::new()) }; MAX_CORES],
            buffers: BufferPool::new(),
            rpc: RpcTable::new(),
            stats: [const { IpcCounters::new() }; MAX_CORES],
        }
    }

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// System-wide unique task id; ids start at 1.
    pub(crate) fn next_task_id(&self) -> u32 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn mailbox(&self, core: usize) -> &SpinCell<Mailbox> {
        &self.mailboxes[core]
    }

    pub(crate) fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub(crate) fn rpc(&self) -> &RpcTable {
        &self.rpc
    }

    pub(crate) fn counters(&self, core: usize) -> &IpcCounters {
        &self.stats[core]
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn ipc_stats(&self, core: usize) -> Result<IpcStats> {
        if core >= self.num_cores {
            return Err(KernelError::Param);
        }
        Ok(self.stats[core].snapshot())
    }

    pub fn reset_ipc_stats(&self) {
        for counters in &self.stats {
            counters.reset();
        }
    }

    /// Buffers currently free in the pool.
    pub fn buffers_available(&self) -> usize {
        self.buffers.available(REGION_OWNER)
    }

    /// RPC descriptors not tied to an outstanding call.
    pub fn rpc_slots_free(&self) -> usize {
        self.rpc.free_slots(REGION_OWNER)
    }

    // -----------------------------------------------------------------------
    // Barriers
    // -----------------------------------------------------------------------

    /// Spin until every configured core has reached barrier `id`. Barriers
    /// are reusable.
    pub fn barrier(&self, id: usize) -> Result<()> {
        let barrier = self.barriers.get(id).ok_or(KernelError::Param)?;
        barrier.wait(self.num_cores as u32);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared heap
    // -----------------------------------------------------------------------

    /// Hand `mem` to the shared bump allocator, replacing any earlier heap.
    pub fn init_heap(&self, mem: &'static mut [u8]) {
        let capacity = mem.len();
        self.heap.with(REGION_OWNER, |heap| {
            heap.free = Some(mem);
            heap.capacity = capacity;
        });
        info!(bytes = capacity, "shared heap initialized");
    }

    /// Carve `size` bytes aligned to `align` out of the shared heap. Blocks
    /// are never returned. `None` for a zero size, an alignment that is not
    /// a power of two, or when the heap is exhausted.
    pub fn alloc_shared(&self, size: usize, align: usize) -> Option<&'static mut [u8]> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let block = self.heap.with(REGION_OWNER, |heap| heap.alloc(size, align));
        if block.is_none() {
            debug!(size, align, "shared heap exhausted");
        }
        block
    }

    pub fn heap_available(&self) -> usize {
        self.heap.with(REGION_OWNER, |heap| heap.available())
    }

    pub fn heap_capacity(&self) -> usize {
        self.heap.with(REGION_OWNER, |heap| heap.capacity)
    }

    // -----------------------------------------------------------------------
    // Core readiness
    // -----------------------------------------------------------------------

    pub fn signal_ready(&self, core: usize) {
        if let Some(flag) = self.ready[..self.num_cores].get(core) {
            flag.store(true, Ordering::Release);
            info!(core, "core ready");
        }
    }

    pub fn is_core_ready(&self, core: usize) -> bool {
        self.ready[..self.num_cores]
            .get(core)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// Poll up to `spins` times for `core` to signal readiness.
    pub fn wait_core_ready(&self, core: usize, spins: u32) -> bool {
        for _ in 0..spins {
            if self.is_core_ready(core) {
                return true;
            }
            spin_loop();
        }
        self.is_core_ready(core)
    }

    /// Poll up to `spins` times per core for every core to be ready.
    pub fn wait_all_ready(&self, spins: u32) -> bool {
        (0..self.num_cores).all(|core| self.wait_core_ready(core, spins))
    }

    // -----------------------------------------------------------------------
    // IPI channels
    // -----------------------------------------------------------------------

    fn post_ipi(&self, target: usize, event: u32) -> Result<()> {
        if target >= self.num_cores || event > IPI_MAX_EVENT {
            return Err(KernelError::Param);
        }
        self.ipi[target].fetch_or(1 << event, Ordering::AcqRel);
        Ok(())
    }

    fn take_ipi(&self, core: usize) -> u32 {
        self.ipi.get(core).map_or(0, |c| c.swap(0, Ordering::AcqRel))
    }

    /// Events posted to `core` and not yet drained, as a bit set.
    pub fn pending_ipi(&self, core: usize) -> u32 {
        self.ipi.get(core).map_or(0, |c| c.load(Ordering::Acquire))
    }
}

impl Core {
    /// Post `event` to `target` and ring its doorbell.
    pub fn send_ipi(&self, target: usize, event: u32) -> Result<()> {
        self.shared().post_ipi(target, event)?;
        self.platform().notify_core(target);
        trace!(core = self.id(), target, event, "ipi sent");
        Ok(())
    }

    /// Post `event` to every other core; returns how many were signalled.
    pub fn broadcast_ipi(&self, event: u32) -> u32 {
        (0..self.shared().num_cores())
            .filter(|&c| c != self.id())
            .filter(|&c| self.send_ipi(c, event).is_ok())
            .count() as u32
    }

    /// Drain and act on this core's IPI events.
    pub fn handle_ipi(&self) {
        let pending = self.shared().take_ipi(self.id());
        if pending == 0 {
            return;
        }
        for event in 0..=IPI_MAX_EVENT {
            if pending & (1 << event) == 0 {
                continue;
            }
            match event {
                IPI_SCHEDULE => self.with(|inner| inner.sched.request_switch()),
                IPI_WAKEUP => {}
                IPI_STOP => {
                    self.set_state(KernelState::Suspended);
                    info!(core = self.id(), "stopped by ipi");
                }
                IPI_CALL => {
                    self.process_pending();
                }
                e if e >= IPI_USER => {
                    if let Some(hook) = self.hooks().ipi {
                        hook(self, e);
                    }
                }
                e => debug!(core = self.id(), event = e, "unknown ipi event"),
            }
        }
    }
}
