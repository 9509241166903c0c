//! Fixed-size message queue for tasks of one core.
//!
//! Messages are copied in and out of a ring buffer of `capacity` slots of
//! `msg_size` bytes. Blocked senders and receivers wait in FIFO order. A
//! woken task retries its operation and waits again, within what is left of
//! its timeout, if another task got there first.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use crate::config::{IPC_DEFAULT_QUEUE_DEPTH, IPC_MAX_MSG_SIZE};
use crate::error::{KernelError, Result, Timeout};
use crate::kernel::Core;
use crate::multicore::SharedRegion;
use crate::sync::{critical_section, WaitQueue};
use crate::task::WaitKind;

struct Ring {
    storage: &'static mut [u8],
    msg_size: usize,
    capacity: usize,
    head: usize,
    count: usize,
}

impl Ring {
    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = (index % self.capacity) * self.msg_size;
        &mut self.storage[start..start + self.msg_size]
    }

    fn push_back(&mut self, msg: &[u8]) {
        let tail = self.head + self.count;
        let size = self.msg_size;
        self.slot(tail).copy_from_slice(&msg[..size]);
        self.count += 1;
    }

    fn push_front(&mut self, msg: &[u8]) {
        self.head = (self.head + self.capacity - 1) % self.capacity;
        let (head, size) = (self.head, self.msg_size);
        self.slot(head).copy_from_slice(&msg[..size]);
        self.count += 1;
    }

    fn pop(&mut self, out: &mut [u8]) {
        let (head, size) = (self.head, self.msg_size);
        out[..size].copy_from_slice(self.slot(head));
        self.head = (self.head + 1) % self.capacity;
        self.count -= 1;
    }
}

struct QueueState {
    ring: Ring,
    senders: WaitQueue,
    receivers: WaitQueue,
    deleted: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum End {
    Back,
    Front,
}

pub struct MessageQueue {
    state: CsMutex<RefCell<QueueState>>,
}

impl MessageQueue {
    /// Queue of `capacity` messages of `msg_size` bytes over `storage`.
    pub fn new(storage: &'static mut [u8], msg_size: usize, capacity: usize) -> Result<Self> {
        if msg_size == 0 || msg_size > IPC_MAX_MSG_SIZE || capacity == 0 {
            return Err(KernelError::Param);
        }
        let bytes = msg_size.checked_mul(capacity).ok_or(KernelError::Param)?;
        if storage.len() < bytes {
            return Err(KernelError::Param);
        }
        Ok(Self {
            state: CsMutex::new(RefCell::new(QueueState {
                ring: Ring {
                    storage,
                    msg_size,
                    capacity,
                    head: 0,
                    count: 0,
                },
                senders: WaitQueue::new(),
                receivers: WaitQueue::new(),
                deleted: false,
            })),
        })
    }

    /// Queue whose storage comes from the shared heap.
    pub fn create_in(shared: &SharedRegion, msg_size: usize, capacity: usize) -> Result<Self> {
        if msg_size == 0 || msg_size > IPC_MAX_MSG_SIZE || capacity == 0 {
            return Err(KernelError::Param);
        }
        let bytes = msg_size.checked_mul(capacity).ok_or(KernelError::Param)?;
        let storage = shared.alloc_shared(bytes, 4).ok_or(KernelError::NoMem)?;
        Self::new(storage, msg_size, capacity)
    }

    /// [`create_in`](Self::create_in) with the default depth of
    /// [`IPC_DEFAULT_QUEUE_DEPTH`] messages.
    pub fn create_default_in(shared: &SharedRegion, msg_size: usize) -> Result<Self> {
        Self::create_in(shared, msg_size, IPC_DEFAULT_QUEUE_DEPTH)
    }

    /// Append a message. `Full` with `NO_WAIT` when there is no room.
    pub fn send(&self, core: &Core, msg: &[u8], timeout: Timeout) -> Result<()> {
        self.put(core, msg, timeout, End::Back)
    }

    /// Put a message at the head, ahead of everything queued.
    pub fn send_front(&self, core: &Core, msg: &[u8], timeout: Timeout) -> Result<()> {
        self.put(core, msg, timeout, End::Front)
    }

    fn put(&self, core: &Core, msg: &[u8], timeout: Timeout, end: End) -> Result<()> {
        self.blocking(core, timeout, WaitKind::QueueSend, || self.try_put(core, msg, end))
    }

    /// Run `attempt` until it stops reporting a full (sending) or empty
    /// (receiving) queue, blocking on the matching wait queue in between.
    /// Finite timeouts are measured from the first attempt.
    fn blocking(
        &self,
        core: &Core,
        timeout: Timeout,
        kind: WaitKind,
        mut attempt: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        let busy = match kind {
            WaitKind::QueueSend => KernelError::Full,
            _ => KernelError::Empty,
        };
        let deadline = timeout.finite().map(|n| core.ticks() + u64::from(n));
        loop {
            match attempt() {
                Err(e) if e == busy && !timeout.is_no_wait() => {}
                other => return other,
            }
            let me = core.task_context()?;
            let wait = match deadline {
                None => timeout,
                Some(d) => match d.saturating_sub(core.ticks()) {
                    0 => return Err(KernelError::Timeout),
                    left => Timeout::ticks(left.min(u64::from(u32::MAX - 1)) as u32),
                },
            };
            let parked = critical_section(|cs| {
                let mut st = self.state.borrow_ref_mut(cs);
                let st = &mut *st;
                let mut inner = core.inner(cs);
                let open = match kind {
                    WaitKind::QueueSend => st.ring.count < st.ring.capacity,
                    _ => st.ring.count > 0,
                };
                if open || st.deleted {
                    return Ok(false);
                }
                let queue = match kind {
                    WaitKind::QueueSend => &mut st.senders,
                    _ => &mut st.receivers,
                };
                queue.push_fifo(&inner, kind, me)?;
                inner.park(wait, kind);
                Ok(true)
            })?;
            if parked {
                if let Err(e) = core.switch_away(me) {
                    critical_section(|cs| {
                        let mut st = self.state.borrow_ref_mut(cs);
                        st.senders.remove(me);
                        st.receivers.remove(me);
                    });
                    return Err(e);
                }
            }
        }
    }

    fn try_put(&self, core: &Core, msg: &[u8], end: End) -> Result<()> {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if msg.len() < st.ring.msg_size {
                return Err(KernelError::Param);
            }
            if st.ring.count == st.ring.capacity {
                return Err(KernelError::Full);
            }
            match end {
                End::Back => st.ring.push_back(msg),
                End::Front => st.ring.push_front(msg),
            }
            let mut inner = core.inner(cs);
            if let Some(r) = st.receivers.pop_waiter(&inner, WaitKind::QueueReceive) {
                inner.wake(r, Ok(()));
            }
            Ok(())
        })?;
        core.dispatch();
        Ok(())
    }

    /// Take the oldest message into `out`. `Empty` with `NO_WAIT` when
    /// there is none.
    pub fn receive(&self, core: &Core, out: &mut [u8], timeout: Timeout) -> Result<()> {
        self.blocking(core, timeout, WaitKind::QueueReceive, || self.try_take(core, out))
    }

    fn try_take(&self, core: &Core, out: &mut [u8]) -> Result<()> {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            if out.len() < st.ring.msg_size {
                return Err(KernelError::Param);
            }
            if st.ring.count == 0 {
                return Err(KernelError::Empty);
            }
            st.ring.pop(out);
            let mut inner = core.inner(cs);
            if let Some(s) = st.senders.pop_waiter(&inner, WaitKind::QueueSend) {
                inner.wake(s, Ok(()));
            }
            Ok(())
        })?;
        core.dispatch();
        Ok(())
    }

    /// Copy the oldest message into `out` without removing it.
    pub fn peek(&self, out: &mut [u8]) -> Result<()> {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if st.deleted {
                return Err(KernelError::Deleted);
            }
            let size = st.ring.msg_size;
            if out.len() < size {
                return Err(KernelError::Param);
            }
            if st.ring.count == 0 {
                return Err(KernelError::Empty);
            }
            let head = st.ring.head;
            out[..size].copy_from_slice(st.ring.slot(head));
            Ok(())
        })
    }

    pub fn count(&self) -> usize {
        critical_section(|cs| self.state.borrow_ref(cs).ring.count)
    }

    pub fn space(&self) -> usize {
        critical_section(|cs| {
            let st = self.state.borrow_ref(cs);
            st.ring.capacity - st.ring.count
        })
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.space() == 0
    }

    pub fn msg_size(&self) -> usize {
        critical_section(|cs| self.state.borrow_ref(cs).ring.msg_size)
    }

    /// Discard every queued message and let blocked senders retry.
    pub fn flush(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.ring.head = 0;
            st.ring.count = 0;
            for s in st.senders.take_all(&inner, WaitKind::QueueSend) {
                inner.wake(s, Ok(()));
            }
        });
        core.dispatch();
    }

    /// Destroy the queue, waking every blocked sender and receiver with
    /// `Deleted`.
    pub fn delete(&self, core: &Core) {
        critical_section(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            let mut inner = core.inner(cs);
            st.deleted = true;
            st.ring.count = 0;
            st.senders.wake_all_deleted(&mut inner, WaitKind::QueueSend);
            st.receivers.wake_all_deleted(&mut inner, WaitKind::QueueReceive);
        });
        core.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{testing, Hooks};
    use crate::task::TaskParams;
    use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::boxed::Box;
    use std::sync::OnceLock;

    fn storage(bytes: usize) -> &'static mut [u8] {
        Box::leak(std::vec![0u8; bytes].into_boxed_slice())
    }

    #[test]
    fn test_capacity_two_scenario() {
        let core = testing::core();
        let q = MessageQueue::new(storage(8), 4, 2).expect("queue");
        assert_eq!(q.send(core, b"aaaa", Timeout::NO_WAIT), Ok(()));
        assert_eq!(q.send(core, b"bbbb", Timeout::NO_WAIT), Ok(()));
        assert_eq!(q.send(core, b"cccc", Timeout::NO_WAIT), Err(KernelError::Full));

        let mut out = [0u8; 4];
        q.receive(core, &mut out, Timeout::NO_WAIT).expect("receive");
        assert_eq!(&out, b"aaaa");
        assert_eq!(q.send(core, b"dddd", Timeout::NO_WAIT), Ok(()));
        assert!(q.is_full());
    }

    #[test]
    fn test_front_peek_flush() {
        let core = testing::core();
        let q = MessageQueue::new(storage(12), 4, 3).expect("queue");
        q.send(core, b"one!", Timeout::NO_WAIT).expect("send");
        q.send_front(core, b"zero", Timeout::NO_WAIT).expect("send");
        let mut out = [0u8; 4];
        q.peek(&mut out).expect("peek");
        assert_eq!(&out, b"zero");
        assert_eq!(q.count(), 2);
        assert_eq!(q.space(), 1);
        q.receive(core, &mut out, Timeout::NO_WAIT).expect("receive");
        assert_eq!(&out, b"zero");
        q.flush(core);
        assert!(q.is_empty());
        assert_eq!(q.receive(core, &mut out, Timeout::NO_WAIT), Err(KernelError::Empty));
        assert_eq!(q.peek(&mut out), Err(KernelError::Empty));
    }

    #[test]
    fn test_invalid_construction_and_short_messages() {
        let core = testing::core();
        assert!(MessageQueue::new(storage(8), 0, 2).is_err());
        assert!(MessageQueue::new(storage(8), 4, 0).is_err());
        assert!(MessageQueue::new(storage(8), IPC_MAX_MSG_SIZE + 1, 1).is_err());
        assert!(MessageQueue::new(storage(7), 4, 2).is_err());
        let q = MessageQueue::new(storage(8), 4, 2).expect("queue");
        assert_eq!(q.send(core, b"abc", Timeout::NO_WAIT), Err(KernelError::Param));
        let mut small = [0u8; 2];
        q.send(core, b"abcd", Timeout::NO_WAIT).expect("send");
        assert_eq!(q.receive(core, &mut small, Timeout::NO_WAIT), Err(KernelError::Param));
    }

    #[test]
    fn test_create_in_shared_heap() {
        let shared = testing::shared(1);
        assert_eq!(
            MessageQueue::create_in(shared, 8, 4).err(),
            Some(KernelError::NoMem)
        );
        shared.init_heap(storage(64));
        let q = MessageQueue::create_in(shared, 8, 4).expect("queue");
        assert_eq!(q.space(), 4);
        assert_eq!(MessageQueue::create_in(shared, 8, 8).err(), Some(KernelError::NoMem));

        let roomy = testing::shared(1);
        roomy.init_heap(storage(4 * IPC_DEFAULT_QUEUE_DEPTH + 8));
        let q = MessageQueue::create_default_in(roomy, 4).expect("queue");
        assert_eq!(q.space(), IPC_DEFAULT_QUEUE_DEPTH);
    }

    static PIPE: OnceLock<MessageQueue> = OnceLock::new();
    static RECEIVED: AtomicU32 = AtomicU32::new(0);

    fn pipe() -> &'static MessageQueue {
        PIPE.get_or_init(|| MessageQueue::new(storage(4), 4, 1).expect("queue"))
    }

    fn consumer(core: &'static Core, _: usize) {
        let mut out = [0u8; 4];
        for _ in 0..3 {
            pipe().receive(core, &mut out, Timeout::FOREVER).expect("receive");
            RECEIVED.fetch_add(u32::from_le_bytes(out), Ordering::SeqCst);
        }
    }

    fn producer(core: &'static Core, _: usize) {
        for v in [1u32, 10, 100] {
            pipe().send(core, &v.to_le_bytes(), Timeout::FOREVER).expect("send");
        }
    }

    #[test]
    fn test_blocking_send_and_receive() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("rx", consumer).priority(10))
            .expect("create");
        core.task_create(TaskParams::new("tx", producer).priority(20))
            .expect("create");
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 111);
        assert!(pipe().is_empty());
    }

    static DOOMED: OnceLock<MessageQueue> = OnceLock::new();
    static DOOMED_RESULT: AtomicU32 = AtomicU32::new(0);

    fn doomed() -> &'static MessageQueue {
        DOOMED.get_or_init(|| MessageQueue::new(storage(4), 4, 1).expect("queue"))
    }

    fn doomed_receiver(core: &'static Core, _: usize) {
        let mut out = [0u8; 4];
        if doomed().receive(core, &mut out, Timeout::FOREVER) == Err(KernelError::Deleted) {
            DOOMED_RESULT.store(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_delete_wakes_blocked_receiver() {
        let core = testing::running(Hooks::default());
        core.task_create(TaskParams::new("rx", doomed_receiver)).expect("create");
        doomed().delete(core);
        assert_eq!(DOOMED_RESULT.load(Ordering::SeqCst), 1);
        assert_eq!(doomed().send(core, b"late", Timeout::NO_WAIT), Err(KernelError::Deleted));
    }

    fn outcome(result: Result<()>) -> i32 {
        match result {
            Ok(()) => 1,
            Err(e) => e.code(),
        }
    }

    static CONTESTED_TX: OnceLock<MessageQueue> = OnceLock::new();
    static SLOW_SENDER: AtomicI32 = AtomicI32::new(0);

    fn contested_tx() -> &'static MessageQueue {
        CONTESTED_TX.get_or_init(|| MessageQueue::new(storage(4), 4, 1).expect("queue"))
    }

    fn slow_sender(core: &'static Core, _: usize) {
        let r = contested_tx().send(core, b"slow", Timeout::FOREVER);
        SLOW_SENDER.store(outcome(r), Ordering::SeqCst);
    }

    /// Frees the slot, which wakes the slow sender, then takes it back
    /// before that sender gets to run.
    fn slot_thief(core: &'static Core, _: usize) {
        let mut out = [0u8; 4];
        contested_tx().receive(core, &mut out, Timeout::NO_WAIT).expect("drain");
        contested_tx().send(core, b"fast", Timeout::NO_WAIT).expect("refill");
    }

    #[test]
    fn test_woken_sender_waits_again_when_slot_is_taken() {
        let core = testing::running(Hooks::default());
        contested_tx().send(core, b"old!", Timeout::NO_WAIT).expect("fill");
        let s = core
            .task_create(TaskParams::new("slow", slow_sender).priority(10))
            .expect("create");
        core.task_create(TaskParams::new("thief", slot_thief).priority(100))
            .expect("create");

        // The sender lost the race and is waiting again, not failed.
        assert_eq!(SLOW_SENDER.load(Ordering::SeqCst), 0);
        assert_eq!(core.task_state(s), Ok(crate::task::TaskState::Blocked));

        let mut out = [0u8; 4];
        contested_tx().receive(core, &mut out, Timeout::NO_WAIT).expect("receive");
        assert_eq!(&out, b"fast");
        assert_eq!(SLOW_SENDER.load(Ordering::SeqCst), 1);
        contested_tx().peek(&mut out).expect("peek");
        assert_eq!(&out, b"slow");
    }

    static CONTESTED_RX: OnceLock<MessageQueue> = OnceLock::new();
    static SLOW_RECEIVER: AtomicI32 = AtomicI32::new(0);
    static SLOW_RECEIVED: AtomicU32 = AtomicU32::new(0);

    fn contested_rx() -> &'static MessageQueue {
        CONTESTED_RX.get_or_init(|| MessageQueue::new(storage(4), 4, 1).expect("queue"))
    }

    fn slow_receiver(core: &'static Core, ticks: usize) {
        let mut out = [0u8; 4];
        let timeout = match ticks {
            0 => Timeout::FOREVER,
            n => Timeout::ticks(n as u32),
        };
        let r = contested_rx().receive(core, &mut out, timeout);
        if r.is_ok() {
            SLOW_RECEIVED.store(u32::from_le_bytes(out), Ordering::SeqCst);
        }
        SLOW_RECEIVER.store(outcome(r), Ordering::SeqCst);
    }

    /// Waits `delay` ticks, then posts a message and takes it straight back.
    fn message_thief(core: &'static Core, delay: usize) {
        let _ = core.task_delay(delay as u32);
        let mut out = [0u8; 4];
        contested_rx().send(core, &7u32.to_le_bytes(), Timeout::NO_WAIT).expect("post");
        contested_rx().receive(core, &mut out, Timeout::NO_WAIT).expect("steal");
    }

    #[test]
    fn test_woken_receiver_keeps_its_timeout_budget() {
        let core = testing::running(Hooks::default());
        // A 3-tick receive; the message it is woken for vanishes at tick 1.
        let r = core
            .task_create(TaskParams::new("slow", slow_receiver).arg(3).priority(10))
            .expect("create");
        core.task_create(TaskParams::new("thief", message_thief).arg(1).priority(100))
            .expect("create");

        core.tick_handler();
        assert_eq!(core.task_state(r), Ok(crate::task::TaskState::Blocked));
        core.tick_handler();
        assert_eq!(SLOW_RECEIVER.load(Ordering::SeqCst), 0);
        // Three ticks after the call, not three ticks after the wake.
        core.tick_handler();
        assert_eq!(SLOW_RECEIVER.load(Ordering::SeqCst), KernelError::Timeout.code());
        assert_eq!(SLOW_RECEIVED.load(Ordering::SeqCst), 0);
    }
}
