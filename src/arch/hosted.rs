//! # Hosted Port
//!
//! Runs the kernel on a desktop OS for tests and simulation. Every execution
//! context is an OS thread, and a per-context baton makes sure only one
//! thread per core executes kernel-scheduled code at a time:
//!
//! ```text
//!   switch(A, B):   A: B.pass() ──► A.wait() ····· parked
//!                   B:                        ◄── wakes, returns from its
//!                                                 own switch (or starts)
//! ```
//!
//! Destroying a context retires its baton: the parked thread unwinds out of
//! its wait and exits.
//!
//! The time source is the host's monotonic clock. There is no timer
//! interrupt: whoever drives the simulation calls `Core::tick_handler`.

use std::boxed::Box;
use std::format;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Instant;
use std::vec::Vec;

use tracing::trace;

use super::{ContextId, ExecutionContext, Platform, StackRegion};
use crate::error::{KernelError, Result};
use crate::task::TaskStart;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Turn {
    Parked,
    Go,
    Retired,
}

/// Unwind payload that ends the thread of a destroyed context.
struct Retired;

/// Hand-off token of one context.
struct Baton {
    turn: Mutex<Turn>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            turn: Mutex::new(Turn::Parked),
            cv: Condvar::new(),
        }
    }

    fn pass(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        if *turn != Turn::Retired {
            *turn = Turn::Go;
        }
        self.cv.notify_one();
    }

    fn retire(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        *turn = Turn::Retired;
        self.cv.notify_one();
    }

    /// Block until passed. A retired baton unwinds the waiting thread up to
    /// [`run_context`].
    fn wait(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *turn {
                Turn::Go => {
                    *turn = Turn::Parked;
                    return;
                }
                Turn::Retired => {
                    drop(turn);
                    panic::resume_unwind(Box::new(Retired));
                }
                Turn::Parked => {
                    turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Thread body of a created context: wait for the first switch, then run
/// `body`. Returns quietly once the context is destroyed; real panics
/// propagate.
fn run_context(baton: &Baton, body: impl FnOnce()) {
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        baton.wait();
        body();
    }));
    if let Err(payload) = run {
        if !payload.is::<Retired>() {
            panic::resume_unwind(payload);
        }
    }
}

/// Thread-backed [`Platform`]. One instance may serve several cores.
pub struct HostedPort {
    contexts: Mutex<Vec<Option<Arc<Baton>>>>,
    epoch: Instant,
}

impl HostedPort {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        }
    }

    fn register(&self, baton: Arc<Baton>) -> ContextId {
        let mut table = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        let index = match table.iter().position(Option::is_none) {
            Some(free) => {
                table[free] = Some(baton);
                free
            }
            None => {
                table.push(Some(baton));
                table.len() - 1
            }
        };
        ContextId(index as u32)
    }

    fn baton(&self, ctx: ContextId) -> Option<Arc<Baton>> {
        let table = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(ctx.0 as usize).and_then(Clone::clone)
    }
}

impl Default for HostedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for HostedPort {
    fn create(&self, _stack: Option<StackRegion>, start: TaskStart) -> Result<ContextId> {
        let baton = Arc::new(Baton::new());
        let ctx = self.register(baton.clone());
        let task = start.task();
        let spawned = thread::Builder::new()
            .name(format!("task-{}.{}", task.core(), task.slot()))
            .spawn(move || run_context(&baton, move || start.run()));
        match spawned {
            Ok(_) => {
                trace!(ctx = ctx.0, "context created");
                Ok(ctx)
            }
            Err(_) => {
                self.destroy(ctx);
                Err(KernelError::NoMem)
            }
        }
    }

    fn adopt(&self) -> Result<ContextId> {
        Ok(self.register(Arc::new(Baton::new())))
    }

    fn switch(&self, from: ContextId, to: ContextId) {
        let (Some(from), Some(to)) = (self.baton(from), self.baton(to)) else {
            return;
        };
        to.pass();
        from.wait();
    }

    fn start_first(&self, to: ContextId) -> ! {
        if let Some(to) = self.baton(to) {
            to.pass();
        }
        loop {
            thread::park();
        }
    }

    fn destroy(&self, ctx: ContextId) {
        let baton = {
            let mut table = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
            table.get_mut(ctx.0 as usize).and_then(Option::take)
        };
        if let Some(baton) = baton {
            baton.retire();
            trace!(ctx = ctx.0, "context destroyed");
        }
    }
}

impl Platform for HostedPort {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn wait_for_interrupt(&self) {
        thread::yield_now();
    }
}
