//! # Jezgro Demo Firmware
//!
//! A single Cortex-M4 core running three tasks under the EDF scheduler:
//!
//! | Task      | Kind      | Timing             | Behavior                               |
//! |-----------|-----------|--------------------|----------------------------------------|
//! | `sensor`  | periodic  | 10 ms, D = 5 ms    | samples, publishes under the mutex     |
//! | `control` | aperiodic | woken by semaphore | reads the latest sample, computes      |
//! | `monitor` | aperiodic | every 1 s          | checks the scheduler, logs statistics  |
//!
//! `sensor` always has the earliest deadline while it is ready, so it
//! preempts the others at every release. `control` inherits `sensor`'s
//! urgency whenever `sensor` waits on the sample mutex it holds.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use jezgro::arch::cortex_m4::{self, CortexM4};
use jezgro::kernel::{Core, Hooks};
use jezgro::multicore::SharedRegion;
use jezgro::sync::{Mutex, Semaphore};
use jezgro::task::TaskParams;
use jezgro::Timeout;

static PORT: CortexM4 = CortexM4::new();
static SHARED: SharedRegion = SharedRegion::new(1);

static SAMPLE_LOCK: Mutex = Mutex::new();
static SAMPLE: AtomicU32 = AtomicU32::new(0);
static OUTPUT: AtomicU32 = AtomicU32::new(0);
static SAMPLE_READY: Semaphore = Semaphore::binary();

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// Periodic producer: one sample per 10 ms job.
fn sensor(core: &'static Core, _: usize) {
    let mut raw: u32 = 0;
    loop {
        raw = raw.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        if SAMPLE_LOCK.lock(core, Timeout::FOREVER).is_ok() {
            SAMPLE.store(raw >> 16, Ordering::Relaxed);
            let _ = SAMPLE_LOCK.unlock(core);
        }
        let _ = SAMPLE_READY.signal(core);
        let _ = core.task_wait_for_period();
    }
}

/// Consumer: a first-order low-pass filter over the samples.
fn control(core: &'static Core, _: usize) {
    let mut state: u32 = 0;
    loop {
        if SAMPLE_READY.wait(core, Timeout::FOREVER).is_err() {
            continue;
        }
        if SAMPLE_LOCK.lock(core, Timeout::ticks(5)).is_err() {
            continue;
        }
        let sample = SAMPLE.load(Ordering::Relaxed);
        let _ = SAMPLE_LOCK.unlock(core);
        state = state - (state >> 3) + (sample >> 3);
        OUTPUT.store(state, Ordering::Relaxed);
    }
}

fn monitor(core: &'static Core, _: usize) {
    loop {
        let _ = core.task_delay_ms(1_000);
        core.validate_or_panic();
        let stats = core.stats();
        tracing::info!(
            uptime_ms = stats.uptime_ms,
            deadline_misses = stats.deadline_misses,
            output = OUTPUT.load(Ordering::Relaxed),
            "monitor"
        );
    }
}

fn on_deadline_miss(_core: &Core, task: jezgro::task::TaskHandle, lateness_us: u64) {
    tracing::warn!(slot = task.slot(), lateness_us, "deadline miss");
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().expect("peripherals taken twice");

    let hooks = Hooks {
        deadline_miss: Some(on_deadline_miss),
        ..Hooks::default()
    };
    let core = Core::new(0, &PORT, &SHARED, hooks).expect("core 0 not configured");
    let core: &'static Core = cortex_m::singleton!(: Core = core).expect("core created twice");

    core.create_idle().expect("idle task");
    core.task_create(
        TaskParams::new("sensor", sensor)
            .priority(200)
            .periodic(10_000)
            .deadline(5_000),
    )
    .expect("sensor task");
    core.task_create(TaskParams::new("control", control).priority(150))
        .expect("control task");
    core.task_create(TaskParams::new("monitor", monitor).priority(10))
        .expect("monitor task");

    cortex_m4::bind(core, &PORT);
    cortex_m4::set_interrupt_priorities();
    cortex_m4::configure_systick(&mut cp.SYST);
    SHARED.signal_ready(core.id());

    // With a created idle task the first switch never comes back here.
    core.start();
    loop {
        cortex_m::asm::wfi();
    }
}
