//! # Cortex-M4 Port Layer
//!
//! Context switching via PendSV and the scheduler tick via SysTick on an
//! ARM Cortex-M4 (Thumb-2). One core per chip: the kernel [`Core`] driven
//! by this port is registered with [`bind`] before the scheduler starts.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in Thread mode on the PSP; the kernel and handlers use the MSP.
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack; PendSV saves and restores R4–R11 around that frame.
//!
//! ```text
//!   switch(from, to):  SWITCH_FROM = &from.sp, SWITCH_TO = &to.sp
//!                      pend PendSV ──► PendSV:
//!                                        stmdb psp!, {r4-r11}  → *SWITCH_FROM
//!                                        ldmia *SWITCH_TO!, {r4-r11} → psp
//!                                        bx 0xFFFFFFFD
//! ```
//!
//! A fresh context's frame returns into [`context_entry`], which takes the
//! task's [`TaskStart`] out of its slot and runs it.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF) so a switch
//! never preempts an application ISR.
//!
//! [`Core`]: crate::kernel::Core

use core::arch::{asm, naked_asm};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;

use super::{ContextId, ExecutionContext, Platform, StackRegion};
use crate::config::{MAX_TASKS_PER_CORE, SYSTEM_CLOCK_HZ, TICK_FREQ_HZ, TICK_PERIOD_US};
use crate::error::{KernelError, Result};
use crate::kernel::Core;
use crate::sync::critical_section;
use crate::task::TaskStart;

/// Initial xPSR: only the Thumb bit set.
const INITIAL_XPSR: u32 = 0x0100_0000;

/// Words in a fresh context: R4–R11 plus the hardware frame.
const FRAME_WORDS: usize = 16;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_FREQ_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_FREQ_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a PendSV exception.
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Put PendSV and SysTick at the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = ptr::read_volatile(shpr3);
        ptr::write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Context table
// ---------------------------------------------------------------------------

struct ContextSlot {
    /// Saved PSP while the context is switched out.
    sp: *mut u32,
    start: MaybeUninit<TaskStart>,
    used: bool,
}

/// The Cortex-M4 [`Platform`].
pub struct CortexM4 {
    slots: UnsafeCell<[ContextSlot; MAX_TASKS_PER_CORE]>,
    ticks: AtomicU32,
}

// Slots are only touched inside critical sections or by PendSV, which
// cannot preempt a critical section.
unsafe impl Sync for CortexM4 {}

impl CortexM4 {
    pub const fn new() -> Self {
        const EMPTY: ContextSlot = ContextSlot {
            sp: ptr::null_mut(),
            start: MaybeUninit::uninit(),
            used: false,
        };
        Self {
            slots: UnsafeCell::new([EMPTY; MAX_TASKS_PER_CORE]),
            ticks: AtomicU32::new(0),
        }
    }

    fn slot_ptr(&self, ctx: ContextId) -> *mut ContextSlot {
        let slots = self.slots.get().cast::<ContextSlot>();
        unsafe { slots.add(ctx.0 as usize) }
    }
}

impl Default for CortexM4 {
    fn default() -> Self {
        Self::new()
    }
}

/// First code a fresh context runs, entered from the exception return of
/// its first switch.
extern "C" fn context_entry(start: *const TaskStart) -> ! {
    let start = unsafe { ptr::read(start) };
    start.run()
}

extern "C" fn context_return() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

impl ExecutionContext for CortexM4 {
    fn create(&self, stack: Option<StackRegion>, start: TaskStart) -> Result<ContextId> {
        let stack = stack.ok_or(KernelError::Param)?;
        if stack.words() < FRAME_WORDS * 2 {
            return Err(KernelError::Param);
        }
        critical_section(|_| {
            let slots = unsafe { &mut *self.slots.get() };
            let (index, slot) = slots
                .iter_mut()
                .enumerate()
                .find(|(_, s)| !s.used)
                .ok_or(KernelError::NoMem)?;
            slot.start = MaybeUninit::new(start);
            slot.used = true;

            // 8-byte aligned top, then the initial frame:
            //   [r4..r11] [r0 r1 r2 r3 r12 lr pc xpsr]
            let top = (stack.top() as usize & !7) as *mut u32;
            unsafe {
                let sp = top.sub(FRAME_WORDS);
                for i in 0..FRAME_WORDS {
                    sp.add(i).write(0);
                }
                sp.add(8).write(slot.start.as_ptr() as u32); // r0
                sp.add(13).write(context_return as usize as u32); // lr
                sp.add(14).write(context_entry as usize as u32); // pc
                sp.add(15).write(INITIAL_XPSR);
                slot.sp = sp;
            }
            Ok(ContextId(index as u32))
        })
    }

    fn adopt(&self) -> Result<ContextId> {
        // The boot flow runs on the MSP; create a dedicated idle task.
        Err(KernelError::State)
    }

    fn switch(&self, from: ContextId, to: ContextId) {
        unsafe {
            SWITCH_FROM = ptr::addr_of_mut!((*self.slot_ptr(from)).sp);
            SWITCH_TO = ptr::addr_of_mut!((*self.slot_ptr(to)).sp);
        }
        trigger_pendsv();
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn start_first(&self, to: ContextId) -> ! {
        let sp = unsafe { (*self.slot_ptr(to)).sp };
        unsafe { start_first_task(sp) }
    }

    fn destroy(&self, ctx: ContextId) {
        critical_section(|_| unsafe {
            let slot = &mut *self.slot_ptr(ctx);
            slot.used = false;
            slot.sp = ptr::null_mut();
        });
    }
}

impl Platform for CortexM4 {
    fn now_us(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed) as u64 * TICK_PERIOD_US as u64
    }

    fn wait_for_interrupt(&self) {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to the PSP and jump into a fresh context frame.
///
/// # Safety
/// `psp` must point at a frame built by [`CortexM4::create`].
unsafe fn start_first_task(psp: *mut u32) -> ! {
    asm!(
        // Skip the software-saved R4-R11
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unstack the hardware frame by hand
        "pop {{r0-r3, r12}}",  // R0 = TaskStart pointer
        "pop {{r4}}",          // LR (unused, entry never returns)
        "pop {{r5}}",          // PC = context_entry
        "pop {{r6}}",          // xPSR (discarded)

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// Where PendSV stores the outgoing PSP. Null when nothing is saved.
static mut SWITCH_FROM: *mut *mut u32 = ptr::null_mut();
/// Where PendSV loads the incoming PSP from.
static mut SWITCH_TO: *mut *mut u32 = ptr::null_mut();

/// PendSV exception handler: save R4–R11 of the outgoing context, load
/// those of the incoming one, and return to Thread mode on the PSP.
///
/// # Safety
/// Entered by the NVIC only; follows the exception entry/exit convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "cpsid i",

        // --- Save outgoing context ---
        "ldr r2, ={from}",
        "ldr r1, [r2]",
        "cbz r1, 1f",
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "str r0, [r1]",

        // --- Restore incoming context ---
        "1:",
        "ldr r2, ={to}",
        "ldr r1, [r2]",
        "ldr r0, [r1]",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",

        "cpsie i",
        // Return to Thread mode using PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",

        from = sym SWITCH_FROM,
        to = sym SWITCH_TO,
    );
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

static BOUND_CORE: AtomicPtr<Core> = AtomicPtr::new(ptr::null_mut());
static BOUND_PORT: AtomicPtr<CortexM4> = AtomicPtr::new(ptr::null_mut());

/// Route SysTick to `core`, which runs on `port`.
pub fn bind(core: &'static Core, port: &'static CortexM4) {
    BOUND_PORT.store(port as *const CortexM4 as *mut CortexM4, Ordering::Release);
    BOUND_CORE.store(core as *const Core as *mut Core, Ordering::Release);
}

/// SysTick exception handler: advance the port clock and run the bound
/// core's tick.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    if let Some(port) = BOUND_PORT.load(Ordering::Acquire).as_ref() {
        port.ticks.fetch_add(1, Ordering::Relaxed);
    }
    if let Some(core) = BOUND_CORE.load(Ordering::Acquire).as_ref() {
        core.tick_handler();
    }
}
