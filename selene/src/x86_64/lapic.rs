// Copyright 2026  The Selene Authors
// All rights reserved
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Kernel surface over the local interrupt controller driver: the
//! memory-mapped [`Machine`] implementation, the system-wide
//! calibration cell, and the operations the rest of the kernel
//! calls.

use crate::x86_64::{vaddr, vector};
use arch::io::{OutPort, Sender};
use arch::lapic::{Config, Frequency, Lapic, Machine, Register};
use arch::{ProcessorID, HPA};
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

/// The scheduling tick period.
pub const QUANTUM: Duration = Duration::from_millis(10);

/// The register page.  The same physical address names every
/// processor's own unit, so one constant serves the whole system.
pub(crate) const LAPIC_BASE: HPA = HPA::new(0xFEE0_0000);

// Warm reset vector: real-mode ip:segment word pair at 40:67 in the
// BIOS data area.
const WARM_RESET_VECTOR: HPA = HPA::new(0x467);

const CMOS_ADDR_PORT: u16 = 0x70;
const CMOS_DATA_PORT: u16 = 0x71;

static LAPIC_HZ: Frequency = Frequency::new();

// Set once the boot processor has initialized its unit; before that,
// identification queries answer processor 0.
static MAPPED: AtomicBool = AtomicBool::new(false);

/// The real machine: volatile access to the register page, port I/O
/// for the CMOS pair, the calibrated processor delay, and the
/// console for diagnostics.
struct Hardware;

impl Machine for Hardware {
    fn read(&mut self, reg: Register) -> u32 {
        let p = (vaddr(LAPIC_BASE) + reg.offset()) as *const u32;
        unsafe { ptr::read_volatile(p) }
    }

    fn write(&mut self, reg: Register, value: u32) {
        let p = (vaddr(LAPIC_BASE) + reg.offset()) as *mut u32;
        unsafe { ptr::write_volatile(p, value) }
    }

    fn relax(&mut self) {
        arch::cpu::relax();
    }

    fn pause(&mut self, duration: Duration) {
        arch::cpu::pause(duration);
    }

    fn interrupts_enabled(&self) -> bool {
        arch::cpu::interrupts_enabled()
    }

    fn warn(&mut self, args: fmt::Arguments<'_>) {
        uart::kprintln!("{args}");
    }

    fn cmos_write(&mut self, reg: u8, value: u8) {
        OutPort::<u8>::new(CMOS_ADDR_PORT).send(reg);
        OutPort::<u8>::new(CMOS_DATA_PORT).send(value);
    }

    fn set_warm_reset_vector(&mut self, entry: u32) {
        let wrv = vaddr(WARM_RESET_VECTOR) as *mut u16;
        unsafe {
            ptr::write_volatile(wrv, 0);
            ptr::write_volatile(wrv.add(1), (entry >> 4) as u16);
        }
    }

    fn fatal(&mut self, msg: &'static str) -> ! {
        panic!("{}", msg);
    }
}

/// Brings the executing processor's controller into operating state.
/// Run once per processor at boot; the first caller calibrates the
/// timer for everyone.
pub fn init() {
    Lapic::new(Hardware).init(&Config {
        quantum: QUANTUM,
        timer_vector: vector::TIMER,
        error_vector: vector::ERROR,
        spurious_vector: vector::SPURIOUS,
        frequency: &LAPIC_HZ,
    });
    MAPPED.store(true, Ordering::SeqCst);
}

/// The calibrated timer frequency, once some processor has
/// initialized.
pub fn frequency() -> Option<u64> {
    LAPIC_HZ.get()
}

/// Acknowledges the in-service interrupt.  Callable from any
/// interrupt handler on the local processor.
pub fn eoi() {
    if MAPPED.load(Ordering::SeqCst) {
        Lapic::new(Hardware).eoi();
    }
}

/// Returns the executing processor's id, or processor 0 early in
/// boot before the controller is mapped.
#[track_caller]
pub fn id() -> ProcessorID {
    if !MAPPED.load(Ordering::SeqCst) {
        return ProcessorID(0);
    }
    Lapic::new(Hardware).id()
}

/// Asks the processor with the given id to flush its translation
/// cache.
pub fn tlb_flush(cpu: ProcessorID) {
    Lapic::new(Hardware).ipi(cpu, vector::TLB_FLUSH);
}

/// Asks the processor with the given id to reload its sampling
/// configuration.
pub fn sample_refresh(cpu: ProcessorID) {
    Lapic::new(Hardware).ipi(cpu, vector::SAMPLE_REFRESH);
}

/// Masks or unmasks the performance-counter overflow interrupt.
pub fn set_perf_mask(masked: bool) {
    Lapic::new(Hardware).set_perf_mask(masked);
}

/// Starts the secondary processor with the given id at the given
/// physical entry address.  Boot processor only, one target at a
/// time.
pub fn start(cpu: ProcessorID, entry: u32) {
    Lapic::new(Hardware).start_processor(cpu, entry);
}
