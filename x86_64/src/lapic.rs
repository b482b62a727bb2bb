// Copyright 2026  The Selene Authors
// All rights reserved
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Driver for the per-processor local interrupt controller: one-time
//! unit initialization, scheduling-tick timer calibration and setup,
//! inter-processor interrupts, and the universal startup algorithm
//! for waking secondary processors.
//!
//! Every processor sees its own controller through the same register
//! page, so no cross-processor locking is needed to drive "your own"
//! unit.  All sequencing here is expressed against the [`Machine`]
//! trait; the kernel supplies the memory-mapped implementation and
//! tests substitute a recording fake.

use crate::ProcessorID;
use bitstruct::bitstruct;
use core::fmt;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use seq_macro::seq;

/// Registers in the controller's 4KiB register page, by byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Register {
    Id = 0x20,
    Version = 0x30,
    TaskPriority = 0x80,
    EndOfInterrupt = 0xB0,
    SpuriousVector = 0xF0,
    ErrorStatus = 0x280,
    IcrLow = 0x300,
    IcrHigh = 0x310,
    TimerLvt = 0x320,
    PerfCounterLvt = 0x340,
    Lint0Lvt = 0x350,
    Lint1Lvt = 0x360,
    ErrorLvt = 0x370,
    TimerInitialCount = 0x380,
    TimerCurrentCount = 0x390,
    TimerDivide = 0x3E0,
}

impl Register {
    pub const fn offset(self) -> usize {
        self as u16 as usize
    }
}

/// The hardware surface the driver touches: its own register file,
/// plus the narrow collaborators consumed during initialization and
/// bring-up (delays, the CMOS shutdown path, diagnostics, and the
/// fatal halt).
pub trait Machine {
    /// Reads the 32-bit register at the given offset.
    fn read(&mut self, reg: Register) -> u32;

    /// Stores a 32-bit value at the given offset.  Completion is the
    /// driver's problem, not the implementation's; see
    /// [`Lapic::write`].
    fn write(&mut self, reg: Register, value: u32);

    /// Yields the core briefly inside a poll loop.
    fn relax(&mut self);

    /// Busy-waits for at least the given duration.
    fn pause(&mut self, duration: Duration);

    /// True when the current processor accepts maskable interrupts.
    fn interrupts_enabled(&self) -> bool;

    /// Emits a non-fatal diagnostic.
    fn warn(&mut self, args: fmt::Arguments<'_>);

    /// Writes a CMOS register through the index/data port pair.
    fn cmos_write(&mut self, reg: u8, value: u8);

    /// Points the warm-reset vector in low memory at the given
    /// real-mode entry address.
    fn set_warm_reset_vector(&mut self, entry: u32);

    /// Logs a message and stops the system.
    fn fatal(&mut self, msg: &'static str) -> !;
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug)]
pub enum DeliveryMode {
    Fixed = 0b000,
    NMI = 0b100,
    Init = 0b101,
    Startup = 0b110,
}

#[derive(Debug)]
pub enum Level {
    DeAssert,
    Assert,
}

#[derive(Debug)]
pub enum TriggerMode {
    Edge,
    Level,
}

#[derive(Debug)]
pub enum DestinationShorthand {
    Myself = 0b01,
    AllIncludingSelf = 0b10,
    AllButSelf = 0b11,
}

bitstruct! {
    /// The interrupt command register pair as a single 64-bit value;
    /// the destination id lives in the top byte.  Writing the low
    /// word dispatches the command, so the high word must be stored
    /// first.
    #[derive(Clone, Copy, Default)]
    pub struct Icr(pub u64) {
        vector: u8 = 0..8;
        raw_delivery_mode: u8 = 8..11;
        logical_destination: bool = 11;
        delivery_status: bool = 12;
        level: Level = 14;
        trigger_mode: TriggerMode = 15;
        raw_destination_shorthand: u8 = 18..20;
        destination: u8 = 56..64;
    }
}

impl Icr {
    fn from_low(low: u32) -> Icr {
        Icr(u64::from(low))
    }

    fn low(self) -> u32 {
        self.0 as u32
    }

    fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    fn with_delivery_mode(self, mode: DeliveryMode) -> Icr {
        self.with_raw_delivery_mode(mode as u8)
    }

    fn delivery_mode(self) -> Result<DeliveryMode, u8> {
        match self.raw_delivery_mode() {
            0b000 => Ok(DeliveryMode::Fixed),
            0b100 => Ok(DeliveryMode::NMI),
            0b101 => Ok(DeliveryMode::Init),
            0b110 => Ok(DeliveryMode::Startup),
            o => Err(o),
        }
    }

    #[must_use]
    fn with_destination_shorthand(self, shorthand: Option<DestinationShorthand>) -> Icr {
        self.with_raw_destination_shorthand(shorthand.map_or(0, |s| s as u8))
    }

    fn destination_shorthand(self) -> Option<DestinationShorthand> {
        match self.raw_destination_shorthand() {
            0b00 => None,
            0b01 => Some(DestinationShorthand::Myself),
            0b10 => Some(DestinationShorthand::AllIncludingSelf),
            0b11 => Some(DestinationShorthand::AllButSelf),
            _ => unreachable!(),
        }
    }
}

impl bitstruct::FromRaw<bool, Level> for Icr {
    fn from_raw(raw: bool) -> Level {
        match raw {
            false => Level::DeAssert,
            true => Level::Assert,
        }
    }
}

impl bitstruct::IntoRaw<bool, Level> for Icr {
    fn into_raw(level: Level) -> bool {
        match level {
            Level::DeAssert => false,
            Level::Assert => true,
        }
    }
}

impl bitstruct::FromRaw<bool, TriggerMode> for Icr {
    fn from_raw(raw: bool) -> TriggerMode {
        match raw {
            false => TriggerMode::Edge,
            true => TriggerMode::Level,
        }
    }
}

impl bitstruct::IntoRaw<bool, TriggerMode> for Icr {
    fn into_raw(mode: TriggerMode) -> bool {
        match mode {
            TriggerMode::Edge => false,
            TriggerMode::Level => true,
        }
    }
}

bitstruct! {
    /// A local vector table entry.  The delivery-mode field shares
    /// the command-register encoding; the periodic bit is meaningful
    /// only in the timer entry.
    #[derive(Clone, Copy, Default)]
    pub struct Lvt(pub u32) {
        vector: u8 = 0..8;
        raw_delivery_mode: u8 = 8..11;
        masked: bool = 16;
        periodic: bool = 17;
    }
}

impl Lvt {
    #[must_use]
    fn with_delivery_mode(self, mode: DeliveryMode) -> Lvt {
        self.with_raw_delivery_mode(mode as u8)
    }
}

bitstruct! {
    /// The read-only version register.
    #[derive(Clone, Copy)]
    pub struct Version(pub u32) {
        version: u8 = 0..8;
        max_lvt_entry: u8 = 16..24;
    }
}

impl Version {
    /// The performance-counter vector-table entry exists on parts
    /// whose highest LVT index reaches it.
    fn has_perf_counter(self) -> bool {
        self.max_lvt_entry() >= 4
    }
}

seq!(N in 32..=255 {
    /// Vectors available for external interrupts and inter-processor
    /// interrupts; 0-31 are architecturally reserved for exceptions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum InterruptVector {
        #( Vector~N = N, )*
    }
});

/// The measured count-down frequency of the controller timer, in
/// Hertz.
///
/// Measured exactly once, by the first processor to initialize its
/// controller; every later initialization observes the cached value
/// and skips calibration.  Once non-zero the value is never
/// rewritten.
pub struct Frequency(AtomicU64);

impl Frequency {
    pub const fn new() -> Frequency {
        Frequency(AtomicU64::new(0))
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            hz => Some(hz),
        }
    }

    /// Stores the measurement; the first non-zero store wins.
    /// Returns whatever value ends up cached.
    fn set(&self, hz: u64) -> u64 {
        match self.0.compare_exchange(0, hz, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => hz,
            Err(prev) => prev,
        }
    }
}

impl Default for Frequency {
    fn default() -> Frequency {
        Frequency::new()
    }
}

/// The delivery-status bit stayed busy for the whole polling budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wedged;

/// Per-processor initialization parameters, supplied by the kernel's
/// vector allocation and tick configuration.
pub struct Config<'a> {
    /// The scheduling tick period.
    pub quantum: Duration,
    pub timer_vector: InterruptVector,
    pub error_vector: InterruptVector,
    pub spurious_vector: InterruptVector,
    /// The system-wide calibration cell.
    pub frequency: &'a Frequency,
}

// Unit enable bit in the spurious-vector register.
const SVR_ENABLE: u32 = 1 << 8;

// Count at native bus frequency.
const DIVIDE_BY_1: u32 = 0b1011;

// CMOS register 0x0F selects the shutdown status byte; 0x0A there
// makes the next INIT resume through the warm-reset vector without
// clearing memory.
const CMOS_SHUTDOWN_STATUS: u8 = 0x0F;
const SHUTDOWN_WARM_JMP: u8 = 0x0A;

/// How long the calibration loop samples the count-down timer.  The
/// hertz math scales by the inverse of this window, so tuning it
/// cannot bias the estimate.
pub const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

const WINDOWS_PER_SEC: u64 = 1_000_000 / CALIBRATION_WINDOW.as_micros() as u64;

// Settling times mandated by the startup algorithm.
const INIT_SETTLE: Duration = Duration::from_micros(10_000);
const STARTUP_SETTLE: Duration = Duration::from_micros(200);

// Polling budget for command delivery before declaring the unit
// wedged.
const DELIVERY_POLL_BUDGET: usize = 100_000;

// Latch for the one-time interrupts-enabled diagnostic in `id`.
static ID_HAZARD_WARNED: AtomicBool = AtomicBool::new(false);

#[cfg(test)]
fn reset_id_hazard() {
    ID_HAZARD_WARNED.store(false, Ordering::SeqCst);
}

/// The driver proper.  One value per processor context; the hardware
/// guarantees that the register page always names the executing
/// processor's own unit.
pub struct Lapic<M: Machine> {
    machine: M,
    poll_budget: usize,
}

impl<M: Machine> Lapic<M> {
    pub fn new(machine: M) -> Lapic<M> {
        Lapic { machine, poll_budget: DELIVERY_POLL_BUDGET }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Stores to a controller register, then reads the id register
    /// so the store retires before anything that depends on it.
    fn write(&mut self, reg: Register, value: u32) {
        self.machine.write(reg, value);
        self.machine.read(Register::Id);
    }

    fn read(&mut self, reg: Register) -> u32 {
        self.machine.read(reg)
    }

    /// Polls the delivery-status bit until the controller accepts
    /// the pending command, up to the polling budget.
    fn wait_delivery(&mut self) -> Result<(), Wedged> {
        for _ in 0..self.poll_budget {
            if !Icr::from_low(self.read(Register::IcrLow)).delivery_status() {
                return Ok(());
            }
            self.machine.relax();
        }
        self.machine.warn(format_args!("lapic: delivery wedged?"));
        Err(Wedged)
    }

    /// Measures the count-down frequency of the controller timer
    /// against the calibrated processor delay.
    fn measure_timer_hz(&mut self) -> u64 {
        self.write(Register::TimerDivide, DIVIDE_BY_1);
        self.write(Register::TimerInitialCount, u32::MAX);
        let t0 = self.read(Register::TimerCurrentCount);
        self.machine.pause(CALIBRATION_WINDOW);
        let t1 = self.read(Register::TimerCurrentCount);
        u64::from(t0.wrapping_sub(t1)) * WINDOWS_PER_SEC
    }

    /// Brings this processor's controller into operating state: unit
    /// enabled, periodic tick armed, unused local lines masked, error
    /// reporting routed, stale state cleared, and arbitration ids
    /// resynchronized.  Run once per processor at boot.
    pub fn init(&mut self, config: &Config<'_>) {
        // Enable the unit; unmatched interrupts arrive on the
        // spurious vector.
        self.write(
            Register::SpuriousVector,
            SVR_ENABLE | u32::from(config.spurious_vector as u8),
        );

        let hz = match config.frequency.get() {
            Some(hz) => hz,
            None => config.frequency.set(self.measure_timer_hz()),
        };

        let count = config.quantum.as_millis() * u128::from(hz) / 1000;
        let Ok(count) = u32::try_from(count) else {
            self.machine.fatal("lapic: quantum too large");
        };

        // The timer counts down from the initial count at bus
        // frequency and raises the tick vector each time it expires.
        self.write(Register::TimerDivide, DIVIDE_BY_1);
        self.write(
            Register::TimerLvt,
            Lvt::default().with_periodic(true).with_vector(config.timer_vector as u8).0,
        );
        self.write(Register::TimerInitialCount, count);

        // The logical interrupt pins are not used on this system.
        self.write(Register::Lint0Lvt, Lvt::default().with_masked(true).0);
        self.write(Register::Lint1Lvt, Lvt::default().with_masked(true).0);

        // Parts with a performance-counter entry can hold a stale
        // overflow interrupt across reset; quiesce it.
        if Version(self.read(Register::Version)).has_perf_counter() {
            self.set_perf_mask(true);
        }

        self.write(
            Register::ErrorLvt,
            Lvt::default().with_vector(config.error_vector as u8).0,
        );

        // Latched error state only fully clears on back-to-back
        // writes.
        self.write(Register::ErrorStatus, 0);
        self.write(Register::ErrorStatus, 0);

        // Acknowledge anything pending from before we owned the unit.
        self.write(Register::EndOfInterrupt, 0);

        // Broadcast an INIT level de-assert to resynchronize
        // arbitration ids across all units.  This completes quickly
        // at boot, so spin without a budget.
        let sync = Icr::default()
            .with_delivery_mode(DeliveryMode::Init)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination_shorthand(Some(DestinationShorthand::AllIncludingSelf));
        self.write(Register::IcrHigh, sync.high());
        self.write(Register::IcrLow, sync.low());
        while Icr::from_low(self.read(Register::IcrLow)).delivery_status() {
            self.machine.relax();
        }

        // Accept interrupts at every priority.
        self.write(Register::TaskPriority, 0);
    }

    /// Signals end-of-interrupt for the in-service interrupt.
    pub fn eoi(&mut self) {
        self.write(Register::EndOfInterrupt, 0);
    }

    /// Returns the id of the executing processor, from the top byte
    /// of the id register.
    ///
    /// Not meaningful with interrupts enabled: the caller could be
    /// rescheduled onto another processor before consuming the
    /// value.  The first offender is diagnosed, not halted; early
    /// boot cannot always guarantee the precondition.
    #[track_caller]
    pub fn id(&mut self) -> ProcessorID {
        if self.machine.interrupts_enabled() && !ID_HAZARD_WARNED.swap(true, Ordering::SeqCst) {
            let caller = Location::caller();
            self.machine
                .warn(format_args!("lapic: id read from {caller} with interrupts enabled"));
        }
        ProcessorID((self.read(Register::Id) >> 24) as u8)
    }

    /// Sends a one-shot interrupt to the processor with the given
    /// id and waits for the controller to accept it.  A command that
    /// never leaves the unit means broken hardware or a programming
    /// error, so there is no retry: the system halts.
    pub fn ipi(&mut self, cpu: ProcessorID, vector: InterruptVector) {
        let icr = Icr::default()
            .with_vector(vector as u8)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_destination(cpu.into());
        self.write(Register::IcrHigh, icr.high());
        self.write(Register::IcrLow, icr.low());
        if self.wait_delivery().is_err() {
            self.machine.fatal("lapic: ipi delivery wedged");
        }
    }

    /// Masks the performance-counter interrupt outright, or routes
    /// overflow interrupts as NMIs when unmasked.
    pub fn set_perf_mask(&mut self, masked: bool) {
        let lvt = if masked {
            Lvt::default().with_masked(true)
        } else {
            Lvt::default().with_delivery_mode(DeliveryMode::NMI)
        };
        self.write(Register::PerfCounterLvt, lvt.0);
    }

    /// Wakes the processor with the given id from reset and sets it
    /// running at `entry`, a page-aligned physical address below
    /// 1MiB.
    ///
    /// The universal startup algorithm: arm the warm-reset path so
    /// an INIT resumes at `entry`, send INIT asserted then
    /// de-asserted with the mandated settling time after each, then
    /// two STARTUP commands carrying the entry page number.  The
    /// second STARTUP is part of the documented protocol even though
    /// conforming parts ignore it while the first is in progress.
    /// Delivery waits are best effort here; a processor that never
    /// comes up is noticed by the caller, not by this sequence.
    pub fn start_processor(&mut self, cpu: ProcessorID, entry: u32) {
        self.machine.cmos_write(CMOS_SHUTDOWN_STATUS, SHUTDOWN_WARM_JMP);
        self.machine.set_warm_reset_vector(entry);

        let init = Icr::default()
            .with_delivery_mode(DeliveryMode::Init)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination(cpu.into());
        self.write(Register::IcrHigh, init.high());
        self.write(Register::IcrLow, init.with_level(Level::Assert).low());
        let _ = self.wait_delivery();
        self.machine.pause(INIT_SETTLE);
        self.write(Register::IcrLow, init.low());
        let _ = self.wait_delivery();
        self.machine.pause(INIT_SETTLE);

        let startup = Icr::default()
            .with_delivery_mode(DeliveryMode::Startup)
            .with_vector((entry >> 12) as u8)
            .with_destination(cpu.into());
        for _ in 0..2 {
            self.write(Register::IcrHigh, startup.high());
            self.write(Register::IcrLow, startup.low());
            self.machine.pause(STARTUP_SETTLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Write(Register, u32),
        Cmos(u8, u8),
        WarmReset(u32),
        Pause(Duration),
    }

    /// A recording register file and collaborator set.  Reads are
    /// not recorded; every side effect is.
    struct FakeMachine {
        regs: [u32; 256],
        current_count: Vec<u32>,
        events: Vec<Event>,
        warnings: Vec<String>,
        interrupts_enabled: bool,
        busy_forever: bool,
        icrlo_reads: usize,
        id_reads: usize,
    }

    impl FakeMachine {
        fn new() -> FakeMachine {
            FakeMachine {
                regs: [0; 256],
                current_count: Vec::new(),
                events: Vec::new(),
                warnings: Vec::new(),
                interrupts_enabled: false,
                busy_forever: false,
                icrlo_reads: 0,
                id_reads: 0,
            }
        }

        /// Sampling the current-count register yields these values in
        /// order, modelling the count-down between reads.
        fn with_count_samples(mut self, samples: &[u32]) -> FakeMachine {
            self.current_count = samples.iter().rev().copied().collect();
            self
        }

        fn with_version(mut self, max_lvt_entry: u8) -> FakeMachine {
            self.regs[Register::Version.offset() / 4] =
                u32::from(max_lvt_entry) << 16 | 0x14;
            self
        }

        fn with_id(mut self, id: u8) -> FakeMachine {
            self.regs[Register::Id.offset() / 4] = u32::from(id) << 24;
            self
        }

        fn with_interrupts_enabled(mut self) -> FakeMachine {
            self.interrupts_enabled = true;
            self
        }

        fn with_busy_forever(mut self) -> FakeMachine {
            self.busy_forever = true;
            self
        }

        fn writes_to(&self, reg: Register) -> Vec<u32> {
            self.events
                .iter()
                .filter_map(|ev| match ev {
                    Event::Write(r, v) if *r == reg => Some(*v),
                    _ => None,
                })
                .collect()
        }
    }

    impl Machine for FakeMachine {
        fn read(&mut self, reg: Register) -> u32 {
            match reg {
                Register::Id => {
                    self.id_reads += 1;
                    self.regs[reg.offset() / 4]
                }
                Register::IcrLow => {
                    self.icrlo_reads += 1;
                    if self.busy_forever {
                        return Icr::default().with_delivery_status(true).low();
                    }
                    self.regs[reg.offset() / 4] & !Icr::default().with_delivery_status(true).low()
                }
                Register::TimerCurrentCount => self.current_count.pop().unwrap_or(0),
                _ => self.regs[reg.offset() / 4],
            }
        }

        fn write(&mut self, reg: Register, value: u32) {
            self.regs[reg.offset() / 4] = value;
            self.events.push(Event::Write(reg, value));
        }

        fn relax(&mut self) {}

        fn pause(&mut self, duration: Duration) {
            self.events.push(Event::Pause(duration));
        }

        fn interrupts_enabled(&self) -> bool {
            self.interrupts_enabled
        }

        fn warn(&mut self, args: fmt::Arguments<'_>) {
            self.warnings.push(args.to_string());
        }

        fn cmos_write(&mut self, reg: u8, value: u8) {
            self.events.push(Event::Cmos(reg, value));
        }

        fn set_warm_reset_vector(&mut self, entry: u32) {
            self.events.push(Event::WarmReset(entry));
        }

        fn fatal(&mut self, msg: &'static str) -> ! {
            panic!("{}", msg);
        }
    }

    fn config<'a>(frequency: &'a Frequency) -> Config<'a> {
        Config {
            quantum: Duration::from_millis(10),
            timer_vector: InterruptVector::Vector32,
            error_vector: InterruptVector::Vector51,
            spurious_vector: InterruptVector::Vector63,
            frequency,
        }
    }

    #[test]
    fn fixed_ipi_encoding() {
        let icr = Icr::default()
            .with_vector(0x40)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_destination(2);
        assert_eq!(icr.0, 0x0200_0000_0000_0040);
        assert_eq!(icr.high(), 0x0200_0000);
        assert_eq!(icr.low(), 0x0000_0040);
    }

    #[test]
    fn init_assert_encoding() {
        let icr = Icr::default()
            .with_delivery_mode(DeliveryMode::Init)
            .with_trigger_mode(TriggerMode::Level)
            .with_level(Level::Assert)
            .with_destination(5);
        assert_eq!(icr.low(), 0x0000_C500);
        assert_eq!(icr.high(), 0x0500_0000);
    }

    #[test]
    fn init_deassert_encoding() {
        let icr = Icr::default()
            .with_delivery_mode(DeliveryMode::Init)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination(5);
        assert_eq!(icr.low(), 0x0000_8500);
    }

    #[test]
    fn startup_encoding() {
        let icr = Icr::default()
            .with_delivery_mode(DeliveryMode::Startup)
            .with_vector(0x07)
            .with_destination(1);
        assert_eq!(icr.low(), 0x0000_0607);
    }

    #[test]
    fn arbitration_sync_encoding() {
        let icr = Icr::default()
            .with_delivery_mode(DeliveryMode::Init)
            .with_trigger_mode(TriggerMode::Level)
            .with_destination_shorthand(Some(DestinationShorthand::AllIncludingSelf));
        assert_eq!(icr.low(), 0x0008_8500);
        assert_eq!(icr.high(), 0);
    }

    #[test]
    fn parse_startup() {
        let icr = Icr(0x0100_0000_0000_0607);
        assert_eq!(icr.vector(), 0x07);
        assert!(matches!(icr.delivery_mode(), Ok(DeliveryMode::Startup)));
        assert!(matches!(icr.destination_shorthand(), None));
        assert_eq!(icr.destination(), 1);
    }

    #[test]
    fn register_writes_retire_through_id_read() {
        let mut lapic = Lapic::new(FakeMachine::new());
        lapic.eoi();
        assert_eq!(lapic.machine().events, vec![Event::Write(Register::EndOfInterrupt, 0)]);
        assert_eq!(lapic.machine().id_reads, 1);
    }

    #[test]
    fn timer_count_derivation() {
        let frequency = Frequency::new();
        frequency.set(333_333);
        let mut lapic = Lapic::new(FakeMachine::new());
        let config = Config { quantum: Duration::from_millis(7), ..config(&frequency) };
        lapic.init(&config);
        // floor(7ms * 333333Hz / 1000) = 2333, and no calibration
        // pass means no max-count load.
        assert_eq!(lapic.machine().writes_to(Register::TimerInitialCount), vec![2333]);
    }

    #[test]
    #[should_panic(expected = "quantum too large")]
    fn oversized_quantum_is_fatal() {
        let frequency = Frequency::new();
        frequency.set(500_000_000);
        let mut lapic = Lapic::new(FakeMachine::new());
        let config = Config { quantum: Duration::from_millis(10_000), ..config(&frequency) };
        lapic.init(&config);
    }

    #[test]
    fn calibration_measures_against_the_sample_window() {
        let frequency = Frequency::new();
        let samples = [u32::MAX, u32::MAX - 1_000_000];
        let mut lapic = Lapic::new(FakeMachine::new().with_count_samples(&samples));
        lapic.init(&config(&frequency));
        assert_eq!(frequency.get(), Some(1_000_000 * WINDOWS_PER_SEC));
        assert!(lapic.machine().events.contains(&Event::Pause(CALIBRATION_WINDOW)));
        // The calibration pass loads the maximum count, the tick
        // setup then loads the derived count.
        let hz = 1_000_000 * WINDOWS_PER_SEC;
        let count = (10 * hz / 1000) as u32;
        assert_eq!(
            lapic.machine().writes_to(Register::TimerInitialCount),
            vec![u32::MAX, count]
        );
    }

    #[test]
    fn calibration_runs_at_most_once() {
        let frequency = Frequency::new();
        let first = [u32::MAX, u32::MAX - 1_000_000];
        let mut bsp = Lapic::new(FakeMachine::new().with_count_samples(&first));
        bsp.init(&config(&frequency));
        let hz = frequency.get().unwrap();

        // A second processor whose own sampling would disagree must
        // reuse the cached value untouched.
        let second = [u32::MAX, u32::MAX - 7_777_777];
        let mut ap = Lapic::new(FakeMachine::new().with_count_samples(&second));
        ap.init(&config(&frequency));
        assert_eq!(frequency.get(), Some(hz));
        assert_eq!(ap.machine().writes_to(Register::TimerInitialCount).len(), 1);
    }

    #[test]
    fn frequency_first_store_wins() {
        let frequency = Frequency::new();
        assert_eq!(frequency.get(), None);
        assert_eq!(frequency.set(100), 100);
        assert_eq!(frequency.set(200), 100);
        assert_eq!(frequency.get(), Some(100));
    }

    #[test]
    fn error_status_clears_with_two_consecutive_writes() {
        let frequency = Frequency::new();
        frequency.set(100_000_000);
        let mut lapic = Lapic::new(FakeMachine::new());
        lapic.init(&config(&frequency));
        let events = &lapic.machine().events;
        assert_eq!(lapic.machine().writes_to(Register::ErrorStatus), vec![0, 0]);
        let first = events
            .iter()
            .position(|ev| matches!(ev, Event::Write(Register::ErrorStatus, _)))
            .unwrap();
        assert_eq!(events[first], Event::Write(Register::ErrorStatus, 0));
        assert_eq!(events[first + 1], Event::Write(Register::ErrorStatus, 0));
    }

    #[test]
    fn init_programs_the_unit_in_order() {
        let frequency = Frequency::new();
        frequency.set(100_000_000);
        let mut lapic = Lapic::new(FakeMachine::new().with_version(4));
        lapic.init(&config(&frequency));
        let order: Vec<Register> = lapic
            .machine()
            .events
            .iter()
            .filter_map(|ev| match ev {
                Event::Write(r, _) => Some(*r),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec![
                Register::SpuriousVector,
                Register::TimerDivide,
                Register::TimerLvt,
                Register::TimerInitialCount,
                Register::Lint0Lvt,
                Register::Lint1Lvt,
                Register::PerfCounterLvt,
                Register::ErrorLvt,
                Register::ErrorStatus,
                Register::ErrorStatus,
                Register::EndOfInterrupt,
                Register::IcrHigh,
                Register::IcrLow,
                Register::TaskPriority,
            ]
        );
        assert_eq!(lapic.machine().writes_to(Register::SpuriousVector), vec![0x13F]);
        assert_eq!(lapic.machine().writes_to(Register::TimerLvt), vec![0x0002_0020]);
        assert_eq!(lapic.machine().writes_to(Register::Lint0Lvt), vec![0x0001_0000]);
        assert_eq!(lapic.machine().writes_to(Register::IcrLow), vec![0x0008_8500]);
        assert_eq!(lapic.machine().writes_to(Register::TaskPriority), vec![0]);
    }

    #[test]
    fn perf_counter_untouched_without_the_lvt_entry() {
        let frequency = Frequency::new();
        frequency.set(100_000_000);
        let mut lapic = Lapic::new(FakeMachine::new().with_version(3));
        lapic.init(&config(&frequency));
        assert!(lapic.machine().writes_to(Register::PerfCounterLvt).is_empty());
    }

    #[test]
    fn perf_mask_toggles_between_masked_and_nmi() {
        let mut lapic = Lapic::new(FakeMachine::new());
        lapic.set_perf_mask(true);
        lapic.set_perf_mask(false);
        assert_eq!(
            lapic.machine().writes_to(Register::PerfCounterLvt),
            vec![0x0001_0000, 0x0000_0400]
        );
    }

    #[test]
    fn bring_up_follows_the_startup_algorithm_exactly() {
        let mut lapic = Lapic::new(FakeMachine::new());
        lapic.start_processor(ProcessorID(3), 0x7000);
        assert_eq!(
            lapic.machine().events,
            vec![
                Event::Cmos(0x0F, 0x0A),
                Event::WarmReset(0x7000),
                Event::Write(Register::IcrHigh, 0x0300_0000),
                Event::Write(Register::IcrLow, 0x0000_C500),
                Event::Pause(Duration::from_micros(10_000)),
                Event::Write(Register::IcrLow, 0x0000_8500),
                Event::Pause(Duration::from_micros(10_000)),
                Event::Write(Register::IcrHigh, 0x0300_0000),
                Event::Write(Register::IcrLow, 0x0000_0607),
                Event::Pause(Duration::from_micros(200)),
                Event::Write(Register::IcrHigh, 0x0300_0000),
                Event::Write(Register::IcrLow, 0x0000_0607),
                Event::Pause(Duration::from_micros(200)),
            ]
        );
    }

    #[test]
    fn bring_up_tolerates_wedged_delivery() {
        let mut lapic = Lapic::new(FakeMachine::new().with_busy_forever());
        lapic.start_processor(ProcessorID(1), 0x7000);
        // Both delivery waits exhaust their budget, warn, and move
        // on; the command sequence still completes.
        assert_eq!(lapic.machine().warnings.len(), 2);
        assert!(lapic.machine().warnings[0].contains("wedged"));
        assert_eq!(lapic.machine().icrlo_reads, 2 * DELIVERY_POLL_BUDGET);
        let startups = lapic
            .machine()
            .events
            .iter()
            .filter(|ev| matches!(ev, Event::Write(Register::IcrLow, 0x0000_0607)))
            .count();
        assert_eq!(startups, 2);
    }

    #[test]
    #[should_panic(expected = "ipi delivery wedged")]
    fn wedged_ipi_halts_the_system() {
        let mut lapic = Lapic::new(FakeMachine::new().with_busy_forever());
        lapic.ipi(ProcessorID(1), InterruptVector::Vector64);
    }

    #[test]
    fn ipi_targets_then_dispatches() {
        let mut lapic = Lapic::new(FakeMachine::new());
        lapic.ipi(ProcessorID(9), InterruptVector::Vector64);
        assert_eq!(
            lapic.machine().events,
            vec![
                Event::Write(Register::IcrHigh, 0x0900_0000),
                Event::Write(Register::IcrLow, 0x0000_0040),
            ]
        );
    }

    #[test]
    fn ident_reads_the_top_byte() {
        let mut lapic = Lapic::new(FakeMachine::new().with_id(5));
        assert_eq!(lapic.id(), ProcessorID(5));
        assert!(lapic.machine().warnings.is_empty());
    }

    #[test]
    fn ident_hazard_diagnosed_once() {
        reset_id_hazard();
        let mut lapic = Lapic::new(FakeMachine::new().with_id(2).with_interrupts_enabled());
        assert_eq!(lapic.id(), ProcessorID(2));
        assert_eq!(lapic.id(), ProcessorID(2));
        assert_eq!(lapic.id(), ProcessorID(2));
        assert_eq!(lapic.machine().warnings.len(), 1);
        assert!(lapic.machine().warnings[0].contains("interrupts enabled"));
        assert!(lapic.machine().warnings[0].contains("lapic.rs"));
    }
}
