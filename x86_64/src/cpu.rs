// Copyright 2026  The Selene Authors
// All rights reserved
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use core::time::Duration;

/// Hardware hint in tight loops for hyperthreads to
/// get access to compute.
pub fn relax() {
    unsafe {
        core::arch::x86_64::_mm_pause();
    }
}

/// Returns the clock frequency of the current CPU in Hertz.
pub fn frequency() -> u128 {
    const DEFAULT_HZ: u128 = 2_000_000_000;
    DEFAULT_HZ
}

fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Busy-waits for at least the given duration, counting cycles
/// against the time-stamp counter.
pub fn pause(duration: Duration) {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let cycles = duration.as_nanos() * frequency() / NANOS_PER_SEC;
    let start = u128::from(rdtsc());
    let end = start + cycles;
    while u128::from(rdtsc()) < end {
        relax();
    }
}

/// Returns true when the current processor will accept maskable
/// interrupts, that is, when the IF bit is set in RFLAGS.
pub fn interrupts_enabled() -> bool {
    x86::bits64::rflags::read().contains(x86::bits64::rflags::RFlags::FLAGS_IF)
}
