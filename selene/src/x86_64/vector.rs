// Copyright 2026  The Selene Authors
// All rights reserved
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The kernel's interrupt-vector allocation.  Device interrupts
//! occupy the range starting at 32, directly above the architectural
//! exceptions; the controller's own service vectors and the
//! inter-processor vectors sit at the top of that range so they never
//! collide with routed device lines.

use arch::lapic::InterruptVector;

/// The scheduling tick.
pub const TIMER: InterruptVector = InterruptVector::Vector32;

/// Controller-internal error reports.
pub const ERROR: InterruptVector = InterruptVector::Vector51;

/// Spurious (unmatched) interrupts; never acknowledged.
pub const SPURIOUS: InterruptVector = InterruptVector::Vector63;

/// Remote translation-cache flush request.
pub const TLB_FLUSH: InterruptVector = InterruptVector::Vector64;

/// Remote sampling-configuration refresh request.
pub const SAMPLE_REFRESH: InterruptVector = InterruptVector::Vector65;
