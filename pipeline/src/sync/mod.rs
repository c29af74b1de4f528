// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives aware of the pipeline.

mod hard_spin;

pub use self::hard_spin::{HardSpinLock, HardSpinLockGuard};
