// SPDX-License-Identifier: MPL-2.0

//! The architecture seam of the pipeline.
//!
//! The pipeline never touches the CPU directly. Hard IRQ masking, the
//! identity of the running CPU, inter-processor interrupts and the hooks run
//! around the head stage are all provided by an implementation of
//! [`PipelineArch`].

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "sim"))] {
        pub mod sim;
    }
}

use crate::{
    cpu::{CpuId, CpuSet},
    irq::IrqNum,
};

/// The hard IRQ state saved by [`PipelineArch::hard_local_irq_save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct HardIrqFlags {
    were_enabled: bool,
}

impl HardIrqFlags {
    /// Creates the saved state.
    pub const fn new(were_enabled: bool) -> Self {
        Self { were_enabled }
    }

    /// Returns whether hard IRQs were enabled when the state was saved.
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

/// Clock information handed over when a head stage is installed.
#[derive(Clone, Debug)]
pub struct Clocking {
    /// The frequency of the high-resolution clock in Hz.
    pub hrclock_freq: u64,
    /// The name of the high-resolution clock device.
    pub hrclock_name: &'static str,
}

/// The architecture-specific primitives used by the pipeline.
pub trait PipelineArch: Send + Sync {
    /// Returns the ID of the CPU executing the caller.
    fn this_cpu(&self) -> CpuId;

    /// Returns the CPUs currently online.
    fn online_cpus(&self) -> CpuSet;

    /// Returns the number of CPUs currently online.
    fn num_online_cpus(&self) -> usize {
        self.online_cpus().count()
    }

    /// Returns whether hard IRQs are disabled on this CPU.
    fn hard_irqs_disabled(&self) -> bool;

    /// Disables hard IRQs on this CPU.
    fn hard_local_irq_disable(&self);

    /// Enables hard IRQs on this CPU.
    ///
    /// Interrupts raised while they were disabled may be taken before this
    /// method returns.
    fn hard_local_irq_enable(&self);

    /// Disables hard IRQs on this CPU, returning the previous state.
    fn hard_local_irq_save(&self) -> HardIrqFlags {
        let were_enabled = !self.hard_irqs_disabled();
        if were_enabled {
            self.hard_local_irq_disable();
        }
        HardIrqFlags::new(were_enabled)
    }

    /// Restores the hard IRQ state saved by [`Self::hard_local_irq_save`].
    fn hard_local_irq_restore(&self, flags: HardIrqFlags) {
        if flags.were_enabled() {
            self.hard_local_irq_enable();
        } else {
            self.hard_local_irq_disable();
        }
    }

    /// Sends `irq` as an inter-processor interrupt to `targets`.
    fn send_ipi(&self, irq: IrqNum, targets: &CpuSet);

    /// Spins once, hinting the CPU that it is busy-waiting.
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Called when a head stage is installed.
    fn push_stage(&self, _clocking: &Clocking) {}

    /// Called after each head stage handler, with hard IRQs off.
    fn finish_head(&self, _irq: IrqNum) {}
}
