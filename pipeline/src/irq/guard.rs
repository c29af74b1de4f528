// SPDX-License-Identifier: MPL-2.0

use core::marker::PhantomData;

use crate::{
    arch::{HardIrqFlags, PipelineArch},
    Pipeline,
};

/// A guard for disabled hard IRQs on the current CPU.
///
/// The previous hard IRQ state is restored when the guard is dropped.
#[clippy::has_significant_drop]
#[must_use]
pub struct HardIrqGuard<'a> {
    arch: &'a dyn PipelineArch,
    flags: HardIrqFlags,
    // The guard is bound to the CPU it was created on.
    _not_send: PhantomData<*const ()>,
}

impl<'a> HardIrqGuard<'a> {
    fn new(arch: &'a dyn PipelineArch) -> Self {
        let flags = arch.hard_local_irq_save();
        Self {
            arch,
            flags,
            _not_send: PhantomData,
        }
    }

    /// Returns whether hard IRQs were enabled before the guard was taken.
    pub fn were_enabled(&self) -> bool {
        self.flags.were_enabled()
    }
}

impl Drop for HardIrqGuard<'_> {
    fn drop(&mut self) {
        self.arch.hard_local_irq_restore(self.flags);
    }
}

impl Pipeline {
    /// Disables hard IRQs on the current CPU until the guard is dropped.
    pub fn disable_hard_local(&self) -> HardIrqGuard<'_> {
        HardIrqGuard::new(&*self.arch)
    }
}
