// SPDX-License-Identifier: MPL-2.0

//! Interrupt controller chips.

use alloc::{sync::Arc, vec::Vec};

use super::IrqNum;
use crate::Pipeline;

/// An interrupt controller chip.
///
/// Every method has a no-op default, so that software-only chips only need
/// to name themselves.
pub trait IrqChip: Send + Sync {
    /// Returns the name of the chip.
    fn name(&self) -> &str;

    /// Acknowledges `irq` at pipeline entry.
    fn ack(&self, _irq: IrqNum) {}

    /// Masks `irq`.
    fn mask(&self, _irq: IrqNum) {}

    /// Unmasks `irq`.
    fn unmask(&self, _irq: IrqNum) {}

    /// Mutes or unmutes every IRQ line of the chip not claimed by the head
    /// stage.
    fn mute(&self, _on: bool) {}
}

/// The chip of the synthetic IRQ domain.
#[derive(Debug, Default)]
pub struct SyntheticChip;

impl IrqChip for SyntheticChip {
    fn name(&self) -> &str {
        "SIRQC"
    }
}

/// The placeholder chip of descriptors no chip was set on.
#[derive(Debug, Default)]
pub(crate) struct NoChip;

impl IrqChip for NoChip {
    fn name(&self) -> &str {
        "none"
    }
}

impl Pipeline {
    /// Registers a chip to be muted and unmuted by [`Self::mute_switch`].
    pub fn register_muter(&self, chip: Arc<dyn IrqChip>) {
        self.muters.lock(self).push(chip);
    }

    /// Unregisters a chip registered with [`Self::register_muter`].
    pub fn unregister_muter(&self, chip: &Arc<dyn IrqChip>) {
        self.muters
            .lock(self)
            .retain(|muter| !Arc::ptr_eq(muter, chip));
    }

    /// Mutes (`on`) or unmutes every registered muter chip.
    pub fn mute_switch(&self, on: bool) {
        let muters = self.muters.lock(self);
        for chip in muters.iter() {
            chip.mute(on);
        }
    }

    /// Returns the names of the registered muter chips.
    pub fn muters(&self) -> Vec<alloc::string::String> {
        self.muters
            .lock(self)
            .iter()
            .map(|chip| chip.name().into())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{arch::sim, PipelineConfig};

    #[derive(Default)]
    struct CountingChip {
        muted: AtomicUsize,
        unmuted: AtomicUsize,
    }

    impl IrqChip for CountingChip {
        fn name(&self) -> &str {
            "counting"
        }

        fn mute(&self, on: bool) {
            if on {
                self.muted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.unmuted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn mute_switch_reaches_registered_chips_only() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let chip = Arc::new(CountingChip::default());
        let muter: Arc<dyn IrqChip> = chip.clone();

        pipeline.register_muter(muter.clone());
        assert_eq!(pipeline.muters(), ["counting"]);
        pipeline.mute_switch(true);
        pipeline.mute_switch(false);

        pipeline.unregister_muter(&muter);
        assert!(pipeline.muters().is_empty());
        pipeline.mute_switch(true);

        assert_eq!(chip.muted.load(Ordering::Relaxed), 1);
        assert_eq!(chip.unmuted.load(Ordering::Relaxed), 1);
    }
}
