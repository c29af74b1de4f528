// SPDX-License-Identifier: MPL-2.0

//! The synthetic IRQ domain.
//!
//! Synthetic IRQs are software-only: no device raises them, they are only
//! ever logged with [`Pipeline::post_event`] or injected with
//! [`Pipeline::inject`]. They occupy the top of the IRQ space, from
//! [`PipelineConfig::first_synthetic_irq`] up.
//!
//! [`PipelineConfig::first_synthetic_irq`]: crate::PipelineConfig::first_synthetic_irq

use alloc::sync::Arc;

use bitvec::prelude::BitVec;
use log::debug;
use spin::Mutex;

use super::{chip::NoChip, IrqFlags, IrqNum, SyntheticChip};
use crate::{prelude::*, Error};

/// The allocator of the synthetic domain.
///
/// A set bit means the IRQ at that offset from the base is allocated.
pub(crate) struct SyntheticDomain {
    base: IrqNum,
    ids: Mutex<IdBitmap>,
}

struct IdBitmap {
    bitset: BitVec<u8>,
    first_available_id: usize,
}

impl SyntheticDomain {
    pub(crate) fn new(base: IrqNum, nr_irqs: usize) -> Self {
        let capacity = nr_irqs.saturating_sub(base);
        let mut bitset = BitVec::with_capacity(capacity);
        bitset.resize(capacity, false);
        Self {
            base,
            ids: Mutex::new(IdBitmap {
                bitset,
                first_available_id: 0,
            }),
        }
    }

    fn alloc(&self) -> Option<IrqNum> {
        let mut ids = self.ids.lock();
        let id = ids.first_available_id;
        if id >= ids.bitset.len() {
            return None;
        }
        ids.bitset.set(id, true);
        ids.first_available_id = (id + 1..ids.bitset.len())
            .find(|&i| !ids.bitset[i])
            .unwrap_or(ids.bitset.len());
        Some(self.base + id)
    }

    fn free(&self, irq: IrqNum) -> bool {
        let Some(id) = irq.checked_sub(self.base) else {
            return false;
        };
        let mut ids = self.ids.lock();
        if id >= ids.bitset.len() || !ids.bitset[id] {
            return false;
        }
        ids.bitset.set(id, false);
        if id < ids.first_available_id {
            ids.first_available_id = id;
        }
        true
    }

    fn is_allocated(&self, irq: IrqNum) -> bool {
        let Some(id) = irq.checked_sub(self.base) else {
            return false;
        };
        let ids = self.ids.lock();
        id < ids.bitset.len() && ids.bitset[id]
    }
}

impl Pipeline {
    /// Allocates a synthetic IRQ.
    ///
    /// The descriptor is set up with the no-op synthetic chip and an empty
    /// pipeline policy, so that the IRQ is delivered to the root stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughResources`] if the domain is exhausted.
    pub fn create_synthetic_irq(&self) -> Result<IrqNum> {
        // The domain may be grown from a head stage handler.
        let _guard = self.disable_hard_local();
        let irq = self.synthetic.alloc().ok_or(Error::NotEnoughResources)?;
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;

        desc.set_chip(Arc::new(SyntheticChip));
        desc.set_flags(IrqFlags::empty());
        desc.set_synthetic(true);

        debug!("IRQ pipeline: synthetic IRQ{} created", irq);
        Ok(irq)
    }

    /// Releases a synthetic IRQ, unregistering its action if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgs`] if `irq` is not an allocated synthetic
    /// IRQ.
    pub fn destroy_synthetic_irq(&self, irq: IrqNum) -> Result<()> {
        let _guard = self.disable_hard_local();
        if !self.synthetic.is_allocated(irq) {
            return Err(Error::InvalidArgs);
        }
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;

        let _ = self.free_irq(irq);
        desc.set_synthetic(false);
        desc.set_flags(IrqFlags::empty());
        desc.set_chip(Arc::new(NoChip));
        self.clear_pending(irq);

        self.synthetic.free(irq);
        Ok(())
    }

    /// Returns whether `irq` is an allocated synthetic IRQ.
    pub fn is_synthetic_irq(&self, irq: IrqNum) -> bool {
        self.descs.get(irq).is_some_and(|desc| desc.is_synthetic())
    }
}
