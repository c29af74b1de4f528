// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::{PendingMap, StageId};
use crate::irq::IrqNum;

bitflags! {
    /// The status word of a stage context.
    pub(crate) struct StageStatus: u32 {
        /// Interrupts are virtually disabled for the stage.
        const STALLED     = 1 << 0;
        /// The stall bit of the root stage saved on NMI entry.
        const STALLED_NMI = 1 << 1;
        /// The CPU is oopsing.
        const OOPS        = 1 << 2;
    }
}

/// The state of one stage on one CPU.
pub struct StageContext {
    stage: StageId,
    status: AtomicU32,
    pending: PendingMap,
}

impl StageContext {
    pub(crate) fn new(stage: StageId, nr_irqs: usize) -> Self {
        Self {
            stage,
            status: AtomicU32::new(0),
            pending: PendingMap::new(nr_irqs),
        }
    }

    pub(crate) fn new_stalled(stage: StageId, nr_irqs: usize) -> Self {
        let context = Self::new(stage, nr_irqs);
        context.set(StageStatus::STALLED);
        context
    }

    /// Returns the stage this context belongs to.
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Returns whether the stage is stalled on this CPU.
    pub fn is_stalled(&self) -> bool {
        self.test(StageStatus::STALLED)
    }

    /// Returns the interrupt log of the context.
    pub fn pending(&self) -> &PendingMap {
        &self.pending
    }

    /// Returns whether any IRQ is logged.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn post(&self, irq: IrqNum) {
        self.pending.post(irq);
    }

    pub(crate) fn stall(&self) {
        self.set(StageStatus::STALLED);
    }

    pub(crate) fn unstall(&self) {
        self.clear(StageStatus::STALLED);
    }

    /// Stalls the stage, returning whether it was already stalled.
    pub(crate) fn test_and_stall(&self) -> bool {
        self.status
            .fetch_or(StageStatus::STALLED.bits(), Ordering::Relaxed)
            & StageStatus::STALLED.bits()
            != 0
    }

    pub(crate) fn test(&self, flags: StageStatus) -> bool {
        self.status.load(Ordering::Relaxed) & flags.bits() != 0
    }

    pub(crate) fn set(&self, flags: StageStatus) {
        self.status.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn clear(&self, flags: StageStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.status.store(0, Ordering::Relaxed);
        self.pending.reset();
    }

    pub(crate) fn copy_from(&self, other: &StageContext) {
        self.status
            .store(other.status.load(Ordering::Relaxed), Ordering::Relaxed);
        self.pending.copy_from(&other.pending);
    }
}

impl core::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field(
                "status",
                &StageStatus::from_bits_truncate(self.status.load(Ordering::Relaxed)),
            )
            .field("pending", &self.pending)
            .finish()
    }
}

/// The register snapshot of the latest timer tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickRegs {
    /// The interrupted instruction pointer.
    pub ip: usize,
    /// The interrupted stack pointer.
    pub sp: usize,
    /// Whether the head stage was current when the tick arrived.
    pub on_head: bool,
}

/// The pipeline state of one CPU.
pub(crate) struct PipelineData {
    pub(crate) root: StageContext,
    pub(crate) head: StageContext,
    pub(crate) curr: CurrentStage,
    pub(crate) tick_regs: Mutex<Option<TickRegs>>,
}

impl PipelineData {
    pub(crate) fn new(nr_irqs: usize) -> Self {
        Self {
            root: StageContext::new_stalled(StageId::Root, nr_irqs),
            head: StageContext::new(StageId::Head, nr_irqs),
            curr: CurrentStage::bootstrap(),
            tick_regs: Mutex::new(None),
        }
    }

    pub(crate) fn context(&self, stage: StageId) -> &StageContext {
        match stage {
            StageId::Root => &self.root,
            StageId::Head => &self.head,
        }
    }
}

/// The stage a CPU is running over.
///
/// Until the pipeline is wired up, every CPU runs over the bootstrap context.
pub(crate) struct CurrentStage(AtomicU8);

impl CurrentStage {
    const BOOTSTRAP: u8 = u8::MAX;

    fn bootstrap() -> Self {
        Self(AtomicU8::new(Self::BOOTSTRAP))
    }

    /// Returns the current stage, or `None` over the bootstrap context.
    pub(crate) fn get(&self) -> Option<StageId> {
        match self.0.load(Ordering::Relaxed) {
            0 => Some(StageId::Root),
            1 => Some(StageId::Head),
            _ => None,
        }
    }

    pub(crate) fn set(&self, stage: StageId) {
        self.0.store(stage as u8, Ordering::Relaxed);
    }
}
