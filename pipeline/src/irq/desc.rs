// SPDX-License-Identifier: MPL-2.0

use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::RwLock;

use super::{
    chip::{IrqChip, NoChip},
    IrqNum,
};
use crate::{
    cpu::{local::CpuLocal, CpuId},
    prelude::*,
    Error,
};

bitflags! {
    /// The pipeline policy of an IRQ.
    pub struct IrqFlags: u32 {
        /// The IRQ is delivered to the head stage when one is installed.
        const PIPELINED     = 1 << 0;
        /// The IRQ is always logged against the stage current at entry.
        const STICKY        = 1 << 1;
        /// The IRQ demultiplexes other IRQs from its flow handler.
        const CHAINED       = 1 << 2;
        /// The action receives a device ID of its own on each CPU.
        const PER_CPU_DEVID = 1 << 3;
        /// The IRQ is a timer tick whose interrupted registers are recorded.
        const TIMER         = 1 << 4;
    }
}

impl IrqFlags {
    pub(crate) fn is_pipelined(&self) -> bool {
        self.contains(Self::PIPELINED)
    }

    pub(crate) fn is_sticky(&self) -> bool {
        self.contains(Self::STICKY)
    }

    pub(crate) fn is_chained(&self) -> bool {
        self.contains(Self::CHAINED)
    }

    pub(crate) fn is_timer(&self) -> bool {
        self.contains(Self::TIMER)
    }
}

/// The description of one IRQ occurrence, passed to the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqEvent {
    /// The IRQ number.
    pub irq: IrqNum,
    /// The CPU handling the IRQ.
    pub cpu: CpuId,
    /// The device ID the action was registered with.
    pub dev_id: usize,
}

type IrqHandler = dyn Fn(&Pipeline, &IrqEvent) + Send + Sync + 'static;

enum DevId {
    Shared(usize),
    PerCpu(Box<[usize]>),
}

/// The action run when an IRQ is handled.
pub struct IrqAction {
    name: &'static str,
    handler: Box<IrqHandler>,
    dev_id: DevId,
}

impl IrqAction {
    /// Creates an action with a device ID of zero.
    pub fn new<F>(name: &'static str, handler: F) -> Self
    where
        F: Fn(&Pipeline, &IrqEvent) + Send + Sync + 'static,
    {
        Self {
            name,
            handler: Box::new(handler),
            dev_id: DevId::Shared(0),
        }
    }

    /// Sets the device ID passed to the handler.
    pub fn with_dev_id(mut self, dev_id: usize) -> Self {
        self.dev_id = DevId::Shared(dev_id);
        self
    }

    /// Sets one device ID per CPU, indexed by CPU ID.
    ///
    /// The IRQ must be flagged [`IrqFlags::PER_CPU_DEVID`] for these to be
    /// used.
    pub fn with_percpu_dev_ids(mut self, dev_ids: Vec<usize>) -> Self {
        self.dev_id = DevId::PerCpu(dev_ids.into_boxed_slice());
        self
    }

    /// Returns the name of the action.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn dev_id(&self, cpu: CpuId, per_cpu: bool) -> usize {
        match &self.dev_id {
            DevId::Shared(dev_id) => *dev_id,
            DevId::PerCpu(dev_ids) if per_cpu => dev_ids.get(cpu.as_usize()).copied().unwrap_or(0),
            DevId::PerCpu(dev_ids) => dev_ids.first().copied().unwrap_or(0),
        }
    }
}

impl core::fmt::Debug for IrqAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub(crate) struct IrqDesc {
    irq: IrqNum,
    flags: AtomicU32,
    synthetic: AtomicBool,
    chip: RwLock<Arc<dyn IrqChip>>,
    action: RwLock<Option<Arc<IrqAction>>>,
    hits: CpuLocal<AtomicU64>,
}

impl IrqDesc {
    fn new(irq: IrqNum, nr_cpus: usize) -> Self {
        Self {
            irq,
            flags: AtomicU32::new(0),
            synthetic: AtomicBool::new(false),
            chip: RwLock::new(Arc::new(NoChip)),
            action: RwLock::new(None),
            hits: CpuLocal::new_with(nr_cpus, |_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn irq(&self) -> IrqNum {
        self.irq
    }

    pub(crate) fn flags(&self) -> IrqFlags {
        IrqFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: IrqFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn is_synthetic(&self) -> bool {
        self.synthetic.load(Ordering::Acquire)
    }

    pub(crate) fn set_synthetic(&self, synthetic: bool) {
        self.synthetic.store(synthetic, Ordering::Release);
    }

    /// Hard IRQs must be off.
    pub(crate) fn chip(&self) -> Arc<dyn IrqChip> {
        self.chip.read().clone()
    }

    /// Hard IRQs must be off.
    pub(crate) fn set_chip(&self, chip: Arc<dyn IrqChip>) {
        *self.chip.write() = chip;
    }

    pub(crate) fn count_hit(&self, cpu: CpuId) {
        self.hits.get_on_cpu(cpu).fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the action of the IRQ on `cpu`.
    ///
    /// Returns `false` if no action is registered. The action is cloned out
    /// of its lock before running, so handlers may free or request IRQs.
    pub(crate) fn handle(&self, pipeline: &Pipeline, cpu: CpuId) -> bool {
        let action = {
            let _guard = pipeline.disable_hard_local();
            self.action.read().clone()
        };
        let Some(action) = action else {
            return false;
        };
        let event = IrqEvent {
            irq: self.irq,
            cpu,
            dev_id: action.dev_id(cpu, self.flags().contains(IrqFlags::PER_CPU_DEVID)),
        };
        (action.handler)(pipeline, &event);
        true
    }
}

pub(crate) struct IrqDescTable {
    descs: Box<[IrqDesc]>,
}

impl IrqDescTable {
    pub(crate) fn new(nr_irqs: usize, nr_cpus: usize) -> Self {
        let descs = (0..nr_irqs).map(|irq| IrqDesc::new(irq, nr_cpus)).collect();
        Self { descs }
    }

    pub(crate) fn get(&self, irq: IrqNum) -> Option<&IrqDesc> {
        self.descs.get(irq)
    }
}

impl Pipeline {
    /// Registers `action` for `irq` with the pipeline policy `flags`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgs`] if `irq` is out of range and
    /// [`Error::Busy`] if an action is already registered.
    pub fn request_irq(&self, irq: IrqNum, flags: IrqFlags, action: IrqAction) -> Result<()> {
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;

        // The action lock is also taken on the IRQ path.
        let _guard = self.disable_hard_local();
        let mut slot = desc.action.write();
        if slot.is_some() {
            return Err(Error::Busy);
        }
        desc.set_flags(flags);
        *slot = Some(Arc::new(action));
        Ok(())
    }

    /// Unregisters the action of `irq`, returning it.
    ///
    /// A copy of the action may still be running on another CPU when this
    /// method returns.
    pub fn free_irq(&self, irq: IrqNum) -> Result<Arc<IrqAction>> {
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;
        let _guard = self.disable_hard_local();
        desc.action.write().take().ok_or(Error::InvalidArgs)
    }

    /// Replaces the pipeline policy of `irq`.
    pub fn set_irq_flags(&self, irq: IrqNum, flags: IrqFlags) -> Result<()> {
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;
        desc.set_flags(flags);
        Ok(())
    }

    /// Returns the pipeline policy of `irq`.
    pub fn irq_flags(&self, irq: IrqNum) -> Option<IrqFlags> {
        self.descs.get(irq).map(IrqDesc::flags)
    }

    /// Sets the chip of `irq`.
    pub fn set_irq_chip(&self, irq: IrqNum, chip: Arc<dyn IrqChip>) -> Result<()> {
        let desc = self.descs.get(irq).ok_or(Error::InvalidArgs)?;
        let _guard = self.disable_hard_local();
        desc.set_chip(chip);
        Ok(())
    }

    /// Returns the name of the chip of `irq`.
    pub fn irq_chip_name(&self, irq: IrqNum) -> Option<alloc::string::String> {
        let desc = self.descs.get(irq)?;
        let _guard = self.disable_hard_local();
        Some(desc.chip().name().into())
    }

    /// Returns how many times `irq` entered the pipeline on `cpu`.
    pub fn irq_hits(&self, irq: IrqNum, cpu: CpuId) -> u64 {
        self.descs
            .get(irq)
            .map_or(0, |desc| desc.hits.get_on_cpu(cpu).load(Ordering::Relaxed))
    }
}
