// SPDX-License-Identifier: MPL-2.0

//! A dual-stage interrupt pipeline.
//!
//! The pipeline splits interrupt handling between two _stages_:
//!
//! - the **root** stage, which always exists and receives every interrupt
//!   the head stage does not claim, deferred until the root stage is
//!   logically ready to take it;
//! - the optional **head** stage, which receives pipelined interrupts
//!   immediately, with hard IRQs off, for minimal and bounded latency.
//!
//! Whenever a stage is _stalled_ (interrupts virtually disabled), arriving
//! interrupts are logged into the per-CPU [`PendingMap`] of that stage and
//! replayed in ascending IRQ order once the stage is unstalled.
//!
//! Around this core, the crate provides:
//!
//! - a cross-CPU critical section, the _superlock_ (see [`Pipeline::lock`]);
//! - a per-CPU deferred-work queue flushed over the root stage (see
//!   [`Pipeline::post_work`]);
//! - a domain of software-only IRQs (see
//!   [`Pipeline::create_synthetic_irq`]).
//!
//! Architecture-specific primitives are consumed through [`PipelineArch`].
//!
//! [`PendingMap`]: stage::PendingMap
//! [`PipelineArch`]: arch::PipelineArch
#![cfg_attr(not(any(test, feature = "sim")), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod cpu;
mod dispatch;
mod error;
pub mod irq;
pub mod prelude;
mod replay;
pub mod stage;
mod superlock;
pub mod sync;
mod work;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::info;
use spin::Once;

pub use self::{
    config::{OverflowPolicy, PipelineConfig},
    error::Error,
    prelude::Result,
    superlock::{SuperLockGuard, SyncFn},
    work::WorkHandler,
};
use self::{
    arch::PipelineArch,
    cpu::{local::CpuLocal, CpuId},
    irq::{chip::IrqChip, desc::IrqDescTable, synthetic::SyntheticDomain, IrqAction, IrqFlags},
    stage::{context::PipelineData, StageContext, StageRegistry},
    superlock::SuperLock,
    sync::HardSpinLock,
    work::WorkQueue,
};

/// An interrupt pipeline instance.
///
/// A pipeline owns the per-CPU stage contexts of every CPU in the system,
/// the IRQ descriptors it dispatches, the superlock state and the deferred
/// work buffers. All per-CPU state is indexed by [`CpuId`] and is only
/// mutated by its owning CPU with hard IRQs off.
///
/// # Lifecycle
///
/// 1. [`Pipeline::new`] builds the instance. Every CPU is running over the
///    bootstrap context, a stalled root context standing in until the
///    per-CPU contexts are wired up.
/// 2. [`Pipeline::init_early`] moves the bootstrap state into the root
///    context of the boot CPU and points every CPU at its own root context.
/// 3. [`Pipeline::init`] creates the synthetic IRQs used internally by the
///    deferred-work queue and the superlock.
pub struct Pipeline {
    config: PipelineConfig,
    arch: Arc<dyn PipelineArch>,
    stages: StageRegistry,
    percpu: CpuLocal<PipelineData>,
    bootup: StageContext,
    booted: AtomicBool,
    descs: IrqDescTable,
    synthetic: SyntheticDomain,
    superlock: SuperLock,
    work: WorkQueue,
    muters: HardSpinLock<alloc::vec::Vec<Arc<dyn IrqChip>>>,
    hrclock_freq: AtomicU64,
    initialized: Once<()>,
}

impl Pipeline {
    /// Creates a pipeline over the given architecture backend.
    pub fn new(config: PipelineConfig, arch: Arc<dyn PipelineArch>) -> Result<Arc<Self>> {
        config.validate()?;

        let nr_cpus = config.nr_cpus;
        let nr_irqs = config.nr_irqs;
        let pipeline = Self {
            stages: StageRegistry::new(),
            percpu: CpuLocal::new_with(nr_cpus, |_| PipelineData::new(nr_irqs)),
            bootup: StageContext::new_stalled(stage::StageId::Root, nr_irqs),
            booted: AtomicBool::new(false),
            descs: IrqDescTable::new(nr_irqs, nr_cpus),
            synthetic: SyntheticDomain::new(config.first_synthetic_irq, nr_irqs),
            superlock: SuperLock::new(nr_cpus, config.superlock_timeout),
            work: WorkQueue::new(nr_cpus, config.work_buf_size),
            muters: HardSpinLock::new(alloc::vec::Vec::new()),
            hrclock_freq: AtomicU64::new(0),
            initialized: Once::new(),
            config,
            arch,
        };

        Ok(Arc::new(pipeline))
    }

    /// Wires up the per-CPU stage contexts.
    ///
    /// The state accumulated in the bootstrap context (its stall bit and any
    /// IRQ logged so far) is copied to the root context of the boot CPU, then
    /// every CPU is switched to its own root context.
    ///
    /// # Panics
    ///
    /// This function must be called once, on the boot CPU, with hard IRQs
    /// off.
    pub fn init_early(&self) {
        assert!(
            self.arch.this_cpu() == CpuId::bsp() && self.arch.hard_irqs_disabled(),
            "the pipeline must be wired up on the boot CPU with hard IRQs off"
        );
        assert!(
            !self.booted.swap(true, Ordering::AcqRel),
            "the pipeline is already wired up"
        );

        self.percpu
            .get_on_cpu(CpuId::bsp())
            .root
            .copy_from(&self.bootup);

        for (_, data) in self.percpu.iter() {
            data.curr.set(stage::StageId::Root);
        }
    }

    /// Creates the internal synthetic IRQs and registers their handlers.
    ///
    /// Hard IRQs must be off.
    pub fn init(&self) -> Result<()> {
        debug_assert!(self.arch.hard_irqs_disabled());

        if self.initialized.is_completed() {
            return Err(Error::InvalidArgs);
        }

        let work_sirq = self.create_synthetic_irq()?;
        self.request_irq(
            work_sirq,
            IrqFlags::empty(),
            IrqAction::new("root stage worker", |pipeline, _| pipeline.flush_work()),
        )?;
        self.work.set_irq(work_sirq);

        let lock_ipi = self.create_synthetic_irq()?;
        self.request_irq(
            lock_ipi,
            IrqFlags::PIPELINED | IrqFlags::STICKY,
            IrqAction::new("pipeline lock interrupt", |pipeline, event| {
                pipeline.superlock_sync_handler(event.cpu)
            }),
        )?;
        self.superlock.set_ipi(lock_ipi);

        self.initialized.call_once(|| ());

        info!(
            "IRQ pipeline: {} CPUs, {} IRQs, {}-level interrupt log",
            self.config.nr_cpus,
            self.config.nr_irqs,
            self.bootup.pending().levels()
        );
        Ok(())
    }

    /// Returns the configuration of this pipeline.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the architecture backend.
    pub fn arch(&self) -> &dyn PipelineArch {
        &*self.arch
    }

    /// Returns the ID of the CPU executing the caller.
    pub fn this_cpu(&self) -> CpuId {
        self.arch.this_cpu()
    }

    /// Returns the high-resolution clock frequency recorded when the head
    /// stage was installed, or zero.
    pub fn hrclock_freq(&self) -> u64 {
        self.hrclock_freq.load(Ordering::Relaxed)
    }
}
