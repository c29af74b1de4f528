// SPDX-License-Identifier: MPL-2.0

//! Stages and their per-CPU contexts.
//!
//! The root stage always exists. At most one head stage can be installed on
//! top of it, from the root stage. Installing the head stage publishes its
//! per-CPU contexts to every CPU; from then on pipelined IRQs are dispatched
//! to the head stage first.

pub(crate) mod context;
mod control;
mod pending;

use core::sync::atomic::{fence, AtomicBool, Ordering};

use log::info;
use spin::Mutex;

pub use self::{
    context::{StageContext, TickRegs},
    control::HeadStallGuard,
    pending::PendingMap,
};
use self::context::PipelineData;
use crate::{arch::Clocking, cpu::CpuId, irq::IrqNum, Pipeline};

/// The identity of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StageId {
    /// The stage running the general-purpose kernel.
    Root = 0,
    /// The high-priority stage.
    Head = 1,
}

pub(crate) struct StageRegistry {
    head_name: Mutex<Option<&'static str>>,
    head_installed: AtomicBool,
}

impl StageRegistry {
    pub(crate) fn new() -> Self {
        Self {
            head_name: Mutex::new(None),
            head_installed: AtomicBool::new(false),
        }
    }
}

impl Pipeline {
    /// Installs the head stage.
    ///
    /// The head contexts of every CPU are reset, `clocking` is handed to the
    /// architecture backend, then the stage is published.
    ///
    /// # Panics
    ///
    /// This function panics if it is not called from the root stage or if a
    /// head stage is already installed.
    pub fn install_stage(&self, name: &'static str, clocking: &Clocking) {
        assert!(
            self.on_root_stage() && !self.has_head_stage(),
            "a head stage may only be installed once, from the root stage"
        );

        {
            let _guard = self.disable_hard_local();
            *self.stages.head_name.lock() = Some(name);
        }
        for (_, data) in self.percpu.iter() {
            data.head.reset();
        }

        self.arch.push_stage(clocking);
        self.hrclock_freq
            .store(clocking.hrclock_freq, Ordering::Relaxed);

        // The contexts must be visible before the stage is.
        fence(Ordering::SeqCst);
        self.stages.head_installed.store(true, Ordering::Release);

        info!(
            "IRQ pipeline: high-priority {} stage added, clock {} at {} Hz",
            name, clocking.hrclock_name, clocking.hrclock_freq
        );
    }

    /// Uninstalls the head stage.
    ///
    /// # Panics
    ///
    /// This function panics if it is not called from the root stage or if no
    /// head stage is installed.
    pub fn uninstall_stage(&self) {
        assert!(
            self.on_root_stage() && self.has_head_stage(),
            "the head stage may only be removed from the root stage"
        );

        self.stages.head_installed.store(false, Ordering::Release);
        fence(Ordering::SeqCst);

        let name = {
            let _guard = self.disable_hard_local();
            self.stages.head_name.lock().take().unwrap_or("?")
        };
        info!("IRQ pipeline: {} stage removed", name);
    }

    /// Returns whether a head stage is installed.
    pub fn has_head_stage(&self) -> bool {
        self.stages.head_installed.load(Ordering::Acquire)
    }

    /// Returns the name of the installed head stage.
    pub fn head_stage_name(&self) -> Option<&'static str> {
        let _guard = self.disable_hard_local();
        *self.stages.head_name.lock()
    }

    /// Returns the highest stage, the one pipelined IRQs are delivered to.
    pub fn leading_stage(&self) -> StageId {
        if self.has_head_stage() {
            StageId::Head
        } else {
            StageId::Root
        }
    }

    /// Returns the stage the current CPU is running over.
    pub fn current_stage(&self) -> StageId {
        self.this_data().curr.get().unwrap_or(StageId::Root)
    }

    /// Returns whether the current CPU is running over the root stage.
    pub fn on_root_stage(&self) -> bool {
        self.current_stage() == StageId::Root
    }

    /// Returns whether the current CPU is running over the head stage.
    pub fn on_head_stage(&self) -> bool {
        self.current_stage() == StageId::Head
    }

    /// Returns whether `stage` is stalled on the current CPU.
    pub fn is_stalled(&self, stage: StageId) -> bool {
        self.this_context(stage).is_stalled()
    }

    /// Returns whether `irq` is logged for `stage` on the current CPU.
    pub fn is_pending(&self, stage: StageId, irq: IrqNum) -> bool {
        self.this_context(stage).pending().contains(irq)
    }

    /// Returns the context of `stage` on `cpu`, for inspection.
    pub fn context_on(&self, cpu: CpuId, stage: StageId) -> &StageContext {
        self.percpu.get_on_cpu(cpu).context(stage)
    }

    pub(crate) fn this_data(&self) -> &PipelineData {
        self.percpu.get_on_cpu(self.arch.this_cpu())
    }

    /// Returns the context of `stage` on the current CPU.
    ///
    /// Before the pipeline is wired up, the root context is the bootstrap
    /// context.
    pub(crate) fn this_context(&self, stage: StageId) -> &StageContext {
        let data = self.this_data();
        match data.curr.get() {
            None if stage == StageId::Root => &self.bootup,
            _ => data.context(stage),
        }
    }

    pub(crate) fn current_context(&self) -> &StageContext {
        self.this_context(self.current_stage())
    }

    /// Switches the current CPU to `stage`.
    ///
    /// This is the only place the current stage changes. Hard IRQs must be
    /// off.
    pub(crate) fn set_current_stage(&self, stage: StageId) {
        debug_assert!(self.arch.hard_irqs_disabled());
        self.this_data().curr.set(stage);
    }
}
