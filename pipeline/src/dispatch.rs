// SPDX-License-Identifier: MPL-2.0

//! Pipeline entry and IRQ dispatching.
//!
//! Every IRQ taken by the CPU enters the pipeline with hard IRQs off. From
//! there, it is either logged for a stage or, when it is pipelined and a
//! head stage is installed, run right away by the head stage:
//!
//! - sticky IRQs are logged for the stage current at entry;
//! - with no head stage, every IRQ is logged for the root stage;
//! - pipelined IRQs go to the head stage;
//! - all other IRQs are logged for the root stage.
//!
//! The logs are then synchronized from the leading stage down, unless the
//! caller asked not to.

use log::error;

use crate::{
    irq::{desc::IrqDesc, IrqNum},
    stage::{StageId, TickRegs},
    Pipeline,
};

impl Pipeline {
    /// Feeds an IRQ taken by the current CPU into the pipeline.
    ///
    /// Hard IRQs must be off.
    pub fn enter(&self, irq: IrqNum) {
        self.enter_pipeline(irq, true, None);
    }

    /// Feeds an IRQ into the pipeline without synchronizing the logs.
    ///
    /// This is how the flow handler of a chained IRQ hands over the IRQs it
    /// demultiplexes. Hard IRQs must be off.
    pub fn enter_nosync(&self, irq: IrqNum) {
        self.enter_pipeline(irq, false, None);
    }

    /// Feeds a timer IRQ into the pipeline along with the interrupted
    /// registers.
    ///
    /// The registers are recorded if `irq` is flagged as a timer. Hard IRQs
    /// must be off.
    pub fn enter_timer(&self, irq: IrqNum, ip: usize, sp: usize) {
        self.enter_pipeline(irq, true, Some((ip, sp)));
    }

    /// Returns the registers recorded by the latest timer tick on the
    /// current CPU.
    pub fn tick_regs(&self) -> Option<TickRegs> {
        let _guard = self.disable_hard_local();
        *self.this_data().tick_regs.lock()
    }

    /// Emulates the receipt of `irq` on the current CPU.
    ///
    /// A pipelined synthetic IRQ is sent to the head stage directly when one
    /// is installed. Any other IRQ follows the regular pipeline entry.
    pub fn inject(&self, irq: IrqNum) {
        let _guard = self.disable_hard_local();

        let Some(desc) = self.descs.get(irq) else {
            error!("IRQ pipeline: cannot inject unknown IRQ{}", irq);
            return;
        };

        if self.has_head_stage() && desc.is_synthetic() && desc.flags().is_pipelined() {
            self.dispatch_head(desc);
        } else {
            self.dispatch(desc, true);
        }
    }

    /// Logs `irq` for `stage` on the current CPU.
    ///
    /// Hard IRQs must be off.
    pub fn post_event(&self, stage: StageId, irq: IrqNum) {
        debug_assert!(
            self.arch.hard_irqs_disabled(),
            "IRQ{} posted with hard IRQs enabled",
            irq
        );
        debug_assert!(irq < self.config.nr_irqs, "IRQ{} is out of range", irq);

        self.this_context(stage).post(irq);
    }

    /// Drops `irq` from the logs of the current CPU.
    pub fn clear_pending(&self, irq: IrqNum) {
        if irq >= self.config.nr_irqs {
            return;
        }

        let _guard = self.disable_hard_local();
        self.this_context(StageId::Root).pending().clear(irq);
        if self.has_head_stage() {
            self.this_context(StageId::Head).pending().clear(irq);
        }
    }

    fn enter_pipeline(&self, irq: IrqNum, sync: bool, regs: Option<(usize, usize)>) {
        if self.config.debug_checks && !self.arch.hard_irqs_disabled() {
            self.arch.hard_local_irq_disable();
            error!("IRQ pipeline: interrupts enabled on entry (IRQ{})", irq);
        }

        let Some(desc) = self.descs.get(irq) else {
            error!("IRQ pipeline: received unhandled IRQ{}", irq);
            return;
        };

        let cpu = self.arch.this_cpu();
        desc.count_hit(cpu);

        if let Some((ip, sp)) = regs {
            if desc.flags().is_timer() {
                *self.this_data().tick_regs.lock() = Some(TickRegs {
                    ip,
                    sp,
                    on_head: self.on_head_stage(),
                });
            }
        }

        // The flow handler. A chained IRQ demultiplexes its children right
        // away, which re-enter the pipeline without syncing.
        desc.chip().ack(irq);
        if desc.flags().is_chained() {
            desc.handle(self, cpu);
            if sync {
                self.sync_stage(self.leading_stage());
            }
            return;
        }

        self.dispatch(desc, sync);
    }

    fn dispatch(&self, desc: &IrqDesc, sync: bool) {
        let irq = desc.irq();
        let flags = desc.flags();

        let stage = if flags.is_sticky() {
            self.current_stage()
        } else if !self.has_head_stage() {
            StageId::Root
        } else if flags.is_pipelined() {
            if sync {
                self.dispatch_head(desc);
            } else {
                self.post_event(StageId::Head, irq);
            }
            return;
        } else {
            StageId::Root
        };

        self.post_event(stage, irq);

        // Over the head stage, there is nothing to sync unless the head
        // stage itself has IRQs waiting.
        if sync && (self.on_root_stage() || self.this_context(StageId::Head).has_pending()) {
            self.sync_stage(self.leading_stage());
        }
    }

    /// Runs a pipelined IRQ over the head stage right away.
    ///
    /// The IRQ is only logged if the head stage is stalled. Hard IRQs must be
    /// off.
    fn dispatch_head(&self, desc: &IrqDesc) {
        let irq = desc.irq();
        let head = self.this_context(StageId::Head);
        if head.is_stalled() {
            self.post_event(StageId::Head, irq);
            return;
        }

        let old = self.current_stage();
        if old != StageId::Head {
            self.set_current_stage(StageId::Head);
        }

        head.stall();
        self.call_head_handler(irq);
        self.arch.hard_local_irq_disable();
        let head = self.this_context(StageId::Head);
        head.unstall();

        if self.current_stage() == StageId::Head {
            if old == StageId::Head {
                // Nested over the head stage: replay its log right here.
                if head.has_pending() {
                    self.sync_current();
                }
                return;
            }
            self.set_current_stage(StageId::Root);
        }

        self.sync_from_root(StageId::Head);
    }
}
