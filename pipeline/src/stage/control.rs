// SPDX-License-Identifier: MPL-2.0

//! Virtual interrupt control.
//!
//! Stalling a stage virtually disables interrupts for it: IRQs keep being
//! accepted by the pipeline but are only logged for the stage. Unstalling
//! replays the log.

use core::marker::PhantomData;

use log::error;

use super::{context::StageStatus, StageId};
use crate::{arch::HardIrqFlags, Pipeline};

impl Pipeline {
    /// Stalls the root stage.
    pub fn root_irq_disable(&self) {
        self.check_root_only();
        let _guard = self.disable_hard_local();
        self.this_context(StageId::Root).stall();
    }

    /// Stalls the root stage, returning whether it was already stalled.
    pub fn root_irq_save(&self) -> bool {
        self.check_root_only();
        let _guard = self.disable_hard_local();
        self.this_context(StageId::Root).test_and_stall()
    }

    /// Returns whether the root stage is stalled on the current CPU.
    pub fn root_irqs_disabled(&self) -> bool {
        let _guard = self.disable_hard_local();
        self.this_context(StageId::Root).is_stalled()
    }

    /// Unstalls the root stage, replaying the IRQs logged meanwhile.
    ///
    /// Hard IRQs are enabled on return.
    pub fn root_irq_enable(&self) {
        self.arch.hard_local_irq_disable();
        self.check_root_only();

        let root = self.this_context(StageId::Root);
        root.unstall();
        if root.has_pending() {
            self.sync_current();
        }

        self.arch.hard_local_irq_enable();
    }

    /// Restores the root stall bit returned by [`Self::root_irq_save`].
    pub fn root_irq_restore(&self, stalled: bool) {
        self.check_root_only();
        if stalled {
            self.root_irq_disable();
        } else {
            self.root_irq_enable();
        }
    }

    /// Restores the root stall bit without replaying the log.
    pub fn root_irq_restore_nosync(&self, stalled: bool) {
        let _guard = self.disable_hard_local();
        let root = self.this_context(StageId::Root);
        if stalled {
            root.stall();
        } else {
            root.unstall();
        }
    }

    /// Stalls the head stage, leaving hard IRQs disabled.
    pub fn head_irq_disable(&self) {
        self.arch.hard_local_irq_disable();
        self.this_context(StageId::Head).stall();
    }

    /// Stalls the head stage until the returned guard is dropped.
    ///
    /// Hard IRQs are disabled until then as well.
    pub fn head_irq_save(&self) -> HeadStallGuard<'_> {
        let flags = self.arch.hard_local_irq_save();
        let was_stalled = self.this_context(StageId::Head).test_and_stall();
        HeadStallGuard {
            pipeline: self,
            was_stalled,
            flags,
            _not_send: PhantomData,
        }
    }

    /// Returns whether the head stage is stalled on the current CPU.
    pub fn head_irqs_disabled(&self) -> bool {
        let _guard = self.disable_hard_local();
        self.this_context(StageId::Head).is_stalled()
    }

    /// Unstalls the head stage, replaying its log.
    ///
    /// Hard IRQs are enabled on return.
    pub fn head_irq_enable(&self) {
        self.arch.hard_local_irq_disable();

        let head = self.this_context(StageId::Head);
        head.unstall();
        if head.has_pending() {
            self.sync_stage(StageId::Head);
        }

        self.arch.hard_local_irq_enable();
    }

    /// Checks that the caller may run a root-only service.
    ///
    /// Root-only services must be called over the root stage with the head
    /// stage unstalled. When the context checks are on, the first violation
    /// is reported and the CPU is marked as oopsing, which silences further
    /// reports. Returns whether the context is legit.
    pub fn check_root_only(&self) -> bool {
        if !self.config.debug_checks {
            return true;
        }

        let (stage, head_stalled, oopsing) = {
            let _guard = self.disable_hard_local();
            (
                self.current_stage(),
                self.this_context(StageId::Head).is_stalled(),
                self.this_context(StageId::Root).test(StageStatus::OOPS),
            )
        };

        if stage == StageId::Root && !head_stalled {
            return true;
        }
        if oopsing {
            return false;
        }

        self.oops();
        if stage != StageId::Root {
            error!(
                "IRQ pipeline: illicit call from head stage '{}' into a root-only service",
                self.head_stage_name().unwrap_or("?")
            );
        } else {
            error!(
                "IRQ pipeline: stalled head stage detected, \
                 a critical section may have been left unterminated"
            );
        }
        false
    }

    /// Saves the root stall bit and stalls the root stage, on NMI entry.
    pub fn nmi_enter(&self) {
        let root = self.this_context(StageId::Root);
        if root.test_and_stall() {
            root.set(StageStatus::STALLED_NMI);
        } else {
            root.clear(StageStatus::STALLED_NMI);
        }
    }

    /// Restores the root stall bit saved by [`Self::nmi_enter`].
    pub fn nmi_exit(&self) {
        let root = self.this_context(StageId::Root);
        if root.test(StageStatus::STALLED_NMI) {
            root.stall();
        } else {
            root.unstall();
        }
    }

    /// Marks the current CPU as oopsing.
    pub fn oops(&self) {
        let _guard = self.disable_hard_local();
        self.this_context(StageId::Root).set(StageStatus::OOPS);
    }

    /// Returns whether the current CPU is oopsing.
    pub fn is_oopsing(&self) -> bool {
        self.this_context(StageId::Root).test(StageStatus::OOPS)
    }

    /// Prepares the current CPU for idling over the root stage.
    ///
    /// The root stage, stalled by the idle loop, is unstalled. If IRQs were
    /// logged meanwhile, they are replayed with hard IRQs enabled on return
    /// and `false` is returned: the CPU must not idle. Otherwise `true` is
    /// returned with hard IRQs still disabled, for the idle instruction to
    /// enable them.
    pub fn idle(&self) -> bool {
        self.arch.hard_local_irq_disable();

        let root = self.this_context(StageId::Root);
        root.unstall();
        if root.has_pending() {
            self.sync_current();
            self.arch.hard_local_irq_enable();
            return false;
        }
        true
    }
}

/// A guard for a stalled head stage.
///
/// When the guard is dropped and the head stage was not stalled before, the
/// head stage is unstalled and the IRQs logged meanwhile are replayed, then
/// the hard IRQ state is restored. The replay is skipped if hard IRQs were
/// disabled when the guard was taken.
#[clippy::has_significant_drop]
#[must_use]
pub struct HeadStallGuard<'a> {
    pipeline: &'a Pipeline,
    was_stalled: bool,
    flags: HardIrqFlags,
    _not_send: PhantomData<*const ()>,
}

impl HeadStallGuard<'_> {
    /// Returns whether the head stage was already stalled.
    pub fn was_stalled(&self) -> bool {
        self.was_stalled
    }
}

impl Drop for HeadStallGuard<'_> {
    fn drop(&mut self) {
        let pipeline = self.pipeline;
        if !self.was_stalled {
            let head = pipeline.this_context(StageId::Head);
            head.unstall();
            if self.flags.were_enabled() && (pipeline.on_root_stage() || head.has_pending()) {
                pipeline.sync_stage(pipeline.leading_stage());
            }
        }
        pipeline.arch.hard_local_irq_restore(self.flags);
    }
}

#[cfg(test)]
mod test {
    use alloc::{sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::{
        arch::{sim, Clocking},
        cpu::CpuId,
        irq::{IrqAction, IrqFlags},
        PipelineConfig,
    };

    const CLOCKING: Clocking = Clocking {
        hrclock_freq: 19_200_000,
        hrclock_name: "arch_sys_counter",
    };

    fn record(pipeline: &Pipeline, irq: usize, flags: IrqFlags, log: &Arc<Mutex<Vec<usize>>>) {
        let log = log.clone();
        pipeline
            .request_irq(
                irq,
                flags,
                IrqAction::new("recorder", move |_, event| log.lock().push(event.irq)),
            )
            .unwrap();
    }

    #[test]
    fn root_stall_defers_until_enable() {
        let (machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&pipeline, 7, IrqFlags::empty(), &log);
        record(&pipeline, 3, IrqFlags::empty(), &log);

        assert!(!pipeline.root_irq_save());
        machine.raise(CpuId::bsp(), 7);
        machine.raise(CpuId::bsp(), 3);
        assert!(log.lock().is_empty());
        assert!(pipeline.root_irqs_disabled());
        assert!(pipeline.is_pending(StageId::Root, 3));

        pipeline.root_irq_restore(false);
        assert_eq!(*log.lock(), [3, 7]);
        assert!(!pipeline.root_irqs_disabled());
    }

    #[test]
    fn restore_nosync_leaves_the_log_alone() {
        let (machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&pipeline, 12, IrqFlags::empty(), &log);

        pipeline.root_irq_disable();
        machine.raise(CpuId::bsp(), 12);
        pipeline.root_irq_restore_nosync(false);
        assert!(log.lock().is_empty());
        assert!(pipeline.is_pending(StageId::Root, 12));

        // The next IRQ entry over an unstalled root flushes the log.
        pipeline.arch().hard_local_irq_disable();
        pipeline.enter(12);
        pipeline.arch().hard_local_irq_enable();
        assert_eq!(*log.lock(), [12]);
    }

    #[test]
    fn head_stall_defers_pipelined_irq() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        pipeline.install_stage("rt", &CLOCKING);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        pipeline
            .request_irq(
                5,
                IrqFlags::PIPELINED,
                IrqAction::new("rt timer", move |pipeline, _| {
                    assert!(pipeline.on_head_stage());
                    assert!(pipeline.head_irqs_disabled());
                    hits_in_handler.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        pipeline.head_irq_disable();
        pipeline.enter(5);
        pipeline.enter(5);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert!(pipeline.is_pending(StageId::Head, 5));
        assert!(!pipeline.is_pending(StageId::Root, 5));

        pipeline.head_irq_enable();
        // Two occurrences of the same IRQ collapse into one log entry.
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!pipeline.is_pending(StageId::Head, 5));
        assert!(pipeline.on_root_stage());
    }

    #[test]
    fn head_stall_guard_replays_on_drop() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        pipeline.install_stage("rt", &CLOCKING);
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&pipeline, 40, IrqFlags::PIPELINED, &log);

        {
            let outer = pipeline.head_irq_save();
            assert!(!outer.was_stalled());
            pipeline.enter(40);
            {
                let inner = pipeline.head_irq_save();
                assert!(inner.was_stalled());
            }
            assert!(pipeline.head_irqs_disabled());
            assert!(log.lock().is_empty());
        }

        assert_eq!(*log.lock(), [40]);
        assert!(!pipeline.head_irqs_disabled());
        assert!(!pipeline.arch().hard_irqs_disabled());
    }

    #[test]
    fn root_only_check_reports_once() {
        let config = PipelineConfig::new(1).with_debug_checks(true);
        let (_machine, pipeline) = sim::boot(config).unwrap();
        assert!(pipeline.check_root_only());

        pipeline.head_irq_disable();
        assert!(!pipeline.check_root_only());
        assert!(pipeline.is_oopsing());
        assert!(!pipeline.check_root_only());
        pipeline.head_irq_enable();

        assert!(pipeline.check_root_only());
    }

    #[test]
    fn nmi_shadows_the_root_stall_bit() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        pipeline.arch().hard_local_irq_disable();

        pipeline.nmi_enter();
        assert!(pipeline.is_stalled(StageId::Root));
        pipeline.nmi_exit();
        assert!(!pipeline.is_stalled(StageId::Root));

        pipeline.root_irq_restore_nosync(true);
        pipeline.nmi_enter();
        pipeline.nmi_exit();
        assert!(pipeline.is_stalled(StageId::Root));
    }

    #[test]
    fn idle_refuses_with_pending_irqs() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        record(&pipeline, 2, IrqFlags::empty(), &log);

        pipeline.root_irq_disable();
        assert!(pipeline.idle());
        assert!(pipeline.arch().hard_irqs_disabled());

        pipeline.root_irq_disable();
        pipeline.post_event(StageId::Root, 2);
        assert!(!pipeline.idle());
        assert_eq!(*log.lock(), [2]);
        assert!(!pipeline.arch().hard_irqs_disabled());
    }
}
