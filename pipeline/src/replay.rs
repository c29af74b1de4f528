// SPDX-License-Identifier: MPL-2.0

//! Log synchronization.
//!
//! Replaying a log runs the handlers of the logged IRQs in ascending IRQ
//! order, with the stage stalled so that IRQs arriving meanwhile are logged
//! again instead of nesting. Head stage handlers run with hard IRQs off, root
//! stage handlers with hard IRQs on.

use core::sync::atomic::{compiler_fence, Ordering};

use log::{error, trace, warn};

use crate::{irq::IrqNum, stage::StageId, Pipeline};

impl Pipeline {
    /// Synchronizes the logs of the current CPU from `top` down.
    ///
    /// If the CPU runs over `top` already, only the log of `top` is replayed,
    /// provided it is not stalled. Hard IRQs must be off.
    pub fn sync_stage(&self, top: StageId) {
        if self.current_stage() != top {
            self.sync_from_root(top);
        } else if !self.this_context(top).is_stalled() {
            self.sync_current();
        }
    }

    /// Replays the logs from `top` down to the root stage, stopping at the
    /// first stalled stage.
    ///
    /// The CPU must run over the root stage. It switches to the head stage
    /// for the time the head log is replayed.
    pub(crate) fn sync_from_root(&self, top: StageId) {
        debug_assert!(self.arch.hard_irqs_disabled());
        if self.config.debug_checks && !self.on_root_stage() {
            error!("IRQ pipeline: log synchronization entered over the head stage");
        }

        let mut stage = top;
        loop {
            let context = self.this_context(stage);
            if context.is_stalled() {
                break;
            }

            if context.has_pending() {
                if stage == StageId::Root {
                    self.sync_current();
                } else {
                    self.set_current_stage(stage);
                    self.sync_current();
                    self.set_current_stage(StageId::Root);
                }
            }

            if stage == StageId::Root {
                break;
            }
            stage = StageId::Root;
        }
    }

    /// Replays the log of the current stage.
    ///
    /// A handler may leave the CPU over a lower stage than the one it was
    /// started from. The replay then carries on with the log of that stage
    /// unless it is stalled, in which case it returns to the caller without
    /// touching the stall bits. Moving up a stage from a handler is a bug.
    ///
    /// Hard IRQs must be off.
    pub(crate) fn sync_current(&self) {
        debug_assert!(self.arch.hard_irqs_disabled());

        let mut context = self.current_context();
        'respin: loop {
            let stage = context.stage();
            debug_assert!(
                !context.is_stalled(),
                "unexpected re-entry into the stalled {:?} stage",
                stage
            );
            context.stall();
            compiler_fence(Ordering::SeqCst);

            while let Some(irq) = context.pending().pull_lowest() {
                // The log must be updated before the handler runs.
                compiler_fence(Ordering::SeqCst);
                trace!("IRQ pipeline: replaying IRQ{} over the {:?} stage", irq, stage);

                if stage != StageId::Head {
                    self.arch.hard_local_irq_enable();
                }
                match stage {
                    StageId::Root => self.call_root_handler(irq),
                    StageId::Head => self.call_head_handler(irq),
                }
                self.arch.hard_local_irq_disable();

                let current = self.current_context();
                if current.stage() != stage {
                    assert!(
                        !self.config.debug_checks || stage != StageId::Root,
                        "IRQ pipeline: a root handler moved the CPU up to the head stage"
                    );
                    if current.is_stalled() {
                        return;
                    }
                    context = current;
                    continue 'respin;
                }
            }

            context.unstall();
            return;
        }
    }

    fn call_root_handler(&self, irq: IrqNum) {
        let handled = self
            .descs
            .get(irq)
            .is_some_and(|desc| desc.handle(self, self.arch.this_cpu()));
        if !handled {
            warn!("IRQ pipeline: no root handler for IRQ{}", irq);
        }
    }

    pub(crate) fn call_head_handler(&self, irq: IrqNum) {
        let handled = self
            .descs
            .get(irq)
            .is_some_and(|desc| desc.handle(self, self.arch.this_cpu()));
        if !handled {
            warn!("IRQ pipeline: no head handler for IRQ{}", irq);
        }
        self.arch.finish_head(irq);
    }
}

#[cfg(test)]
mod test {
    use alloc::{sync::Arc, vec::Vec};

    use spin::Mutex;

    use crate::{
        arch::{sim, Clocking},
        cpu::CpuId,
        irq::{IrqAction, IrqFlags},
        stage::StageId,
        Pipeline, PipelineConfig,
    };

    const CLOCKING: Clocking = Clocking {
        hrclock_freq: 1_000_000,
        hrclock_name: "sim",
    };

    #[test]
    fn replay_runs_in_ascending_order() {
        let (machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for irq in [900, 3, 7, 64, 65] {
            let order = order.clone();
            pipeline
                .request_irq(
                    irq,
                    IrqFlags::empty(),
                    IrqAction::new("ordered", move |_, event| order.lock().push(event.irq)),
                )
                .unwrap();
        }

        pipeline.root_irq_disable();
        for irq in [65, 7, 900, 3, 64, 7] {
            machine.raise(CpuId::bsp(), irq);
        }
        pipeline.root_irq_enable();

        assert_eq!(*order.lock(), [3, 7, 64, 65, 900]);
    }

    #[test]
    fn root_handlers_run_with_hard_irqs_on() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        pipeline.install_stage("rt", &CLOCKING);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (irq, flags) in [(8, IrqFlags::empty()), (9, IrqFlags::PIPELINED)] {
            let seen = seen.clone();
            pipeline
                .request_irq(
                    irq,
                    flags,
                    IrqAction::new("watcher", move |pipeline, event| {
                        seen.lock().push((
                            event.irq,
                            pipeline.is_stalled(pipeline.current_stage()),
                            pipeline.arch().hard_irqs_disabled(),
                        ));
                    }),
                )
                .unwrap();
        }

        pipeline.arch().hard_local_irq_disable();
        pipeline.enter(8);
        pipeline.enter(9);
        pipeline.arch().hard_local_irq_enable();

        assert_eq!(*seen.lock(), [(8, true, false), (9, true, true)]);
    }

    #[test]
    fn irq_raised_by_a_root_handler_is_replayed_after_it() {
        let (machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let outer = order.clone();
        let raiser = machine.clone();
        pipeline
            .request_irq(
                20,
                IrqFlags::empty(),
                IrqAction::new("raiser", move |_, event| {
                    outer.lock().push(event.irq);
                    // Taken right away since the handler runs with hard
                    // IRQs on, but only logged as root is stalled.
                    raiser.raise(CpuId::bsp(), 2);
                    outer.lock().push(event.irq);
                }),
            )
            .unwrap();
        let inner = order.clone();
        pipeline
            .request_irq(
                2,
                IrqFlags::empty(),
                IrqAction::new("raised", move |_, event| inner.lock().push(event.irq)),
            )
            .unwrap();

        machine.raise(CpuId::bsp(), 20);

        assert_eq!(*order.lock(), [20, 20, 2]);
        assert!(!pipeline.is_stalled(StageId::Root));
    }

    type Trace = Arc<Mutex<Vec<(usize, StageId)>>>;

    fn traced(trace: &Trace) -> IrqAction {
        let trace = trace.clone();
        IrqAction::new("tracer", move |pipeline, event| {
            trace.lock().push((event.irq, pipeline.current_stage()));
        })
    }

    /// Logs IRQ4 for the root stage, then IRQ9 and IRQ10 for the stalled
    /// head stage. The handler of IRQ9 drops the CPU down to the root stage.
    fn log_demotion(pipeline: &Pipeline, trace: &Trace) {
        pipeline.install_stage("rt", &CLOCKING);
        pipeline
            .request_irq(4, IrqFlags::empty(), traced(trace))
            .unwrap();
        pipeline
            .request_irq(10, IrqFlags::PIPELINED, traced(trace))
            .unwrap();
        let inner = trace.clone();
        pipeline
            .request_irq(
                9,
                IrqFlags::PIPELINED,
                IrqAction::new("demoter", move |pipeline, event| {
                    inner.lock().push((event.irq, pipeline.current_stage()));
                    pipeline.set_current_stage(StageId::Root);
                }),
            )
            .unwrap();

        pipeline.head_irq_disable();
        for irq in [4, 10, 9] {
            pipeline.enter(irq);
        }
    }

    #[test]
    fn dropping_to_root_carries_on_with_the_root_log() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let trace = Trace::default();

        log_demotion(&pipeline, &trace);
        assert!(trace.lock().is_empty());
        pipeline.head_irq_enable();

        assert_eq!(*trace.lock(), [(9, StageId::Head), (4, StageId::Root)]);
        assert!(pipeline.on_root_stage());
        assert!(!pipeline.is_stalled(StageId::Root));
        // The rest of the head log stays with the stage the handler left.
        assert!(pipeline.is_stalled(StageId::Head));
        assert!(pipeline.is_pending(StageId::Head, 10));
    }

    #[test]
    fn dropping_to_a_stalled_root_ends_the_replay() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let trace = Trace::default();

        pipeline.root_irq_disable();
        log_demotion(&pipeline, &trace);
        pipeline.head_irq_enable();

        assert_eq!(*trace.lock(), [(9, StageId::Head)]);
        assert!(pipeline.on_root_stage());
        assert!(pipeline.is_stalled(StageId::Root));
        assert!(pipeline.is_pending(StageId::Root, 4));
        assert!(pipeline.is_stalled(StageId::Head));
        assert!(pipeline.is_pending(StageId::Head, 10));
    }

    #[test]
    #[should_panic(expected = "moved the CPU up to the head stage")]
    fn climbing_to_head_from_a_root_handler_is_fatal() {
        let config = PipelineConfig::new(1).with_debug_checks(true);
        let (machine, pipeline) = sim::boot(config).unwrap();
        pipeline.install_stage("rt", &CLOCKING);
        pipeline
            .request_irq(
                4,
                IrqFlags::empty(),
                IrqAction::new("climber", |pipeline, _| {
                    pipeline.arch().hard_local_irq_disable();
                    pipeline.set_current_stage(StageId::Head);
                }),
            )
            .unwrap();

        machine.raise(CpuId::bsp(), 4);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unexpected re-entry")]
    fn replaying_a_stalled_stage_is_fatal() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();

        pipeline.root_irq_disable();
        pipeline.arch().hard_local_irq_disable();
        pipeline.sync_current();
    }
}
