// SPDX-License-Identifier: MPL-2.0

//! A simulated multiprocessor running on host threads.
//!
//! Each simulated CPU is bound to one host thread with [`SimMachine::bind`].
//! A CPU owns a hard IRQ enable bit and a mailbox of raised IRQs. Raised IRQs
//! are taken, one at a time and with hard IRQs masked, whenever the owning
//! thread enables hard IRQs, relaxes in a spin loop or calls
//! [`SimMachine::poll`].
//!
//! The machine boots with hard IRQs disabled on every CPU, like real
//! hardware does.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::{
    cell::Cell,
    collections::VecDeque,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
};

use spin::{Mutex, Once};

use super::PipelineArch;
use crate::{
    cpu::{local::CpuLocal, CpuId, CpuSet},
    irq::IrqNum,
    Pipeline, PipelineConfig, Result,
};

std::thread_local! {
    static BOUND_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

struct SimCpu {
    irqs_enabled: AtomicBool,
    online: AtomicBool,
    mailbox: Mutex<VecDeque<IrqNum>>,
}

/// A simulated machine.
pub struct SimMachine {
    cpus: CpuLocal<SimCpu>,
    pipeline: Once<Weak<Pipeline>>,
    ipis_sent: AtomicU64,
}

impl SimMachine {
    /// Creates a machine with `nr_cpus` online CPUs.
    pub fn new(nr_cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            cpus: CpuLocal::new_with(nr_cpus, |_| SimCpu {
                irqs_enabled: AtomicBool::new(false),
                online: AtomicBool::new(true),
                mailbox: Mutex::new(VecDeque::new()),
            }),
            pipeline: Once::new(),
            ipis_sent: AtomicU64::new(0),
        })
    }

    /// Connects the interrupt controller of the machine to `pipeline`.
    pub fn attach(&self, pipeline: &Arc<Pipeline>) {
        self.pipeline.call_once(|| Arc::downgrade(pipeline));
    }

    /// Binds the calling thread to `cpu`.
    ///
    /// # Panics
    ///
    /// This method panics if `cpu` does not exist.
    pub fn bind(&self, cpu: CpuId) {
        assert!(cpu.as_usize() < self.cpus.num_cpus(), "no such CPU");
        BOUND_CPU.with(|bound| bound.set(Some(cpu)));
    }

    /// Spawns a host thread bound to `cpu` and runs `f` on it.
    pub fn spawn_cpu<F, T>(self: &Arc<Self>, cpu: CpuId, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let machine = self.clone();
        thread::spawn(move || {
            machine.bind(cpu);
            f()
        })
    }

    /// Raises `irq` on `cpu`.
    ///
    /// If `cpu` is the calling CPU and its hard IRQs are enabled, the IRQ is
    /// taken before this method returns.
    pub fn raise(&self, cpu: CpuId, irq: IrqNum) {
        self.cpus.get_on_cpu(cpu).mailbox.lock().push_back(irq);
        if BOUND_CPU.with(Cell::get) == Some(cpu) {
            self.deliver(cpu);
        }
    }

    /// Takes the IRQs raised on the calling CPU if its hard IRQs are enabled.
    pub fn poll(&self) {
        self.deliver(self.this_cpu());
    }

    /// Brings `cpu` online or offline.
    pub fn set_online(&self, cpu: CpuId, online: bool) {
        self.cpus
            .get_on_cpu(cpu)
            .online
            .store(online, Ordering::Release);
    }

    /// Returns the number of IRQs raised on `cpu` but not taken yet.
    pub fn nr_raised(&self, cpu: CpuId) -> usize {
        self.cpus.get_on_cpu(cpu).mailbox.lock().len()
    }

    /// Returns the number of IPIs sent so far.
    pub fn ipis_sent(&self) -> u64 {
        self.ipis_sent.load(Ordering::Relaxed)
    }

    fn deliver(&self, cpu: CpuId) {
        let Some(pipeline) = self.pipeline.get().and_then(Weak::upgrade) else {
            return;
        };
        let sim_cpu = self.cpus.get_on_cpu(cpu);

        while sim_cpu.irqs_enabled.load(Ordering::Acquire) {
            let Some(irq) = sim_cpu.mailbox.lock().pop_front() else {
                break;
            };
            sim_cpu.irqs_enabled.store(false, Ordering::Release);
            pipeline.enter(irq);
            sim_cpu.irqs_enabled.store(true, Ordering::Release);
        }
    }
}

impl PipelineArch for SimMachine {
    fn this_cpu(&self) -> CpuId {
        BOUND_CPU
            .with(Cell::get)
            .expect("the thread is not bound to a simulated CPU")
    }

    fn online_cpus(&self) -> CpuSet {
        self.cpus
            .iter()
            .filter(|(_, cpu)| cpu.online.load(Ordering::Acquire))
            .map(|(id, _)| id)
            .collect()
    }

    fn hard_irqs_disabled(&self) -> bool {
        !self
            .cpus
            .get_on_cpu(self.this_cpu())
            .irqs_enabled
            .load(Ordering::Acquire)
    }

    fn hard_local_irq_disable(&self) {
        self.cpus
            .get_on_cpu(self.this_cpu())
            .irqs_enabled
            .store(false, Ordering::Release);
    }

    fn hard_local_irq_enable(&self) {
        let cpu = self.this_cpu();
        self.cpus
            .get_on_cpu(cpu)
            .irqs_enabled
            .store(true, Ordering::Release);
        self.deliver(cpu);
    }

    fn send_ipi(&self, irq: IrqNum, targets: &CpuSet) {
        for cpu in targets.iter() {
            if cpu.as_usize() >= self.cpus.num_cpus() {
                continue;
            }
            self.ipis_sent.fetch_add(1, Ordering::Relaxed);
            self.raise(cpu, irq);
        }
    }

    fn cpu_relax(&self) {
        if let Some(cpu) = BOUND_CPU.with(Cell::get) {
            self.deliver(cpu);
        }
        thread::yield_now();
    }
}

/// Boots a pipeline on a fresh simulated machine.
///
/// The calling thread is bound to the boot CPU. On return, the pipeline is
/// initialized and the root stage of the boot CPU is unstalled with hard
/// IRQs enabled.
pub fn boot(config: PipelineConfig) -> Result<(Arc<SimMachine>, Arc<Pipeline>)> {
    let machine = SimMachine::new(config.nr_cpus);
    let pipeline = Pipeline::new(config, machine.clone())?;
    machine.attach(&pipeline);
    machine.bind(CpuId::bsp());

    pipeline.init_early();
    pipeline.init()?;
    pipeline.root_irq_enable();

    Ok((machine, pipeline))
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicUsize;

    use super::*;
    use crate::irq::{IrqAction, IrqFlags};

    fn counting(pipeline: &Pipeline, irq: IrqNum) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_handler = hits.clone();
        pipeline
            .request_irq(
                irq,
                IrqFlags::empty(),
                IrqAction::new("counter", move |_, _| {
                    hits_in_handler.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
        hits
    }

    fn raise_from_outside(machine: &Arc<SimMachine>, cpu: CpuId, irq: IrqNum) {
        let machine = machine.clone();
        thread::spawn(move || machine.raise(cpu, irq))
            .join()
            .unwrap();
    }

    #[test]
    fn spinning_cpu_takes_its_raised_irqs() {
        let (machine, pipeline) = boot(PipelineConfig::new(1)).unwrap();
        let hits = counting(&pipeline, 7);

        raise_from_outside(&machine, CpuId::bsp(), 7);
        assert_eq!(machine.nr_raised(CpuId::bsp()), 1);

        pipeline.arch().cpu_relax();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(machine.nr_raised(CpuId::bsp()), 0);
    }

    #[test]
    fn masked_cpu_keeps_its_raised_irqs() {
        let (machine, pipeline) = boot(PipelineConfig::new(1)).unwrap();
        let hits = counting(&pipeline, 7);

        pipeline.arch().hard_local_irq_disable();
        raise_from_outside(&machine, CpuId::bsp(), 7);
        pipeline.arch().cpu_relax();
        machine.poll();
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        pipeline.arch().hard_local_irq_enable();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
