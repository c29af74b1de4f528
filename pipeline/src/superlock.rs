// SPDX-License-Identifier: MPL-2.0

//! The superlock, a critical section spanning every online CPU.
//!
//! The owner of the superlock sends the critical IPI to every other online
//! CPU and waits for all of them to park in the IPI handler. The owner then
//! runs its critical section while nothing else runs anywhere. On release,
//! each parked CPU runs the sync callback passed by the owner, if any, before
//! resuming.
//!
//! A CPU may be unable to take the IPI for a while, e.g. when it spins with
//! interrupts masked on a lock the owner holds. If the peers do not show up
//! within the configured spin budget, the owner cancels the round and starts
//! a new one.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use log::{trace, warn};
use spin::Once;

use crate::{
    arch::{HardIrqFlags, PipelineArch},
    cpu::{AtomicCpuSet, CpuId, CpuSet},
    irq::IrqNum,
    prelude::*,
};

/// A callback run by every parked CPU when the superlock is released.
pub type SyncFn = dyn Fn(&Pipeline, CpuId) + Send + Sync;

pub(crate) struct SuperLock {
    /// The CPUs parked in the critical IPI handler.
    sync_map: AtomicCpuSet,
    /// The CPUs holding or waiting for the superlock.
    lock_map: AtomicCpuSet,
    /// The CPUs done with the current round.
    pass_map: AtomicCpuSet,
    /// Serializes the owners.
    ticket: AtomicBool,
    /// Held by the owner while the others are parked.
    barrier: AtomicBool,
    /// The nesting depth of the owner.
    count: AtomicUsize,
    /// The callback of the current round.
    ///
    /// Only the owner writes it, while holding the barrier or once no other
    /// CPU is left in the handler. The others read it after crossing the
    /// barrier.
    callback: UnsafeCell<Option<Arc<SyncFn>>>,
    ipi: Once<IrqNum>,
    timeout: usize,
    restarts: AtomicU64,
}

impl SuperLock {
    pub(crate) fn new(nr_cpus: usize, timeout: usize) -> Self {
        Self {
            sync_map: AtomicCpuSet::new(nr_cpus),
            lock_map: AtomicCpuSet::new(nr_cpus),
            pass_map: AtomicCpuSet::new(nr_cpus),
            ticket: AtomicBool::new(false),
            barrier: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            callback: UnsafeCell::new(None),
            ipi: Once::new(),
            timeout,
            restarts: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_ipi(&self, ipi: IrqNum) {
        self.ipi.call_once(|| ipi);
    }

    fn acquire_barrier(&self, arch: &dyn PipelineArch) {
        while self
            .barrier
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            arch.cpu_relax();
        }
    }

    fn release_barrier(&self) {
        self.barrier.store(false, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must own the superlock, and no other CPU may be between
    /// the barrier and its departure from the handler.
    unsafe fn set_callback(&self, callback: Option<Arc<SyncFn>>) {
        // SAFETY: The caller guarantees that no one else accesses the slot.
        unsafe { *self.callback.get() = callback };
    }

    /// # Safety
    ///
    /// The caller must have crossed the barrier of the current round and not
    /// yet left the handler.
    unsafe fn callback(&self) -> Option<Arc<SyncFn>> {
        // SAFETY: The owner does not write the slot until the caller leaves.
        unsafe { (*self.callback.get()).clone() }
    }
}

// SAFETY: The callback slot is only accessed under the superlock protocol,
// see `SuperLock::callback`. Every other field is `Sync` already.
unsafe impl Sync for SuperLock {}
// SAFETY: Same as above.
unsafe impl Send for SuperLock {}

/// A guard for the superlock.
///
/// Hard IRQs are masked on the owning CPU for as long as the guard lives.
#[clippy::has_significant_drop]
#[must_use]
pub struct SuperLockGuard<'a> {
    pipeline: &'a Pipeline,
    flags: HardIrqFlags,
    smp: bool,
    _not_send: PhantomData<*const ()>,
}

impl Pipeline {
    /// Acquires the superlock.
    ///
    /// Returns once every other online CPU is parked. When the guard is
    /// dropped, the parked CPUs run `sync` then resume. The superlock may be
    /// nested on the owning CPU.
    ///
    /// With a single CPU online, or before [`Pipeline::init`], this only
    /// masks hard IRQs.
    pub fn lock(&self, sync: Option<Arc<SyncFn>>) -> SuperLockGuard<'_> {
        let flags = self.arch.hard_local_irq_save();
        let ipi = self.superlock.ipi.get().copied();
        let smp = ipi.is_some() && self.arch.num_online_cpus() > 1;
        let guard = SuperLockGuard {
            pipeline: self,
            flags,
            smp,
            _not_send: PhantomData,
        };
        let Some(ipi) = ipi.filter(|_| smp) else {
            return guard;
        };

        let cpu = self.arch.this_cpu();
        let lock = &self.superlock;
        if !lock.lock_map.add(cpu, Ordering::AcqRel) {
            while lock.ticket.swap(true, Ordering::Acquire) {
                // Back off by a delay unique to this CPU, taking the IPI of
                // the current owner meanwhile.
                self.arch.hard_local_irq_enable();
                for _ in 0..=cpu.as_usize() {
                    self.arch.cpu_relax();
                }
                self.arch.hard_local_irq_disable();
            }
            self.superlock_rendezvous(cpu, ipi, sync);
        }
        lock.count.fetch_add(1, Ordering::AcqRel);

        guard
    }

    /// Returns the CPUs currently parked by the superlock.
    pub fn superlock_parked(&self) -> CpuSet {
        self.superlock.sync_map.load(Ordering::Acquire)
    }

    /// Returns how many superlock rounds were cancelled so far.
    pub fn superlock_restarts(&self) -> u64 {
        self.superlock.restarts.load(Ordering::Relaxed)
    }

    fn superlock_rendezvous(&self, cpu: CpuId, ipi: IrqNum, sync: Option<Arc<SyncFn>>) {
        let lock = &self.superlock;
        loop {
            let online = self.arch.online_cpus();
            let mut others = online.clone();
            others.remove(cpu);

            lock.acquire_barrier(&*self.arch);
            // SAFETY: We own the superlock and hold the barrier. The CPUs of
            // any earlier round have all left the handler.
            unsafe { lock.set_callback(sync.clone()) };
            lock.pass_map.store(&CpuSet::from(cpu), Ordering::Release);
            self.arch.send_ipi(ipi, &others);

            let mut spins = lock.timeout;
            while lock.sync_map.load(Ordering::Acquire) != others {
                if spins == 0 {
                    break;
                }
                spins -= 1;
                self.arch.cpu_relax();
            }
            if spins > 0 || lock.sync_map.load(Ordering::Acquire) == others {
                trace!("IRQ pipeline: CPU {} owns the superlock", cpu);
                return;
            }

            // Cancel the round. Every CPU must have consumed the IPI before
            // the next one starts, lest it runs a stale callback.
            lock.restarts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "IRQ pipeline: superlock round of CPU {} timed out, restarting",
                cpu
            );
            // SAFETY: We still hold the barrier.
            unsafe { lock.set_callback(None) };
            lock.release_barrier();
            while lock.pass_map.load(Ordering::Acquire) != online
                || !lock.sync_map.load(Ordering::Acquire).is_empty()
            {
                self.arch.cpu_relax();
            }
        }
    }

    /// Handles the critical IPI on a CPU other than the owner.
    pub(crate) fn superlock_sync_handler(&self, cpu: CpuId) {
        let lock = &self.superlock;
        lock.sync_map.add(cpu, Ordering::AcqRel);

        lock.acquire_barrier(&*self.arch);
        lock.release_barrier();

        // SAFETY: We crossed the barrier and are not gone from `sync_map`.
        let callback = unsafe { lock.callback() };
        if let Some(callback) = callback {
            callback(self, cpu);
        }

        lock.pass_map.add(cpu, Ordering::AcqRel);
        lock.sync_map.remove(cpu, Ordering::Release);
    }
}

impl Drop for SuperLockGuard<'_> {
    fn drop(&mut self) {
        let pipeline = self.pipeline;
        if self.smp {
            let lock = &pipeline.superlock;
            if lock.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                lock.release_barrier();
                while !lock.sync_map.load(Ordering::Acquire).is_empty() {
                    pipeline.arch.cpu_relax();
                }
                // SAFETY: We own the superlock and every parked CPU has left.
                unsafe { lock.set_callback(None) };
                lock.lock_map
                    .remove(pipeline.arch.this_cpu(), Ordering::Release);
                lock.ticket.store(false, Ordering::Release);
            }
        }
        pipeline.arch.hard_local_irq_restore(self.flags);
    }
}

#[cfg(test)]
mod test {
    use alloc::vec::Vec;
    use std::thread;

    use super::*;
    use crate::{
        arch::sim::{self, SimMachine},
        PipelineConfig,
    };

    fn counting_callback(counts: &Arc<Vec<AtomicUsize>>) -> Arc<SyncFn> {
        let counts = counts.clone();
        Arc::new(move |_: &Pipeline, cpu: CpuId| {
            counts[cpu.as_usize()].fetch_add(1, Ordering::Relaxed);
        })
    }

    fn spawn_idle_cpu(
        machine: &Arc<SimMachine>,
        pipeline: &Arc<Pipeline>,
        cpu: CpuId,
        stop: &Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let (ap, ap_machine, stop) = (pipeline.clone(), machine.clone(), stop.clone());
        machine.spawn_cpu(cpu, move || {
            ap.root_irq_enable();
            while !stop.load(Ordering::Acquire) {
                ap_machine.poll();
                thread::yield_now();
            }
        })
    }

    #[test]
    fn single_cpu_only_masks_hard_irqs() {
        let (machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let counts = Arc::new(alloc::vec![AtomicUsize::new(0)]);

        {
            let _guard = pipeline.lock(Some(counting_callback(&counts)));
            assert!(pipeline.arch().hard_irqs_disabled());
        }

        assert!(!pipeline.arch().hard_irqs_disabled());
        assert_eq!(counts[0].load(Ordering::Relaxed), 0);
        assert_eq!(machine.ipis_sent(), 0);
    }

    #[test]
    fn every_other_cpu_parks_then_runs_the_callback() {
        const NR_CPUS: usize = 4;
        let (machine, pipeline) = sim::boot(PipelineConfig::new(NR_CPUS)).unwrap();
        let counts: Arc<Vec<_>> = Arc::new((0..NR_CPUS).map(|_| AtomicUsize::new(0)).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let aps: Vec<_> = (1..NR_CPUS as u32)
            .map(|id| spawn_idle_cpu(&machine, &pipeline, CpuId::new(id), &stop))
            .collect();

        {
            let _guard = pipeline.lock(Some(counting_callback(&counts)));
            let others: CpuSet = (1..NR_CPUS as u32).map(CpuId::new).collect();
            assert_eq!(pipeline.superlock_parked(), others);
            assert!(counts.iter().all(|count| count.load(Ordering::Relaxed) == 0));

            {
                let _nested = pipeline.lock(None);
            }
            assert_eq!(pipeline.superlock_parked(), others);
        }

        assert!(pipeline.superlock_parked().is_empty());
        assert_eq!(counts[0].load(Ordering::Relaxed), 0);
        for count in &counts[1..] {
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        stop.store(true, Ordering::Release);
        for ap in aps {
            ap.join().unwrap();
        }
    }

    #[test]
    fn callback_does_not_outlive_its_round() {
        const NR_CPUS: usize = 3;
        let (machine, pipeline) = sim::boot(PipelineConfig::new(NR_CPUS)).unwrap();
        let counts: Arc<Vec<_>> = Arc::new((0..NR_CPUS).map(|_| AtomicUsize::new(0)).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let aps: Vec<_> = (1..NR_CPUS as u32)
            .map(|id| spawn_idle_cpu(&machine, &pipeline, CpuId::new(id), &stop))
            .collect();

        drop(pipeline.lock(Some(counting_callback(&counts))));
        drop(pipeline.lock(None));
        drop(pipeline.lock(Some(counting_callback(&counts))));

        for count in &counts[1..] {
            assert_eq!(count.load(Ordering::Relaxed), 2);
        }

        stop.store(true, Ordering::Release);
        for ap in aps {
            ap.join().unwrap();
        }
    }

    #[test]
    fn stuck_cpu_makes_the_round_restart() {
        let config = PipelineConfig::new(2).with_superlock_timeout(1000);
        let (machine, pipeline) = sim::boot(config).unwrap();
        let counts: Arc<Vec<_>> = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());
        let ready = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let (ap, ap_machine) = (pipeline.clone(), machine.clone());
        let (ap_ready, ap_stop) = (ready.clone(), stop.clone());
        let stuck = machine.spawn_cpu(CpuId::new(1), move || {
            // With the root stage stalled, the critical IPI is only logged.
            ap.root_irq_disable();
            ap.arch().hard_local_irq_enable();
            ap_ready.store(true, Ordering::Release);
            while ap.superlock_restarts() == 0 {
                ap_machine.poll();
                thread::yield_now();
            }
            ap.root_irq_enable();
            while !ap_stop.load(Ordering::Acquire) {
                ap_machine.poll();
                thread::yield_now();
            }
        });

        while !ready.load(Ordering::Acquire) {
            thread::yield_now();
        }
        drop(pipeline.lock(Some(counting_callback(&counts))));

        assert!(pipeline.superlock_restarts() >= 1);
        assert_eq!(counts[1].load(Ordering::Relaxed), 1);

        stop.store(true, Ordering::Release);
        stuck.join().unwrap();
    }
}
