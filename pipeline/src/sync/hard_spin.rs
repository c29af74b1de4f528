// SPDX-License-Identifier: MPL-2.0

use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{arch::HardIrqFlags, stage::StageId, Pipeline};

/// A spin lock which can be shared by every stage.
///
/// While the lock is held, hard IRQs are masked and the current stage is
/// stalled on the holder CPU, so that no handler of any stage may preempt
/// the holder and spin on the lock forever.
pub struct HardSpinLock<T: ?Sized> {
    lock: AtomicBool,
    val: UnsafeCell<T>,
}

impl<T> HardSpinLock<T> {
    /// Creates a new hard spin lock.
    pub const fn new(val: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> HardSpinLock<T> {
    /// Acquires the lock, masking hard IRQs and stalling the current stage.
    ///
    /// This method runs in a busy loop until the lock can be acquired.
    pub fn lock<'a>(&'a self, pipeline: &'a Pipeline) -> HardSpinLockGuard<'a, T> {
        let flags = pipeline.arch().hard_local_irq_save();
        self.acquire_lock(pipeline);

        let stage = pipeline.current_stage();
        let was_stalled = pipeline.this_context(stage).test_and_stall();
        HardSpinLockGuard {
            lock: self,
            pipeline,
            stage,
            was_stalled,
            flags,
            _not_send: PhantomData,
        }
    }

    fn acquire_lock(&self, pipeline: &Pipeline) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            pipeline.arch().cpu_relax();
        }
    }

    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for HardSpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HardSpinLock")
            .field("locked", &self.lock.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// SAFETY: Only a single lock holder is permitted to access the inner data.
unsafe impl<T: ?Sized + Send> Send for HardSpinLock<T> {}
// SAFETY: Same as above.
unsafe impl<T: ?Sized + Send> Sync for HardSpinLock<T> {}

/// The guard of a [`HardSpinLock`].
///
/// On drop, the lock is released, then the stall bit and the hard IRQ state
/// are restored. The log of the stage is not replayed.
#[clippy::has_significant_drop]
#[must_use]
pub struct HardSpinLockGuard<'a, T: ?Sized> {
    lock: &'a HardSpinLock<T>,
    pipeline: &'a Pipeline,
    stage: StageId,
    was_stalled: bool,
    flags: HardIrqFlags,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for HardSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &*self.lock.val.get() }
    }
}

impl<T: ?Sized> DerefMut for HardSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &mut *self.lock.val.get() }
    }
}

impl<T: ?Sized> Drop for HardSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_lock();
        if !self.was_stalled {
            self.pipeline.this_context(self.stage).unstall();
        }
        self.pipeline.arch().hard_local_irq_restore(self.flags);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for HardSpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod test {
    use alloc::{sync::Arc, vec::Vec};
    use std::thread;

    use super::*;
    use crate::{
        arch::{sim, Clocking},
        cpu::CpuId,
        irq::{IrqAction, IrqFlags},
        PipelineConfig,
    };

    #[test]
    fn holder_stalls_the_current_stage() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        let lock = HardSpinLock::new(Vec::new());
        let hits = Arc::new(HardSpinLock::new(0usize));
        let hits_in_handler = hits.clone();
        pipeline
            .request_irq(
                5,
                IrqFlags::empty(),
                IrqAction::new("counter", move |pipeline, _| {
                    *hits_in_handler.lock(pipeline) += 1;
                }),
            )
            .unwrap();

        {
            let mut guard = lock.lock(&pipeline);
            assert!(pipeline.arch().hard_irqs_disabled());
            assert!(pipeline.is_stalled(StageId::Root));
            guard.push(1);
            pipeline.post_event(StageId::Root, 5);
        }

        // Releasing the lock does not replay the log by itself.
        assert!(!pipeline.is_stalled(StageId::Root));
        assert!(!pipeline.arch().hard_irqs_disabled());
        assert_eq!(*hits.lock(&pipeline), 0);
        assert!(pipeline.is_pending(StageId::Root, 5));

        pipeline.root_irq_disable();
        pipeline.root_irq_enable();
        assert_eq!(*hits.lock(&pipeline), 1);
        assert_eq!(*lock.lock(&pipeline), [1]);
    }

    #[test]
    fn nested_lock_keeps_the_outer_stall() {
        let (_machine, pipeline) = sim::boot(PipelineConfig::new(1)).unwrap();
        pipeline.install_stage(
            "rt",
            &Clocking {
                hrclock_freq: 1_000_000,
                hrclock_name: "sim",
            },
        );
        let outer = HardSpinLock::new(());
        let inner = HardSpinLock::new(());

        pipeline.head_irq_disable();
        {
            let _outer = outer.lock(&pipeline);
            let _inner = inner.lock(&pipeline);
        }
        assert!(pipeline.head_irqs_disabled());
        // `head_irq_disable` only stalled the head stage.
        assert!(!pipeline.is_stalled(StageId::Root));
        pipeline.head_irq_enable();
    }

    #[test]
    fn counter_is_exclusive_across_cpus() {
        const NR_CPUS: u32 = 4;
        const ROUNDS: usize = 1000;
        let (machine, pipeline) = sim::boot(PipelineConfig::new(NR_CPUS as usize)).unwrap();
        let counter = Arc::new(HardSpinLock::new(0usize));

        let handles: Vec<_> = (1..NR_CPUS)
            .map(|id| {
                let (ap, counter) = (pipeline.clone(), counter.clone());
                machine.spawn_cpu(CpuId::new(id), move || {
                    for _ in 0..ROUNDS {
                        let mut count = counter.lock(&ap);
                        let seen = *count;
                        thread::yield_now();
                        *count = seen + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(&pipeline), (NR_CPUS as usize - 1) * ROUNDS);
    }
}
