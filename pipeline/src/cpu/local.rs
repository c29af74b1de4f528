// SPDX-License-Identifier: MPL-2.0

//! CPU local storage.
//!
//! Every pipeline instance owns its per-CPU state, so this storage is a plain
//! array indexed by [`CpuId`] rather than a linker section. Objects can be
//! read from any CPU; mutating them is up to the inner types, which in this
//! crate are atomics or locks owned by the CPU the object belongs to.

use alloc::boxed::Box;

use super::CpuId;

/// An object with one instance per CPU.
pub struct CpuLocal<T> {
    slots: Box<[T]>,
}

impl<T> CpuLocal<T> {
    /// Creates the instances for `num_cpus` CPUs with `init`.
    pub fn new_with(num_cpus: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        let slots = (0..num_cpus)
            .map(|id| init(CpuId::new(id as u32)))
            .collect();
        Self { slots }
    }

    /// Gets the instance of the given CPU.
    ///
    /// # Panics
    ///
    /// This method panics if `cpu_id` is beyond the CPUs this object was
    /// created for.
    pub fn get_on_cpu(&self, cpu_id: CpuId) -> &T {
        &self.slots[cpu_id.as_usize()]
    }

    /// Returns the number of CPUs.
    pub fn num_cpus(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over the instances of all CPUs in ascending CPU order.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(id, slot)| (CpuId::new(id as u32), slot))
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for CpuLocal<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}
