// SPDX-License-Identifier: MPL-2.0

//! The interrupt log of a stage context.
//!
//! The log is a hierarchical bitmap of 64-bit words. The bottom level
//! (`lomap`) has one bit per IRQ. Each bit of an upper level tells whether
//! the corresponding word of the level below is non-zero:
//!
//! ```text
//!               himap (1 word)
//!        ┌───────────┴───────────┐
//!    mdmap[0]    ...         mdmap[63]      (3-level layout only)
//!   ┌────┴────┐
//! lomap[0] ... lomap[63]
//! ```
//!
//! Two levels cover up to 4096 IRQs, three levels up to 262144. Finding the
//! lowest pending IRQ walks one word per level with `trailing_zeros`.
//!
//! A log is only ever mutated by the CPU owning it, with hard IRQs off. The
//! words are atomics so that other CPUs may inspect the log.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::irq::IrqNum;

type Word = u64;

const BITS_PER_WORD: usize = Word::BITS as usize;

/// A per-stage, per-CPU log of pending IRQs.
pub struct PendingMap {
    nr_irqs: usize,
    himap: AtomicU64,
    // Empty in the 2-level layout.
    mdmap: Box<[AtomicU64]>,
    lomap: Box<[AtomicU64]>,
}

impl PendingMap {
    /// The largest IRQ space a log can cover.
    pub const MAX_IRQS: usize = BITS_PER_WORD * BITS_PER_WORD * BITS_PER_WORD;

    /// Creates an empty log covering `nr_irqs` IRQs.
    ///
    /// # Panics
    ///
    /// This function panics if `nr_irqs` is zero or above [`Self::MAX_IRQS`].
    pub fn new(nr_irqs: usize) -> Self {
        assert!(
            nr_irqs > 0 && nr_irqs <= Self::MAX_IRQS,
            "unsupported IRQ space size"
        );

        let lo_words = nr_irqs.div_ceil(BITS_PER_WORD);
        let md_words = if lo_words <= BITS_PER_WORD {
            0
        } else {
            lo_words.div_ceil(BITS_PER_WORD)
        };

        Self {
            nr_irqs,
            himap: AtomicU64::new(0),
            mdmap: new_words(md_words),
            lomap: new_words(lo_words),
        }
    }

    /// Returns the number of levels of the bitmap, 2 or 3.
    pub fn levels(&self) -> usize {
        if self.mdmap.is_empty() {
            2
        } else {
            3
        }
    }

    /// Returns the number of IRQs covered by the log.
    pub fn capacity(&self) -> usize {
        self.nr_irqs
    }

    /// Logs `irq`.
    pub fn post(&self, irq: IrqNum) {
        debug_assert!(irq < self.nr_irqs, "IRQ{} is out of range", irq);

        let (lo_word, lo_bit) = split(irq);
        self.lomap[lo_word].fetch_or(lo_bit, Ordering::Relaxed);

        if self.levels() == 2 {
            self.himap.fetch_or(1 << lo_word, Ordering::Relaxed);
        } else {
            let (md_word, md_bit) = split(lo_word);
            self.mdmap[md_word].fetch_or(md_bit, Ordering::Relaxed);
            self.himap.fetch_or(1 << md_word, Ordering::Relaxed);
        }
    }

    /// Removes `irq` from the log, collapsing the ancestor bits of words
    /// becoming empty.
    pub fn clear(&self, irq: IrqNum) {
        debug_assert!(irq < self.nr_irqs, "IRQ{} is out of range", irq);

        let (lo_word, lo_bit) = split(irq);
        if self.lomap[lo_word].fetch_and(!lo_bit, Ordering::Relaxed) & !lo_bit != 0 {
            return;
        }

        if self.levels() == 2 {
            self.himap.fetch_and(!(1 << lo_word), Ordering::Relaxed);
            return;
        }

        let (md_word, md_bit) = split(lo_word);
        if self.mdmap[md_word].fetch_and(!md_bit, Ordering::Relaxed) & !md_bit == 0 {
            self.himap.fetch_and(!(1 << md_word), Ordering::Relaxed);
        }
    }

    /// Returns whether `irq` is logged.
    pub fn contains(&self, irq: IrqNum) -> bool {
        if irq >= self.nr_irqs {
            return false;
        }
        let (lo_word, lo_bit) = split(irq);
        self.lomap[lo_word].load(Ordering::Relaxed) & lo_bit != 0
    }

    /// Returns whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.himap.load(Ordering::Relaxed) == 0
    }

    /// Returns the lowest logged IRQ.
    pub fn lowest(&self) -> Option<IrqNum> {
        let hi = self.himap.load(Ordering::Relaxed);
        if hi == 0 {
            return None;
        }
        let hi_bit = hi.trailing_zeros() as usize;

        let lo_word = if self.levels() == 2 {
            hi_bit
        } else {
            let md = self.mdmap[hi_bit].load(Ordering::Relaxed);
            debug_assert_ne!(md, 0, "inconsistent interrupt log");
            hi_bit * BITS_PER_WORD + md.trailing_zeros() as usize
        };

        let lo = self.lomap[lo_word].load(Ordering::Relaxed);
        debug_assert_ne!(lo, 0, "inconsistent interrupt log");
        Some(lo_word * BITS_PER_WORD + lo.trailing_zeros() as usize)
    }

    /// Removes and returns the lowest logged IRQ.
    pub fn pull_lowest(&self) -> Option<IrqNum> {
        let irq = self.lowest()?;
        self.clear(irq);
        Some(irq)
    }

    pub(crate) fn reset(&self) {
        self.himap.store(0, Ordering::Relaxed);
        for word in self.mdmap.iter().chain(self.lomap.iter()) {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn copy_from(&self, other: &PendingMap) {
        debug_assert_eq!(self.nr_irqs, other.nr_irqs);
        self.himap
            .store(other.himap.load(Ordering::Relaxed), Ordering::Relaxed);
        for (dst, src) in self
            .mdmap
            .iter()
            .zip(other.mdmap.iter())
            .chain(self.lomap.iter().zip(other.lomap.iter()))
        {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl core::fmt::Debug for PendingMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingMap")
            .field("nr_irqs", &self.nr_irqs)
            .field("himap", &self.himap.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn new_words(count: usize) -> Box<[AtomicU64]> {
    (0..count).map(|_| AtomicU64::new(0)).collect()
}

const fn split(index: usize) -> (usize, Word) {
    (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
}

#[cfg(test)]
mod test {
    use alloc::{collections::BTreeSet, vec::Vec};

    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    fn snapshot(map: &PendingMap) -> (Word, Vec<Word>, Vec<Word>) {
        let load = |words: &[AtomicU64]| -> Vec<Word> {
            words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
        };
        (
            map.himap.load(Ordering::Relaxed),
            load(&map.mdmap[..]),
            load(&map.lomap[..]),
        )
    }

    #[test]
    fn layout_follows_irq_space() {
        assert_eq!(PendingMap::new(1).levels(), 2);
        assert_eq!(PendingMap::new(4096).levels(), 2);
        assert_eq!(PendingMap::new(4097).levels(), 3);
        assert_eq!(PendingMap::new(PendingMap::MAX_IRQS).levels(), 3);
    }

    #[test]
    #[should_panic(expected = "unsupported IRQ space size")]
    fn oversized_irq_space() {
        PendingMap::new(PendingMap::MAX_IRQS + 1);
    }

    #[test]
    fn lowest_follows_random_pending_sets() {
        let mut rng = SmallRng::seed_from_u64(0x1b7e_5eed);

        for nr_irqs in [64, 1000, 4096, 5000, 70_000] {
            let map = PendingMap::new(nr_irqs);
            let mut expected = BTreeSet::new();

            for _ in 0..2000 {
                let irq = rng.random_range(0..nr_irqs);
                if rng.random_bool(0.6) {
                    map.post(irq);
                    expected.insert(irq);
                } else {
                    map.clear(irq);
                    expected.remove(&irq);
                }
                assert_eq!(map.lowest(), expected.first().copied());
                assert_eq!(map.is_empty(), expected.is_empty());
            }

            let mut drained = Vec::new();
            while let Some(irq) = map.pull_lowest() {
                drained.push(irq);
            }
            assert_eq!(drained, expected.into_iter().collect::<Vec<_>>());
            assert_eq!(snapshot(&map), snapshot(&PendingMap::new(nr_irqs)));
        }
    }

    #[test]
    fn post_then_clear_restores_every_level() {
        for nr_irqs in [256, 10_000] {
            let map = PendingMap::new(nr_irqs);
            map.post(3);
            map.post(nr_irqs - 1);
            let before = snapshot(&map);

            for irq in [0, 64, 200, nr_irqs / 2, nr_irqs - 2] {
                map.post(irq);
                assert!(map.contains(irq));
                map.clear(irq);
                assert_eq!(snapshot(&map), before);
            }
        }
    }

    #[test]
    fn pull_lowest_collapses_ancestors() {
        let map = PendingMap::new(8192);
        map.post(4100);
        map.post(7);

        assert_eq!(map.pull_lowest(), Some(7));
        assert_eq!(map.lowest(), Some(4100));
        assert_eq!(map.pull_lowest(), Some(4100));
        assert_eq!(map.pull_lowest(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn copy_from_duplicates_the_log() {
        let source = PendingMap::new(5000);
        let target = PendingMap::new(5000);
        source.post(4999);
        source.post(12);

        target.copy_from(&source);
        assert_eq!(snapshot(&target), snapshot(&source));

        target.reset();
        assert!(target.is_empty());
        assert!(!target.contains(12));
    }
}
