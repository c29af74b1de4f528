// SPDX-License-Identifier: MPL-2.0

//! IRQ descriptors, chips and the synthetic IRQ domain.
//!
//! Every IRQ number below [`PipelineConfig::nr_irqs`] owns a descriptor
//! holding its pipeline policy ([`IrqFlags`]), its chip, its action and
//! per-CPU hit counters. Descriptors are created with the pipeline and live
//! as long as it does.
//!
//! [`PipelineConfig::nr_irqs`]: crate::PipelineConfig::nr_irqs

pub mod chip;
pub(crate) mod desc;
mod guard;
pub(crate) mod synthetic;

pub use chip::{IrqChip, SyntheticChip};
pub use desc::{IrqAction, IrqEvent, IrqFlags};
pub use guard::HardIrqGuard;

/// The number of an IRQ, in `[0, nr_irqs)`.
pub type IrqNum = usize;
