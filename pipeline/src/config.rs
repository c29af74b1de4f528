// SPDX-License-Identifier: MPL-2.0

//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is either built programmatically or parsed from a
//! kernel command line. Recognized command-line arguments belong to the
//! `irq_pipeline` module and take the form `irq_pipeline.<key>=<value>`:
//!
//! | Key                 | Meaning                                            |
//! |---------------------|----------------------------------------------------|
//! | `nr_irqs`           | Number of IRQs the pending maps cover              |
//! | `synthetic_base`    | First IRQ number of the synthetic domain           |
//! | `work_buf_size`     | Size of the per-CPU deferred-work buffer in bytes  |
//! | `superlock_timeout` | Spin budget before the superlock restarts a round  |
//! | `overflow`          | `panic` or `drop`                                  |
//! | `debug_checks`      | `on`/`off`, `1`/`0`, or `true`/`false`             |
//!
//! Arguments of other modules are ignored.

use log::warn;

use crate::{irq::IrqNum, prelude::*, stage::PendingMap, work::RECORD_HEADER_SIZE, Error};

/// The default number of IRQs covered by the pending maps.
pub const DEFAULT_NR_IRQS: usize = 1024;
/// The default first IRQ of the synthetic domain.
pub const DEFAULT_SYNTHETIC_BASE: IrqNum = 768;
/// The default size in bytes of each per-CPU deferred-work buffer.
pub const DEFAULT_WORK_BUF_SIZE: usize = 2048;
/// The default number of spins a CPU waits for its peers in the superlock.
pub const DEFAULT_SUPERLOCK_TIMEOUT: usize = 1_000_000;

const MODULE_NAME: &str = "irq_pipeline";

/// What to do when a deferred-work record does not fit in its buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OverflowPolicy {
    /// Panic. This is the default with debug assertions.
    Panic,
    /// Drop the record and report [`Error::WorkOverflow`].
    Drop,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Drop
        }
    }
}

/// The configuration of a [`Pipeline`].
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// The number of CPUs, which sizes every per-CPU structure.
    pub nr_cpus: usize,
    /// The number of IRQs.
    pub nr_irqs: usize,
    /// The first IRQ number handed out by the synthetic domain.
    pub first_synthetic_irq: IrqNum,
    /// The size of each per-CPU deferred-work buffer in bytes.
    pub work_buf_size: usize,
    /// The number of spins before a superlock round is restarted.
    pub superlock_timeout: usize,
    /// The deferred-work overflow policy.
    pub overflow_policy: OverflowPolicy,
    /// Whether the context checks run, for instance [`Pipeline::check_root_only`].
    pub debug_checks: bool,
}

impl PipelineConfig {
    /// Creates a default configuration for `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            nr_irqs: DEFAULT_NR_IRQS,
            first_synthetic_irq: DEFAULT_SYNTHETIC_BASE,
            work_buf_size: DEFAULT_WORK_BUF_SIZE,
            superlock_timeout: DEFAULT_SUPERLOCK_TIMEOUT,
            overflow_policy: OverflowPolicy::default(),
            debug_checks: cfg!(debug_assertions),
        }
    }

    /// Sets the number of IRQs.
    pub fn with_nr_irqs(mut self, nr_irqs: usize) -> Self {
        self.nr_irqs = nr_irqs;
        self
    }

    /// Sets the first IRQ of the synthetic domain.
    pub fn with_first_synthetic_irq(mut self, irq: IrqNum) -> Self {
        self.first_synthetic_irq = irq;
        self
    }

    /// Sets the size of each per-CPU deferred-work buffer.
    pub fn with_work_buf_size(mut self, size: usize) -> Self {
        self.work_buf_size = size;
        self
    }

    /// Sets the superlock spin budget.
    pub fn with_superlock_timeout(mut self, spins: usize) -> Self {
        self.superlock_timeout = spins;
        self
    }

    /// Sets the deferred-work overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Turns the context checks on or off.
    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Checks that the configuration describes a usable pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0
            || self.nr_irqs == 0
            || self.nr_irqs > PendingMap::MAX_IRQS
            || self.first_synthetic_irq >= self.nr_irqs
            || self.work_buf_size < RECORD_HEADER_SIZE
            || self.superlock_timeout == 0
        {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }

    /// Builds a configuration for `nr_cpus` CPUs from a kernel command line.
    ///
    /// Unknown keys of the `irq_pipeline` module are reported and skipped.
    /// A recognized key with a malformed value fails the whole parse.
    pub fn from_cmdline(nr_cpus: usize, cmdline: &str) -> Result<Self> {
        let mut config = Self::new(nr_cpus);

        for arg in cmdline.split_whitespace() {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            let Some((module, key)) = key.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }

            match key {
                "nr_irqs" => config.nr_irqs = parse_number(value)?,
                "synthetic_base" => config.first_synthetic_irq = parse_number(value)?,
                "work_buf_size" => config.work_buf_size = parse_number(value)?,
                "superlock_timeout" => config.superlock_timeout = parse_number(value)?,
                "overflow" => {
                    config.overflow_policy = match value {
                        "panic" => OverflowPolicy::Panic,
                        "drop" => OverflowPolicy::Drop,
                        _ => return Err(Error::InvalidArgs),
                    }
                }
                "debug_checks" => config.debug_checks = parse_switch(value)?,
                _ => warn!("{}: unknown option '{}' skipped", MODULE_NAME, key),
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number(value: &str) -> Result<usize> {
    let value = value.replace('_', "");
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| Error::InvalidArgs)
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(Error::InvalidArgs),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cmdline_overrides_defaults() {
        let config = PipelineConfig::from_cmdline(
            4,
            "console=ttyS0 irq_pipeline.nr_irqs=8192 irq_pipeline.synthetic_base=0x1f00 \
             irq_pipeline.overflow=drop irq_pipeline.debug_checks=off init=/bin/sh",
        )
        .unwrap();

        assert_eq!(config.nr_cpus, 4);
        assert_eq!(config.nr_irqs, 8192);
        assert_eq!(config.first_synthetic_irq, 0x1f00);
        assert_eq!(config.work_buf_size, DEFAULT_WORK_BUF_SIZE);
        assert_eq!(config.superlock_timeout, DEFAULT_SUPERLOCK_TIMEOUT);
        assert_eq!(config.overflow_policy, OverflowPolicy::Drop);
        assert!(!config.debug_checks);
    }

    #[test]
    fn cmdline_ignores_unknown_keys() {
        let config =
            PipelineConfig::from_cmdline(1, "irq_pipeline.frobnicate=1 other.nr_irqs=3").unwrap();
        assert_eq!(config.nr_irqs, DEFAULT_NR_IRQS);
    }

    #[test]
    fn cmdline_rejects_malformed_values() {
        assert_eq!(
            PipelineConfig::from_cmdline(1, "irq_pipeline.nr_irqs=lots").unwrap_err(),
            Error::InvalidArgs
        );
        assert_eq!(
            PipelineConfig::from_cmdline(1, "irq_pipeline.overflow=maybe").unwrap_err(),
            Error::InvalidArgs
        );
    }

    #[test]
    fn synthetic_base_must_lie_below_nr_irqs() {
        let config = PipelineConfig::new(1)
            .with_nr_irqs(64)
            .with_first_synthetic_irq(64);
        assert_eq!(config.validate(), Err(Error::InvalidArgs));
        assert!(config.with_first_synthetic_irq(48).validate().is_ok());
    }

    #[test]
    fn pending_map_capacity_bounds_nr_irqs() {
        let config = PipelineConfig::new(1).with_nr_irqs(PendingMap::MAX_IRQS + 1);
        assert_eq!(config.validate(), Err(Error::InvalidArgs));
    }
}
