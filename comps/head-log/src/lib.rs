// SPDX-License-Identifier: MPL-2.0

//! A logger that may be called from any stage of the IRQ pipeline.
//!
//! Writing to a console from the head stage would make the head stage wait
//! on root stage locks. Instead, records logged over the head stage, or with
//! hard IRQs off, are appended to a per-CPU text buffer. The buffer is
//! flushed to the sink by a synthetic IRQ as soon as the root stage takes
//! IRQs again.
//!
//! Over the root stage with hard IRQs on, records go straight to the sink.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{
    format,
    string::String,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU64, Ordering};

use irq_pipeline::{
    cpu::local::CpuLocal,
    prelude::{CpuId, IrqAction, IrqFlags, IrqNum, Pipeline, StageId},
    sync::HardSpinLock,
};
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// The default capacity in bytes of each per-CPU buffer.
pub const DEFAULT_BUF_CAPACITY: usize = 4096;

/// Where the logger writes the text eventually.
///
/// The sink is only called over the root stage.
pub trait LogSink: Send + Sync {
    /// Writes a chunk of text made of whole lines.
    fn write(&self, text: &str);
}

/// A logger safe to call from the head stage.
pub struct HeadSafeLogger {
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn LogSink>,
    level: LevelFilter,
    capacity: usize,
    bufs: CpuLocal<HardSpinLock<String>>,
    sirq: IrqNum,
    truncated: AtomicU64,
}

impl HeadSafeLogger {
    /// Creates a logger writing to `sink`, with a flush IRQ of its own.
    ///
    /// Records above `level` are discarded.
    pub fn new(
        pipeline: &Arc<Pipeline>,
        sink: Arc<dyn LogSink>,
        level: LevelFilter,
        capacity: usize,
    ) -> irq_pipeline::Result<Arc<Self>> {
        let sirq = pipeline.create_synthetic_irq()?;
        let logger = Arc::new(Self {
            pipeline: pipeline.clone(),
            sink,
            level,
            capacity,
            bufs: CpuLocal::new_with(pipeline.config().nr_cpus, |_| {
                HardSpinLock::new(String::new())
            }),
            sirq,
            truncated: AtomicU64::new(0),
        });

        let weak: Weak<Self> = Arc::downgrade(&logger);
        let requested = pipeline.request_irq(
            sirq,
            IrqFlags::empty(),
            IrqAction::new("head log flush", move |_, event| {
                if let Some(logger) = weak.upgrade() {
                    logger.flush_cpu(event.cpu);
                }
            }),
        );
        if let Err(err) = requested {
            let _ = pipeline.destroy_synthetic_irq(sirq);
            return Err(err);
        }

        Ok(logger)
    }

    /// Returns the IRQ flushing the buffers.
    pub fn flush_irq(&self) -> IrqNum {
        self.sirq
    }

    /// Returns how many records were cut short for lack of buffer space.
    pub fn truncated(&self) -> u64 {
        self.truncated.load(Ordering::Relaxed)
    }

    fn can_write_through(&self) -> bool {
        self.pipeline.on_root_stage() && !self.pipeline.arch().hard_irqs_disabled()
    }

    fn write_line(&self, line: &str) {
        let pipeline = &*self.pipeline;
        let direct = self.can_write_through();

        let mut buf = self.bufs.get_on_cpu(pipeline.this_cpu()).lock(pipeline);
        if direct {
            let backlog = core::mem::take(&mut *buf);
            drop(buf);
            if !backlog.is_empty() {
                self.sink.write(&backlog);
            }
            self.sink.write(line);
            return;
        }

        let was_empty = buf.is_empty();
        let room = self.capacity.saturating_sub(buf.len());
        if line.len() <= room {
            buf.push_str(line);
        } else {
            // A cut record still ends the line.
            let mut end = room.saturating_sub(1);
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            if end > 0 {
                buf.push_str(&line[..end]);
                buf.push('\n');
            }
            self.truncated.fetch_add(1, Ordering::Relaxed);
        }
        drop(buf);

        if was_empty {
            let _guard = pipeline.disable_hard_local();
            pipeline.post_event(StageId::Root, self.sirq);
        }
    }

    fn flush_cpu(&self, cpu: CpuId) {
        let text = core::mem::take(&mut *self.bufs.get_on_cpu(cpu).lock(&self.pipeline));
        if !text.is_empty() {
            self.sink.write(&text);
        }
    }
}

impl log::Log for HeadSafeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!("{:<5}: {}\n", record.level(), record.args());
        self.write_line(&line);
    }

    fn flush(&self) {
        if self.can_write_through() {
            self.flush_cpu(self.pipeline.this_cpu());
        }
    }
}

impl Drop for HeadSafeLogger {
    fn drop(&mut self) {
        let _ = self.pipeline.destroy_synthetic_irq(self.sirq);
    }
}

static LOGGER: Once<Arc<HeadSafeLogger>> = Once::new();

struct GlobalLogger;

static GLOBAL_LOGGER: GlobalLogger = GlobalLogger;

impl log::Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        LOGGER.get().is_some_and(|logger| logger.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if let Some(logger) = LOGGER.get() {
            logger.log(record);
        }
    }

    fn flush(&self) {
        if let Some(logger) = LOGGER.get() {
            logger.flush();
        }
    }
}

/// Makes `logger` the logger behind the `log` macros.
pub fn init(logger: Arc<HeadSafeLogger>) -> Result<(), SetLoggerError> {
    let level = logger.level;
    log::set_logger(&GLOBAL_LOGGER)?;
    LOGGER.call_once(|| logger);
    log::set_max_level(level);
    Ok(())
}
