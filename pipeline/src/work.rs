// SPDX-License-Identifier: MPL-2.0

//! Deferred work for the root stage.
//!
//! Code running over the head stage cannot call into root-only services.
//! Instead, it posts a small record to the deferred-work buffer of its CPU,
//! which is flushed by a synthetic IRQ as soon as the root stage accepts
//! IRQs again.
//!
//! Each buffer is bump-allocated: records are appended at the tail, and the
//! buffer is reset once the flush catches up with the tail. A record is a
//! header followed by the payload bytes:
//!
//! ```text
//! 0        4        8                16
//! +--------+--------+----------------+------------------
//! |  len   |  zero  |    handler     |  payload (len bytes)
//! +--------+--------+----------------+------------------
//! ```

use core::mem::size_of;

use log::warn;
use smallvec::SmallVec;
use spin::{Mutex, Once};

use crate::{
    config::OverflowPolicy,
    cpu::{local::CpuLocal, CpuId},
    irq::IrqNum,
    prelude::*,
    stage::StageId,
    Error,
};

/// The handler of a deferred-work record, called over the root stage with
/// the payload of the record.
pub type WorkHandler = fn(&Pipeline, &[u8]);

/// The size in bytes of a record header.
pub(crate) const RECORD_HEADER_SIZE: usize = 16;

struct WorkBuf {
    data: Box<[u8]>,
    /// Where the next flush resumes.
    head: usize,
    /// Where the next record is appended.
    tail: usize,
}

impl WorkBuf {
    fn new(size: usize) -> Self {
        Self {
            data: alloc::vec![0; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, handler: WorkHandler, payload: &[u8]) -> bool {
        let size = RECORD_HEADER_SIZE + payload.len();
        let Some(end) = self.tail.checked_add(size) else {
            return false;
        };
        if end > self.data.len() || payload.len() > u32::MAX as usize {
            return false;
        }

        let record = &mut self.data[self.tail..end];
        record[0..4].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
        record[4..8].fill(0);
        record[8..16].copy_from_slice(&(handler as usize as u64).to_ne_bytes());
        record[RECORD_HEADER_SIZE..].copy_from_slice(payload);
        self.tail = end;
        true
    }

    /// Takes the record at `head` out of the buffer.
    fn pop(&mut self) -> Option<(WorkHandler, SmallVec<[u8; 64]>)> {
        if self.head == self.tail {
            return None;
        }

        let header = &self.data[self.head..self.head + RECORD_HEADER_SIZE];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header[8..16]);
        let raw = u64::from_ne_bytes(raw) as usize;
        const _: () = assert!(size_of::<WorkHandler>() == size_of::<usize>());
        // SAFETY: The header was written by `push` from a valid `WorkHandler`
        // and the buffer is never written to outside of `push`.
        let handler = unsafe { core::mem::transmute::<usize, WorkHandler>(raw) };

        let start = self.head + RECORD_HEADER_SIZE;
        let payload = SmallVec::from_slice(&self.data[start..start + len]);
        self.head = start + len;
        Some((handler, payload))
    }

    fn backlog(&self) -> usize {
        self.tail - self.head
    }
}

pub(crate) struct WorkQueue {
    bufs: CpuLocal<Mutex<WorkBuf>>,
    sirq: Once<IrqNum>,
}

impl WorkQueue {
    pub(crate) fn new(nr_cpus: usize, buf_size: usize) -> Self {
        Self {
            bufs: CpuLocal::new_with(nr_cpus, |_| Mutex::new(WorkBuf::new(buf_size))),
            sirq: Once::new(),
        }
    }

    pub(crate) fn set_irq(&self, sirq: IrqNum) {
        self.sirq.call_once(|| sirq);
    }
}

impl Pipeline {
    /// Posts deferred work to the root stage of the current CPU.
    ///
    /// `handler` is called with a copy of `payload` over the root stage, in
    /// posting order with respect to the other records of this CPU. This may
    /// be called from any stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uninitialized`] before [`Pipeline::init`] and
    /// [`Error::WorkOverflow`] if the record does not fit in the buffer
    /// under [`OverflowPolicy::Drop`].
    ///
    /// # Panics
    ///
    /// This function panics if the record does not fit in the buffer under
    /// [`OverflowPolicy::Panic`].
    pub fn post_work(&self, handler: WorkHandler, payload: &[u8]) -> Result<()> {
        let sirq = *self.work.sirq.get().ok_or(Error::Uninitialized)?;

        let _stall = self.head_irq_save();
        let cpu = self.arch.this_cpu();
        let pushed = self.work.bufs.get_on_cpu(cpu).lock().push(handler, payload);
        if !pushed {
            match self.config.overflow_policy {
                OverflowPolicy::Panic => panic!(
                    "deferred work buffer overflow on CPU {} ({} payload bytes)",
                    cpu,
                    payload.len()
                ),
                OverflowPolicy::Drop => {
                    warn!(
                        "IRQ pipeline: deferred work buffer overflow on CPU {}, record dropped",
                        cpu
                    );
                    return Err(Error::WorkOverflow);
                }
            }
        }

        self.post_event(StageId::Root, sirq);
        Ok(())
    }

    /// Returns how many bytes of deferred work wait on `cpu`.
    pub fn work_backlog(&self, cpu: CpuId) -> usize {
        let _guard = self.disable_hard_local();
        self.work.bufs.get_on_cpu(cpu).lock().backlog()
    }

    /// Runs the deferred work of the current CPU.
    ///
    /// Records posted while flushing are left to the next flush, which is
    /// requested before returning.
    pub(crate) fn flush_work(&self) {
        let cpu = self.arch.this_cpu();
        let buf = self.work.bufs.get_on_cpu(cpu);

        let end = {
            let _guard = self.disable_hard_local();
            buf.lock().tail
        };

        loop {
            let record = {
                let _guard = self.disable_hard_local();
                let mut buf = buf.lock();
                if buf.head == end {
                    None
                } else {
                    buf.pop()
                }
            };
            let Some((handler, payload)) = record else {
                break;
            };
            handler(self, &payload);
        }

        let _guard = self.disable_hard_local();
        let mut buf = buf.lock();
        if buf.head == buf.tail {
            buf.head = 0;
            buf.tail = 0;
        } else if let Some(&sirq) = self.work.sirq.get() {
            drop(buf);
            self.post_event(StageId::Root, sirq);
        }
    }
}
