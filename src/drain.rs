//! Event buffers between the lock-free fast path and the maintenance lock.
//!
//! Reads and writes against the index are recorded here and replayed against
//! the policy in batches. A four-state status word tells callers whether a
//! drain is already pending or running so they don't schedule redundant ones.

use crate::metrics::CacheMetrics;
use crate::node::PageRef;
use crate::sync::*;
use crate::util::*;
use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Nothing is buffered that a drain must see.
pub(crate) const IDLE: u8 = 0;
/// A drain must run soon.
pub(crate) const REQUIRED: u8 = 1;
/// A drain is running and nothing new arrived since it started.
pub(crate) const PROCESSING_TO_IDLE: u8 = 2;
/// A drain is running and more work arrived; another drain must follow.
pub(crate) const PROCESSING_TO_REQUIRED: u8 = 3;

/// Policy mutation recorded by a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    /// A load published this entry in the index.
    Add(PageRef),
    /// This entry was detached from the index and retired.
    Remove(PageRef),
}

pub(crate) struct DrainStatus {
    status: AtomicU8,
}

impl DrainStatus {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(IDLE),
        }
    }

    #[inline]
    pub fn get(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    pub fn compare_and_set(&self, expected: u8, status: u8) -> bool {
        self.status
            .compare_exchange(expected, status, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a read should trigger a drain. `delayable` is false when the
    /// read could not be buffered.
    pub fn should_drain_buffers(&self, delayable: bool) -> bool {
        match self.get() {
            IDLE => !delayable,
            REQUIRED => true,
            _ => false,
        }
    }

    /// Record that a write was buffered. Returns `true` if the caller must
    /// schedule a drain.
    ///
    /// | current                | on write                        |
    /// |------------------------|---------------------------------|
    /// | IDLE                   | → REQUIRED, schedule            |
    /// | REQUIRED               | schedule                        |
    /// | PROCESSING_TO_IDLE     | → PROCESSING_TO_REQUIRED        |
    /// | PROCESSING_TO_REQUIRED | nothing                         |
    pub fn after_write(&self, metrics: &CacheMetrics) -> bool {
        let result = retry_cas_u8(
            &self.status,
            |current| match current {
                IDLE => Some((REQUIRED, true)),
                PROCESSING_TO_IDLE => Some((PROCESSING_TO_REQUIRED, false)),
                _ => None,
            },
            CasRetryConfig::default(),
            metrics,
        );

        match result {
            CasResult::Success(schedule) => schedule,
            CasResult::Aborted(current) => current == REQUIRED,
            // Contended beyond the retry budget: a redundant drain is harmless
            CasResult::Failed(_) => true,
        }
    }
}

/// Lossy read buffer plus bounded write buffer.
pub(crate) struct Buffers {
    read_tx: Sender<PageRef>,
    read_rx: Receiver<PageRef>,
    read_capacity: usize,
    write_tx: Sender<WriteOp>,
    write_rx: Receiver<WriteOp>,
    write_capacity: usize,
}

impl Buffers {
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        let (read_tx, read_rx) = crossbeam_channel::bounded(read_capacity);
        let (write_tx, write_rx) = crossbeam_channel::bounded(write_capacity);
        Self {
            read_tx,
            read_rx,
            read_capacity,
            write_tx,
            write_rx,
            write_capacity,
        }
    }

    /// Buffer a read. Returns `false` if it was dropped because the buffer is full.
    pub fn record_read(&self, entry: PageRef, metrics: &CacheMetrics) -> bool {
        match self.read_tx.try_send(entry) {
            Ok(()) => true,
            Err(_) => {
                metrics.read_buffer_drops.increment();
                false
            }
        }
    }

    /// Buffer a write, handing it back if the buffer is full.
    pub fn try_record_write(&self, op: WriteOp) -> Result<(), WriteOp> {
        self.write_tx.try_send(op).map_err(|e| match e {
            TrySendError::Full(op) | TrySendError::Disconnected(op) => op,
        })
    }

    /// Buffered reads, at most one buffer's worth so a drain always terminates.
    pub fn drain_reads(&self) -> impl Iterator<Item = PageRef> + '_ {
        self.read_rx.try_iter().take(self.read_capacity)
    }

    pub fn drain_writes(&self) -> impl Iterator<Item = WriteOp> + '_ {
        self.write_rx.try_iter().take(self.write_capacity)
    }

    #[cfg(test)]
    pub fn pending_writes(&self) -> usize {
        self.write_rx.len()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn entry(slot: u32) -> PageRef {
        PageRef { slot, version: 1 }
    }

    #[test]
    fn write_transitions() {
        let metrics = CacheMetrics::new();
        let status = DrainStatus::new();

        assert!(status.after_write(&metrics));
        assert_eq!(status.get(), REQUIRED);
        assert!(status.after_write(&metrics));
        assert_eq!(status.get(), REQUIRED);

        status.set(PROCESSING_TO_IDLE);
        assert!(!status.after_write(&metrics));
        assert_eq!(status.get(), PROCESSING_TO_REQUIRED);
        assert!(!status.after_write(&metrics));
        assert_eq!(status.get(), PROCESSING_TO_REQUIRED);
    }

    #[test]
    fn reads_drain_only_when_needed() {
        let status = DrainStatus::new();
        assert!(!status.should_drain_buffers(true));
        assert!(status.should_drain_buffers(false));

        status.set(REQUIRED);
        assert!(status.should_drain_buffers(true));

        status.set(PROCESSING_TO_IDLE);
        assert!(!status.should_drain_buffers(false));
        status.set(PROCESSING_TO_REQUIRED);
        assert!(!status.should_drain_buffers(false));
    }

    #[test]
    fn read_buffer_is_lossy() {
        let metrics = CacheMetrics::new();
        let buffers = Buffers::new(2, 2);
        assert!(buffers.record_read(entry(0), &metrics));
        assert!(buffers.record_read(entry(1), &metrics));
        assert!(!buffers.record_read(entry(2), &metrics));
        assert_eq!(metrics.read_buffer_drops.value(), 1);

        let drained: Vec<_> = buffers.drain_reads().collect();
        assert_eq!(drained, vec![entry(0), entry(1)]);
        assert!(buffers.record_read(entry(2), &metrics));
    }

    #[test]
    fn full_write_buffer_returns_the_op() {
        let buffers = Buffers::new(1, 1);
        assert!(buffers.try_record_write(WriteOp::Add(entry(0))).is_ok());
        assert_eq!(
            buffers.try_record_write(WriteOp::Remove(entry(0))),
            Err(WriteOp::Remove(entry(0)))
        );
        assert_eq!(buffers.pending_writes(), 1);
        assert_eq!(buffers.drain_writes().collect::<Vec<_>>(), vec![WriteOp::Add(entry(0))]);
    }
}
