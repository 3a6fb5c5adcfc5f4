//! Per-queue-class completion counters.
//!
//! `submitted` is advanced by the CPU each time work is handed to a queue;
//! `completed` caches the last value polled from the backend. Polling is the
//! only way to learn that the GPU is done with something.

use std::sync::atomic::{AtomicU64, Ordering};

use strata_core::{CompletionStamp, QueueClass};

use crate::backend::Backend;
use crate::error::Result;

/// Submitted and completed counter values for every queue class.
#[derive(Debug, Default)]
pub struct CompletionCounters {
    submitted: [AtomicU64; QueueClass::COUNT],
    completed: [AtomicU64; QueueClass::COUNT],
}

impl CompletionCounters {
    /// Counters with nothing submitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `value` has been handed to `class`.
    ///
    /// Callers serialise submissions per class, so values arrive in order.
    pub fn mark_submitted(&self, class: QueueClass, value: u64) {
        self.submitted[class.index()].fetch_max(value, Ordering::AcqRel);
    }

    /// Value the next submission on `class` will signal.
    pub fn next_value(&self, class: QueueClass) -> u64 {
        self.submitted[class.index()].load(Ordering::Acquire) + 1
    }

    /// Last value handed to `class`.
    pub fn submitted_value(&self, class: QueueClass) -> u64 {
        self.submitted[class.index()].load(Ordering::Acquire)
    }

    /// Last submitted values of every class.
    ///
    /// A resource stamped with this is safe once everything already
    /// submitted anywhere has finished.
    pub fn submitted(&self) -> CompletionStamp {
        let mut stamp = CompletionStamp::ZERO;
        for class in QueueClass::ALL {
            stamp.set(class, self.submitted_value(class));
        }
        stamp
    }

    /// Completed values as of the last poll.
    pub fn completed(&self) -> CompletionStamp {
        let mut stamp = CompletionStamp::ZERO;
        for class in QueueClass::ALL {
            stamp.set(class, self.completed[class.index()].load(Ordering::Acquire));
        }
        stamp
    }

    /// Query every queue and refresh the cached completed values.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn poll<B: Backend>(&self, backend: &B) -> Result<CompletionStamp> {
        for class in QueueClass::ALL {
            let value = backend.completed_value(class)?;
            self.completed[class.index()].fetch_max(value, Ordering::AcqRel);
        }
        Ok(self.completed())
    }

    /// Returns true if `stamp` is passed according to the last poll.
    pub fn is_passed(&self, stamp: &CompletionStamp) -> bool {
        stamp.has_passed(&self.completed())
    }

    /// Block until every class has completed everything submitted so far.
    pub fn wait_all<B: Backend>(&self, backend: &B) -> Result<CompletionStamp> {
        for class in QueueClass::ALL {
            let value = self.submitted_value(class);
            if value > 0 {
                backend.wait(class, value)?;
            }
        }
        self.poll(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessBackend};

    #[test]
    fn submitted_tracks_marks() {
        let counters = CompletionCounters::new();
        assert_eq!(counters.next_value(QueueClass::Copy), 1);
        counters.mark_submitted(QueueClass::Copy, 1);
        counters.mark_submitted(QueueClass::Graphics, 4);
        assert_eq!(counters.submitted(), CompletionStamp::new(4, 0, 1));
        assert_eq!(counters.next_value(QueueClass::Copy), 2);
    }

    #[test]
    fn poll_reads_backend() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let counters = CompletionCounters::new();
        backend.signal(QueueClass::Compute, 3).unwrap();
        counters.mark_submitted(QueueClass::Compute, 3);
        assert_eq!(counters.poll(&backend).unwrap(), CompletionStamp::ZERO);
        assert!(!counters.is_passed(&CompletionStamp::only(QueueClass::Compute, 3)));

        backend.complete(QueueClass::Compute, 3);
        assert_eq!(counters.poll(&backend).unwrap().compute, 3);
        assert!(counters.is_passed(&CompletionStamp::only(QueueClass::Compute, 3)));
    }

    #[test]
    fn wait_all_blocks_until_completion() {
        let backend = std::sync::Arc::new(HeadlessBackend::new(CompletionMode::Manual));
        let counters = CompletionCounters::new();
        backend.signal(QueueClass::Graphics, 1).unwrap();
        counters.mark_submitted(QueueClass::Graphics, 1);

        let gpu = backend.clone();
        let worker = std::thread::spawn(move || gpu.complete_all());
        let completed = counters.wait_all(&*backend).unwrap();
        worker.join().unwrap();
        assert_eq!(completed.graphics, 1);
    }
}
