//! Deferred retirement of GPU resources.
//!
//! A resource the CPU no longer needs may still be read by work already
//! submitted to any queue. Retired items are held here with the completion
//! stamp current at retirement time and only handed back for destruction or
//! reuse once every stamped queue class has passed its recorded value.

use strata_core::CompletionStamp;

/// An item waiting for the GPU to finish with it.
#[derive(Debug)]
pub struct Retired<T> {
    /// The retired item.
    pub item: T,
    /// Counter values that must all be passed before reuse.
    pub stamp: CompletionStamp,
}

/// Queue of items gated on multi-queue completion.
///
/// Stamps are only partially ordered (one queue can race ahead of another),
/// so every drain scans the whole queue instead of stopping at the first
/// unfinished entry.
#[derive(Debug)]
pub struct RetirementQueue<T> {
    pending: Vec<Retired<T>>,
}

impl<T> Default for RetirementQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RetirementQueue<T> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Queue an item until `stamp` has passed.
    pub fn retire(&mut self, item: T, stamp: CompletionStamp) {
        self.pending.push(Retired { item, stamp });
    }

    /// Remove and return every item whose stamp `completed` has passed,
    /// oldest first.
    pub fn drain_passed(&mut self, completed: &CompletionStamp) -> Vec<T> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|retired| retired.stamp.has_passed(completed));
        self.pending = waiting;
        ready.into_iter().map(|retired| retired.item).collect()
    }

    /// Remove and return every item regardless of its stamp.
    ///
    /// Only valid after the device has gone idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.take_all()
            .into_iter()
            .map(|retired| retired.item)
            .collect()
    }

    /// Remove every entry, keeping each item's stamp.
    pub fn take_all(&mut self) -> Vec<Retired<T>> {
        std::mem::take(&mut self.pending)
    }

    /// Number of items still waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Join of every pending stamp: once this passes, the queue drains fully.
    pub fn horizon(&self) -> CompletionStamp {
        self.pending
            .iter()
            .fold(CompletionStamp::ZERO, |acc, retired| acc.join(retired.stamp))
    }

    /// Iterate over the pending entries.
    pub fn iter(&self) -> impl Iterator<Item = &Retired<T>> + '_ {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_released_before_every_stamp_passes() {
        let mut queue = RetirementQueue::new();
        queue.retire("texture", CompletionStamp::new(3, 0, 2));

        assert!(queue
            .drain_passed(&CompletionStamp::new(3, 0, 1))
            .is_empty());
        assert!(queue
            .drain_passed(&CompletionStamp::new(2, 9, 9))
            .is_empty());
        assert_eq!(queue.len(), 1);

        assert_eq!(
            queue.drain_passed(&CompletionStamp::new(3, 0, 2)),
            vec!["texture"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn out_of_order_completion_across_queues() {
        let mut queue = RetirementQueue::new();
        queue.retire("graphics-heavy", CompletionStamp::new(10, 0, 0));
        queue.retire("copy-heavy", CompletionStamp::new(0, 0, 10));

        let ready = queue.drain_passed(&CompletionStamp::new(1, 0, 10));
        assert_eq!(ready, vec!["copy-heavy"]);
        let ready = queue.drain_passed(&CompletionStamp::new(10, 0, 10));
        assert_eq!(ready, vec!["graphics-heavy"]);
    }

    #[test]
    fn drain_preserves_retirement_order() {
        let mut queue = RetirementQueue::new();
        for i in 0..5 {
            queue.retire(i, CompletionStamp::new(i, 0, 0));
        }
        assert_eq!(
            queue.drain_passed(&CompletionStamp::new(3, 0, 0)),
            vec![0, 1, 2, 3]
        );
        assert_eq!(queue.drain_all(), vec![4]);
    }

    #[test]
    fn horizon_joins_stamps() {
        let mut queue = RetirementQueue::new();
        assert_eq!(queue.horizon(), CompletionStamp::ZERO);
        queue.retire((), CompletionStamp::new(4, 1, 0));
        queue.retire((), CompletionStamp::new(2, 0, 6));
        assert_eq!(queue.horizon(), CompletionStamp::new(4, 1, 6));
    }

    #[test]
    fn everything_reclaimed_once_counters_pass() {
        let mut queue = RetirementQueue::new();
        let mut state = 0xDEAD_BEEF_u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut completed = CompletionStamp::ZERO;
        let mut reclaimed = 0usize;
        for frame in 1..=64u64 {
            let stamp = CompletionStamp::new(frame, next() % (frame + 1), next() % (frame + 1));
            queue.retire(stamp, stamp);

            completed = completed.join(CompletionStamp::new(
                frame.saturating_sub(2),
                next() % (frame + 1),
                next() % (frame + 1),
            ));
            for released in queue.drain_passed(&completed) {
                assert!(released.has_passed(&completed));
                reclaimed += 1;
            }
        }

        let everything = CompletionStamp::new(u64::MAX, u64::MAX, u64::MAX);
        reclaimed += queue.drain_passed(&everything).len();
        assert_eq!(reclaimed, 64);
        assert!(queue.is_empty());
    }
}
