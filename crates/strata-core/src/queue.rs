//! Hardware queue classes and completion stamps.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Independent hardware execution stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueClass {
    /// Graphics queue (also capable of compute and copy work).
    Graphics,
    /// Async compute queue.
    Compute,
    /// Copy / transfer queue.
    Copy,
}

impl QueueClass {
    /// Every queue class in index order.
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Copy];

    /// Number of queue classes.
    pub const COUNT: usize = 3;

    /// Position of this class in per-class arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Copy => 2,
        }
    }

    /// Lowercase name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Copy => "copy",
        }
    }
}

/// Per-queue-class completion-counter values.
///
/// Used both for the stamp recorded on a retired resource and for the live
/// counters it is compared against. A zero field means "never touched by that
/// queue" and is passed by any counter value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct CompletionStamp {
    /// Graphics queue value.
    pub graphics: u64,
    /// Compute queue value.
    pub compute: u64,
    /// Copy queue value.
    pub copy: u64,
}

impl CompletionStamp {
    /// Stamp that every counter state has passed.
    pub const ZERO: Self = Self {
        graphics: 0,
        compute: 0,
        copy: 0,
    };

    /// Build a stamp from explicit per-class values.
    #[inline]
    #[must_use]
    pub const fn new(graphics: u64, compute: u64, copy: u64) -> Self {
        Self {
            graphics,
            compute,
            copy,
        }
    }

    /// Stamp touching a single queue class.
    #[must_use]
    pub fn only(class: QueueClass, value: u64) -> Self {
        let mut stamp = Self::ZERO;
        stamp.set(class, value);
        stamp
    }

    /// Value for one class.
    #[inline]
    #[must_use]
    pub const fn get(&self, class: QueueClass) -> u64 {
        match class {
            QueueClass::Graphics => self.graphics,
            QueueClass::Compute => self.compute,
            QueueClass::Copy => self.copy,
        }
    }

    /// Overwrite the value for one class.
    #[inline]
    pub fn set(&mut self, class: QueueClass, value: u64) {
        match class {
            QueueClass::Graphics => self.graphics = value,
            QueueClass::Compute => self.compute = value,
            QueueClass::Copy => self.copy = value,
        }
    }

    /// Field-wise maximum of two stamps.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        Self {
            graphics: self.graphics.max(other.graphics),
            compute: self.compute.max(other.compute),
            copy: self.copy.max(other.copy),
        }
    }

    /// Returns true once every class in `completed` has reached this stamp.
    ///
    /// This is a conjunction over all three classes: one queue racing ahead
    /// never releases a resource another queue may still read.
    #[inline]
    #[must_use]
    pub const fn has_passed(&self, completed: &Self) -> bool {
        self.graphics <= completed.graphics
            && self.compute <= completed.compute
            && self.copy <= completed.copy
    }

    /// Returns true if no queue has touched this stamp.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.graphics == 0 && self.compute == 0 && self.copy == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_indices_are_dense() {
        for (i, class) in QueueClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn passed_requires_every_class() {
        let stamp = CompletionStamp::new(5, 2, 9);
        assert!(!stamp.has_passed(&CompletionStamp::new(5, 2, 8)));
        assert!(!stamp.has_passed(&CompletionStamp::new(4, 100, 100)));
        assert!(stamp.has_passed(&CompletionStamp::new(5, 2, 9)));
        assert!(stamp.has_passed(&CompletionStamp::new(6, 3, 10)));
    }

    #[test]
    fn zero_stamp_always_passed() {
        assert!(CompletionStamp::ZERO.has_passed(&CompletionStamp::ZERO));
        assert!(CompletionStamp::ZERO.is_zero());
    }

    #[test]
    fn only_and_join() {
        let a = CompletionStamp::only(QueueClass::Compute, 4);
        assert_eq!(a, CompletionStamp::new(0, 4, 0));
        let b = CompletionStamp::new(3, 1, 7);
        assert_eq!(a.join(b), CompletionStamp::new(3, 4, 7));
        assert_eq!(a.join(b).get(QueueClass::Copy), 7);
    }
}
