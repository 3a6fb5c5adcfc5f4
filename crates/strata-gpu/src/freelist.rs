//! Address-ordered, size-indexed free-list over one backing region.
//!
//! Every free block is present in both an offset-ordered map (for finding
//! neighbours on free) and a size-ordered set (for best-fit search on
//! allocate). Free blocks are always coalesced, so no two are adjacent, and
//! free plus allocated bytes always tile the region exactly.

use std::collections::{BTreeMap, BTreeSet};

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Free-list bookkeeping for one region of `size` bytes.
#[derive(Debug, Clone)]
pub struct FreeListRegion {
    size: u64,
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    allocated: u64,
}

impl FreeListRegion {
    /// A region that is entirely free.
    pub fn new(size: u64) -> Self {
        let mut region = Self {
            size,
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            allocated: 0,
        };
        if size > 0 {
            region.insert_free(0, size);
        }
        region
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove_free(&mut self, offset: u64, size: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    /// Reserve `size` bytes at an offset aligned to `alignment`.
    ///
    /// Picks the smallest free block whose aligned interior fits, scanning
    /// forward through larger blocks when alignment padding defeats the
    /// first candidate. Returns `None` if no block fits.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(alignment.is_power_of_two());
        if size == 0 || size > self.size {
            return None;
        }

        let (block_size, block_offset, aligned) = self
            .by_size
            .range((size, 0)..)
            .find_map(|&(block_size, block_offset)| {
                let aligned = align_up(block_offset, alignment);
                (aligned - block_offset + size <= block_size)
                    .then_some((block_size, block_offset, aligned))
            })?;

        self.remove_free(block_offset, block_size);

        let pad = aligned - block_offset;
        if pad > 0 {
            self.insert_free(block_offset, pad);
        }
        let remainder = block_size - pad - size;
        if remainder > 0 {
            self.insert_free(aligned + size, remainder);
        }

        self.allocated += size;
        Some(aligned)
    }

    /// Return `size` bytes at `offset` and coalesce with free neighbours.
    pub fn free(&mut self, offset: u64, size: u64) {
        debug_assert!(offset + size <= self.size, "free outside the region");
        debug_assert!(
            self.by_offset
                .range(..offset + size)
                .next_back()
                .map_or(true, |(&o, &s)| o + s <= offset),
            "double free at offset {offset}"
        );

        let mut start = offset;
        let mut length = size;

        let predecessor = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((pred_offset, pred_size)) = predecessor {
            if pred_offset + pred_size == offset {
                self.remove_free(pred_offset, pred_size);
                start = pred_offset;
                length += pred_size;
            }
        }

        if let Some(&succ_size) = self.by_offset.get(&(offset + size)) {
            self.remove_free(offset + size, succ_size);
            length += succ_size;
        }

        self.insert_free(start, length);
        self.allocated -= size;
    }

    /// Region size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently handed out.
    pub const fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Bytes currently free (including alignment pads).
    pub fn free_bytes(&self) -> u64 {
        self.by_offset.values().sum()
    }

    /// Returns true if nothing is allocated.
    pub const fn is_unused(&self) -> bool {
        self.allocated == 0
    }

    /// Number of distinct free blocks.
    pub fn free_block_count(&self) -> usize {
        self.by_offset.len()
    }

    /// Size of the largest free block.
    pub fn largest_free_block(&self) -> u64 {
        self.by_size.last().map_or(0, |&(size, _)| size)
    }

    /// Free blocks as `(offset, size)` in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset.iter().map(|(&o, &s)| (o, s))
    }

    /// Verify the tiling and coalescing invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.by_offset.len() != self.by_size.len() {
            return Err(format!(
                "index mismatch: {} by offset, {} by size",
                self.by_offset.len(),
                self.by_size.len()
            ));
        }
        let mut previous_end: Option<u64> = None;
        for (offset, size) in self.free_blocks() {
            if size == 0 {
                return Err(format!("empty free block at {offset}"));
            }
            if !self.by_size.contains(&(size, offset)) {
                return Err(format!("block {offset}+{size} missing from size index"));
            }
            if let Some(end) = previous_end {
                if end > offset {
                    return Err(format!("free blocks overlap at {offset}"));
                }
                if end == offset {
                    return Err(format!("adjacent free blocks at {offset}"));
                }
            }
            previous_end = Some(offset + size);
        }
        if previous_end.is_some_and(|end| end > self.size) {
            return Err("free block runs past the region".to_string());
        }
        if self.free_bytes() + self.allocated != self.size {
            return Err(format!(
                "{} free + {} allocated != {} total",
                self.free_bytes(),
                self.allocated,
                self.size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn alloc_free_alloc_reuses_offset() {
        let mut region = FreeListRegion::new(2 * MIB);
        let first = region.allocate(5000, 256).unwrap();
        region.free(first, 5000);
        assert_eq!(region.free_block_count(), 1);
        let second = region.allocate(5000, 256).unwrap();
        assert_eq!(first, second);
        region.check_invariants().unwrap();
    }

    #[test]
    fn alignment_pad_is_returned_to_the_free_list() {
        let mut region = FreeListRegion::new(4096);
        let a = region.allocate(10, 1).unwrap();
        assert_eq!(a, 0);
        let b = region.allocate(100, 256).unwrap();
        assert_eq!(b, 256);
        // pad 10..256 and tail 356..4096 are free
        assert_eq!(region.free_blocks().collect::<Vec<_>>(), vec![(10, 246), (356, 3740)]);
        region.check_invariants().unwrap();
    }

    #[test]
    fn best_fit_prefers_smallest_block() {
        let mut region = FreeListRegion::new(1000);
        let a = region.allocate(100, 1).unwrap();
        let _b = region.allocate(100, 1).unwrap();
        let c = region.allocate(300, 1).unwrap();
        let _d = region.allocate(100, 1).unwrap();
        region.free(a, 100);
        region.free(c, 300);
        // free: [0,100) [200,500) [600,1000)
        assert_eq!(region.allocate(90, 1), Some(0));
        assert_eq!(region.allocate(250, 1), Some(200));
    }

    #[test]
    fn scans_past_candidate_defeated_by_alignment() {
        let mut region = FreeListRegion::new(2048);
        let a = region.allocate(1, 1).unwrap();
        let b = region.allocate(64, 1).unwrap();
        let _c = region.allocate(1000, 1).unwrap();
        region.free(b, 64);
        assert_eq!(a, 0);
        // 64-byte hole at 1 cannot host a 64-byte block aligned to 64
        let aligned = region.allocate(64, 64).unwrap();
        assert_eq!(aligned % 64, 0);
        assert!(aligned >= 1001);
        region.check_invariants().unwrap();
    }

    #[test]
    fn free_coalesces_both_neighbours() {
        let mut region = FreeListRegion::new(300);
        let a = region.allocate(100, 1).unwrap();
        let b = region.allocate(100, 1).unwrap();
        let c = region.allocate(100, 1).unwrap();
        region.free(a, 100);
        region.free(c, 100);
        assert_eq!(region.free_block_count(), 2);
        region.free(b, 100);
        assert_eq!(region.free_blocks().collect::<Vec<_>>(), vec![(0, 300)]);
        assert!(region.is_unused());
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut region = FreeListRegion::new(1024);
        assert!(region.allocate(1024, 1).is_some());
        assert_eq!(region.allocate(1, 1), None);
        assert_eq!(region.allocate(0, 1), None);
        assert_eq!(FreeListRegion::new(16).allocate(32, 1), None);
    }

    #[test]
    fn invariants_hold_under_churn() {
        let mut region = FreeListRegion::new(2 * MIB);
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut state = 0x1234_5678_9ABC_DEF1_u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..4000 {
            if live.is_empty() || next() % 3 != 0 {
                let size = 1 + next() % 20_000;
                let alignment = 1 << (next() % 9);
                if let Some(offset) = region.allocate(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    live.push((offset, size));
                }
            } else {
                let index = (next() % live.len() as u64) as usize;
                let (offset, size) = live.swap_remove(index);
                region.free(offset, size);
            }
            region.check_invariants().unwrap();
            let allocated: u64 = live.iter().map(|&(_, s)| s).sum();
            assert_eq!(region.allocated_bytes(), allocated);
            assert_eq!(region.free_bytes() + allocated, region.size());
        }

        for (offset, size) in live.drain(..) {
            region.free(offset, size);
        }
        assert_eq!(region.free_blocks().collect::<Vec<_>>(), vec![(0, 2 * MIB)]);
    }
}
