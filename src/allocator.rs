//! Per-file block index dispenser with a resumable checkpoint.
//!
//! Workers claim indices with [`PacketIndexAllocator::next`] and report them
//! with [`complete`](PacketIndexAllocator::complete) or give them back with
//! [`release`](PacketIndexAllocator::release). Contiguous completions fold into
//! the low-water mark: every index below it is done, so it is the only value
//! that needs persisting.
//!
//! `next` scans forward from the mark. The gap between the mark and the first
//! unclaimed index is bounded by the number of blocks in flight, not by file
//! size.

use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Default)]
struct AllocatorState {
    total_blocks: u64,
    low_water_mark: u64,
    working: HashSet<u64>,
    finished: HashSet<u64>,
}

#[derive(Debug, Default)]
pub struct PacketIndexAllocator {
    state: Mutex<AllocatorState>,
}

/// Number of `block_size` blocks needed to cover `total_length` bytes.
pub fn block_count(total_length: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    total_length.div_ceil(block_size)
}

impl PacketIndexAllocator {
    pub fn new(total_blocks: u64) -> Self {
        Self::resume(0, total_blocks)
    }

    /// Start from a persisted low-water mark; nothing below it is reissued.
    pub fn resume(low_water_mark: u64, total_blocks: u64) -> Self {
        let allocator = Self::default();
        allocator.reset(low_water_mark, total_blocks);
        allocator
    }

    /// Claim the lowest index that is neither in flight nor finished.
    /// Returns `None` once every index is done or claimed.
    pub fn next(&self) -> Option<u64> {
        let mut st = self.state.lock();
        let index =
            (st.low_water_mark..st.total_blocks).find(|i| !st.working.contains(i) && !st.finished.contains(i))?;
        st.working.insert(index);
        Some(index)
    }

    /// Mark `index` done and fold contiguous completions into the mark.
    /// Returns the low-water mark after folding.
    pub fn complete(&self, index: u64) -> u64 {
        let mut st = self.state.lock();
        if index < st.low_water_mark || index >= st.total_blocks {
            return st.low_water_mark;
        }
        st.working.remove(&index);
        st.finished.insert(index);
        loop {
            let mark = st.low_water_mark;
            if !st.finished.remove(&mark) {
                break;
            }
            st.low_water_mark += 1;
        }
        st.low_water_mark
    }

    /// Give back a claimed index after a transient failure.
    pub fn release(&self, index: u64) {
        self.state.lock().working.remove(&index);
    }

    pub fn reset(&self, low_water_mark: u64, total_blocks: u64) {
        let mut st = self.state.lock();
        st.total_blocks = total_blocks;
        st.low_water_mark = low_water_mark.min(total_blocks);
        st.working.clear();
        st.finished.clear();
    }

    pub fn low_water_mark(&self) -> u64 {
        self.state.lock().low_water_mark
    }

    pub fn total_blocks(&self) -> u64 {
        self.state.lock().total_blocks
    }

    pub fn is_complete(&self) -> bool {
        let st = self.state.lock();
        st.low_water_mark == st.total_blocks
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().working.len()
    }
}
