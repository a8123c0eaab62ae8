use std::collections::BTreeSet;

use crate::common::latch::{LatchRank, RankedMutex};
use crate::common::{FrameId, Lsn};

/// Dirty frames ordered by ascending oldest-modification LSN.
///
/// A frame is linked on its first modification and unlinked on flush
/// completion; its key never changes in between, so the set order is the
/// recovery low-water order: flushing the head advances the LSN up to
/// which the log can be truncated.
pub struct FlushList {
    inner: RankedMutex<BTreeSet<(Lsn, FrameId)>>,
}

impl FlushList {
    pub fn new() -> Self {
        Self {
            inner: RankedMutex::new(LatchRank::FlushList, BTreeSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn insert(&self, oldest_lsn: Lsn, frame: FrameId) {
        debug_assert_ne!(oldest_lsn, 0);
        self.inner.lock().insert((oldest_lsn, frame));
    }

    pub fn remove(&self, oldest_lsn: Lsn, frame: FrameId) -> bool {
        self.inner.lock().remove(&(oldest_lsn, frame))
    }

    /// Smallest oldest-LSN still dirty; the log must be retained from
    /// this point.
    pub fn oldest(&self) -> Option<(Lsn, FrameId)> {
        self.inner.lock().iter().next().copied()
    }

    /// Frames from the list tail (smallest LSNs first) whose oldest LSN
    /// is at or below `limit`, up to `max` of them.
    pub fn batch(&self, limit: Lsn, max: usize) -> Vec<(Lsn, FrameId)> {
        self.inner
            .lock()
            .iter()
            .take_while(|(lsn, _)| *lsn <= limit)
            .take(max)
            .copied()
            .collect()
    }

    pub fn contains(&self, oldest_lsn: Lsn, frame: FrameId) -> bool {
        self.inner.lock().contains(&(oldest_lsn, frame))
    }
}

impl Default for FlushList {
    fn default() -> Self {
        Self::new()
    }
}
