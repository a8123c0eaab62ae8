use std::collections::VecDeque;

use crate::common::latch::{LatchRank, RankedMutex};
use crate::common::FrameId;

/// LRU list of file-state frames with a young/old split.
///
/// New frames enter at the head of the old sublist; a frame is promoted
/// to the young sublist only when it is touched again after living past
/// the admission age, which keeps one-shot scans from flooding the young
/// half. Eviction and FLUSH_LRU batches scan from the old tail.
pub struct LruList {
    inner: RankedMutex<LruInner>,
    /// Old sublist share of the total length, in 1/8ths.
    old_eighths: usize,
    admission_age: u64,
}

struct LruInner {
    /// Most-recently-used at the front.
    young: VecDeque<FrameId>,
    /// Admissions at the front, evictions from the back.
    old: VecDeque<FrameId>,
    tick: u64,
    /// First-touch tick per frame, indexed by frame id.
    first_touch: Vec<u64>,
}

impl LruList {
    pub fn new(capacity: usize, old_eighths: usize, admission_age: u64) -> Self {
        Self {
            inner: RankedMutex::new(
                LatchRank::LruList,
                LruInner {
                    young: VecDeque::new(),
                    old: VecDeque::new(),
                    tick: 0,
                    first_touch: vec![0; capacity],
                },
            ),
            old_eighths,
            admission_age,
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.young.len() + inner.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn old_len(&self) -> usize {
        self.inner.lock().old.len()
    }

    /// Admits a frame at the head of the old sublist.
    pub fn insert(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.first_touch[frame.as_usize()] = tick;
        inner.old.push_front(frame);
        self.rebalance(&mut inner);
    }

    /// Records an access. Old frames that have outlived the admission age
    /// move to the young head; young frames move back to the head.
    pub fn touch(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        if let Some(pos) = inner.young.iter().position(|&f| f == frame) {
            inner.young.remove(pos);
            inner.young.push_front(frame);
            return;
        }
        if let Some(pos) = inner.old.iter().position(|&f| f == frame) {
            let age = inner.tick - inner.first_touch[frame.as_usize()];
            if age >= self.admission_age {
                inner.old.remove(pos);
                inner.young.push_front(frame);
                self.rebalance(&mut inner);
            }
        }
    }

    pub fn remove(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.young.iter().position(|&f| f == frame) {
            inner.young.remove(pos);
        } else if let Some(pos) = inner.old.iter().position(|&f| f == frame) {
            inner.old.remove(pos);
        }
        self.rebalance(&mut inner);
    }

    /// Frames from the old tail, oldest first, up to `n`.
    pub fn tail(&self, n: usize) -> Vec<FrameId> {
        let inner = self.inner.lock();
        inner
            .old
            .iter()
            .rev()
            .chain(inner.young.iter().rev())
            .take(n)
            .copied()
            .collect()
    }

    /// Keeps the old sublist at its configured share by demoting from
    /// the young tail.
    fn rebalance(&self, inner: &mut LruInner) {
        let total = inner.young.len() + inner.old.len();
        let target_old = total * self.old_eighths / 8;
        while inner.old.len() < target_old {
            match inner.young.pop_back() {
                Some(f) => inner.old.push_front(f),
                None => break,
            }
        }
    }
}
