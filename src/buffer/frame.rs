use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::common::latch::PageLatch;
use crate::common::{FrameId, Lsn, PageId, INVALID_LSN};

/// FrameHeader manages a single buffer frame: the page bytes plus the
/// fix counts and modification LSNs the flush pipeline keys off.
///
/// Dirty-page lifecycle: `set_modified` on the first change records the
/// oldest LSN (the flush-list key) and every later change advances the
/// newest LSN; `clear_dirty` on flush completion resets the oldest LSN
/// while the newest remains the page's on-disk LSN.
pub struct FrameHeader {
    frame_id: FrameId,
    page_id: RwLock<Option<PageId>>,
    /// Buffer-fix count: threads currently addressing the frame.
    buf_fix: AtomicU32,
    /// Set while a flush has the frame staged for write-out.
    io_fixed: AtomicBool,
    /// LSN of the first unflushed modification; INVALID_LSN when clean.
    oldest_lsn: AtomicU64,
    /// LSN of the latest modification.
    newest_lsn: AtomicU64,
    /// Access tick of the first touch, for old-sublist admission.
    first_access: AtomicU64,
    latch: PageLatch,
    pub(crate) data: RwLock<Box<[u8]>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: RwLock::new(None),
            buf_fix: AtomicU32::new(0),
            io_fixed: AtomicBool::new(false),
            oldest_lsn: AtomicU64::new(INVALID_LSN),
            newest_lsn: AtomicU64::new(INVALID_LSN),
            first_access: AtomicU64::new(0),
            latch: PageLatch::new(),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> Option<PageId> {
        *self.page_id.read()
    }

    pub fn set_page_id(&self, page_id: Option<PageId>) {
        *self.page_id.write() = page_id;
    }

    pub fn latch(&self) -> &PageLatch {
        &self.latch
    }

    pub fn buf_fix_count(&self) -> u32 {
        self.buf_fix.load(Ordering::Acquire)
    }

    pub fn fix(&self) -> u32 {
        self.buf_fix.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the fix count. None if it was already zero.
    pub fn unfix(&self) -> Option<u32> {
        loop {
            let current = self.buf_fix.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .buf_fix
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    pub fn is_io_fixed(&self) -> bool {
        self.io_fixed.load(Ordering::Acquire)
    }

    /// Claims the frame for write-out. False if another flush owns it.
    pub fn try_io_fix(&self) -> bool {
        self.io_fixed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn io_unfix(&self) {
        self.io_fixed.store(false, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_lsn.load(Ordering::Acquire) != INVALID_LSN
    }

    pub fn oldest_lsn(&self) -> Lsn {
        self.oldest_lsn.load(Ordering::Acquire)
    }

    pub fn newest_lsn(&self) -> Lsn {
        self.newest_lsn.load(Ordering::Acquire)
    }

    /// Records a modification at `lsn`. Returns true when this was the
    /// first modification since the frame was last clean, in which case
    /// the caller links the frame into the flush list keyed by `lsn`.
    pub fn set_modified(&self, lsn: Lsn) -> bool {
        self.newest_lsn.fetch_max(lsn, Ordering::AcqRel);
        self.oldest_lsn
            .compare_exchange(INVALID_LSN, lsn, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Flush completion: the frame is clean again.
    pub fn clear_dirty(&self) {
        self.oldest_lsn.store(INVALID_LSN, Ordering::Release);
    }

    pub fn first_access(&self) -> u64 {
        self.first_access.load(Ordering::Acquire)
    }

    pub fn note_first_access(&self, tick: u64) {
        self.first_access.store(tick, Ordering::Release);
    }

    pub fn copy_to(&self, out: &mut [u8]) {
        let guard = self.data.read();
        out.copy_from_slice(&guard[..]);
    }

    pub fn copy_from(&self, src: &[u8]) {
        let mut guard = self.data.write();
        guard.copy_from_slice(src);
    }

    pub fn reset(&self) {
        *self.page_id.write() = None;
        self.buf_fix.store(0, Ordering::Release);
        self.io_fixed.store(false, Ordering::Release);
        self.oldest_lsn.store(INVALID_LSN, Ordering::Release);
        self.newest_lsn.store(INVALID_LSN, Ordering::Release);
        self.first_access.store(0, Ordering::Release);
        self.data.write().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageNo, SpaceId};

    #[test]
    fn test_fix_unfix() {
        let frame = FrameHeader::new(FrameId::new(0), 1024);
        assert_eq!(frame.fix(), 1);
        assert_eq!(frame.fix(), 2);
        assert_eq!(frame.unfix(), Some(1));
        assert_eq!(frame.unfix(), Some(0));
        assert_eq!(frame.unfix(), None);
    }

    #[test]
    fn test_dirty_lifecycle() {
        let frame = FrameHeader::new(FrameId::new(0), 1024);
        assert!(!frame.is_dirty());

        // First modification pins the oldest LSN.
        assert!(frame.set_modified(100));
        assert!(!frame.set_modified(150));
        assert_eq!(frame.oldest_lsn(), 100);
        assert_eq!(frame.newest_lsn(), 150);
        assert!(frame.oldest_lsn() <= frame.newest_lsn());

        frame.clear_dirty();
        assert!(!frame.is_dirty());
        assert_eq!(frame.newest_lsn(), 150);

        // A later modification starts a new dirty episode.
        assert!(frame.set_modified(200));
        assert_eq!(frame.oldest_lsn(), 200);
    }

    #[test]
    fn test_newest_lsn_monotonic() {
        let frame = FrameHeader::new(FrameId::new(0), 1024);
        frame.set_modified(100);
        frame.set_modified(90);
        assert_eq!(frame.newest_lsn(), 100);
    }

    #[test]
    fn test_io_fix_exclusive() {
        let frame = FrameHeader::new(FrameId::new(0), 1024);
        assert!(frame.try_io_fix());
        assert!(!frame.try_io_fix());
        frame.io_unfix();
        assert!(frame.try_io_fix());
    }

    #[test]
    fn test_reset() {
        let frame = FrameHeader::new(FrameId::new(1), 1024);
        frame.set_page_id(Some(PageId::new(SpaceId::new(0), PageNo::new(5))));
        frame.fix();
        frame.set_modified(10);
        let data = vec![1u8; 1024];
        frame.copy_from(&data);

        frame.reset();
        assert_eq!(frame.page_id(), None);
        assert_eq!(frame.buf_fix_count(), 0);
        assert!(!frame.is_dirty());
        let mut out = vec![9u8; 1024];
        frame.copy_to(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }
}
