use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::latch::{ExclusiveLatchGuard, SharedLatchGuard};
use crate::common::{Lsn, PageId};

use super::frame::FrameHeader;

/// Callback invoked when a guard is dropped.
type ReleaseCallback = Box<dyn FnOnce(PageId) + Send + Sync>;

/// Callback invoked when a write guard marks the page modified at an LSN.
type DirtyCallback = Box<dyn Fn(Lsn) + Send + Sync>;

struct PageGuardBase {
    page_id: PageId,
    /// Keeps the frame alive for the transmuted guards below.
    _frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
}

impl PageGuardBase {
    fn new(page_id: PageId, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            page_id,
            _frame: frame,
            release_callback: Some(release_callback),
        }
    }

    fn drop_impl(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id);
        }
    }
}

/// RAII guard for shared access to a page: shared page latch plus a read
/// lock on the frame bytes. Unfixes the frame when dropped.
pub struct ReadPageGuard {
    base: PageGuardBase,
    _latch: SharedLatchGuard<'static>,
    data_guard: RwLockReadGuard<'static, Box<[u8]>>,
}

impl ReadPageGuard {
    /// # Safety
    /// The frame must outlive the guard; the Arc in the base ensures it.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        let latch: SharedLatchGuard<'static> =
            std::mem::transmute(frame.latch().acquire_shared());
        let data_guard: RwLockReadGuard<'static, Box<[u8]>> =
            std::mem::transmute(frame.data.read());
        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            _latch: latch,
            data_guard,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard[..]
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        self.base.drop_impl();
    }
}

/// RAII guard for exclusive access to a page: exclusive page latch plus a
/// write lock on the frame bytes.
///
/// Mutators follow the WAL discipline: append the redo record first, then
/// change the bytes, then call [`mark_dirty`](Self::mark_dirty) with the
/// record's LSN so the frame lands on the flush list.
pub struct WritePageGuard {
    base: PageGuardBase,
    latch: Option<ExclusiveLatchGuard<'static>>,
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8]>>>,
    dirty_callback: DirtyCallback,
}

impl WritePageGuard {
    /// # Safety
    /// The frame must outlive the guard; the Arc in the base ensures it.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
        dirty_callback: DirtyCallback,
    ) -> Self {
        let latch: ExclusiveLatchGuard<'static> =
            std::mem::transmute(frame.latch().acquire_exclusive());
        let data_guard: RwLockWriteGuard<'static, Box<[u8]>> =
            std::mem::transmute(frame.data.write());
        Self {
            base: PageGuardBase::new(page_id, frame, release_callback),
            latch: Some(latch),
            data_guard: Some(data_guard),
            dirty_callback,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.base.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Records that the page now carries modifications up to `lsn`.
    pub fn mark_dirty(&self, lsn: Lsn) {
        (self.dirty_callback)(lsn);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Release the byte lock and latch before the unfix callback runs.
        self.data_guard.take();
        self.latch.take();
        self.base.drop_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FrameId, PageNo, SpaceId};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn pid() -> PageId {
        PageId::new(SpaceId::new(0), PageNo::new(1))
    }

    #[test]
    fn test_read_guard_releases() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0), 1024));
        let mut init = vec![0u8; 1024];
        init[0] = 42;
        frame.copy_from(&init);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let guard = unsafe {
            ReadPageGuard::new(
                pid(),
                frame.clone(),
                Box::new(move |_| released_clone.store(true, Ordering::SeqCst)),
            )
        };
        assert_eq!(guard.data()[0], 42);
        assert!(!released.load(Ordering::SeqCst));
        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_guard_marks_dirty() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0), 1024));
        let marked = Arc::new(AtomicU64::new(0));
        let marked_clone = marked.clone();

        let mut guard = unsafe {
            WritePageGuard::new(
                pid(),
                frame.clone(),
                Box::new(|_| {}),
                Box::new(move |lsn| marked_clone.store(lsn, Ordering::SeqCst)),
            )
        };
        guard.data_mut()[0] = 7;
        guard.mark_dirty(123);
        assert_eq!(marked.load(Ordering::SeqCst), 123);
        drop(guard);

        let mut out = vec![0u8; 1024];
        frame.copy_to(&mut out);
        assert_eq!(out[0], 7);
    }

    #[test]
    fn test_read_guards_share() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0), 1024));
        let a = unsafe { ReadPageGuard::new(pid(), frame.clone(), Box::new(|_| {})) };
        let b = unsafe { ReadPageGuard::new(pid(), frame.clone(), Box::new(|_| {})) };
        assert_eq!(a.data().len(), b.data().len());
    }
}
