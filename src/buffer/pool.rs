use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::latch::{LatchRank, RankedMutex};
use crate::common::{EngineConfig, EngineError, FrameId, PageId, Result, SpaceId};
use crate::page::{checksum, ChecksumAlgorithm};
use crate::storage::BlockDevice;

use super::flush_list::FlushList;
use super::frame::FrameHeader;
use super::lru::LruList;
use super::page_guard::{ReadPageGuard, WritePageGuard};

/// Page table and free list, guarded together at the buffer-pool rank.
struct PoolMaps {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

struct PoolState {
    frames: Vec<Arc<FrameHeader>>,
    maps: RankedMutex<PoolMaps>,
    lru: LruList,
    flush_list: FlushList,
    /// Wakes free-frame and io-fix waiters on flush completion.
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    /// Registered by the flush engine; invoked when a caller needs a
    /// flush batch to refill the free list.
    flush_waker: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// The buffer pool: a fixed arena of frames addressed by index, a page
/// table, a young/old LRU and the flush list. Frames are never
/// reallocated; lists carry frame indices, not references.
pub struct BufferPool {
    page_size: usize,
    pool_size: usize,
    free_margin: usize,
    checksum: ChecksumAlgorithm,
    state: Arc<PoolState>,
    device: Arc<dyn BlockDevice>,
}

impl BufferPool {
    pub fn new(config: &EngineConfig, device: Arc<dyn BlockDevice>) -> Self {
        let mut frames = Vec::with_capacity(config.pool_size);
        let mut free_list = VecDeque::with_capacity(config.pool_size);
        for i in 0..config.pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id, config.page_size)));
            free_list.push_back(frame_id);
        }
        let state = Arc::new(PoolState {
            frames,
            maps: RankedMutex::new(
                LatchRank::BufferPool,
                PoolMaps {
                    page_table: HashMap::new(),
                    free_list,
                },
            ),
            lru: LruList::new(
                config.pool_size,
                config.old_sublist_eighths,
                config.old_admission_age,
            ),
            flush_list: FlushList::new(),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            flush_waker: Mutex::new(None),
        });
        Self {
            page_size: config.page_size,
            pool_size: config.pool_size,
            free_margin: config.free_list_margin,
            checksum: config.checksum,
            state,
            device,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.maps.lock().free_list.len()
    }

    pub fn flush_list(&self) -> &FlushList {
        &self.state.flush_list
    }

    pub fn lru(&self) -> &LruList {
        &self.state.lru
    }

    pub fn frame(&self, frame_id: FrameId) -> &Arc<FrameHeader> {
        &self.state.frames[frame_id.as_usize()]
    }

    /// Frame currently holding `page_id`, if resident.
    pub fn frame_of(&self, page_id: PageId) -> Option<FrameId> {
        self.state.maps.lock().page_table.get(&page_id).copied()
    }

    /// The flush engine registers a waker so blocked callers can demand a
    /// batch.
    pub fn register_flush_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        *self.state.flush_waker.lock() = Some(waker);
    }

    /// Allocates a fresh page in `space` and brings it into the pool.
    pub fn new_page(&self, space: SpaceId) -> Result<PageId> {
        let page_no = self.device.allocate(space, 1)?;
        let page_id = PageId::new(space, page_no);
        let frame_id = self.get_free_frame()?;
        let frame = &self.state.frames[frame_id.as_usize()];
        frame.reset();
        frame.set_page_id(Some(page_id));

        let mut maps = self.state.maps.lock();
        maps.page_table.insert(page_id, frame_id);
        self.state.lru.insert(frame_id);
        Ok(page_id)
    }

    /// Fetches a page for shared access.
    pub fn read_page(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let (frame_id, frame) = self.fetch_frame(page_id)?;
        let state = Arc::clone(&self.state);
        let guard = unsafe {
            ReadPageGuard::new(
                page_id,
                Arc::clone(frame),
                Box::new(move |_| {
                    state.frames[frame_id.as_usize()].unfix();
                }),
            )
        };
        Ok(guard)
    }

    /// Fetches a page for exclusive access. Blocks while the frame is
    /// io-fixed so a staged flush image cannot lose a late modification.
    pub fn write_page(&self, page_id: PageId) -> Result<WritePageGuard> {
        let (frame_id, frame) = self.fetch_frame(page_id)?;
        loop {
            self.wait_while_io_fixed(frame);

            // The flush-list link is deferred to guard drop: inserting
            // while the page latch is held would invert the lock order.
            // The frame stays buf-fixed until then, which keeps flush
            // batches away from the not-yet-linked dirty frame.
            let pending = Arc::new(std::sync::atomic::AtomicU64::new(0));
            let mark_pending = Arc::clone(&pending);
            let mark_state = Arc::clone(&self.state);
            let release_state = Arc::clone(&self.state);
            let guard = unsafe {
                WritePageGuard::new(
                    page_id,
                    Arc::clone(frame),
                    Box::new(move |_| {
                        let lsn = pending.swap(0, std::sync::atomic::Ordering::AcqRel);
                        if lsn != 0 {
                            release_state.flush_list.insert(lsn, frame_id);
                        }
                        release_state.frames[frame_id.as_usize()].unfix();
                    }),
                    Box::new(move |lsn| {
                        let frame = &mark_state.frames[frame_id.as_usize()];
                        if frame.set_modified(lsn) {
                            mark_pending.store(lsn, std::sync::atomic::Ordering::Release);
                        }
                    }),
                )
            };
            // A flush that io-fixed the frame before our latch holds its
            // staged image through completion; retreat and retry so no
            // modification slips in behind that image.
            if frame.is_io_fixed() {
                drop(guard); // also unfixes; restore the fetch fix
                frame.fix();
                continue;
            }
            return Ok(guard);
        }
    }

    /// Exposed flush completion: the doublewrite batch containing this
    /// page has fully hit the tablespace and been fsynced.
    pub fn page_flush_complete(&self, page_id: PageId) {
        let maps = self.state.maps.lock();
        if let Some(&frame_id) = maps.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            let oldest = frame.oldest_lsn();
            if oldest != crate::common::INVALID_LSN {
                self.state.flush_list.remove(oldest, frame_id);
                frame.clear_dirty();
            }
            frame.io_unfix();
        }
        drop(maps);
        self.state.wait_cond.notify_all();
    }

    /// True when free frames plus replaceable LRU-tail frames fall below
    /// the margin; callers then demand a flush batch before allocating.
    pub fn needs_flush_for_free(&self) -> bool {
        let free = self.free_frame_count();
        if free >= self.free_margin {
            return false;
        }
        let replaceable = self
            .state
            .lru
            .tail(self.free_margin * 2)
            .into_iter()
            .filter(|f| {
                let frame = &self.state.frames[f.as_usize()];
                frame.buf_fix_count() == 0 && !frame.is_dirty() && !frame.is_io_fixed()
            })
            .count();
        free + replaceable < self.free_margin
    }

    // ----- internals -------------------------------------------------

    fn fetch_frame(&self, page_id: PageId) -> Result<(FrameId, &Arc<FrameHeader>)> {
        {
            let maps = self.state.maps.lock();
            if let Some(&frame_id) = maps.page_table.get(&page_id) {
                let frame = &self.state.frames[frame_id.as_usize()];
                frame.fix();
                self.state.lru.touch(frame_id);
                return Ok((frame_id, frame));
            }
        }

        // Miss: claim a frame, then read and verify the page image.
        let frame_id = self.get_free_frame()?;
        let frame = &self.state.frames[frame_id.as_usize()];
        frame.reset();
        let verified = {
            let mut buf = frame.data.write();
            match self.device.read(page_id.space, page_id.page_no, &mut buf[..]) {
                Ok(()) => {
                    if checksum::is_all_zero(&buf) || checksum::verify(self.checksum, &buf) {
                        Ok(())
                    } else {
                        Err(EngineError::Corrupted(
                            page_id,
                            "checksum mismatch on read".into(),
                        ))
                    }
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = verified {
            frame.reset();
            self.state.maps.lock().free_list.push_back(frame_id);
            return Err(e);
        }
        frame.set_page_id(Some(page_id));
        frame.fix();

        let mut maps = self.state.maps.lock();
        maps.page_table.insert(page_id, frame_id);
        self.state.lru.insert(frame_id);
        Ok((frame_id, frame))
    }

    /// Pops a free frame, evicting a clean LRU-tail frame if none remain.
    /// Blocks on the flush engine when everything is dirty or fixed.
    fn get_free_frame(&self) -> Result<FrameId> {
        for _ in 0..200 {
            {
                let mut maps = self.state.maps.lock();
                if let Some(frame_id) = maps.free_list.pop_front() {
                    return Ok(frame_id);
                }
                // Scan the LRU tail for a replaceable frame.
                for frame_id in self.state.lru.tail(16) {
                    let frame = &self.state.frames[frame_id.as_usize()];
                    if frame.buf_fix_count() == 0 && !frame.is_dirty() && !frame.is_io_fixed() {
                        if let Some(old_id) = frame.page_id() {
                            maps.page_table.remove(&old_id);
                        }
                        self.state.lru.remove(frame_id);
                        frame.reset();
                        return Ok(frame_id);
                    }
                }
            }
            // Everything replaceable is dirty: demand a flush and wait.
            if let Some(waker) = self.state.flush_waker.lock().as_ref() {
                waker();
            }
            let mut wait = self.state.wait_lock.lock();
            self.state
                .wait_cond
                .wait_for(&mut wait, Duration::from_millis(50));
        }
        Err(EngineError::BufferPoolFull)
    }

    fn wait_while_io_fixed(&self, frame: &Arc<FrameHeader>) {
        while frame.is_io_fixed() {
            let mut wait = self.state.wait_lock.lock();
            if !frame.is_io_fixed() {
                return;
            }
            self.state
                .wait_cond
                .wait_for(&mut wait, Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageNo;
    use crate::storage::FileBlockDevice;
    use tempfile::tempdir;

    fn make_pool(pool_size: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.page_size = 1024;
        config.pool_size = pool_size;
        let device = Arc::new(FileBlockDevice::new(dir.path(), config.page_size).unwrap());
        (dir, BufferPool::new(&config, device))
    }

    #[test]
    fn test_new_page_and_rw() {
        let (_dir, pool) = make_pool(8);
        let space = SpaceId::new(1);

        let page_id = pool.new_page(space).unwrap();
        assert_eq!(page_id.page_no, PageNo::new(0));

        {
            let mut guard = pool.write_page(page_id).unwrap();
            guard.data_mut()[100] = 42;
            guard.mark_dirty(10);
        }
        {
            let guard = pool.read_page(page_id).unwrap();
            assert_eq!(guard.data()[100], 42);
        }
    }

    #[test]
    fn test_dirty_tracking() {
        let (_dir, pool) = make_pool(8);
        let page_id = pool.new_page(SpaceId::new(1)).unwrap();

        {
            let mut guard = pool.write_page(page_id).unwrap();
            guard.data_mut()[0] = 1;
            guard.mark_dirty(100);
            guard.data_mut()[1] = 2;
            guard.mark_dirty(150);
        }
        let frame_id = pool.frame_of(page_id).unwrap();
        let frame = pool.frame(frame_id);
        assert_eq!(frame.oldest_lsn(), 100);
        assert_eq!(frame.newest_lsn(), 150);
        assert!(pool.flush_list().contains(100, frame_id));

        pool.page_flush_complete(page_id);
        assert!(!frame.is_dirty());
        assert!(pool.flush_list().is_empty());
    }

    #[test]
    fn test_unfix_on_guard_drop() {
        let (_dir, pool) = make_pool(8);
        let page_id = pool.new_page(SpaceId::new(1)).unwrap();

        let frame_id = pool.frame_of(page_id).unwrap();
        {
            let _g = pool.read_page(page_id).unwrap();
            assert_eq!(pool.frame(frame_id).buf_fix_count(), 1);
        }
        assert_eq!(pool.frame(frame_id).buf_fix_count(), 0);
    }

    #[test]
    fn test_eviction_of_clean_pages() {
        let (_dir, pool) = make_pool(3);
        let space = SpaceId::new(1);

        // Fill the pool with clean pages, then allocate one more.
        let pages: Vec<_> = (0..3).map(|_| pool.new_page(space).unwrap()).collect();
        assert_eq!(pool.free_frame_count(), 0);
        let extra = pool.new_page(space).unwrap();
        assert_eq!(extra.page_no, PageNo::new(3));

        // One of the original pages was evicted; it reads back from disk.
        let resident: usize = pages.iter().filter(|p| pool.frame_of(**p).is_some()).count();
        assert_eq!(resident, 2);
    }

    #[test]
    fn test_dirty_pages_survive_eviction_pressure() {
        let (_dir, pool) = make_pool(3);
        let space = SpaceId::new(1);

        let first = pool.new_page(space).unwrap();
        {
            let mut g = pool.write_page(first).unwrap();
            g.data_mut()[500] = 77;
            g.mark_dirty(10);
        }
        // Clean pages cycle through the remaining frames; the dirty page
        // is never replaced without a flush.
        for _ in 0..4 {
            pool.new_page(space).unwrap();
        }
        assert!(pool.frame_of(first).is_some());
        let g = pool.read_page(first).unwrap();
        assert_eq!(g.data()[500], 77);
    }

    #[test]
    fn test_corrupted_page_read_is_reported() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.page_size = 1024;
        config.pool_size = 4;
        let device = Arc::new(FileBlockDevice::new(dir.path(), config.page_size).unwrap());
        let pool = BufferPool::new(&config, device.clone());

        let space = SpaceId::new(1);
        device.allocate(space, 1).unwrap();
        let mut junk = vec![0u8; 1024];
        junk[0] = 0xFF;
        junk[500] = 0xAA;
        device.write(space, PageNo::new(0), &junk).unwrap();

        let err = pool.read_page(PageId::new(space, PageNo::new(0)));
        assert!(matches!(err, Err(EngineError::Corrupted(..))));
        // The claimed frame went back to the free list.
        assert_eq!(pool.free_frame_count(), 4);
    }
}
