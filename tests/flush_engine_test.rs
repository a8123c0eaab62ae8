//! Flush pipeline scenarios: WAL ordering observed at the device, flush
//! batches under load, back-pressure bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use tessera::buffer::BufferPool;
use tessera::common::{EngineConfig, Lsn, PageId, PageNo, Result, SpaceId};
use tessera::flush::{DoublewriteBuffer, FlushEngine};
use tessera::page::{checksum, layout::fil, ChecksumAlgorithm};
use tessera::redo::{FileLogDevice, LogManager, RedoRecord};
use tessera::storage::{BlockDevice, FileBlockDevice};

/// Wraps the real device and snapshots the log's durable LSN at the
/// moment every data-page write begins.
struct WalProbeDevice {
    inner: FileBlockDevice,
    log: Arc<LogManager>,
    /// (page lsn stamped in the image, durable lsn when the write began),
    /// highest-lsn write wins.
    last_violation: AtomicU64,
    writes_seen: AtomicU64,
}

impl WalProbeDevice {
    fn check(&self, buf: &[u8]) {
        let page_lsn = fil::lsn(buf);
        if page_lsn == 0 {
            return; // never-stamped page (doublewrite block header etc.)
        }
        self.writes_seen.fetch_add(1, Ordering::Relaxed);
        if self.log.durable_lsn() < page_lsn {
            self.last_violation.store(page_lsn, Ordering::Relaxed);
        }
    }

    fn violations(&self) -> u64 {
        self.last_violation.load(Ordering::Relaxed)
    }
}

impl BlockDevice for WalProbeDevice {
    fn read(&self, space: SpaceId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        self.inner.read(space, page_no, buf)
    }

    fn write(&self, space: SpaceId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        self.check(buf);
        self.inner.write(space, page_no, buf)
    }

    fn write_many(&self, space: SpaceId, first: PageNo, buf: &[u8]) -> Result<()> {
        for page in buf.chunks(1024) {
            self.check(page);
        }
        self.inner.write_many(space, first, buf)
    }

    fn fsync(&self, space: SpaceId) -> Result<()> {
        self.inner.fsync(space)
    }

    fn allocate(&self, space: SpaceId, n_pages: u32) -> Result<PageNo> {
        self.inner.allocate(space, n_pages)
    }

    fn size_of(&self, space: SpaceId) -> Result<u32> {
        self.inner.size_of(space)
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.page_size = 1024;
    config.pool_size = 16;
    config.doublewrite_pages = 4;
    config
}

#[test]
fn test_wal_order_holds_at_the_device() {
    let dir = tempdir().unwrap();
    let config = config();

    let log_dev = Arc::new(FileLogDevice::new(dir.path().join("log")).unwrap());
    let log = Arc::new(LogManager::new(log_dev));

    let probe = Arc::new(WalProbeDevice {
        inner: FileBlockDevice::new(dir.path().join("data"), config.page_size).unwrap(),
        log: log.clone(),
        last_violation: AtomicU64::new(0),
        writes_seen: AtomicU64::new(0),
    });
    let device: Arc<dyn BlockDevice> = probe.clone();

    let pool = Arc::new(BufferPool::new(&config, device.clone()));
    let dblwr = Arc::new(
        DoublewriteBuffer::new(device.clone(), config.page_size, config.doublewrite_pages)
            .unwrap(),
    );
    let engine = FlushEngine::new(
        pool.clone(),
        log.clone(),
        dblwr,
        config,
        Arc::new(Default::default()),
    );

    // Modify pages at known LSNs, then flush. The probe records any page
    // write that began before the log was durable past the page's LSN.
    let space = SpaceId::new(1);
    for i in 0..6u32 {
        let page_id = pool.new_page(space).unwrap();
        let lsn = log.append(&RedoRecord::CompletedGci { gci: 100 + i }).unwrap();
        let mut guard = pool.write_page(page_id).unwrap();
        guard.data_mut()[64] = i as u8;
        guard.mark_dirty(lsn);
    }
    assert!(log.durable_lsn() < log.written_lsn());

    engine.flush_list_batch(Lsn::MAX, 32).unwrap();

    assert!(probe.writes_seen.load(Ordering::Relaxed) > 0);
    assert_eq!(
        probe.violations(),
        0,
        "a page image reached the device before its log was durable"
    );
}

#[test]
fn test_flushed_images_verify_and_carry_lsn() {
    let dir = tempdir().unwrap();
    let config = config();

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path().join("data"), config.page_size).unwrap());
    let log_dev = Arc::new(FileLogDevice::new(dir.path().join("log")).unwrap());
    let log = Arc::new(LogManager::new(log_dev));
    let pool = Arc::new(BufferPool::new(&config, device.clone()));
    let dblwr = Arc::new(
        DoublewriteBuffer::new(device.clone(), config.page_size, config.doublewrite_pages)
            .unwrap(),
    );
    let engine = FlushEngine::new(
        pool.clone(),
        log.clone(),
        dblwr,
        config,
        Arc::new(Default::default()),
    );

    let space = SpaceId::new(1);
    let page_id = pool.new_page(space).unwrap();
    let lsn = log.append(&RedoRecord::CompletedGci { gci: 5 }).unwrap();
    {
        let mut guard = pool.write_page(page_id).unwrap();
        guard.data_mut()[900] = 0x3C;
        guard.mark_dirty(lsn);
    }
    engine.flush_all().unwrap();

    let mut img = vec![0u8; 1024];
    device.read(space, page_id.page_no, &mut img).unwrap();
    assert!(checksum::verify(ChecksumAlgorithm::Crc32, &img));
    assert_eq!(fil::lsn(&img), lsn);
    assert_eq!(fil::trailer_lsn_low(&img), lsn as u32);
    assert_eq!(img[900], 0x3C);
}

#[test]
fn test_many_dirty_pages_cycle_through_staging() {
    let dir = tempdir().unwrap();
    let config = config();

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path().join("data"), config.page_size).unwrap());
    let log_dev = Arc::new(FileLogDevice::new(dir.path().join("log")).unwrap());
    let log = Arc::new(LogManager::new(log_dev));
    let pool = Arc::new(BufferPool::new(&config, device.clone()));
    let dblwr = Arc::new(
        DoublewriteBuffer::new(device.clone(), config.page_size, config.doublewrite_pages)
            .unwrap(),
    );
    let engine = FlushEngine::new(
        pool.clone(),
        log.clone(),
        dblwr,
        config,
        Arc::new(Default::default()),
    );

    // More dirty pages than the 4-page staging block: the batch must
    // fire the doublewrite barrier repeatedly.
    let space = SpaceId::new(1);
    let mut pages = Vec::new();
    for i in 0..10u32 {
        let page_id = pool.new_page(space).unwrap();
        let lsn = log.append(&RedoRecord::CompletedGci { gci: i }).unwrap();
        let mut guard = pool.write_page(page_id).unwrap();
        guard.data_mut()[500] = i as u8;
        guard.mark_dirty(lsn);
        drop(guard);
        pages.push(page_id);
    }

    let flushed = engine.flush_all().unwrap();
    assert_eq!(flushed, 10);
    assert!(pool.flush_list().is_empty());

    for (i, page_id) in pages.iter().enumerate() {
        let mut img = vec![0u8; 1024];
        device.read(space, page_id.page_no, &mut img).unwrap();
        assert_eq!(img[500], i as u8);
        assert!(checksum::verify(ChecksumAlgorithm::Crc32, &img));
    }
}

#[test]
fn test_free_margin_bookkeeping() {
    let dir = tempdir().unwrap();
    let mut config = config();
    config.pool_size = 6;
    config.free_list_margin = 4;

    let device: Arc<dyn BlockDevice> =
        Arc::new(FileBlockDevice::new(dir.path().join("data"), config.page_size).unwrap());
    let pool = Arc::new(BufferPool::new(&config, device));

    // A fresh pool is all free frames: no flush needed.
    assert!(!pool.needs_flush_for_free());

    let space = SpaceId::new(1);
    for i in 0..6u32 {
        let page_id = pool.new_page(space).unwrap();
        let mut guard = pool.write_page(page_id).unwrap();
        guard.data_mut()[0] = i as u8;
        guard.mark_dirty(u64::from(i) + 1);
    }
    // Every frame dirty, nothing replaceable: the margin is breached.
    assert!(pool.needs_flush_for_free());
}
