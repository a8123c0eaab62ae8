use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferPool, ReadPageGuard, WritePageGuard};
use crate::common::{EngineConfig, EngineError, Lsn, PageId, Result, SpaceId};
use crate::flush::{repair_from_doublewrite, repair_page, DoublewriteBuffer, FlushEngine};
use crate::redo::{recovery, LogDevice, LogManager, RedoApplicator, RedoRecord};
use crate::storage::BlockDevice;

/// The engine context: every entry point receives its collaborators from
/// here. There are no static singletons; the block and log devices are
/// injected capabilities, so tests can interpose instrumented ones.
pub struct Engine {
    config: EngineConfig,
    device: Arc<dyn BlockDevice>,
    log: Arc<LogManager>,
    log_device: Arc<dyn LogDevice>,
    pool: Arc<BufferPool>,
    flush: FlushEngine,
    read_only: Arc<AtomicBool>,
}

impl Engine {
    /// Opens the engine over the given devices. Doublewrite repair runs
    /// before anything else touches the data files, so torn in-place
    /// writes from a previous life never reach the buffer pool.
    pub fn open(
        config: EngineConfig,
        device: Arc<dyn BlockDevice>,
        log_device: Arc<dyn LogDevice>,
    ) -> Result<Self> {
        config.validate();

        let repaired = repair_from_doublewrite(
            &device,
            config.page_size,
            config.doublewrite_pages,
            config.checksum,
        )?;
        if !repaired.is_empty() {
            log::info!("repaired {} torn pages from the doublewrite area", repaired.len());
        }

        let log = Arc::new(LogManager::new(log_device.clone()));
        let pool = Arc::new(BufferPool::new(&config, device.clone()));
        let dblwr = Arc::new(DoublewriteBuffer::new(
            device.clone(),
            config.page_size,
            config.doublewrite_pages,
        )?);
        let read_only = Arc::new(AtomicBool::new(false));
        let flush = FlushEngine::new(
            pool.clone(),
            log.clone(),
            dblwr,
            config.clone(),
            read_only.clone(),
        );

        Ok(Self {
            config,
            device,
            log,
            log_device,
            pool,
            flush,
            read_only,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn flush_engine(&self) -> &FlushEngine {
        &self.flush
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Appends a redo record; mutators call this before touching bytes.
    pub fn append_redo(&self, record: &RedoRecord) -> Result<Lsn> {
        self.check_writable()?;
        self.log.append(record)
    }

    pub fn new_page(&self, space: SpaceId) -> Result<PageId> {
        self.check_writable()?;
        self.pool.new_page(space)
    }

    /// Fetches a page for reading; a checksum failure is repaired from
    /// the doublewrite area when a consistent copy exists, otherwise the
    /// page is lost.
    pub fn read_page(&self, page_id: PageId) -> Result<ReadPageGuard> {
        match self.pool.read_page(page_id) {
            Err(e) if e.is_corruption() => {
                self.try_repair(page_id)?;
                self.pool.read_page(page_id)
            }
            other => other,
        }
    }

    pub fn write_page(&self, page_id: PageId) -> Result<WritePageGuard> {
        self.check_writable()?;
        match self.pool.write_page(page_id) {
            Err(e) if e.is_corruption() => {
                self.try_repair(page_id)?;
                self.pool.write_page(page_id)
            }
            other => other,
        }
    }

    fn try_repair(&self, page_id: PageId) -> Result<()> {
        let repaired = repair_page(
            &self.device,
            self.config.page_size,
            self.config.doublewrite_pages,
            self.config.checksum,
            page_id,
        )?;
        if repaired {
            log::warn!("page {} repaired from doublewrite after checksum mismatch", page_id);
            Ok(())
        } else {
            Err(EngineError::PageLost(page_id))
        }
    }

    /// Flushes all dirty pages and the log: a quiescent checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_writable()?;
        self.log.flush_up_to(self.log.written_lsn())?;
        self.flush.flush_all()?;
        Ok(())
    }

    /// Replays the redo log in `[start_lsn, end_lsn]` into `space`.
    pub fn recover(
        &self,
        space: SpaceId,
        start_lsn: Lsn,
        end_lsn: Lsn,
        applicator: &dyn RedoApplicator,
    ) -> Result<recovery::RecoveryStats> {
        recovery::recover(
            &self.pool,
            self.log_device.clone(),
            space,
            start_lsn,
            end_lsn,
            applicator,
        )
    }

    /// Drains in-flight flush batches and writes everything out.
    pub fn shutdown(self) -> Result<()> {
        if !self.is_read_only() {
            self.log.flush_up_to(self.log.written_lsn())?;
            self.flush.flush_all()?;
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }
}
