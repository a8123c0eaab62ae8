use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::buffer::BufferPool;
use crate::common::{
    EngineConfig, EngineError, FrameId, Lsn, PageId, PageNo, Result,
};
use crate::page::checksum;
use crate::redo::LogManager;

use super::doublewrite::DoublewriteBuffer;

/// Flush batch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Advance the oldest modification LSN: walk the flush list tail.
    List = 0,
    /// Free frames for page-in: walk the LRU tail, unfixed pages only.
    Lru = 1,
}

enum Msg {
    Batch {
        flush_type: FlushType,
        limit_lsn: Lsn,
        max_pages: usize,
        done: Option<Sender<Result<usize>>>,
    },
    Shutdown,
}

struct FlushInner {
    pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    dblwr: Arc<DoublewriteBuffer>,
    config: EngineConfig,
    /// One active batch per type; the second caller waits on the event.
    active: Mutex<[bool; 2]>,
    active_cond: Condvar,
    read_only: Arc<AtomicBool>,
}

/// The flush engine drains dirty pages to stable storage: WAL first,
/// doublewrite staging second, in-place writes last. Batches run either
/// on the caller's thread or on the dedicated coordinator thread fed by
/// a bounded request channel.
pub struct FlushEngine {
    inner: Arc<FlushInner>,
    sender: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

impl FlushEngine {
    pub fn new(
        pool: Arc<BufferPool>,
        log: Arc<LogManager>,
        dblwr: Arc<DoublewriteBuffer>,
        config: EngineConfig,
        read_only: Arc<AtomicBool>,
    ) -> Self {
        let inner = Arc::new(FlushInner {
            pool,
            log,
            dblwr,
            config,
            active: Mutex::new([false; 2]),
            active_cond: Condvar::new(),
            read_only,
        });

        let (sender, receiver) = bounded::<Msg>(16);
        let worker_inner = Arc::clone(&inner);
        let worker = thread::spawn(move || {
            Self::coordinator(worker_inner, receiver);
        });

        // Blocked page-in callers poke the coordinator for an LRU batch.
        let waker_sender = sender.clone();
        inner.pool.register_flush_waker(Box::new(move || {
            let _ = waker_sender.try_send(Msg::Batch {
                flush_type: FlushType::Lru,
                limit_lsn: Lsn::MAX,
                max_pages: 32,
                done: None,
            });
        }));

        Self {
            inner,
            sender,
            worker: Some(worker),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    /// Runs a FLUSH_LIST batch on the calling thread: flush every page
    /// whose oldest modification is at or below `limit_lsn`.
    pub fn flush_list_batch(&self, limit_lsn: Lsn, max_pages: usize) -> Result<usize> {
        Self::run_batch(&self.inner, FlushType::List, limit_lsn, max_pages)
    }

    /// Runs a FLUSH_LRU batch on the calling thread.
    pub fn flush_lru_batch(&self, max_pages: usize) -> Result<usize> {
        Self::run_batch(&self.inner, FlushType::Lru, Lsn::MAX, max_pages)
    }

    /// Queues a batch for the coordinator thread and returns immediately.
    pub fn request_batch(&self, flush_type: FlushType, limit_lsn: Lsn, max_pages: usize) {
        let _ = self.sender.try_send(Msg::Batch {
            flush_type,
            limit_lsn,
            max_pages,
            done: None,
        });
    }

    /// Flushes everything dirty. Used at checkpoints and shutdown.
    pub fn flush_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.flush_list_batch(Lsn::MAX, self.inner.pool.pool_size())?;
            total += n;
            if n == 0 {
                return Ok(total);
            }
        }
    }

    fn coordinator(inner: Arc<FlushInner>, receiver: Receiver<Msg>) {
        while let Ok(msg) = receiver.recv() {
            match msg {
                Msg::Batch {
                    flush_type,
                    limit_lsn,
                    max_pages,
                    done,
                } => {
                    let result = Self::run_batch(&inner, flush_type, limit_lsn, max_pages);
                    if let Err(e) = &result {
                        log::error!("{:?} flush batch failed: {}", flush_type, e);
                    }
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                Msg::Shutdown => break,
            }
        }
    }

    fn run_batch(
        inner: &Arc<FlushInner>,
        flush_type: FlushType,
        limit_lsn: Lsn,
        max_pages: usize,
    ) -> Result<usize> {
        if inner.read_only.load(Ordering::Acquire) {
            return Err(EngineError::ReadOnly);
        }
        Self::acquire_batch_slot(inner, flush_type);
        let result = Self::run_batch_locked(inner, flush_type, limit_lsn, max_pages);
        {
            let mut active = inner.active.lock();
            active[flush_type as usize] = false;
        }
        inner.active_cond.notify_all();

        if let Err(e) = &result {
            if !e.is_corruption() {
                log::error!("write failure, entering read-only mode: {}", e);
                inner.read_only.store(true, Ordering::Release);
            }
        }
        result
    }

    /// Only one batch of each type may be active; later callers wait on
    /// the no-flush event. The wait doubles as the stall watchdog.
    fn acquire_batch_slot(inner: &FlushInner, flush_type: FlushType) {
        let mut active = inner.active.lock();
        while active[flush_type as usize] {
            let timed_out = inner
                .active_cond
                .wait_for(&mut active, inner.config.stall_threshold)
                .timed_out();
            if timed_out {
                panic!(
                    "watchdog: {:?} flush batch stalled past {:?}; \
                     flush_list={} free_frames={} staged={}",
                    flush_type,
                    inner.config.stall_threshold,
                    inner.pool.flush_list().len(),
                    inner.pool.free_frame_count(),
                    inner.dblwr.staged_count(),
                );
            }
        }
        active[flush_type as usize] = true;
    }

    fn run_batch_locked(
        inner: &Arc<FlushInner>,
        flush_type: FlushType,
        limit_lsn: Lsn,
        max_pages: usize,
    ) -> Result<usize> {
        let candidates = Self::collect_candidates(inner, flush_type, limit_lsn, max_pages);
        log::debug!(
            "{:?} batch: {} candidate pages (limit lsn {})",
            flush_type,
            candidates.len(),
            limit_lsn
        );

        let mut flushed = 0;
        for frame_id in candidates {
            if Self::flush_one(inner, flush_type, frame_id)? {
                flushed += 1;
            }
        }

        // Batch barrier: whatever is staged goes out now.
        let pool = Arc::clone(&inner.pool);
        inner
            .dblwr
            .flush_batch(&mut |page_id| pool.page_flush_complete(page_id))?;
        if flushed > 0 {
            log::debug!("{:?} batch: flushed {} pages", flush_type, flushed);
        }
        Ok(flushed)
    }

    fn collect_candidates(
        inner: &FlushInner,
        flush_type: FlushType,
        limit_lsn: Lsn,
        max_pages: usize,
    ) -> Vec<FrameId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let primary: Vec<FrameId> = match flush_type {
            FlushType::List => inner
                .pool
                .flush_list()
                .batch(limit_lsn, max_pages)
                .into_iter()
                .map(|(_, f)| f)
                .collect(),
            FlushType::Lru => inner
                .pool
                .lru()
                .tail(max_pages)
                .into_iter()
                .filter(|f| {
                    let frame = inner.pool.frame(*f);
                    // Deadlock avoidance: a latched page could wait
                    // behind its own flush.
                    frame.is_dirty() && frame.buf_fix_count() == 0
                })
                .collect(),
        };

        let neighbors_on = inner.pool.lru().len() >= inner.config.min_old_len_for_neighbors;
        let window = inner.config.neighbor_window();

        for frame_id in primary {
            if seen.insert(frame_id) {
                out.push(frame_id);
            }
            if !neighbors_on {
                continue;
            }
            let Some(page_id) = inner.pool.frame(frame_id).page_id() else {
                continue;
            };
            // Scan the aligned window around the page for dirty company.
            let start = page_id.page_no.as_u32() - page_id.page_no.as_u32() % window as u32;
            for no in start..start + window as u32 {
                let neighbor = PageId::new(page_id.space, PageNo::new(no));
                let Some(nf) = inner.pool.frame_of(neighbor) else {
                    continue;
                };
                let frame = inner.pool.frame(nf);
                if frame.is_dirty()
                    && frame.buf_fix_count() == 0
                    && !frame.is_io_fixed()
                    && seen.insert(nf)
                {
                    out.push(nf);
                }
            }
        }
        out
    }

    /// The per-page flush protocol. Returns false when the page was
    /// skipped (already clean, io-fixed elsewhere, or fixed in LRU mode).
    fn flush_one(
        inner: &Arc<FlushInner>,
        flush_type: FlushType,
        frame_id: FrameId,
    ) -> Result<bool> {
        let frame = inner.pool.frame(frame_id);
        if flush_type == FlushType::Lru && frame.buf_fix_count() != 0 {
            return Ok(false);
        }
        if !frame.try_io_fix() {
            return Ok(false);
        }
        if !frame.is_dirty() {
            frame.io_unfix();
            return Ok(false);
        }
        let Some(page_id) = frame.page_id() else {
            frame.io_unfix();
            return Ok(false);
        };

        // Shared latch: content is stable while we snapshot; mutators
        // wanting exclusive access wait for the io-fix to clear.
        let mut image = vec![0u8; inner.pool.page_size()];
        let newest = {
            let _latch = frame.latch().acquire_shared();
            let newest = frame.newest_lsn();

            // WAL: the log covers this page before its image can move.
            if let Err(e) = inner.log.flush_up_to(newest) {
                frame.io_unfix();
                return Err(e);
            }

            let data = frame.data.read();
            image.copy_from_slice(&data[..]);
            newest
        };

        checksum::stamp(inner.config.checksum, &mut image, newest);

        if inner.dblwr.stage(page_id, &image) {
            let pool = Arc::clone(&inner.pool);
            inner
                .dblwr
                .flush_batch(&mut |page_id| pool.page_flush_complete(page_id))?;
        }
        Ok(true)
    }
}

impl Drop for FlushEngine {
    fn drop(&mut self) {
        // In-flight batches run to completion before the thread exits.
        let _ = self.sender.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
