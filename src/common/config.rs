use std::time::Duration;

use super::types::{FrameId, PageNo, SpaceId};
use crate::page::ChecksumAlgorithm;

/// Default size of a data page in bytes (16 KB)
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported data page size (1 KB); page sizes are powers of two
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported data page size. In-page next pointers are 16-bit
/// signed relative offsets, which bounds the page at 32 KB.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Size of a redo log page in bytes (32 KB). Log media keep their own page
/// size, independent of the data page size.
pub const LOG_PAGE_SIZE: usize = 32 * 1024;

/// Invalid page number constant used in on-page chain pointers
pub const INVALID_PAGE_NO: PageNo = PageNo(u32::MAX);

/// Invalid frame ID constant
pub const INVALID_FRAME_ID: FrameId = FrameId(u32::MAX);

/// The system tablespace holding the doublewrite blocks
pub const SYSTEM_SPACE: SpaceId = SpaceId(0);

/// First page of the doublewrite area in the system space (page 0 is the
/// space header)
pub const DOUBLEWRITE_FIRST_PAGE: PageNo = PageNo(1);

/// Engine-wide configuration. One instance lives in the [`Engine`] context
/// and is passed down explicitly; there are no global knobs.
///
/// [`Engine`]: crate::engine::Engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data page size in bytes. Must be a power of two, >= MIN_PAGE_SIZE.
    pub page_size: usize,
    /// Number of frames in the buffer pool.
    pub pool_size: usize,
    /// Pages per doublewrite block (two blocks are kept).
    pub doublewrite_pages: usize,
    /// Free-list margin below which page allocation blocks on a flush batch.
    pub free_list_margin: usize,
    /// Fraction of the LRU kept in the old sublist, in 1/8ths.
    pub old_sublist_eighths: usize,
    /// Accesses a frame must survive in the old sublist before promotion.
    pub old_admission_age: u64,
    /// Minimum LRU length for the neighbor-flush optimization to engage.
    pub min_old_len_for_neighbors: usize,
    /// Checksum formula stamped on pages at write-out.
    pub checksum: ChecksumAlgorithm,
    /// Watchdog threshold after which a stalled flush batch is fatal.
    pub stall_threshold: Duration,
}

impl EngineConfig {
    /// Neighbor window width for a given pool size: min(64, pool_size / 16).
    pub fn neighbor_window(&self) -> usize {
        64.min(self.pool_size / 16).max(1)
    }

    /// Boundary index of the old sublist for a given LRU length.
    pub fn old_boundary(&self, lru_len: usize) -> usize {
        lru_len * self.old_sublist_eighths / 8
    }

    pub fn validate(&self) {
        assert!(
            self.page_size.is_power_of_two()
                && self.page_size >= MIN_PAGE_SIZE
                && self.page_size <= MAX_PAGE_SIZE,
            "page_size must be a power of two in [{}, {}]",
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        assert!(self.pool_size > 0, "pool_size must be non-zero");
        assert!(self.doublewrite_pages > 0, "doublewrite_pages must be non-zero");
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_size: 128,
            doublewrite_pages: 64,
            free_list_margin: 8,
            old_sublist_eighths: 3,
            old_admission_age: 2,
            min_old_len_for_neighbors: 16,
            checksum: ChecksumAlgorithm::Crc32,
            stall_threshold: Duration::from_secs(600),
        }
    }
}
