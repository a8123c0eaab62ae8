//! Tessera - a page-oriented storage engine core in Rust
//!
//! This crate provides the record manager of an on-disk storage engine:
//! physical records on fixed-size pages, write-ahead logging, and a
//! buffer-pool flush pipeline with a doublewrite guarantee.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//!
//! - **Record Codec** (`record`): Physical record formats
//!   - `RecordDescriptor`: immutable column layout descriptions
//!   - `encode`/`decode_offsets`/`nth_field`: compact and original record
//!     formats with O(1) field access from a precomputed offset vector
//!
//! - **Page Manager** (`page`): In-page structure and invariants
//!   - `RecordPage`: record heap, ordered chain, sparse directory with
//!     owned-count bounds, free list, reorganization
//!   - `checksum`: additive and CRC32 page checksum formulas
//!
//! - **Redo Log** (`redo`): Log record taxonomy and durability
//!   - `LogManager`: LSN assignment and explicit log flushing
//!   - `LogReader`: forward parsing with cross-page record stitching
//!   - `recovery`: doublewrite repair plus LSN-ordered replay
//!
//! - **Buffer Pool** (`buffer`): Memory management for database pages
//!   - `BufferPool`: page table, free list, young/old LRU, flush list
//!   - `ReadPageGuard`/`WritePageGuard`: RAII latched page access
//!
//! - **Flush Engine** (`flush`): Dirty-page write-out
//!   - `FlushEngine`: FLUSH_LIST and FLUSH_LRU batches, neighbor
//!     flushing, back-pressure, WAL ordering
//!   - `DoublewriteBuffer`: torn-page-safe staging area
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera::common::{EngineConfig, SpaceId};
//! use tessera::engine::Engine;
//! use tessera::redo::{FileLogDevice, RedoRecord};
//! use tessera::storage::FileBlockDevice;
//!
//! let config = EngineConfig::default();
//! let device = Arc::new(FileBlockDevice::new("data", config.page_size).unwrap());
//! let log_device = Arc::new(FileLogDevice::new("log").unwrap());
//! let engine = Engine::open(config, device, log_device).unwrap();
//!
//! // Allocate a page and modify it under the WAL discipline.
//! let page_id = engine.new_page(SpaceId::new(1)).unwrap();
//! let lsn = engine.append_redo(&RedoRecord::CompletedGci { gci: 1 }).unwrap();
//! {
//!     let mut guard = engine.write_page(page_id).unwrap();
//!     guard.data_mut()[128] = 42;
//!     guard.mark_dirty(lsn);
//! }
//!
//! // Drain dirty pages through the doublewrite area.
//! engine.checkpoint().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod engine;
pub mod flush;
pub mod page;
pub mod record;
pub mod redo;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{EngineConfig, EngineError, Lsn, PageId, PageNo, Result, SpaceId};
pub use engine::Engine;
