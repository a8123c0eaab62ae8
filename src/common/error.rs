use thiserror::Error;

use super::types::{PageId, SpaceId};

/// Storage engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {0} is corrupted: {1}")]
    Corrupted(PageId, String),

    #[error("malformed record: {0}")]
    CorruptRecord(String),

    #[error("page {0} is lost: no consistent copy on disk or in the doublewrite area")]
    PageLost(PageId),

    #[error("page is full")]
    PageFull,

    #[error("record not found")]
    RecordNotFound,

    #[error("record too large: {size} bytes exceeds page capacity {capacity}")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("space {0} not found")]
    SpaceNotFound(SpaceId),

    #[error("page {0} is still buffer-fixed")]
    PageStillFixed(PageId),

    #[error("engine is in read-only mode after a write failure")]
    ReadOnly,

    #[error("log page checksum mismatch at page {page}: stored {stored:#010x}, computed {computed:#010x}")]
    LogChecksum {
        page: u32,
        stored: u32,
        computed: u32,
    },

    #[error("unknown redo record type {0}")]
    UnknownRecordType(u32),

    #[error("truncated redo record of type {0}")]
    TruncatedRecord(u32),

    #[error("flush request channel closed: {0}")]
    Channel(String),

    #[error("descriptor mismatch: record has {actual} fields, descriptor declares {declared}")]
    FieldCountMismatch { actual: usize, declared: usize },
}

impl EngineError {
    /// Corruption and lost-page errors cannot be retried; they surface to
    /// the caller or trigger a doublewrite repair.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::Corrupted(..) | EngineError::CorruptRecord(_) | EngineError::PageLost(_)
        )
    }

    /// Transient-looking I/O errors are retried at the device layer.
    pub fn is_transient_io(&self) -> bool {
        match self {
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
