use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::common::{Lsn, PageId, PageNo, Result, SpaceId};
use crate::page::layout::fil;
use crate::record::{FieldValue, RecordDescriptor, RecordStatus};

use super::device::LogDevice;
use super::page::{LOG_PAGE_HEADER_WORDS, LOG_PAGE_PAYLOAD_WORDS, PAGES_PER_MBYTE};
use super::reader::{LogPosition, LogReader};
use super::record::{OpCode, PrepareOp, RedoRecord};

/// Re-applies prepared operations to page images during replay. The
/// engine core has no catalog, so the caller supplies the descriptor
/// knowledge; [`ImageApplicator`] covers the single-descriptor case.
pub trait RedoApplicator: Send + Sync {
    fn apply(&self, page: &mut [u8], op: &PrepareOp) -> Result<()>;
}

/// Field-tuple wire form used in prepare-op key and attr payloads: per
/// field a 2-byte length (0xFFFF encodes NULL) followed by the bytes.
pub fn encode_field_tuple(fields: &[FieldValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for f in fields {
        match f {
            None => out.extend_from_slice(&0xFFFFu16.to_le_bytes()),
            Some(bytes) => {
                debug_assert!(bytes.len() < 0xFFFF);
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }
    out
}

pub fn decode_field_tuple(bytes: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let mut out = Vec::new();
    let mut at = 0;
    while at + 2 <= bytes.len() {
        let len = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        at += 2;
        if len == 0xFFFF {
            out.push(None);
            continue;
        }
        let len = len as usize;
        if at + len > bytes.len() {
            return Err(crate::common::EngineError::CorruptRecord(
                "field tuple truncated".into(),
            ));
        }
        out.push(Some(bytes[at..at + len].to_vec()));
        at += len;
    }
    Ok(out)
}

/// Applies after-images with a fixed record descriptor: inserts insert
/// the attr tuple, deletes remove by key, updates delete then re-insert.
pub struct ImageApplicator {
    desc: Arc<RecordDescriptor>,
}

impl ImageApplicator {
    pub fn new(desc: Arc<RecordDescriptor>) -> Self {
        Self { desc }
    }
}

impl RedoApplicator for ImageApplicator {
    fn apply(&self, page: &mut [u8], op: &PrepareOp) -> Result<()> {
        let mut view = crate::page::RecordPage::new(page, &self.desc);
        let key = decode_field_tuple(&op.key)?;
        let key_views: Vec<FieldValue> = key.iter().map(|f| f.as_deref()).collect();
        match op.opcode {
            OpCode::Read => Ok(()),
            OpCode::Insert => {
                let fields = decode_field_tuple(&op.attr)?;
                let views: Vec<FieldValue> = fields.iter().map(|f| f.as_deref()).collect();
                view.insert(&views, RecordStatus::Ordinary)?;
                Ok(())
            }
            OpCode::Delete => view.delete(&key_views),
            OpCode::Update => {
                view.delete(&key_views)?;
                let fields = decode_field_tuple(&op.attr)?;
                let views: Vec<FieldValue> = fields.iter().map(|f| f.as_deref()).collect();
                view.insert(&views, RecordStatus::Ordinary)?;
                Ok(())
            }
        }
    }
}

/// Counters reported by a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub records_applied: usize,
    pub records_skipped: usize,
}

/// Log position holding the record whose LSN is `lsn`.
pub fn position_of(lsn: Lsn) -> LogPosition {
    debug_assert!(lsn > 0);
    let word_index = lsn - 1;
    let page_index = word_index / LOG_PAGE_PAYLOAD_WORDS as u64;
    let word = (word_index % LOG_PAGE_PAYLOAD_WORDS as u64) as u32
        + LOG_PAGE_HEADER_WORDS as u32;
    let page = (page_index % PAGES_PER_MBYTE as u64) as u32;
    let mbyte_flat = page_index / PAGES_PER_MBYTE as u64;
    let mbyte = (mbyte_flat % super::page::MBYTES_PER_FILE as u64) as u32;
    let file_no = (mbyte_flat / super::page::MBYTES_PER_FILE as u64) as u32;
    LogPosition::new(file_no, mbyte, page, word)
}

/// Replays redo records in `[start_lsn, end_lsn]` in LSN order. A record
/// is re-applied only when the target page's LSN is older, after which
/// the page LSN advances to the record's; replay is therefore idempotent.
pub fn recover(
    pool: &BufferPool,
    log_device: Arc<dyn LogDevice>,
    space: SpaceId,
    start_lsn: Lsn,
    end_lsn: Lsn,
    applicator: &dyn RedoApplicator,
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let mut reader = LogReader::new(log_device, position_of(start_lsn.max(1)), true)?;

    while let Some((lsn, record)) = reader.next_record()? {
        if lsn > end_lsn {
            break;
        }
        stats.records_scanned += 1;
        let op = match record {
            RedoRecord::Prepare(op) if op.opcode != OpCode::Read => op,
            _ => continue,
        };

        let page_id = PageId::new(space, PageNo::new(op.page_no));
        let mut guard = pool.write_page(page_id)?;
        if fil::lsn(guard.data()) >= lsn {
            stats.records_skipped += 1;
            continue;
        }
        applicator.apply(guard.data_mut(), &op)?;
        fil::set_lsn(guard.data_mut(), lsn);
        guard.mark_dirty(lsn);
        stats.records_applied += 1;
        log::debug!("re-applied {:?} at lsn {} to {}", op.opcode, lsn, page_id);
    }
    log::info!(
        "recovery replay: {} scanned, {} applied, {} skipped",
        stats.records_scanned,
        stats.records_applied,
        stats.records_skipped
    );
    Ok(stats)
}
