use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{Lsn, Result};

use super::device::LogDevice;
use super::page::{
    LogPageHeader, LOG_PAGE_HEADER_WORDS, LOG_PAGE_PAYLOAD_WORDS, LOG_PAGE_WORDS,
    NEXT_PAGE_SENTINEL, PAGES_PER_MBYTE,
};
use super::record::RedoRecord;

/// LSN of the first payload word at the given position. LSN 0 is reserved.
pub fn lsn_at(page_index: u64, word_offset: usize) -> Lsn {
    page_index * LOG_PAGE_PAYLOAD_WORDS as u64 + (word_offset - LOG_PAGE_HEADER_WORDS) as u64 + 1
}

struct WriterState {
    /// Image of the tail page being filled.
    page: Vec<u32>,
    page_index: u64,
    /// Word offset of the next free word, header included.
    offset: usize,
    lap: u32,
    max_gci_completed: u32,
    max_gci_started: u32,
}

impl WriterState {
    fn header(&self, tail: bool) -> LogPageHeader {
        LogPageHeader {
            lap: self.lap,
            max_gci_completed: self.max_gci_completed,
            max_gci_started: self.max_gci_started,
            next_page: if tail {
                NEXT_PAGE_SENTINEL
            } else {
                (self.page_index + 1) as u32
            },
            prev_page: self.page_index.saturating_sub(1) as u32,
            version: super::page::LOG_VERSION,
            curr_offset: self.offset as u32,
            dirty: tail,
        }
    }
}

/// The log manager owns the redo file set through the log device and is
/// the single writer of log pages. Records are appended under a mutex;
/// LSNs are assigned monotonically, one unit per payload word.
///
/// Durability is explicit: [`LogManager::flush_up_to`] blocks until every
/// record at or below the given LSN has been fsynced, which is what the
/// flush engine calls before any page write (the WAL rule).
pub struct LogManager {
    device: Arc<dyn LogDevice>,
    state: Mutex<WriterState>,
    written_lsn: AtomicU64,
    durable_lsn: AtomicU64,
}

impl LogManager {
    pub fn new(device: Arc<dyn LogDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(WriterState {
                page: vec![0u32; LOG_PAGE_WORDS],
                page_index: 0,
                offset: LOG_PAGE_HEADER_WORDS,
                lap: 0,
                max_gci_completed: 0,
                max_gci_started: 0,
            }),
            written_lsn: AtomicU64::new(lsn_at(0, LOG_PAGE_HEADER_WORDS)),
            durable_lsn: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Arc<dyn LogDevice> {
        &self.device
    }

    /// Appends a record and returns its LSN. The record is buffered; call
    /// [`flush_up_to`](Self::flush_up_to) for durability.
    pub fn append(&self, record: &RedoRecord) -> Result<Lsn> {
        let words = record.encode();
        let mut state = self.state.lock();

        match record {
            RedoRecord::Commit(c) | RedoRecord::InvalidCommit(c) => {
                state.max_gci_started = state.max_gci_started.max(c.gci);
            }
            RedoRecord::CompletedGci { gci } => {
                state.max_gci_completed = state.max_gci_completed.max(*gci);
            }
            _ => {}
        }

        let lsn = lsn_at(state.page_index, state.offset);
        let mut remaining = &words[..];
        while !remaining.is_empty() {
            let avail = LOG_PAGE_WORDS - state.offset;
            if avail == 0 {
                self.complete_page(&mut state)?;
                continue;
            }
            let n = avail.min(remaining.len());
            let at = state.offset;
            state.page[at..at + n].copy_from_slice(&remaining[..n]);
            state.offset += n;
            remaining = &remaining[n..];
        }

        // Padding records consume the remainder of their unit. A page
        // already rolled over by the copy loop needs no second close.
        match record {
            RedoRecord::NextLog => {
                if state.offset > LOG_PAGE_HEADER_WORDS {
                    self.complete_page(&mut state)?;
                }
            }
            RedoRecord::NextMbyte => {
                let target = (state.page_index / PAGES_PER_MBYTE as u64 + 1)
                    * PAGES_PER_MBYTE as u64;
                if state.offset > LOG_PAGE_HEADER_WORDS {
                    self.complete_page(&mut state)?;
                }
                state.page_index = state.page_index.max(target);
            }
            _ => {}
        }

        let end = lsn_at(state.page_index, state.offset);
        self.written_lsn.store(end, Ordering::Release);
        Ok(lsn)
    }

    /// Finalizes the current page image and opens the next one.
    fn complete_page(&self, state: &mut WriterState) -> Result<()> {
        let header = state.header(false);
        // The page leaves the buffer fully used regardless of offset;
        // unused words stay zero and the offset records the fill level.
        let mut page = std::mem::replace(&mut state.page, vec![0u32; LOG_PAGE_WORDS]);
        header.store(&mut page);
        self.device.write_page(state.page_index, &page)?;
        state.page_index += 1;
        state.offset = LOG_PAGE_HEADER_WORDS;
        Ok(())
    }

    /// Blocks until the log is durable at or past `lsn`.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        if self.durable_lsn.load(Ordering::Acquire) >= lsn {
            return Ok(());
        }
        let mut state = self.state.lock();
        let end = lsn_at(state.page_index, state.offset);
        // Write the tail page in place; completed pages are already with
        // the device and only need the sync.
        let header = state.header(true);
        header.store(&mut state.page);
        self.device.write_page(state.page_index, &state.page)?;
        self.device.flush()?;
        self.durable_lsn.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Everything appended so far, durable or not.
    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    /// Everything the device has confirmed durable.
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }
}
