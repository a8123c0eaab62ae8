use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::latch::{LatchRank, RankedMutex};
use crate::common::{
    PageId, PageNo, Result, SpaceId, DOUBLEWRITE_FIRST_PAGE, SYSTEM_SPACE,
};
use crate::page::{checksum, layout::fil, ChecksumAlgorithm};
use crate::storage::BlockDevice;

struct DwState {
    /// Staging bytes, `pages_per_block` pages.
    buf: Vec<u8>,
    /// Page identity per staged slot.
    slots: Vec<PageId>,
    /// Alternates between the two on-disk blocks per batch.
    use_second_block: bool,
}

/// The doublewrite staging area: every page image is written here
/// sequentially and fsynced before its in-place write, so a torn in-place
/// write is always repairable from the staged copy.
///
/// Two contiguous blocks live in the system tablespace right after its
/// header page; batches alternate between them so the previous batch's
/// copies survive until the next one has fully staged.
pub struct DoublewriteBuffer {
    device: Arc<dyn BlockDevice>,
    page_size: usize,
    pages_per_block: usize,
    state: RankedMutex<DwState>,
    /// Wakes stagers blocked on a full staging area.
    space_lock: Mutex<()>,
    space_cond: Condvar,
}

impl DoublewriteBuffer {
    /// Opens the doublewrite area, extending the system space to cover
    /// the header page plus both blocks on first use.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        page_size: usize,
        pages_per_block: usize,
    ) -> Result<Self> {
        let needed = DOUBLEWRITE_FIRST_PAGE.as_u32() + 2 * pages_per_block as u32;
        let have = device.size_of(SYSTEM_SPACE)?;
        if have < needed {
            device.allocate(SYSTEM_SPACE, needed - have)?;
        }
        Ok(Self {
            device,
            page_size,
            pages_per_block,
            state: RankedMutex::new(
                LatchRank::Doublewrite,
                DwState {
                    buf: vec![0u8; pages_per_block * page_size],
                    slots: Vec::with_capacity(pages_per_block),
                    use_second_block: false,
                },
            ),
            space_lock: Mutex::new(()),
            space_cond: Condvar::new(),
        })
    }

    pub fn pages_per_block(&self) -> usize {
        self.pages_per_block
    }

    pub fn staged_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Stages one page image. Blocks while the area is full until the
    /// current batch completes. Returns true when this stage filled the
    /// area and the caller must fire [`flush_batch`](Self::flush_batch).
    pub fn stage(&self, page_id: PageId, image: &[u8]) -> bool {
        assert_eq!(image.len(), self.page_size);
        loop {
            {
                let mut state = self.state.lock();
                if state.slots.len() < self.pages_per_block {
                    let at = state.slots.len() * self.page_size;
                    state.buf[at..at + self.page_size].copy_from_slice(image);
                    state.slots.push(page_id);
                    return state.slots.len() == self.pages_per_block;
                }
            }
            let mut wait = self.space_lock.lock();
            self.space_cond
                .wait_for(&mut wait, Duration::from_millis(20));
        }
    }

    /// Writes the staged pages out: the whole staging block sequentially,
    /// fsync, then each page in place, then fsync of every touched space.
    /// `complete` runs once per page after everything is durable.
    pub fn flush_batch(&self, complete: &mut dyn FnMut(PageId)) -> Result<usize> {
        let (done, count) = {
            let mut state = self.state.lock();
            let count = state.slots.len();
            if count == 0 {
                return Ok(0);
            }

            let block_first = if state.use_second_block {
                PageNo::new(DOUBLEWRITE_FIRST_PAGE.as_u32() + self.pages_per_block as u32)
            } else {
                DOUBLEWRITE_FIRST_PAGE
            };

            // Stage write: one sequential I/O, durable before any
            // in-place write begins.
            self.device.write_many(
                SYSTEM_SPACE,
                block_first,
                &state.buf[..count * self.page_size],
            )?;
            self.device.fsync(SYSTEM_SPACE)?;

            for (i, page_id) in state.slots.iter().enumerate() {
                let at = i * self.page_size;
                self.device.write(
                    page_id.space,
                    page_id.page_no,
                    &state.buf[at..at + self.page_size],
                )?;
            }
            let spaces: HashSet<SpaceId> = state.slots.iter().map(|p| p.space).collect();
            for space in spaces {
                self.device.fsync(space)?;
            }

            let done = std::mem::take(&mut state.slots);
            state.use_second_block = !state.use_second_block;
            (done, count)
        };

        // Completions run outside the staging mutex: they take buffer
        // pool locks that rank above it.
        for page_id in done {
            complete(page_id);
        }
        self.space_cond.notify_all();
        Ok(count)
    }
}

/// Startup repair: scans both doublewrite blocks and restores any home
/// page from a staged copy that verifies. A home page is replaced when
/// its image fails verification (torn in-place write) or when the staged
/// copy is newer by LSN (the crash hit between the staging fsync and the
/// in-place write). Returns the repaired page ids.
pub fn repair_from_doublewrite(
    device: &Arc<dyn BlockDevice>,
    page_size: usize,
    pages_per_block: usize,
    algo: ChecksumAlgorithm,
) -> Result<Vec<PageId>> {
    let mut repaired = Vec::new();
    let mut staged = vec![0u8; page_size];
    let mut home = vec![0u8; page_size];

    let dw_pages = 2 * pages_per_block as u32;
    let have = device.size_of(SYSTEM_SPACE)?;
    for i in 0..dw_pages.min(have.saturating_sub(DOUBLEWRITE_FIRST_PAGE.as_u32())) {
        let dw_page = PageNo::new(DOUBLEWRITE_FIRST_PAGE.as_u32() + i);
        device.read(SYSTEM_SPACE, dw_page, &mut staged)?;
        if checksum::is_all_zero(&staged) || !checksum::verify(algo, &staged) {
            // Never used, or torn during staging; in the latter case the
            // in-place writes of that batch never started.
            continue;
        }
        let page_id = PageId::new(fil::space_id(&staged), fil::page_no(&staged));
        device.read(page_id.space, page_id.page_no, &mut home)?;
        let home_broken = checksum::is_all_zero(&home) || !checksum::verify(algo, &home);
        if home_broken || fil::lsn(&home) < fil::lsn(&staged) {
            log::info!("doublewrite repair of {}", page_id);
            device.write(page_id.space, page_id.page_no, &staged)?;
            device.fsync(page_id.space)?;
            repaired.push(page_id);
        }
    }
    Ok(repaired)
}

/// Runtime repair of a single page whose read failed verification.
/// Returns true when a consistent staged copy was found and written home.
pub fn repair_page(
    device: &Arc<dyn BlockDevice>,
    page_size: usize,
    pages_per_block: usize,
    algo: ChecksumAlgorithm,
    page_id: PageId,
) -> Result<bool> {
    let mut staged = vec![0u8; page_size];
    let dw_pages = 2 * pages_per_block as u32;
    for i in 0..dw_pages {
        let dw_page = PageNo::new(DOUBLEWRITE_FIRST_PAGE.as_u32() + i);
        device.read(SYSTEM_SPACE, dw_page, &mut staged)?;
        if checksum::is_all_zero(&staged) || !checksum::verify(algo, &staged) {
            continue;
        }
        if PageId::new(fil::space_id(&staged), fil::page_no(&staged)) == page_id {
            log::info!("doublewrite repair of {}", page_id);
            device.write(page_id.space, page_id.page_no, &staged)?;
            device.fsync(page_id.space)?;
            return Ok(true);
        }
    }
    Ok(false)
}
