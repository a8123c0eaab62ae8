use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::common::{PageNo, Result, SpaceId};

/// The block device the engine consumes: a byte-addressable page store
/// per tablespace. Injected into the engine context as a capability so
/// tests can interpose instrumented implementations.
///
/// `write` success does NOT imply durability; only `fsync` does.
pub trait BlockDevice: Send + Sync {
    fn read(&self, space: SpaceId, page_no: PageNo, buf: &mut [u8]) -> Result<()>;

    fn write(&self, space: SpaceId, page_no: PageNo, buf: &[u8]) -> Result<()>;

    /// Writes `bufs.len() / page_size` contiguous pages in one I/O.
    fn write_many(&self, space: SpaceId, first: PageNo, buf: &[u8]) -> Result<()>;

    fn fsync(&self, space: SpaceId) -> Result<()>;

    /// Extends the tablespace by `n_pages` zeroed pages; returns the first
    /// new page number.
    fn allocate(&self, space: SpaceId, n_pages: u32) -> Result<PageNo>;

    /// Number of pages currently allocated in the space.
    fn size_of(&self, space: SpaceId) -> Result<u32>;
}

/// Retries a transient-looking I/O operation with exponential backoff:
/// three retries, 1s + 2s + 4s, well under the 12 second ceiling.
/// Permanent errors surface immediately for the caller to escalate.
pub fn retry_io<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_secs(1);
    let mut last = None;
    for attempt in 0..4 {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient_io() && attempt < 3 => {
                log::warn!("transient I/O error (attempt {}): {}", attempt + 1, e);
                std::thread::sleep(delay);
                delay *= 2;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap())
}

struct SpaceFile {
    file: File,
    n_pages: u32,
}

/// File-backed block device: one file per tablespace, named `space.N`
/// under the data directory. Reads past the end of a file come back
/// zero-filled; the I/O counters count operations, not pages.
pub struct FileBlockDevice {
    dir: PathBuf,
    page_size: usize,
    spaces: Mutex<HashMap<SpaceId, SpaceFile>>,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl FileBlockDevice {
    pub fn new<P: AsRef<Path>>(dir: P, page_size: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            page_size,
            spaces: Mutex::new(HashMap::new()),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    fn with_space<R>(
        &self,
        space: SpaceId,
        f: impl FnOnce(&mut SpaceFile, usize) -> std::io::Result<R>,
    ) -> Result<R> {
        let mut spaces = self.spaces.lock();
        if !spaces.contains_key(&space) {
            let path = self.dir.join(format!("space.{}", space.as_u32()));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let n_pages = (file.metadata()?.len() / self.page_size as u64) as u32;
            spaces.insert(space, SpaceFile { file, n_pages });
        }
        Ok(f(spaces.get_mut(&space).unwrap(), self.page_size)?)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&self, space: SpaceId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), self.page_size, "buffer must be one page");
        retry_io(|| {
            self.with_space(space, |sf, page_size| {
                sf.file
                    .seek(SeekFrom::Start(page_no.as_u64() * page_size as u64))?;
                let mut read = 0;
                while read < buf.len() {
                    match sf.file.read(&mut buf[read..])? {
                        0 => {
                            buf[read..].fill(0);
                            break;
                        }
                        n => read += n,
                    }
                }
                Ok(())
            })
        })?;
        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, space: SpaceId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), self.page_size, "buffer must be one page");
        retry_io(|| {
            self.with_space(space, |sf, page_size| {
                sf.file
                    .seek(SeekFrom::Start(page_no.as_u64() * page_size as u64))?;
                sf.file.write_all(buf)?;
                sf.n_pages = sf.n_pages.max(page_no.as_u32() + 1);
                Ok(())
            })
        })?;
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_many(&self, space: SpaceId, first: PageNo, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len() % self.page_size, 0, "buffer must be whole pages");
        let n = (buf.len() / self.page_size) as u32;
        self.with_space(space, |sf, page_size| {
            sf.file
                .seek(SeekFrom::Start(first.as_u64() * page_size as u64))?;
            sf.file.write_all(buf)?;
            sf.n_pages = sf.n_pages.max(first.as_u32() + n);
            Ok(())
        })?;
        // One seek, one write: counted as a single operation.
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fsync(&self, space: SpaceId) -> Result<()> {
        retry_io(|| self.with_space(space, |sf, _| sf.file.sync_all()))
    }

    fn allocate(&self, space: SpaceId, n_pages: u32) -> Result<PageNo> {
        let page_size = self.page_size;
        let first = self.with_space(space, |sf, _| {
            let first = sf.n_pages;
            let new_len = (first as u64 + n_pages as u64) * page_size as u64;
            sf.file.set_len(new_len)?;
            sf.n_pages = first + n_pages;
            Ok(first)
        })?;
        Ok(PageNo::new(first))
    }

    fn size_of(&self, space: SpaceId) -> Result<u32> {
        self.with_space(space, |sf, _| Ok(sf.n_pages))
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        let spaces = self.spaces.lock();
        for sf in spaces.values() {
            let _ = sf.file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineError;
    use tempfile::tempdir;

    const PS: usize = 1024;

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
        let space = SpaceId::new(1);

        let first = dev.allocate(space, 4).unwrap();
        assert_eq!(first, PageNo::new(0));

        let mut page = vec![0u8; PS];
        page[0] = 42;
        page[PS - 1] = 7;
        dev.write(space, PageNo::new(2), &page).unwrap();

        let mut back = vec![0u8; PS];
        dev.read(space, PageNo::new(2), &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_read_past_end_zero_fills() {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
        let space = SpaceId::new(0);

        let mut buf = vec![0xFFu8; PS];
        dev.read(space, PageNo::new(10), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_many_counts_one_io() {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
        let space = SpaceId::new(0);

        let buf = vec![3u8; PS * 8];
        dev.write_many(space, PageNo::new(0), &buf).unwrap();
        assert_eq!(dev.num_writes(), 1);

        let mut back = vec![0u8; PS];
        dev.read(space, PageNo::new(7), &mut back).unwrap();
        assert_eq!(back, vec![3u8; PS]);
    }

    #[test]
    fn test_allocate_extends_space() {
        let dir = tempdir().unwrap();
        let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
        let space = SpaceId::new(2);

        assert_eq!(dev.size_of(space).unwrap(), 0);
        let first = dev.allocate(space, 3).unwrap();
        assert_eq!(first, PageNo::new(0));
        let next = dev.allocate(space, 2).unwrap();
        assert_eq!(next, PageNo::new(3));
        assert_eq!(dev.size_of(space).unwrap(), 5);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let space = SpaceId::new(1);
        {
            let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
            dev.allocate(space, 1).unwrap();
            let page = vec![9u8; PS];
            dev.write(space, PageNo::new(0), &page).unwrap();
            dev.fsync(space).unwrap();
        }
        let dev = FileBlockDevice::new(dir.path(), PS).unwrap();
        assert_eq!(dev.size_of(space).unwrap(), 1);
        let mut back = vec![0u8; PS];
        dev.read(space, PageNo::new(0), &mut back).unwrap();
        assert_eq!(back, vec![9u8; PS]);
    }

    #[test]
    fn test_retry_gives_up_on_permanent_error() {
        let mut calls = 0;
        let result: Result<()> = retry_io(|| {
            calls += 1;
            Err(EngineError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
