use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::common::Result;

use super::page::{bytes_to_words, words_to_bytes, LOG_PAGE_BYTES, LOG_PAGE_WORDS, PAGES_PER_FILE};

/// The log device consumed by the log manager and reader: page-granular
/// access to the redo file set. Implementations map a flat page index onto
/// 16-mbyte files.
pub trait LogDevice: Send + Sync {
    /// Writes one 32 KiB log page. Durability is NOT implied.
    fn write_page(&self, page_index: u64, page: &[u32]) -> Result<()>;

    /// Reads one 32 KiB log page; pages never written read back as zeros.
    fn read_page(&self, page_index: u64, out: &mut [u32]) -> Result<()>;

    /// Makes every prior write durable.
    fn flush(&self) -> Result<()>;
}

/// File-backed log device: one file per 16 mbytes, named `redo.N` under
/// the log directory.
pub struct FileLogDevice {
    dir: PathBuf,
    files: Mutex<HashMap<u32, File>>,
}

impl FileLogDevice {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn with_file<R>(
        &self,
        file_no: u32,
        f: impl FnOnce(&mut File) -> std::io::Result<R>,
    ) -> Result<R> {
        let mut files = self.files.lock();
        if !files.contains_key(&file_no) {
            let path = self.dir.join(format!("redo.{}", file_no));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            files.insert(file_no, file);
        }
        Ok(f(files.get_mut(&file_no).unwrap())?)
    }

    fn split(page_index: u64) -> (u32, u64) {
        let file_no = (page_index / PAGES_PER_FILE as u64) as u32;
        let offset = (page_index % PAGES_PER_FILE as u64) * LOG_PAGE_BYTES as u64;
        (file_no, offset)
    }
}

impl LogDevice for FileLogDevice {
    fn write_page(&self, page_index: u64, page: &[u32]) -> Result<()> {
        assert_eq!(page.len(), LOG_PAGE_WORDS);
        let mut bytes = vec![0u8; LOG_PAGE_BYTES];
        words_to_bytes(page, &mut bytes);
        let (file_no, offset) = Self::split(page_index);
        self.with_file(file_no, |f| {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(&bytes)
        })
    }

    fn read_page(&self, page_index: u64, out: &mut [u32]) -> Result<()> {
        assert_eq!(out.len(), LOG_PAGE_WORDS);
        let mut bytes = vec![0u8; LOG_PAGE_BYTES];
        let (file_no, offset) = Self::split(page_index);
        self.with_file(file_no, |f| {
            f.seek(SeekFrom::Start(offset))?;
            let mut read = 0;
            while read < bytes.len() {
                match f.read(&mut bytes[read..])? {
                    0 => break, // short file reads back zero-filled
                    n => read += n,
                }
            }
            Ok(())
        })?;
        bytes_to_words(&bytes, out);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for file in files.values() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_page_roundtrip() {
        let dir = tempdir().unwrap();
        let dev = FileLogDevice::new(dir.path()).unwrap();

        let mut page = vec![0u32; LOG_PAGE_WORDS];
        page[0] = 0xAA;
        page[8191] = 0xBB;
        dev.write_page(3, &page).unwrap();

        let mut back = vec![0u32; LOG_PAGE_WORDS];
        dev.read_page(3, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_unwritten_page_reads_zero() {
        let dir = tempdir().unwrap();
        let dev = FileLogDevice::new(dir.path()).unwrap();

        let mut page = vec![1u32; LOG_PAGE_WORDS];
        dev.read_page(100, &mut page).unwrap();
        assert!(page.iter().all(|&w| w == 0));
    }

    #[test]
    fn test_pages_span_files() {
        let dir = tempdir().unwrap();
        let dev = FileLogDevice::new(dir.path()).unwrap();

        let mut page = vec![0u32; LOG_PAGE_WORDS];
        page[5] = 42;
        // Page index beyond one file lands in redo.1.
        dev.write_page(PAGES_PER_FILE as u64 + 2, &page).unwrap();
        assert!(dir.path().join("redo.1").exists());

        let mut back = vec![0u32; LOG_PAGE_WORDS];
        dev.read_page(PAGES_PER_FILE as u64 + 2, &mut back).unwrap();
        assert_eq!(back[5], 42);
    }
}
