//! Rollback journal format.
//!
//! ```text
//! header  : magic[8] | orig_len u64 | page_size u32 | nonce u64
//! record  : page_no u32 | image[page_size] | crc32 u32
//! ```
//!
//! All integers are big-endian. `orig_len` is the database length in bytes
//! when the journal was started, so a file ending in a partial page is
//! restored to its exact size. The record checksum covers the nonce, the
//! page number and the image, so a record torn by a crash is recognised and
//! playback stops there.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::primitives::io::LockFile;
use crate::types::{journal_crc32, PageNo, PagerError, Result};

/// Signature identifying a rollback journal written by this pager.
pub const JOURNAL_MAGIC: [u8; 8] = [0xD9, 0xD5, 0x05, 0xF9, 0x20, 0xA1, 0x63, 0xD4];
/// Length of the journal header in bytes.
pub const JOURNAL_HEADER_LEN: usize = 28;

const RECORD_OVERHEAD: usize = 8;

/// Path of the rollback journal belonging to database `path`.
pub fn journal_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("pagekeep"));
    name.push("-journal");
    let mut journal = path.to_path_buf();
    journal.set_file_name(name);
    journal
}

fn record_len(page_size: usize) -> usize {
    page_size + RECORD_OVERHEAD
}

fn encode_header(orig_len: u64, page_size: u32, nonce: u64) -> [u8; JOURNAL_HEADER_LEN] {
    let mut buf = [0u8; JOURNAL_HEADER_LEN];
    buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
    buf[8..16].copy_from_slice(&orig_len.to_be_bytes());
    buf[16..20].copy_from_slice(&page_size.to_be_bytes());
    buf[20..28].copy_from_slice(&nonce.to_be_bytes());
    buf
}

struct Header {
    orig_len: u64,
    page_size: u32,
    nonce: u64,
}

fn decode_header(buf: &[u8; JOURNAL_HEADER_LEN]) -> Result<Header> {
    if buf[0..8] != JOURNAL_MAGIC {
        return Err(PagerError::Corruption("journal magic mismatch"));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&buf[8..16]);
    let mut size = [0u8; 4];
    size.copy_from_slice(&buf[16..20]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&buf[20..28]);
    Ok(Header {
        orig_len: u64::from_be_bytes(len),
        page_size: u32::from_be_bytes(size),
        nonce: u64::from_be_bytes(nonce),
    })
}

/// An open journal being appended to during a write transaction.
///
/// Tracks every page it covers so the coverage survives the page being
/// evicted and reloaded.
pub struct Journal {
    file: LockFile,
    page_size: usize,
    nonce: u64,
    orig_len: u64,
    records: u32,
    covered: HashSet<PageNo>,
}

impl Journal {
    /// Writes a fresh header into `file` and returns the journal.
    pub fn create(file: LockFile, page_size: usize, orig_len: u64) -> Result<Self> {
        let nonce = rand::random::<u64>();
        file.truncate(0)?;
        file.write_at(
            0,
            &encode_header(orig_len, page_size as u32, nonce),
        )?;
        Ok(Self {
            file,
            page_size,
            nonce,
            orig_len,
            records: 0,
            covered: HashSet::new(),
        })
    }

    /// Database length in bytes when the journal was started.
    pub fn orig_len(&self) -> u64 {
        self.orig_len
    }

    /// True when `page_no` holds bytes that existed when the journal was
    /// started, including a partial last page.
    pub fn predates(&self, page_no: PageNo) -> bool {
        page_no.offset(self.page_size) < self.orig_len
    }

    /// Number of records appended so far.
    pub fn records(&self) -> u32 {
        self.records
    }

    /// Appends the pre-image of `page_no`.
    pub fn append(&mut self, page_no: PageNo, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), self.page_size);
        let mut record = Vec::with_capacity(record_len(self.page_size));
        record.extend_from_slice(&page_no.0.to_be_bytes());
        record.extend_from_slice(image);
        record.extend_from_slice(&journal_crc32(self.nonce, page_no.0, image).to_be_bytes());
        let off = JOURNAL_HEADER_LEN as u64 + u64::from(self.records) * record.len() as u64;
        self.file.write_at(off, &record)?;
        self.records += 1;
        self.covered.insert(page_no);
        Ok(())
    }

    /// Marks a page past the original end as covered. Rollback truncates it
    /// away, so no pre-image is needed.
    pub fn mark(&mut self, page_no: PageNo) {
        self.covered.insert(page_no);
    }

    /// True when `page_no` was appended or marked.
    pub fn contains(&self, page_no: PageNo) -> bool {
        self.covered.contains(&page_no)
    }

    /// Flushes the journal to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    #[cfg(test)]
    fn file(&self) -> &LockFile {
        &self.file
    }

    /// Consumes the journal, returning its file handle.
    pub fn into_file(self) -> LockFile {
        self.file
    }
}

/// Replays every intact record of the journal in `file` through `apply`.
///
/// Returns the original database length stored in the header, or `None` when the
/// file is too short to hold a header (the writer crashed before any page
/// was journaled, so there is nothing to undo).
pub fn replay<F>(file: &LockFile, page_size: usize, mut apply: F) -> Result<Option<u64>>
where
    F: FnMut(PageNo, &[u8]) -> Result<()>,
{
    let len = file.size()?;
    if len < JOURNAL_HEADER_LEN as u64 {
        debug!(len, "journal.replay.no_header");
        return Ok(None);
    }
    let mut raw = [0u8; JOURNAL_HEADER_LEN];
    file.read_at(0, &mut raw)?;
    let header = decode_header(&raw)?;
    if header.page_size as usize != page_size {
        return Err(PagerError::Corruption("journal page size mismatch"));
    }

    let rec_len = record_len(page_size);
    let mut record = vec![0u8; rec_len];
    let mut off = JOURNAL_HEADER_LEN as u64;
    let mut applied = 0u32;
    while off + rec_len as u64 <= len {
        file.read_at(off, &mut record)?;
        let mut no = [0u8; 4];
        no.copy_from_slice(&record[0..4]);
        let page_no = PageNo(u32::from_be_bytes(no));
        let image = &record[4..4 + page_size];
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&record[4 + page_size..]);
        if !page_no.is_valid()
            || u32::from_be_bytes(crc) != journal_crc32(header.nonce, page_no.0, image)
        {
            warn!(offset = off, page = page_no.0, "journal.replay.torn_record");
            break;
        }
        apply(page_no, image)?;
        applied += 1;
        off += rec_len as u64;
    }
    debug!(
        records = applied,
        orig_len = header.orig_len,
        "journal.replay.complete"
    );
    Ok(Some(header.orig_len))
}
