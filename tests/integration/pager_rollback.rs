#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use pagekeep::primitives::io::file_exists;
use pagekeep::primitives::pager::{journal_path, JOURNAL_MAGIC};
use pagekeep::types::journal_crc32;
use pagekeep::{ErrorMask, LockState, PageNo, Pager, PagerError, PagerOptions, Result};
use tempfile::tempdir;

const PAGE: usize = 1024;

fn seed(path: &Path, pages: u32, fill: u8) -> Result<()> {
    let pager = Pager::open(path, PagerOptions::default())?;
    let anchor = pager.fetch(PageNo(1))?;
    for n in 1..=pages {
        let page = pager.fetch(PageNo(n))?;
        page.write()?.fill(fill);
    }
    pager.commit()?;
    drop(anchor);
    pager.close()
}

fn page_bytes(pager: &Pager, n: u32) -> Result<Vec<u8>> {
    let page = pager.fetch(PageNo(n))?;
    let bytes = page.data().to_vec();
    Ok(bytes)
}

fn journal_record(nonce: u64, page_no: u32, image: &[u8]) -> Vec<u8> {
    let mut record = page_no.to_be_bytes().to_vec();
    record.extend_from_slice(image);
    record.extend_from_slice(&journal_crc32(nonce, page_no, image).to_be_bytes());
    record
}

fn journal_header(orig_len: u64, nonce: u64) -> Vec<u8> {
    let mut header = JOURNAL_MAGIC.to_vec();
    header.extend_from_slice(&orig_len.to_be_bytes());
    header.extend_from_slice(&(PAGE as u32).to_be_bytes());
    header.extend_from_slice(&nonce.to_be_bytes());
    header
}

#[test]
fn rollback_restores_committed_pages_and_size() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("rollback.db");
    seed(&path, 2, 0x11)?;

    let pager = Pager::open(&path, PagerOptions::default())?;
    let first = pager.fetch(PageNo(1))?;
    first.write()?.fill(0x99);
    let grown = pager.fetch(PageNo(4))?;
    grown.write()?.fill(0x44);
    assert_eq!(pager.page_count()?, 4);

    pager.rollback()?;
    assert_eq!(pager.lock_state(), LockState::ReadLocked);
    assert!(first.data().iter().all(|&b| b == 0x11));
    assert!(!first.is_dirty());
    assert!(grown.data().iter().all(|&b| b == 0));
    assert_eq!(pager.page_count()?, 2);
    assert!(!file_exists(pager.journal_path()));
    drop(grown);
    drop(first);
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 2 * PAGE as u64);
    assert_eq!(pager.stats().rollbacks, 1);
    Ok(())
}

/// A file whose tail is a partial page: one full page of 0x11, then 476 bytes of 0x22.
fn seed_partial(path: &Path) -> Vec<u8> {
    let mut bytes = vec![0x11; PAGE];
    bytes.extend_from_slice(&[0x22; 476]);
    fs::write(path, &bytes).expect("write db");
    bytes
}

#[test]
fn commit_keeps_untouched_partial_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("partial_commit.db");
    let original = seed_partial(&path);

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert_eq!(pager.page_count()?, 1);
    let tail = pager.fetch(PageNo(2))?;
    assert!(tail.data()[..476].iter().all(|&b| b == 0x22));
    assert!(tail.data()[476..].iter().all(|&b| b == 0));
    let first = pager.fetch(PageNo(1))?;
    first.write()?.fill(0x33);
    pager.commit()?;
    drop((first, tail));
    pager.close()?;

    let on_disk = fs::read(&path).expect("read db");
    assert_eq!(on_disk.len(), original.len());
    assert!(on_disk[..PAGE].iter().all(|&b| b == 0x33));
    assert_eq!(&on_disk[PAGE..], &original[PAGE..]);
    Ok(())
}

#[test]
fn rollback_restores_partial_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("partial_rollback.db");
    let original = seed_partial(&path);

    let pager = Pager::open(&path, PagerOptions::default())?;
    let anchor = pager.fetch(PageNo(1))?;
    {
        let tail = pager.fetch(PageNo(2))?;
        tail.write()?.fill(0x44);
        assert!(tail.in_journal());
    }
    assert_eq!(pager.page_count()?, 2);
    pager.rollback()?;
    let tail = page_bytes(&pager, 2)?;
    assert!(tail[..476].iter().all(|&b| b == 0x22));
    assert!(tail[476..].iter().all(|&b| b == 0));
    assert_eq!(pager.page_count()?, 1);
    drop(anchor);
    pager.close()?;

    assert_eq!(fs::read(&path).expect("read db"), original);
    Ok(())
}

#[test]
fn hot_journal_restores_partial_tail_length() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("partial_hot.db");
    let original = seed_partial(&path);
    // Crashed writer: page 2 written out in full over the partial tail.
    let mut crashed = original.clone();
    crashed.resize(2 * PAGE, 0x55);
    crashed[PAGE..].fill(0x55);
    fs::write(&path, &crashed).expect("overwrite db");
    let mut image = vec![0u8; PAGE];
    image[..476].fill(0x22);
    let nonce = 0x0bad_cafe;
    let mut journal = journal_header(original.len() as u64, nonce);
    journal.extend(journal_record(nonce, 2, &image));
    fs::write(journal_path(&path), journal).expect("write journal");

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert_eq!(page_bytes(&pager, 2)?, image);
    assert_eq!(pager.stats().hot_journal_recoveries, 1);
    pager.close()?;
    assert_eq!(fs::read(&path).expect("read db"), original);
    Ok(())
}

#[test]
fn releasing_every_page_abandons_the_transaction() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("abandon.db");
    seed(&path, 1, 0x21)?;

    let pager = Pager::open(&path, PagerOptions::default())?;
    {
        let page = pager.fetch(PageNo(1))?;
        page.write()?.fill(0x77);
        assert_eq!(pager.lock_state(), LockState::WriteLocked);
    }
    assert_eq!(pager.lock_state(), LockState::Unlocked);
    assert_eq!(pager.cached_pages(), 0);
    assert!(!file_exists(pager.journal_path()));
    assert!(page_bytes(&pager, 1)?.iter().all(|&b| b == 0x21));
    Ok(())
}

#[test]
fn crash_snapshot_is_recovered_from_hot_journal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("live.db");
    seed(&path, 3, 0x11)?;

    let options = PagerOptions {
        cache_pages: 2,
        ..PagerOptions::default()
    };
    let writer = Pager::open(&path, options)?;
    let anchor = writer.fetch(PageNo(3))?;
    {
        let page = writer.fetch(PageNo(1))?;
        page.write()?.fill(0x99);
    }
    // Loading page 2 evicts dirty page 1 to the database file.
    drop(writer.fetch(PageNo(2))?);
    assert_eq!(writer.stats().dirty_writebacks, 1);

    let crashed = dir.path().join("crashed.db");
    fs::copy(&path, &crashed).expect("copy db");
    fs::copy(writer.journal_path(), journal_path(&crashed)).expect("copy journal");
    assert_eq!(fs::read(&crashed).expect("read")[0], 0x99);

    let recovered = Pager::open(&crashed, PagerOptions::default())?;
    assert!(page_bytes(&recovered, 1)?.iter().all(|&b| b == 0x11));
    assert_eq!(recovered.stats().hot_journal_recoveries, 1);
    assert!(!file_exists(journal_path(&crashed)));
    assert_eq!(recovered.page_count()?, 3);

    drop(anchor);
    writer.close()?;
    assert!(page_bytes(&Pager::open(&path, PagerOptions::default())?, 1)?
        .iter()
        .all(|&b| b == 0x11));
    Ok(())
}

#[test]
fn hot_journal_playback_stops_at_torn_record_and_truncates() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("torn.db");
    seed(&path, 2, 0xAA)?;
    // Crashed writer: both pages overwritten, a third appended.
    fs::write(&path, vec![0xEE; 3 * PAGE]).expect("overwrite db");
    let nonce = 0x0123_4567_89AB_CDEF;
    let mut journal = journal_header(2 * PAGE as u64, nonce);
    journal.extend(journal_record(nonce, 1, &[0xAA; PAGE]));
    let mut torn = journal_record(nonce, 2, &[0xAA; PAGE]);
    let last = torn.len() - 1;
    torn[last] ^= 0xFF;
    journal.extend(torn);
    fs::write(journal_path(&path), journal).expect("write journal");

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert!(page_bytes(&pager, 1)?.iter().all(|&b| b == 0xAA));
    assert!(page_bytes(&pager, 2)?.iter().all(|&b| b == 0xEE));
    assert_eq!(pager.page_count()?, 2);
    assert!(!file_exists(pager.journal_path()));
    Ok(())
}

#[test]
fn journal_without_header_is_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("headerless.db");
    seed(&path, 1, 0x31)?;
    fs::write(journal_path(&path), &JOURNAL_MAGIC[..4]).expect("write journal");

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert!(page_bytes(&pager, 1)?.iter().all(|&b| b == 0x31));
    assert!(!file_exists(pager.journal_path()));
    Ok(())
}

#[test]
fn unreadable_hot_journal_is_sticky_corruption() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("garbled.db");
    seed(&path, 1, 0x41)?;
    fs::write(journal_path(&path), vec![0x42; 64]).expect("write journal");

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert!(matches!(
        pager.fetch(PageNo(1)),
        Err(PagerError::Corruption(_))
    ));
    assert!(pager.error_mask().contains(ErrorMask::CORRUPT));
    assert_eq!(pager.lock_state(), LockState::Unlocked);
    assert!(file_exists(pager.journal_path()));
    assert!(matches!(
        pager.fetch(PageNo(1)),
        Err(PagerError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn checkpoint_rollback_returns_to_checkpoint_state() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("ckpt.db");
    seed(&path, 2, 0x01)?;

    let pager = Pager::open(&path, PagerOptions::default())?;
    let first = pager.fetch(PageNo(1))?;
    first.write()?.fill(0x02);
    pager.checkpoint_begin()?;
    first.write()?.fill(0x03);
    let second = pager.fetch(PageNo(2))?;
    second.write()?.fill(0x04);
    let grown = pager.fetch(PageNo(4))?;
    grown.write()?.fill(0x05);
    assert_eq!(pager.page_count()?, 4);

    pager.checkpoint_rollback()?;
    assert_eq!(pager.lock_state(), LockState::WriteLocked);
    assert!(first.data().iter().all(|&b| b == 0x02));
    assert!(first.is_dirty());
    assert!(second.data().iter().all(|&b| b == 0x01));
    assert!(grown.data().iter().all(|&b| b == 0));
    assert!(!grown.is_dirty());
    assert_eq!(pager.page_count()?, 2);

    pager.commit()?;
    drop((first, second, grown));
    pager.close()?;

    let reopened = Pager::open(&path, PagerOptions::default())?;
    assert_eq!(reopened.page_count()?, 2);
    assert!(page_bytes(&reopened, 1)?.iter().all(|&b| b == 0x02));
    assert!(page_bytes(&reopened, 2)?.iter().all(|&b| b == 0x01));
    Ok(())
}

#[test]
fn checkpoint_commit_keeps_changes_until_full_rollback() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("ckpt_commit.db");
    seed(&path, 1, 0x10)?;

    let pager = Pager::open(&path, PagerOptions::default())?;
    assert!(matches!(
        pager.checkpoint_begin(),
        Err(PagerError::Protocol(_))
    ));
    let page = pager.fetch(PageNo(1))?;
    page.write()?.fill(0x20);
    pager.checkpoint_begin()?;
    page.write()?.fill(0x30);
    pager.checkpoint_commit()?;
    assert!(page.data().iter().all(|&b| b == 0x30));

    pager.rollback()?;
    assert!(page.data().iter().all(|&b| b == 0x10));
    Ok(())
}
