#![allow(missing_docs)]
#![cfg(target_os = "linux")]

use pagekeep::{ErrorMask, LockState, PageNo, Pager, PagerError, PagerOptions, Result};
use tempfile::tempdir;

#[test]
fn readers_share_and_writer_waits_for_them() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("shared.db");
    let a = Pager::open(&path, PagerOptions::default())?;
    let b = Pager::open(&path, PagerOptions::default())?;

    let page_a = a.fetch(PageNo(1))?;
    let page_b = b.fetch(PageNo(1))?;
    assert_eq!(a.lock_state(), LockState::ReadLocked);
    assert_eq!(b.lock_state(), LockState::ReadLocked);

    assert!(matches!(a.begin_write(), Err(PagerError::Busy)));
    assert_eq!(a.lock_state(), LockState::ReadLocked);
    assert!(matches!(page_a.write(), Err(PagerError::Busy)));
    assert!(a.error_mask().is_empty());

    drop(page_b);
    assert_eq!(b.lock_state(), LockState::Unlocked);
    page_a.write()?.fill(0xAB);
    assert_eq!(a.lock_state(), LockState::WriteLocked);
    Ok(())
}

#[test]
fn writer_blocks_new_readers_until_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("writer.db");
    let writer = Pager::open(&path, PagerOptions::default())?;
    let reader = Pager::open(&path, PagerOptions::default())?;

    let page = writer.fetch(PageNo(1))?;
    page.write()?.fill(0x5C);
    let err = reader.fetch(PageNo(1)).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(reader.lock_state(), LockState::Unlocked);
    assert_eq!(reader.error_mask(), ErrorMask::empty());

    writer.commit()?;
    let seen = reader.fetch(PageNo(1))?;
    assert!(seen.data().iter().all(|&b| b == 0x5C));
    drop(seen);
    drop(page);
    Ok(())
}

#[test]
fn busy_reader_does_not_touch_a_live_journal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("live_journal.db");
    let writer = Pager::open(&path, PagerOptions::default())?;
    let page = writer.fetch(PageNo(1))?;
    page.write()?.fill(1);
    assert!(writer.journal_path().exists());

    let reader = Pager::open(&path, PagerOptions::default())?;
    assert!(matches!(reader.fetch(PageNo(1)), Err(PagerError::Busy)));
    assert!(writer.journal_path().exists());
    assert_eq!(reader.stats().hot_journal_recoveries, 0);

    writer.rollback()?;
    assert!(!writer.journal_path().exists());
    drop(page);
    Ok(())
}
