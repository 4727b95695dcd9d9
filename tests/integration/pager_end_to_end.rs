#![allow(missing_docs)]

use std::fs;

use pagekeep::primitives::io::file_exists;
use pagekeep::{LockState, PageNo, Pager, PagerError, PagerOptions, Result, Synchronous};
use tempfile::tempdir;

const PAGE: usize = 1024;

#[test]
fn fresh_database_commit_survives_reopen() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("fresh.db");
    let pager = Pager::open(&path, PagerOptions::default())?;
    assert_eq!(pager.page_count()?, 0);
    assert_eq!(pager.lock_state(), LockState::Unlocked);

    let page = pager.fetch(PageNo(1))?;
    assert_eq!(pager.lock_state(), LockState::ReadLocked);
    assert!(page.data().iter().all(|&b| b == 0));
    page.write()?[..5].copy_from_slice(b"hello");
    assert_eq!(pager.lock_state(), LockState::WriteLocked);
    assert!(page.is_dirty());
    pager.commit()?;
    assert!(!page.is_dirty());
    assert_eq!(pager.page_count()?, 1);
    assert!(!file_exists(pager.journal_path()));
    drop(page);
    assert_eq!(pager.lock_state(), LockState::Unlocked);
    pager.close()?;

    assert_eq!(fs::metadata(&path).expect("metadata").len(), PAGE as u64);
    let reopened = Pager::open(&path, PagerOptions::default())?;
    let page = reopened.fetch(PageNo(1))?;
    assert_eq!(&page.data()[..5], b"hello");
    assert_eq!(reopened.stats().disk_reads, 1);
    Ok(())
}

#[test]
fn pages_past_the_end_read_as_zero_and_grow_at_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("grow.db");
    let pager = Pager::open(&path, PagerOptions::default())?;
    let page = pager.fetch(PageNo(5))?;
    assert!(page.data().iter().all(|&b| b == 0));
    assert_eq!(pager.stats().disk_reads, 0);
    page.write()?.fill(0x55);
    assert_eq!(pager.page_count()?, 5);
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 0);
    pager.commit()?;
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 5 * PAGE as u64);

    let hole = pager.fetch(PageNo(3))?;
    assert!(hole.data().iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn page_zero_is_rejected() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let pager = Pager::open(dir.path().join("zero.db"), PagerOptions::default())?;
    assert!(matches!(pager.fetch(PageNo(0)), Err(PagerError::Invalid(_))));
    assert!(pager.lookup(PageNo(0))?.is_none());
    assert_eq!(pager.lock_state(), LockState::Unlocked);

    let held = pager.fetch(PageNo(1))?;
    assert_eq!(pager.lock_state(), LockState::ReadLocked);
    assert!(matches!(pager.fetch(PageNo(0)), Err(PagerError::Invalid(_))));
    assert!(pager.lookup(PageNo(0))?.is_none());
    assert_eq!(pager.lock_state(), LockState::ReadLocked);

    held.write()?[0] = 1;
    assert_eq!(pager.lock_state(), LockState::WriteLocked);
    assert!(matches!(pager.fetch(PageNo(0)), Err(PagerError::Invalid(_))));
    assert!(pager.lookup(PageNo(0))?.is_none());
    assert_eq!(pager.lock_state(), LockState::WriteLocked);
    assert!(held.is_dirty());
    assert_eq!(pager.cached_pages(), 1);
    drop(held);
    Ok(())
}

#[test]
fn every_synchronous_mode_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    for (idx, mode) in [Synchronous::Full, Synchronous::Normal, Synchronous::Off]
        .into_iter()
        .enumerate()
    {
        let path = dir.path().join(format!("sync_{}.db", mode.as_str()));
        let options = PagerOptions {
            synchronous: mode,
            ..PagerOptions::default()
        };
        {
            let pager = Pager::open(&path, options.clone())?;
            let page = pager.fetch(PageNo(2))?;
            page.write()?.fill(idx as u8 + 1);
            pager.commit()?;
        }
        let pager = Pager::open(&path, options)?;
        assert_eq!(pager.page_count()?, 2);
        let page = pager.fetch(PageNo(2))?;
        assert!(page.data().iter().all(|&b| b == idx as u8 + 1));
    }
    Ok(())
}

#[test]
fn read_only_pager_refuses_writes() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("ro.db");
    {
        let pager = Pager::open(&path, PagerOptions::default())?;
        let page = pager.fetch(PageNo(1))?;
        page.write()?.fill(9);
        pager.commit()?;
    }
    let options = PagerOptions {
        read_only: true,
        ..PagerOptions::default()
    };
    let pager = Pager::open(&path, options)?;
    assert!(pager.is_read_only());
    let page = pager.fetch(PageNo(1))?;
    assert_eq!(page.data()[0], 9);
    assert!(matches!(page.write(), Err(PagerError::ReadOnly)));
    assert!(matches!(pager.begin_write(), Err(PagerError::ReadOnly)));
    assert!(pager.error_mask().is_empty());
    Ok(())
}

#[test]
fn read_only_open_of_missing_file_fails() {
    let dir = tempdir().expect("tmpdir");
    let options = PagerOptions {
        read_only: true,
        ..PagerOptions::default()
    };
    let err = Pager::open(dir.path().join("absent.db"), options).unwrap_err();
    assert!(matches!(err, PagerError::CannotOpen { .. }));
}

#[test]
fn invalid_options_are_rejected_at_open() {
    let dir = tempdir().expect("tmpdir");
    let options = PagerOptions {
        page_size: 3000,
        ..PagerOptions::default()
    };
    assert!(matches!(
        Pager::open(dir.path().join("bad.db"), options),
        Err(PagerError::Invalid(_))
    ));
}

#[test]
fn custom_page_size_is_used_for_offsets() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("big.db");
    let options = PagerOptions {
        page_size: 4096,
        ..PagerOptions::default()
    };
    {
        let pager = Pager::open(&path, options.clone())?;
        assert_eq!(pager.page_size(), 4096);
        let page = pager.fetch(PageNo(2))?;
        page.write()?[4095] = 0xEE;
        pager.commit()?;
    }
    let raw = fs::read(&path).expect("read db");
    assert_eq!(raw.len(), 8192);
    assert_eq!(raw[8191], 0xEE);
    let pager = Pager::open(&path, options)?;
    assert_eq!(pager.page_count()?, 2);
    Ok(())
}
