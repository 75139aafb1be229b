#![allow(missing_docs)]

use std::path::Path;

use tempfile::tempdir;
use txstore::{File, Options, PageId, Result, StoreError};

fn open(path: &Path) -> Result<File> {
    File::open(
        path,
        Options {
            page_size: 4096,
            ..Options::default()
        },
    )
}

fn prefix(tx: &mut txstore::Tx<'_>, id: PageId, len: usize) -> Result<Vec<u8>> {
    Ok(tx.page(id)?.bytes()?[..len].to_vec())
}

#[test]
fn write_reopen_overwrite_scenario() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("scenario.db");

    let root = {
        let file = open(&path)?;
        let mut tx = file.begin()?;
        let ids = tx.alloc_n(3)?;
        for (id, data) in ids.iter().zip([b"A", b"B", b"C"]) {
            tx.page(*id)?.set_bytes(data)?;
        }
        tx.set_root(ids[0])?;
        tx.commit()?;
        drop(tx);
        file.close()?;
        ids[0]
    };

    let file = open(&path)?;
    {
        let mut tx = file.begin_readonly()?;
        assert_eq!(tx.root(), root);
        assert_eq!(prefix(&mut tx, root, 1)?, b"A");
    }

    let mut writer = file.begin()?;
    writer.page(root)?.set_bytes(b"A2")?;
    writer.flush()?;
    {
        let mut reader = file.begin_readonly()?;
        assert_eq!(prefix(&mut reader, root, 2)?, b"A\0");
        // The reader closes before the commit below waits for readers.
    }
    writer.commit()?;
    drop(writer);

    let mut tx = file.begin_readonly()?;
    assert_eq!(prefix(&mut tx, root, 2)?, b"A2");
    Ok(())
}

#[test]
fn free_then_reuse_across_commits() -> Result<()> {
    let dir = tempdir()?;
    let file = open(&dir.path().join("reuse.db"))?;

    let mut tx = file.begin()?;
    let ids = tx.alloc_n(4)?;
    tx.commit()?;
    drop(tx);

    let mut tx = file.begin()?;
    tx.page(ids[1])?.free()?;
    // Freed committed pages are only reusable after the commit.
    let fresh = tx.alloc_n(1)?;
    assert!(!fresh.contains(&ids[1]));
    tx.commit()?;
    drop(tx);

    let mut tx = file.begin()?;
    assert!(matches!(tx.page(ids[1]), Err(StoreError::FreedPage(_))));
    assert_eq!(tx.alloc_n(1)?, vec![ids[1]]);
    tx.commit()?;
    Ok(())
}

#[test]
fn contiguous_region_allocation_is_best_fit() -> Result<()> {
    let dir = tempdir()?;
    let file = open(&dir.path().join("regions.db"))?;

    let mut tx = file.begin()?;
    let ids = tx.alloc_n(12)?;
    tx.commit()?;
    drop(tx);

    // Leave holes of 3 and 2 pages.
    let mut tx = file.begin()?;
    for &id in ids[1..4].iter().chain(&ids[6..8]) {
        tx.page(id)?.free()?;
    }
    tx.commit()?;
    drop(tx);

    let mut tx = file.begin()?;
    let region = tx.alloc_region(2)?;
    assert_eq!(region.start, ids[6]);
    let region = tx.alloc_region(3)?;
    assert_eq!(region.start, ids[1]);
    tx.commit()?;
    Ok(())
}

#[test]
fn rollback_leaves_no_trace() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rollback.db");
    let file = open(&path)?;
    let before = file.stats()?;

    let mut tx = file.begin()?;
    let ids = tx.alloc_n(64)?;
    for &id in &ids {
        tx.page(id)?.set_bytes(b"discarded")?;
    }
    tx.flush()?;
    tx.rollback()?;
    drop(tx);

    let after = file.stats()?;
    assert_eq!(after.txid, before.txid);
    assert_eq!(after.data_end, before.data_end);
    assert_eq!(after.file_size, before.file_size);
    file.close()?;

    let file = open(&path)?;
    let mut tx = file.begin_readonly()?;
    assert!(matches!(tx.page(ids[0]), Err(StoreError::OutOfBounds(_))));
    Ok(())
}
