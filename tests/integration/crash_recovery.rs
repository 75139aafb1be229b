#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{abort, Command};

use tempfile::tempdir;
use txstore::{File, Options, PageId, Result, TxId};

const PAGE: usize = 1024;

fn options() -> Options {
    Options {
        page_size: PAGE as u32,
        ..Options::default()
    }
}

fn read_prefix(file: &File, id: PageId, len: usize) -> Result<Vec<u8>> {
    let mut tx = file.begin_readonly()?;
    let bytes = tx.page(id)?.bytes()?[..len].to_vec();
    Ok(bytes)
}

/// Commits a first transaction (root page "first"), then a second one that
/// rewrites the root page, frees a page and allocates new ones. Returns the
/// root id and the file image taken between the two commits.
fn two_commits(path: &Path) -> Result<(PageId, Vec<u8>)> {
    let file = File::open(path, options())?;
    let mut tx = file.begin()?;
    let ids = tx.alloc_n(8)?;
    tx.page(ids[0])?.set_bytes(b"first")?;
    tx.page(ids[5])?.set_bytes(b"doomed")?;
    tx.set_root(ids[0])?;
    tx.commit()?;
    drop(tx);
    file.close()?;
    let image = fs::read(path)?;

    let file = File::open(path, options())?;
    let mut tx = file.begin()?;
    tx.page(ids[0])?.set_bytes(b"second")?;
    tx.page(ids[5])?.free()?;
    for id in tx.alloc_n(3)? {
        tx.page(id)?.set_bytes(b"new")?;
    }
    tx.commit()?;
    drop(tx);
    file.close()?;
    Ok((ids[0], image))
}

/// Slot written by the second commit: the initial file holds txid 0 and 1, so
/// txid 2 lands in slot 0 and txid 3 in slot 1.
const SECOND_COMMIT_SLOT: usize = 1;

fn slot_range(slot: usize) -> std::ops::Range<usize> {
    slot * PAGE..(slot + 1) * PAGE
}

fn assert_first_commit(path: &Path, root: PageId) -> Result<()> {
    let file = File::open(path, options())?;
    assert_eq!(file.stats()?.txid, 2);
    let tx = file.begin_readonly()?;
    assert_eq!(tx.id(), TxId(2));
    assert_eq!(tx.root(), root);
    drop(tx);
    assert_eq!(read_prefix(&file, root, 6)?, b"first\0");
    let mut tx = file.begin_readonly()?;
    assert!(tx.page(PageId(root.0 + 5)).is_ok());
    Ok(())
}

#[test]
fn crash_before_meta_write_keeps_previous_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crash.db");
    let (root, image) = two_commits(&path)?;

    // Payload of the second commit reached the disk, its meta page did not.
    let mut bytes = fs::read(&path)?;
    let range = slot_range(SECOND_COMMIT_SLOT);
    bytes[range.clone()].copy_from_slice(&image[range]);
    fs::write(&path, &bytes)?;

    assert_first_commit(&path, root)
}

#[test]
fn torn_meta_write_keeps_previous_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.db");
    let (root, _) = two_commits(&path)?;

    let mut bytes = fs::read(&path)?;
    let start = slot_range(SECOND_COMMIT_SLOT).start;
    // Half of the header made it, the rest is garbage.
    for byte in &mut bytes[start + 40..start + 84] {
        *byte = 0xEE;
    }
    fs::write(&path, &bytes)?;

    assert_first_commit(&path, root)
}

#[test]
fn completed_commit_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("done.db");
    let (root, _) = two_commits(&path)?;

    let file = File::open(&path, options())?;
    assert_eq!(file.stats()?.txid, 3);
    assert_eq!(read_prefix(&file, root, 7)?, b"second\0");
    let mut tx = file.begin_readonly()?;
    assert!(tx.page(PageId(root.0 + 5)).is_err());
    Ok(())
}

#[test]
fn crash_before_payload_sync_keeps_previous_commit() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("early.db");
    let (root, image) = two_commits(&path)?;

    // Nothing past the first commit reached the disk: restore the image but
    // keep the file length the second commit produced.
    let mut bytes = fs::read(&path)?;
    bytes[..image.len()].copy_from_slice(&image);
    fs::write(&path, &bytes)?;

    assert_first_commit(&path, root)
}

#[test]
fn abort_after_commit_recovers() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("abort.db");

    let status = Command::new(std::env::current_exe()?)
        .env("TXSTORE_CRASH_PATH", &path)
        .arg("--ignored")
        .arg("--exact")
        .arg("crash_child_abort_after_commit")
        .arg("--nocapture")
        .status()?;
    assert!(!status.success(), "child should abort");

    let file = File::open(&path, options())?;
    let mut tx = file.begin_readonly()?;
    let root = tx.root();
    assert!(!root.is_none());
    assert_eq!(&tx.page(root)?.bytes()?[..4], &[0xC0, 0xFF, 0xEE, 0x01]);
    Ok(())
}

#[test]
#[ignore]
fn crash_child_abort_after_commit() -> Result<()> {
    let Some(path) = std::env::var_os("TXSTORE_CRASH_PATH") else {
        return Ok(());
    };
    let path = PathBuf::from(path);
    let file = File::open(&path, options())?;
    let mut tx = file.begin()?;
    let mut page = tx.alloc()?;
    page.set_bytes(&[0xC0, 0xFF, 0xEE, 0x01])?;
    let id = page.id();
    tx.set_root(id)?;
    tx.commit()?;

    // No close, no writer shutdown.
    abort();
}
