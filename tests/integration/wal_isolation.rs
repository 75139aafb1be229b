#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use tempfile::tempdir;
use txstore::{File, Options, PageId, Result, TxOptions};

fn open(dir: &tempfile::TempDir, name: &str) -> Result<File> {
    File::open(
        dir.path().join(name),
        Options {
            page_size: 1024,
            ..Options::default()
        },
    )
}

fn seed(file: &File, pages: usize, fill: u8) -> Result<Vec<PageId>> {
    let mut tx = file.begin()?;
    let ids = tx.alloc_n(pages)?;
    for &id in &ids {
        tx.page(id)?.bytes_mut()?.fill(fill);
    }
    tx.commit()?;
    Ok(ids)
}

fn first_byte(file: &File, id: PageId) -> Result<u8> {
    let mut tx = file.begin_readonly()?;
    let byte = tx.page(id)?.bytes()?[0];
    Ok(byte)
}

#[test]
fn reader_keeps_snapshot_until_it_closes() -> Result<()> {
    let dir = tempdir()?;
    let file = open(&dir, "isolation.db")?;
    let ids = seed(&file, 4, b'A')?;
    let target = ids[2];

    let reader_ready = Barrier::new(2);
    let writer_flushed = Barrier::new(2);
    let reader_closed = AtomicBool::new(false);

    thread::scope(|s| -> Result<()> {
        let reader = s.spawn(|| -> Result<()> {
            let mut tx = file.begin_readonly()?;
            assert_eq!(tx.page(target)?.bytes()?[0], b'A');
            reader_ready.wait();
            writer_flushed.wait();
            // The writer is committing now but cannot swap state while this
            // transaction is open.
            thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(tx.page(target)?.bytes()?[0], b'A');
            reader_closed.store(true, Ordering::SeqCst);
            tx.close()
        });

        reader_ready.wait();
        let mut tx = file.begin()?;
        tx.page(target)?.bytes_mut()?.fill(b'B');
        tx.flush()?;
        writer_flushed.wait();
        tx.commit()?;
        assert!(reader_closed.load(Ordering::SeqCst));
        drop(tx);
        reader.join().expect("reader panicked")
    })?;

    assert_eq!(first_byte(&file, target)?, b'B');
    assert_eq!(file.stats()?.wal_entries, 1);
    Ok(())
}

#[test]
fn concurrent_readers_do_not_block_each_other() -> Result<()> {
    const READERS: usize = 8;
    let dir = tempdir()?;
    let file = open(&dir, "readers.db")?;
    let ids = seed(&file, 16, 7)?;
    let all_open = Barrier::new(READERS);
    let seen = AtomicUsize::new(0);
    let (file, ids, all_open, seen) = (&file, &ids, &all_open, &seen);

    thread::scope(|s| {
        let handles: Vec<_> = (0..READERS)
            .map(|_| {
                s.spawn(move || -> Result<()> {
                    let mut tx = file.begin_readonly()?;
                    // Every reader holds its transaction here at once.
                    all_open.wait();
                    for &id in ids {
                        assert_eq!(tx.page(id)?.bytes()?[0], 7);
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("reader panicked")?;
        }
        Ok::<(), txstore::StoreError>(())
    })?;
    assert_eq!(seen.load(Ordering::SeqCst), READERS);
    Ok(())
}

#[test]
fn readers_run_during_writer_flush() -> Result<()> {
    let dir = tempdir()?;
    let file = open(&dir, "flush.db")?;
    let ids = seed(&file, 8, 1)?;

    let mut writer = file.begin()?;
    for &id in &ids {
        writer.page(id)?.bytes_mut()?.fill(2);
    }
    writer.flush()?;
    let (shared, pages) = (&file, &ids);
    thread::scope(|s| -> Result<()> {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || -> Result<()> {
                    for &id in pages {
                        assert_eq!(first_byte(shared, id)?, 1);
                    }
                    Ok(())
                })
            })
            .collect();
        for reader in readers {
            reader.join().expect("reader panicked")?;
        }
        Ok(())
    })?;
    writer.commit()?;
    drop(writer);

    for &id in &ids {
        assert_eq!(first_byte(&file, id)?, 2);
    }
    Ok(())
}

#[test]
fn checkpoint_moves_content_home() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("checkpoint.db");
    let file = open(&dir, "checkpoint.db")?;
    let ids = seed(&file, 6, 1)?;

    for round in 2..5u8 {
        let mut tx = file.begin()?;
        for &id in &ids {
            tx.page(id)?.bytes_mut()?.fill(round);
        }
        tx.commit()?;
    }
    assert_eq!(file.stats()?.wal_entries, ids.len());

    let mut tx = file.begin()?;
    let moved = tx.checkpoint_wal()?;
    assert_eq!(moved, ids.len());
    tx.commit()?;
    drop(tx);
    assert_eq!(file.stats()?.wal_entries, 0);
    file.close()?;

    let file = File::open(&path, Options::default())?;
    for &id in &ids {
        assert_eq!(first_byte(&file, id)?, 4);
    }
    Ok(())
}

#[test]
fn wal_limit_bounds_mapping_growth() -> Result<()> {
    let dir = tempdir()?;
    let file = File::open(
        dir.path().join("limit.db"),
        Options {
            page_size: 1024,
            wal_limit: 8,
            ..Options::default()
        },
    )?;
    let ids = seed(&file, 32, 0)?;
    for (round, chunk) in ids.chunks(4).enumerate() {
        let mut tx = file.begin_with(TxOptions::default())?;
        for &id in chunk {
            tx.page(id)?.bytes_mut()?.fill(round as u8 + 1);
        }
        tx.commit()?;
        assert!(file.stats()?.wal_entries <= 8 + chunk.len());
    }
    for (round, chunk) in ids.chunks(4).enumerate() {
        for &id in chunk {
            assert_eq!(first_byte(&file, id)?, round as u8 + 1);
        }
    }
    Ok(())
}
