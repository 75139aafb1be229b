#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use txstore::{File, FileStats, Options, PageId, Result, StoreError, TxOptions};

const PAGE: u32 = 1024;

fn options(max_size: u64) -> Options {
    Options {
        page_size: PAGE,
        max_size,
        ..Options::default()
    }
}

/// Every page below the data end marker is either free, live, or owned by
/// the meta area.
fn assert_accounted(stats: &FileStats, live: usize) {
    let data_limit = stats.data_end.max(stats.max_size / u64::from(PAGE));
    let overflow = stats.meta_end.saturating_sub(data_limit);
    assert_eq!(
        stats.free_data_pages + live as u64 + stats.meta_total - overflow,
        stats.data_end - 2,
        "page accounting broken: {stats}"
    );
}

fn check_contents(file: &File, live: &BTreeMap<PageId, u8>) -> Result<()> {
    let mut tx = file.begin_readonly()?;
    for (&id, &fill) in live {
        let mut page = tx.page(id)?;
        assert!(page.bytes()?.iter().all(|&b| b == fill), "page {id} lost its content");
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Alloc(u8),
    Free(usize),
    Write(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..6).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
        any::<usize>().prop_map(Op::Write),
    ]
}

#[derive(Clone, Debug)]
struct Round {
    ops: Vec<Op>,
    commit: bool,
    reopen: bool,
}

fn round() -> impl Strategy<Value = Round> {
    (prop::collection::vec(op(), 1..12), prop::bool::weighted(0.8), prop::bool::weighted(0.2))
        .prop_map(|(ops, commit, reopen)| Round { ops, commit, reopen })
}

fn run_rounds(path: &Path, rounds: &[Round]) -> Result<()> {
    let mut file = File::open(path, options(0))?;
    let mut live: BTreeMap<PageId, u8> = BTreeMap::new();
    let mut stamp = 0u8;

    for round in rounds {
        let mut next = live.clone();
        let mut tx = file.begin()?;
        for op in &round.ops {
            match *op {
                Op::Alloc(n) => {
                    stamp = stamp.wrapping_add(1);
                    for id in tx.alloc_n(usize::from(n))? {
                        tx.page(id)?.bytes_mut()?.fill(stamp);
                        next.insert(id, stamp);
                    }
                }
                Op::Free(pick) if !next.is_empty() => {
                    let id = *next.keys().nth(pick % next.len()).unwrap_or(&PageId::NONE);
                    tx.page(id)?.free()?;
                    next.remove(&id);
                    assert!(matches!(tx.page(id), Err(StoreError::FreedPage(_))));
                }
                Op::Write(pick) if !next.is_empty() => {
                    let id = *next.keys().nth(pick % next.len()).unwrap_or(&PageId::NONE);
                    stamp = stamp.wrapping_add(1);
                    tx.page(id)?.bytes_mut()?.fill(stamp);
                    next.insert(id, stamp);
                }
                _ => {}
            }
        }
        if round.commit {
            tx.commit()?;
            live = next;
        } else {
            tx.rollback()?;
        }
        drop(tx);

        if round.reopen {
            file.close()?;
            file = File::open(path, options(0))?;
        }
        let stats = file.stats()?;
        assert_accounted(&stats, live.len());
        check_contents(&file, &live)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn freelist_round_trips_through_reopen(rounds in prop::collection::vec(round(), 1..10)) {
        let dir = tempdir().unwrap();
        run_rounds(&dir.path().join("prop.db"), &rounds).unwrap();
    }
}

#[test]
fn seeded_churn_keeps_accounting() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("churn.db");
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED_CAFE);
    let rounds: Vec<Round> = (0..60)
        .map(|_| Round {
            ops: (0..rng.gen_range(1..20))
                .map(|_| match rng.gen_range(0..3) {
                    0 => Op::Alloc(rng.gen_range(1..8)),
                    1 => Op::Free(rng.gen()),
                    _ => Op::Write(rng.gen()),
                })
                .collect(),
            commit: rng.gen_bool(0.85),
            reopen: rng.gen_bool(0.1),
        })
        .collect();
    run_rounds(&path, &rounds)
}

#[test]
fn full_data_area_needs_overflow_to_free() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("overflow.db");
    let max_size = 16 * u64::from(PAGE);
    let file = File::open(&path, options(max_size))?;

    let mut tx = file.begin()?;
    let ids = tx.alloc_n(14)?;
    assert!(matches!(tx.alloc_n(1), Err(StoreError::OutOfMemory { .. })));
    tx.commit()?;
    drop(tx);

    // Persisting the freed page needs a list page nobody can provide.
    let mut tx = file.begin()?;
    tx.page(ids[3])?.free()?;
    assert!(matches!(tx.commit(), Err(StoreError::OutOfMemory { .. })));
    drop(tx);
    assert_eq!(file.stats()?.free_data_pages, 0);

    let mut tx = file.begin_with(TxOptions {
        enable_overflow_area: true,
        ..TxOptions::default()
    })?;
    tx.page(ids[3])?.free()?;
    tx.commit()?;
    drop(tx);
    let stats = file.stats()?;
    assert_eq!(stats.meta_end, 17);
    assert!(stats.file_size > max_size);
    assert_eq!(stats.free_data_pages, 1);

    // The next commit moves the list into the data area and gives the
    // overflow page back.
    let mut tx = file.begin()?;
    tx.page(ids[4])?.free()?;
    tx.commit()?;
    drop(tx);
    let stats = file.stats()?;
    assert_eq!(stats.meta_end, 0);
    assert_eq!(stats.file_size, max_size);
    file.close()?;

    let file = File::open(&path, options(max_size))?;
    let mut tx = file.begin_readonly()?;
    assert!(matches!(tx.page(ids[4]), Err(StoreError::FreedPage(_))));
    assert!(tx.page(ids[5]).is_ok());
    Ok(())
}
