#![allow(missing_docs)]

use std::path::PathBuf;
use std::process::Command;

use tempfile::tempdir;
use txstore::{File, Options, Result, StoreError, TxOptions};

#[test]
fn options_load_from_toml_with_defaults() {
    let opts: Options = toml::from_str(
        r#"
            max_size = 1048576
            page_size = 8192
            wal_limit = 64
        "#,
    )
    .expect("valid toml");
    assert_eq!(opts.max_size, 1 << 20);
    assert_eq!(opts.page_size, 8192);
    assert_eq!(opts.wal_limit, 64);
    assert_eq!(opts.meta_grow_percentage, 80);
    assert_eq!(opts.file_mode, 0o600);
    assert!(!opts.readonly);
    assert!(opts.validate().is_ok());

    let tx: TxOptions = toml::from_str("enable_overflow_area = true").expect("valid toml");
    assert!(tx.enable_overflow_area);
    assert!(!tx.readonly);
    assert_eq!(tx.meta_area_grow_percentage, None);
}

#[test]
fn options_serialize_round_trip_through_toml() {
    let opts = Options {
        max_size: 4 << 20,
        prealloc: true,
        ..Options::default()
    };
    let text = toml::to_string(&opts).expect("serializable");
    let back: Options = toml::from_str(&text).expect("parsable");
    assert_eq!(back, opts);
}

#[test]
fn invalid_options_fail_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad.db");
    let opts: Options = toml::from_str("page_size = 1000").expect("valid toml");
    assert!(matches!(File::open(&path, opts), Err(StoreError::Invalid(_))));
    assert!(!path.exists());

    let tiny = Options {
        page_size: 1024,
        max_size: 2048,
        ..Options::default()
    };
    assert!(matches!(File::open(&path, tiny), Err(StoreError::Invalid(_))));
    assert!(!path.exists());
    Ok(())
}

#[test]
fn per_transaction_grow_percentage_overrides_file_default() -> Result<()> {
    let dir = tempdir()?;
    let file = File::open(
        dir.path().join("grow.db"),
        Options {
            page_size: 1024,
            ..Options::default()
        },
    )?;
    let mut tx = file.begin()?;
    let ids = tx.alloc_n(8)?;
    tx.commit()?;
    drop(tx);

    let mut tx = file.begin_with(TxOptions {
        meta_area_grow_percentage: Some(100),
        ..TxOptions::default()
    })?;
    tx.page(ids[0])?.free()?;
    tx.commit()?;
    drop(tx);
    // A single list page fits exactly at 100%; the default 80% would double.
    assert_eq!(file.stats()?.meta_total, 1);
    Ok(())
}

#[test]
fn second_process_is_locked_out() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("locked.db");
    let file = File::open(&path, Options::default())?;

    let status = Command::new(std::env::current_exe()?)
        .env("TXSTORE_LOCK_PATH", &path)
        .arg("--ignored")
        .arg("--exact")
        .arg("lock_child_open")
        .arg("--nocapture")
        .status()?;
    assert!(status.success(), "child could open a locked file");
    file.close()
}

#[test]
#[ignore]
fn lock_child_open() {
    let Some(path) = std::env::var_os("TXSTORE_LOCK_PATH") else {
        return;
    };
    let path = PathBuf::from(path);
    assert!(matches!(
        File::open(&path, Options::default()),
        Err(StoreError::Locked)
    ));
    let readonly = Options {
        readonly: true,
        ..Options::default()
    };
    assert!(matches!(File::open(&path, readonly), Err(StoreError::Locked)));
}
