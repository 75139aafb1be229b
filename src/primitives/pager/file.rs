use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{ProcessLock, TxLocks};
use crate::primitives::io::mmap::{grow_size, Mapping};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::writer::AsyncWriter;
use crate::types::{PageId, Result, StoreError, TxId};

use super::alloc::AllocState;
use super::list::{self, FreeEntry, WalEntry};
use super::meta::{select_active, valid_page_size, MetaPage, MAX_PAGE_SIZE, META_LEN, MIN_PAGE_SIZE};
use super::options::{Options, TxOptions};
use super::tx::Tx;
use super::wal::WalMapping;

/// State published by the last successful commit.
#[derive(Debug)]
pub(crate) struct Committed {
    pub meta: MetaPage,
    /// Meta page slot (0 or 1) holding `meta`.
    pub slot: usize,
    pub alloc: AllocState,
    pub wal: WalMapping,
    /// File length once the commit was published.
    pub file_len: u64,
}

/// An open page store file.
///
/// Transactions borrow the file; any number of read transactions and at most
/// one write transaction may be active at a time. A thread must not commit a
/// write transaction while it still holds a read transaction on the same
/// file, because the commit waits for every reader to finish.
pub struct File {
    path: PathBuf,
    io: Arc<StdFileIo>,
    pub(crate) locks: TxLocks,
    writer: Option<AsyncWriter>,
    mapping: RwLock<Mapping>,
    state: RwLock<Arc<Committed>>,
    options: Options,
    page_size: usize,
    max_size: u64,
    // Dropped last so the OS lock outlives every other handle.
    _process_lock: ProcessLock,
}

/// Point-in-time statistics of a [`File`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStats {
    /// Transaction id of the active meta page.
    pub txid: u64,
    /// Page size in bytes.
    pub page_size: usize,
    /// Maximum file size in bytes (0 = unbounded).
    pub max_size: u64,
    /// One past the highest data or meta-area page.
    pub data_end: u64,
    /// One past the highest overflow page (0 = none).
    pub meta_end: u64,
    /// Pages owned by the meta area.
    pub meta_total: u64,
    /// Free data pages.
    pub free_data_pages: u64,
    /// Free meta pages.
    pub free_meta_pages: u64,
    /// Pages currently redirected through the overwrite log.
    pub wal_entries: usize,
    /// File size on disk in bytes.
    pub file_size: u64,
    /// Bytes currently memory mapped.
    pub mapped_size: u64,
    /// Active read transactions.
    pub active_readers: u32,
}

impl fmt::Display for FileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileStats(txid={}, page_size={}, max_size={}, data_end={}, meta_end={}, meta_total={}, free_data={}, free_meta={}, wal_entries={}, file_size={}, mapped={}, readers={})",
            self.txid,
            self.page_size,
            self.max_size,
            self.data_end,
            self.meta_end,
            self.meta_total,
            self.free_data_pages,
            self.free_meta_pages,
            self.wal_entries,
            self.file_size,
            self.mapped_size,
            self.active_readers,
        )
    }
}

impl File {
    /// Opens the store at `path`, creating it unless `options.readonly`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<File> {
        Self::open_inner(path, options, |io| -> Arc<dyn FileIo> { io })
    }

    /// Opens with the writer thread going through `wrap(io)` instead of the
    /// file handle itself.
    #[cfg(test)]
    pub(crate) fn open_with_writer_io<W>(
        path: impl AsRef<Path>,
        options: Options,
        wrap: W,
    ) -> Result<File>
    where
        W: FnOnce(Arc<StdFileIo>) -> Arc<dyn FileIo>,
    {
        Self::open_inner(path, options, wrap)
    }

    fn open_inner<W>(path: impl AsRef<Path>, options: Options, writer_io: W) -> Result<File>
    where
        W: FnOnce(Arc<StdFileIo>) -> Arc<dyn FileIo>,
    {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let io = Arc::new(StdFileIo::open_with(
            &path,
            OpenMode {
                readonly: options.readonly,
                mode: options.file_mode,
            },
        )?);
        let process_lock = ProcessLock::try_acquire(io.file(), !options.readonly)?;

        if io.len()? == 0 {
            if options.readonly {
                return Err(StoreError::Corruption("file is empty"));
            }
            init_file(io.as_ref(), &options)?;
        }

        let (meta, slot) = read_meta(io.as_ref(), options.page_size)?;
        if options.page_size != 0 && options.page_size != meta.page_size {
            return Err(StoreError::Invalid("page size does not match file"));
        }
        let page_size = meta.page_size as usize;
        let max_size = resolve_max_size(&meta, &options)?;
        let max_pages = max_size / page_size as u64;

        let read_page = |id: PageId| -> Result<Vec<u8>> {
            let mut buf = vec![0u8; page_size];
            match io.read_at(id.offset(page_size), &mut buf) {
                Ok(()) => Ok(buf),
                Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    Err(StoreError::Corruption("list page past end of file"))
                }
                Err(err) => Err(err),
            }
        };
        let (free_entries, free_pages) =
            list::read_list::<FreeEntry, _>(meta.freelist_root, page_size, read_page)?;
        let alloc = AllocState::restore(
            max_pages,
            meta.data_end,
            meta.meta_end,
            meta.meta_total,
            meta.freelist_root,
            &free_entries,
            &free_pages,
        )?;
        let (wal_entries, wal_pages) =
            list::read_list::<WalEntry, _>(meta.wal_root, page_size, read_page)?;
        let wal = WalMapping::restore(meta.wal_root, &wal_entries, &wal_pages)?;

        if options.prealloc && !options.readonly && io.len()? < max_size {
            io.truncate(max_size)?;
        }
        let file_len = io.len()?;
        let mapping = Mapping::map(io.file(), file_len - file_len % page_size as u64)?;
        let writer = if options.readonly {
            None
        } else {
            Some(AsyncWriter::start(writer_io(io.clone()), page_size)?)
        };

        info!(
            path = %path.display(),
            txid = meta.txid.0,
            slot,
            page_size,
            max_size,
            data_end = meta.data_end,
            wal_entries = wal.len(),
            readonly = options.readonly,
            "txfile.open"
        );
        Ok(File {
            path,
            io,
            locks: TxLocks::new(),
            writer,
            mapping: RwLock::new(mapping),
            state: RwLock::new(Arc::new(Committed {
                meta,
                slot,
                alloc,
                wal,
                file_len,
            })),
            options,
            page_size,
            max_size,
            _process_lock: process_lock,
        })
    }

    /// Begins a write transaction, waiting for the current writer to finish.
    pub fn begin(&self) -> Result<Tx<'_>> {
        self.begin_with(TxOptions::default())
    }

    /// Begins a read transaction.
    pub fn begin_readonly(&self) -> Result<Tx<'_>> {
        self.begin_with(TxOptions {
            readonly: true,
            ..TxOptions::default()
        })
    }

    /// Begins a transaction with per-transaction overrides.
    pub fn begin_with(&self, opts: TxOptions) -> Result<Tx<'_>> {
        if opts.readonly {
            let guard = self.locks.shared();
            let snapshot = self.snapshot();
            debug!(txid = snapshot.meta.txid.0, "tx.begin.read");
            return Ok(Tx::read(self, guard, snapshot));
        }
        if self.options.readonly {
            return Err(StoreError::ReadOnly);
        }
        if let Some(err) = self.writer()?.failure() {
            return Err(err);
        }
        let guard = self.locks.reserved();
        let snapshot = self.snapshot();
        let grow = opts
            .meta_area_grow_percentage
            .unwrap_or(self.options.meta_grow_percentage);
        let wal_limit = opts.wal_limit.unwrap_or(self.options.wal_limit);
        debug!(
            txid = snapshot.meta.txid.0 + 1,
            overflow = opts.enable_overflow_area,
            "tx.begin.write"
        );
        Ok(Tx::write(
            self,
            guard,
            snapshot,
            opts.enable_overflow_area,
            grow,
            wal_limit,
        ))
    }

    /// Closes the file after every transaction finished, draining the writer.
    pub fn close(self) -> Result<()> {
        let reserved = self.locks.reserved();
        let pending = self.locks.pending(&reserved);
        let exclusive = self.locks.exclusive(&pending);
        if let Some(writer) = &self.writer {
            writer.shutdown();
        }
        let failure = self.writer.as_ref().and_then(AsyncWriter::failure);
        *self.mapping.write() = Mapping::default();
        drop(exclusive);
        drop(pending);
        drop(reserved);
        info!(path = %self.path.display(), "txfile.close");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Effective maximum file size in bytes (0 = unbounded).
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Returns true if the file was opened read-only.
    pub fn readonly(&self) -> bool {
        self.options.readonly
    }

    /// Current statistics.
    pub fn stats(&self) -> Result<FileStats> {
        let state = self.snapshot();
        Ok(FileStats {
            txid: state.meta.txid.0,
            page_size: self.page_size,
            max_size: self.max_size,
            data_end: state.alloc.data_end,
            meta_end: state.alloc.meta_end,
            meta_total: state.alloc.meta_total,
            free_data_pages: state.alloc.data_free.avail(),
            free_meta_pages: state.alloc.meta_free.avail(),
            wal_entries: state.wal.len(),
            file_size: self.io.len()?,
            mapped_size: self.mapping.read().len(),
            active_readers: self.locks.snapshot().shared,
        })
    }

    pub(crate) fn snapshot(&self) -> Arc<Committed> {
        Arc::clone(&self.state.read())
    }

    pub(crate) fn writer(&self) -> Result<&AsyncWriter> {
        self.writer.as_ref().ok_or(StoreError::ReadOnly)
    }

    /// Copies page `id` into `buf`, from the map when it covers the page.
    /// Pages past the end of the file read as zeros.
    pub(crate) fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        {
            let map = self.mapping.read();
            if let Some(src) = map.page(id, self.page_size) {
                buf.copy_from_slice(src);
                return Ok(());
            }
        }
        match self.io.read_at(id.offset(self.page_size), buf) {
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                buf.fill(0);
                Ok(())
            }
            other => other,
        }
    }

    /// Installs the state of a durable commit. Called with the exclusive lock
    /// held. Remapping or truncation failures are logged; the commit itself
    /// already succeeded.
    pub(crate) fn publish(&self, mut next: Committed) {
        let prev_extent = self.snapshot().alloc.extent();
        let extent = next.alloc.extent();
        if let Err(err) = self.update_mapping(extent, extent < prev_extent) {
            warn!(error = %err, extent, "txfile.remap_failed");
        }
        next.file_len = self.io.len().unwrap_or(next.file_len);
        *self.state.write() = Arc::new(next);
    }

    fn update_mapping(&self, extent_pages: u64, shrink: bool) -> Result<()> {
        let required = extent_pages * self.page_size as u64;
        let mut map = self.mapping.write();
        let current = map.len();
        let target = if required > current {
            grow_size(required, self.max_size)?
        } else if shrink {
            grow_size(required, self.max_size)?.min(current)
        } else {
            return Ok(());
        };
        if target == current {
            return Ok(());
        }
        let file_len = self.io.len()?;
        if file_len < target {
            self.io.truncate(target)?;
        }
        *map = Mapping::map(self.io.file(), target)?;
        if shrink && file_len > target {
            self.io.truncate(target)?;
            info!(from = file_len, to = target, "txfile.truncate");
        }
        debug!(from = current, to = target, "txfile.remap");
        Ok(())
    }

    /// Drops file growth left behind by a rolled back transaction.
    pub(crate) fn truncate_to(&self, committed: &Committed) {
        let len = match self.io.len() {
            Ok(len) => len,
            Err(err) => {
                warn!(error = %err, "txfile.rollback_len_failed");
                return;
            }
        };
        let floor = committed.file_len.max(self.mapping.read().len());
        if len > floor {
            match self.io.truncate(floor) {
                Ok(()) => debug!(from = len, to = floor, "txfile.rollback_truncate"),
                Err(err) => warn!(error = %err, "txfile.rollback_truncate_failed"),
            }
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("max_size", &self.max_size)
            .field("readonly", &self.options.readonly)
            .finish()
    }
}

fn init_file(io: &dyn FileIo, options: &Options) -> Result<()> {
    let page_size = options.effective_page_size();
    let ps = page_size as usize;
    let mut buf = vec![0u8; 2 * ps];
    MetaPage::initial(page_size, options.max_size, TxId(0)).encode(&mut buf[..ps])?;
    MetaPage::initial(page_size, options.max_size, TxId(1)).encode(&mut buf[ps..])?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    info!(page_size, max_size = options.max_size, "txfile.init");
    Ok(())
}

fn read_slot(io: &dyn FileIo, offset: u64) -> Option<MetaPage> {
    let mut buf = [0u8; META_LEN];
    io.read_at(offset, &mut buf).ok()?;
    MetaPage::decode(&buf).ok()
}

/// Reads both meta slots and returns the authoritative one with its slot.
///
/// Slot 1 sits one page into the file. If slot 0 is unreadable the page size
/// is unknown, so candidate sizes are probed: the configured one first, then
/// every supported power of two.
fn read_meta(io: &dyn FileIo, configured: u32) -> Result<(MetaPage, usize)> {
    let slot0 = read_slot(io, 0);
    let slot1 = match &slot0 {
        Some(m0) => {
            read_slot(io, u64::from(m0.page_size)).filter(|m1| m1.page_size == m0.page_size)
        }
        None => {
            warn!("txfile.meta.slot0_invalid");
            let probes = std::iter::once(configured)
                .filter(|&size| valid_page_size(size))
                .chain(
                    std::iter::successors(Some(MIN_PAGE_SIZE), |&s| s.checked_mul(2))
                        .take_while(|&s| s <= MAX_PAGE_SIZE),
                );
            probes
                .filter_map(|size| read_slot(io, u64::from(size)).filter(|m| m.page_size == size))
                .next()
        }
    };
    if slot0.is_some() && slot1.is_none() {
        warn!("txfile.meta.slot1_invalid");
    }
    let active = select_active([slot0.as_ref(), slot1.as_ref()])
        .ok_or(StoreError::Corruption("no valid meta page"))?;
    let meta = if active == 0 { slot0 } else { slot1 };
    let meta = meta.ok_or(StoreError::Corruption("no valid meta page"))?;
    Ok((meta, active))
}

fn resolve_max_size(meta: &MetaPage, options: &Options) -> Result<u64> {
    if !options.update_max_size || options.max_size == meta.max_size {
        if options.max_size != 0 && options.max_size != meta.max_size {
            debug!(
                stored = meta.max_size,
                requested = options.max_size,
                "txfile.max_size.keep_stored"
            );
        }
        return check_max_size(meta.max_size, meta.page_size);
    }
    let wanted = options.max_size;
    if meta.meta_end != 0 {
        return Err(StoreError::Invalid(
            "cannot change max size while the overflow area is in use",
        ));
    }
    if wanted != 0 && wanted / u64::from(meta.page_size) < meta.data_end {
        return Err(StoreError::Invalid("max size below current file extent"));
    }
    info!(from = meta.max_size, to = wanted, "txfile.max_size.update");
    check_max_size(wanted, meta.page_size)
}

fn check_max_size(max_size: u64, page_size: u32) -> Result<u64> {
    if max_size != 0 && max_size / u64::from(page_size) < 4 {
        return Err(StoreError::Invalid("max size must hold at least four pages"));
    }
    Ok(max_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;
    use tempfile::tempdir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("txstore=debug"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .try_init();
        });
    }

    fn small() -> Options {
        Options {
            page_size: 1024,
            ..Options::default()
        }
    }

    #[test]
    fn create_writes_both_meta_slots() -> Result<()> {
        init_tracing();
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let file = File::open(&path, small())?;
        assert_eq!(file.page_size(), 1024);
        assert_eq!(file.stats()?.txid, 1);
        file.close()?;

        let bytes = std::fs::read(&path)?;
        let slot0 = MetaPage::decode(&bytes[..1024])?;
        let slot1 = MetaPage::decode(&bytes[1024..2048])?;
        assert_eq!(slot0.txid, TxId(0));
        assert_eq!(slot1.txid, TxId(1));
        assert_eq!(slot1.data_end, 2);
        Ok(())
    }

    #[test]
    fn commits_alternate_slots() -> Result<()> {
        let dir = tempdir()?;
        let file = File::open(dir.path().join("store.db"), small())?;
        assert_eq!(file.snapshot().slot, 1);
        for expected in [0, 1, 0] {
            let mut tx = file.begin()?;
            tx.alloc()?.set_bytes(b"x")?;
            tx.commit()?;
            assert_eq!(file.snapshot().slot, expected);
        }
        assert_eq!(file.stats()?.txid, 4);
        Ok(())
    }

    #[test]
    fn page_size_must_match_existing_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        File::open(&path, small())?.close()?;
        let err = File::open(
            &path,
            Options {
                page_size: 4096,
                ..Options::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        // Zero adopts the stored page size.
        assert_eq!(File::open(&path, Options::default())?.page_size(), 1024);
        Ok(())
    }

    #[test]
    fn readonly_file_rejects_write_transactions() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let readonly = Options {
            readonly: true,
            ..small()
        };
        assert!(File::open(&path, readonly.clone()).is_err());

        File::open(&path, small())?.close()?;
        let file = File::open(&path, readonly)?;
        assert!(file.readonly());
        assert!(matches!(file.begin(), Err(StoreError::ReadOnly)));
        let tx = file.begin_readonly()?;
        assert_eq!(tx.root(), PageId::NONE);
        Ok(())
    }

    #[test]
    fn torn_first_slot_falls_back_to_second() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        File::open(&path, small())?.close()?;
        let mut bytes = std::fs::read(&path)?;
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        // The configured size is unknown, so slot 1 must be found by probing.
        let file = File::open(&path, Options::default())?;
        assert_eq!(file.page_size(), 1024);
        assert_eq!(file.stats()?.txid, 1);
        Ok(())
    }

    #[test]
    fn list_root_past_end_of_file_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        File::open(&path, small())?.close()?;
        let mut meta = MetaPage::initial(1024, 0, TxId(2));
        meta.freelist_root = PageId(500);
        let mut bytes = std::fs::read(&path)?;
        bytes[..1024].copy_from_slice(&meta.to_page()?);
        std::fs::write(&path, &bytes)?;

        assert!(matches!(
            File::open(&path, small()),
            Err(StoreError::Corruption("list page past end of file"))
        ));
        Ok(())
    }

    #[test]
    fn no_valid_meta_page_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        std::fs::write(&path, vec![0x5Au8; 4096])?;
        assert!(matches!(
            File::open(&path, small()),
            Err(StoreError::Corruption("no valid meta page"))
        ));
        Ok(())
    }

    #[test]
    fn prealloc_extends_to_max_size() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let opts = Options {
            max_size: 64 * 1024,
            prealloc: true,
            ..small()
        };
        let file = File::open(&path, opts)?;
        let stats = file.stats()?;
        assert_eq!(stats.file_size, 64 * 1024);
        assert_eq!(stats.mapped_size, 64 * 1024);
        assert_eq!(stats.max_size, 64 * 1024);
        Ok(())
    }

    #[test]
    fn max_size_update_is_opt_in_and_bounded() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let opts = Options {
            max_size: 64 * 1024,
            ..small()
        };
        {
            let file = File::open(&path, opts.clone())?;
            let mut tx = file.begin()?;
            tx.alloc_n(20)?;
            tx.commit()?;
        }
        let bigger = Options {
            max_size: 128 * 1024,
            ..opts.clone()
        };
        assert_eq!(File::open(&path, bigger.clone())?.max_size(), 64 * 1024);

        let update = Options {
            update_max_size: true,
            ..bigger
        };
        {
            let file = File::open(&path, update)?;
            assert_eq!(file.max_size(), 128 * 1024);
            let mut tx = file.begin()?;
            tx.alloc()?;
            tx.commit()?;
        }
        assert_eq!(File::open(&path, opts.clone())?.max_size(), 128 * 1024);

        let too_small = Options {
            max_size: 8 * 1024,
            update_max_size: true,
            ..opts
        };
        assert!(matches!(
            File::open(&path, too_small),
            Err(StoreError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn stats_display_names_fields() -> Result<()> {
        let dir = tempdir()?;
        let file = File::open(dir.path().join("store.db"), small())?;
        let text = file.stats()?.to_string();
        assert!(text.contains("txid=1"));
        assert!(text.contains("page_size=1024"));
        Ok(())
    }
}
