use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::primitives::concurrency::{ReservedGuard, SharedGuard};
use crate::primitives::writer::WriteTracker;
use crate::types::{PageId, Result, StoreError, TxId};

use super::alloc::TxAlloc;
use super::file::{Committed, File};
use super::list;
use super::meta::MetaPage;
use super::page::{CachedPage, Page};
use super::region::Region;
use super::wal::{WalDelta, WalMapping};

enum TxLock<'f> {
    Read { _guard: SharedGuard<'f> },
    Write(ReservedGuard<'f>),
}

struct WriteState {
    alloc: TxAlloc,
    wal: WalDelta,
    tracker: WriteTracker,
    wal_limit: usize,
}

/// A transaction on a [`File`].
///
/// Read transactions see the state of the last commit that finished before
/// they began. A write transaction sees its own changes; nothing it does is
/// visible to others until [`Tx::commit`] returns. Dropping an active
/// transaction rolls it back.
pub struct Tx<'f> {
    file: &'f File,
    snapshot: Arc<Committed>,
    id: TxId,
    readonly: bool,
    root: PageId,
    pages: HashMap<PageId, CachedPage>,
    write: Option<WriteState>,
    lock: Option<TxLock<'f>>,
}

impl<'f> Tx<'f> {
    pub(crate) fn read(file: &'f File, guard: SharedGuard<'f>, snapshot: Arc<Committed>) -> Self {
        Self {
            file,
            id: snapshot.meta.txid,
            readonly: true,
            root: snapshot.meta.root,
            snapshot,
            pages: HashMap::new(),
            write: None,
            lock: Some(TxLock::Read { _guard: guard }),
        }
    }

    pub(crate) fn write(
        file: &'f File,
        guard: ReservedGuard<'f>,
        snapshot: Arc<Committed>,
        overflow: bool,
        grow_percentage: u8,
        wal_limit: usize,
    ) -> Self {
        let write = WriteState {
            alloc: TxAlloc::new(&snapshot.alloc, overflow, grow_percentage),
            wal: WalDelta::new(),
            tracker: WriteTracker::new(),
            wal_limit,
        };
        Self {
            file,
            id: TxId(snapshot.meta.txid.0 + 1),
            readonly: false,
            root: snapshot.meta.root,
            snapshot,
            pages: HashMap::new(),
            write: Some(write),
            lock: Some(TxLock::Write(guard)),
        }
    }

    /// Transaction id. Write transactions carry the id their commit will
    /// publish; read transactions the id of the commit they observe.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Returns true for read transactions.
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Returns true until the transaction commits or rolls back.
    pub fn is_active(&self) -> bool {
        self.lock.is_some()
    }

    /// Page size of the underlying file.
    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    /// Application root page as seen by this transaction.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Sets the application root page stored in the meta page at commit.
    pub fn set_root(&mut self, id: PageId) -> Result<()> {
        let data_end = self.writable()?.alloc.data_end();
        if !id.is_none() && (id.0 < PageId::FIRST_DATA.0 || id.0 >= data_end) {
            return Err(StoreError::OutOfBounds(id));
        }
        self.root = id;
        Ok(())
    }

    /// Returns a handle to data page `id`.
    pub fn page(&mut self, id: PageId) -> Result<Page<'_, 'f>> {
        self.check_page(id)?;
        Ok(Page::new(self, id))
    }

    /// Allocates one zeroed data page.
    pub fn alloc(&mut self) -> Result<Page<'_, 'f>> {
        let id = self
            .alloc_n(1)?
            .first()
            .copied()
            .ok_or(StoreError::OutOfMemory { requested: 1 })?;
        Ok(Page::new(self, id))
    }

    /// Allocates `n` data pages, not necessarily contiguous.
    pub fn alloc_n(&mut self, n: usize) -> Result<Vec<PageId>> {
        let page_size = self.page_size();
        let regions = self.writable()?.alloc.alloc_data(n as u64)?;
        let ids: Vec<PageId> = regions.iter().flat_map(Region::pages).collect();
        for &id in &ids {
            self.pages.insert(id, CachedPage::allocated(id, page_size));
        }
        Ok(ids)
    }

    /// Allocates `n` contiguous data pages.
    pub fn alloc_region(&mut self, n: u32) -> Result<Region> {
        let page_size = self.page_size();
        let region = self.writable()?.alloc.alloc_data_continuous(n)?;
        for id in region.pages() {
            self.pages.insert(id, CachedPage::allocated(id, page_size));
        }
        Ok(region)
    }

    /// Schedules every dirty page for writing. Flushed pages can still be
    /// read but no longer modified.
    pub fn flush(&mut self) -> Result<()> {
        self.writable()?;
        for id in self.dirty_pages() {
            self.flush_page(id)?;
        }
        Ok(())
    }

    /// Copies committed overwrite pages back to their original location and
    /// drops the redirects. Pages modified but not yet flushed are skipped.
    /// Returns the number of pages moved.
    pub fn checkpoint_wal(&mut self) -> Result<usize> {
        let file = self.file;
        let page_size = file.page_size();
        self.writable()?;
        let writer = file.writer()?;
        let candidates = match &self.write {
            Some(w) => w.wal.checkpoint_candidates(&self.snapshot.wal),
            None => Vec::new(),
        };
        let mut moved = 0;
        for (original, overwrite) in candidates {
            if self.pages.get(&original).is_some_and(|p| p.dirty) {
                continue;
            }
            let mut buf = vec![0u8; page_size];
            file.read_page(overwrite, &mut buf)?;
            let w = self.writable()?;
            writer.schedule(&w.tracker, original, buf.clone());
            w.alloc.free_meta(overwrite)?;
            w.wal.remove_committed(original);
            let page = self
                .pages
                .entry(original)
                .or_insert_with(|| CachedPage::durable(original));
            page.disk_id = original;
            page.buf = Some(buf);
            moved += 1;
        }
        debug!(txid = self.id.0, pages = moved, "tx.checkpoint");
        Ok(moved)
    }

    /// Makes the transaction's changes durable and visible.
    ///
    /// Page contents and the list pages are written and synced first; only
    /// then is the meta page written to the inactive slot and synced. A crash
    /// at any point before the second sync leaves the previous commit intact.
    /// On error the transaction is rolled back.
    ///
    /// Publishing waits until every open read transaction has closed, so a
    /// thread must not commit while it still holds a reader on the same file.
    pub fn commit(&mut self) -> Result<()> {
        self.active()?;
        if self.write.is_none() {
            self.finish();
            return Ok(());
        }
        match self.commit_write() {
            Ok(()) => {
                self.finish();
                Ok(())
            }
            Err(err) => {
                warn!(txid = self.id.0, error = %err, "tx.commit.failed");
                self.abort_write();
                self.finish();
                Err(err)
            }
        }
    }

    /// Discards every change of the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.active()?;
        if self.write.is_some() {
            self.abort_write();
            debug!(txid = self.id.0, "tx.rollback");
        }
        self.finish();
        Ok(())
    }

    /// Ends the transaction, rolling back if it is still active.
    pub fn close(mut self) -> Result<()> {
        if self.is_active() {
            self.rollback()?;
        }
        Ok(())
    }

    fn commit_write(&mut self) -> Result<()> {
        let file = self.file;
        let page_size = file.page_size();
        let writer = file.writer()?;
        let pending = match &self.lock {
            Some(TxLock::Write(reserved)) => file.locks.pending(reserved),
            _ => return Err(StoreError::TxReadonly),
        };
        info!(txid = self.id.0, pages = self.pages.len(), "tx.commit.start");

        for id in self.dirty_pages() {
            self.flush_page(id)?;
        }
        let (projected, limit) = match &self.write {
            Some(w) => (w.wal.projected_len(&self.snapshot.wal), w.wal_limit),
            None => (0, 0),
        };
        if projected > 0 && projected >= limit {
            self.checkpoint_wal()?;
        }

        let snapshot = Arc::clone(&self.snapshot);
        let root = self.root;
        let txid = self.id;
        let w = self.writable()?;
        for region in snapshot.alloc.freelist_pages.iter() {
            w.alloc.free_meta_region(*region)?;
        }
        for region in snapshot.wal.pages.iter() {
            w.alloc.free_meta_region(*region)?;
        }
        let wal_entries = snapshot.wal.merged_entries(&w.wal);
        let wal_pages = list::pages_needed(&wal_entries, page_size);
        let plan = w.alloc.plan_lists(wal_pages, page_size)?;
        let wal = WalMapping::from_entries(&wal_entries, &plan.wal_pages)?;

        for (id, buf) in list::encode_pages(&plan.free_entries, &plan.freelist_pages, page_size)? {
            writer.schedule(&w.tracker, id, buf);
        }
        for (id, buf) in list::encode_pages(&wal_entries, &plan.wal_pages, page_size)? {
            writer.schedule(&w.tracker, id, buf);
        }
        writer.sync(&w.tracker);
        w.tracker.wait()?;
        debug!(
            txid = txid.0,
            freelist_pages = plan.freelist_pages.len(),
            wal_entries = wal_entries.len(),
            "tx.commit.payload_synced"
        );

        let meta = MetaPage {
            page_size: page_size as u32,
            max_size: file.max_size(),
            flags: snapshot.meta.flags,
            root,
            txid,
            freelist_root: plan.state.freelist_root,
            wal_root: wal.root,
            data_end: plan.state.data_end,
            meta_end: plan.state.meta_end,
            meta_total: plan.state.meta_total,
        };
        let slot = 1 - snapshot.slot;
        writer.schedule(&w.tracker, PageId(slot as u64), meta.to_page()?);
        writer.sync(&w.tracker);
        w.tracker.wait()?;
        debug!(txid = txid.0, slot, "tx.commit.meta_synced");

        let exclusive = file.locks.exclusive(&pending);
        file.publish(Committed {
            meta,
            slot,
            alloc: plan.state,
            wal,
            file_len: snapshot.file_len,
        });
        drop(exclusive);
        drop(pending);
        info!(txid = txid.0, slot, "tx.commit.done");
        Ok(())
    }

    fn abort_write(&mut self) {
        if let Some(w) = &self.write {
            if let Err(err) = w.tracker.wait() {
                debug!(txid = self.id.0, error = %err, "tx.rollback.write_failed");
            }
            self.file.truncate_to(&self.snapshot);
        }
        self.pages.clear();
    }

    fn finish(&mut self) {
        self.write = None;
        self.lock = None;
    }

    fn active(&self) -> Result<()> {
        if self.lock.is_none() {
            return Err(StoreError::TxFinished);
        }
        Ok(())
    }

    fn writable(&mut self) -> Result<&mut WriteState> {
        self.active()?;
        self.write.as_mut().ok_or(StoreError::TxReadonly)
    }

    fn dirty_pages(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Page currently holding the content of `id` for this transaction.
    fn resolve(&self, id: PageId) -> PageId {
        match &self.write {
            Some(w) => w.wal.resolve(&self.snapshot.wal, id),
            None => self.snapshot.wal.resolve(id),
        }
    }

    fn check_page(&self, id: PageId) -> Result<()> {
        self.active()?;
        let data_end = match &self.write {
            Some(w) => w.alloc.data_end(),
            None => self.snapshot.alloc.data_end,
        };
        let cached = self.pages.get(&id);
        if cached.is_some_and(|p| p.freed) {
            return Err(StoreError::FreedPage(id));
        }
        if id.0 < PageId::FIRST_DATA.0 || id.0 >= data_end {
            return Err(StoreError::OutOfBounds(id));
        }
        if let Some(page) = cached {
            if page.new {
                return Ok(());
            }
        }
        let committed = &self.snapshot;
        let (free, meta) = match &self.write {
            Some(w) => (
                w.alloc.is_free_data(id),
                w.wal.owns(id)
                    || w.alloc.is_new_meta(id)
                    || w.alloc.state().meta_free.contains(id),
            ),
            None => (
                committed.alloc.data_free.contains(id),
                committed.alloc.meta_free.contains(id),
            ),
        };
        if free {
            return Err(StoreError::FreedPage(id));
        }
        if meta || committed.wal.owns(id) || committed.alloc.freelist_pages.contains(id) {
            return Err(StoreError::Invalid("page belongs to the meta area"));
        }
        Ok(())
    }

    pub(super) fn page_state(&self, id: PageId) -> Option<&CachedPage> {
        self.pages.get(&id)
    }

    pub(super) fn load_page(&mut self, id: PageId) -> Result<()> {
        self.check_page(id)?;
        if self.pages.get(&id).is_some_and(CachedPage::cached) {
            return Ok(());
        }
        let disk_id = self.resolve(id);
        let mut buf = vec![0u8; self.page_size()];
        self.file.read_page(disk_id, &mut buf)?;
        let page = self.pages.entry(id).or_insert_with(|| CachedPage::durable(id));
        page.disk_id = disk_id;
        page.buf = Some(buf);
        Ok(())
    }

    pub(super) fn page_bytes(&mut self, id: PageId) -> Result<&[u8]> {
        self.load_page(id)?;
        self.pages
            .get(&id)
            .and_then(|p| p.buf.as_deref())
            .ok_or(StoreError::Invalid("page not loaded"))
    }

    fn page_for_update(&mut self, id: PageId) -> Result<&mut CachedPage> {
        self.writable()?;
        self.load_page(id)?;
        let page = self
            .pages
            .get_mut(&id)
            .ok_or(StoreError::Invalid("page not loaded"))?;
        if page.flushed {
            return Err(StoreError::PageFlushed(id));
        }
        Ok(page)
    }

    pub(super) fn page_bytes_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        let page = self.page_for_update(id)?;
        page.dirty = true;
        let buf = page.buf.as_deref_mut();
        buf.ok_or(StoreError::Invalid("page not loaded"))
    }

    pub(super) fn set_page_bytes(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if data.len() > self.page_size() {
            return Err(StoreError::Invalid("data larger than page"));
        }
        let buf = self.page_bytes_mut(id)?;
        buf[..data.len()].copy_from_slice(data);
        buf[data.len()..].fill(0);
        Ok(())
    }

    pub(super) fn mark_page_dirty(&mut self, id: PageId) -> Result<()> {
        self.page_for_update(id)?.dirty = true;
        Ok(())
    }

    /// Hands a dirty page to the writer. New pages are written in place;
    /// committed pages go to an overwrite page so readers keep the old bytes.
    pub(super) fn flush_page(&mut self, id: PageId) -> Result<()> {
        self.writable()?;
        let (new, data) = match self.pages.get(&id) {
            Some(page) if page.dirty => (
                page.new,
                page.buf.clone().ok_or(StoreError::Invalid("page not loaded"))?,
            ),
            _ => return Ok(()),
        };
        let file = self.file;
        let writer = file.writer()?;
        let committed = &self.snapshot.wal;
        let w = self.write.as_mut().ok_or(StoreError::TxReadonly)?;
        let target = if new {
            id
        } else if let Some(existing) = w.wal.added(id) {
            existing
        } else {
            let target = w
                .alloc
                .alloc_meta(1)?
                .first()
                .map(|r| r.start)
                .ok_or(StoreError::OutOfMemory { requested: 1 })?;
            if !w.wal.is_removed(id) {
                if let Some(old) = committed.get(id) {
                    w.alloc.free_meta(old)?;
                    w.wal.remove_committed(id);
                }
            }
            w.wal.insert(id, target);
            target
        };
        writer.schedule(&w.tracker, target, data);
        if let Some(page) = self.pages.get_mut(&id) {
            page.disk_id = target;
            page.dirty = false;
            page.flushed = true;
        }
        Ok(())
    }

    pub(super) fn free_page(&mut self, id: PageId) -> Result<()> {
        self.writable()?;
        self.check_page(id)?;
        let committed = &self.snapshot.wal;
        let w = self.write.as_mut().ok_or(StoreError::TxReadonly)?;
        w.alloc.free_data(id)?;
        if let Some(redirect) = w.wal.take_added(id) {
            w.alloc.free_meta(redirect)?;
        }
        if !w.wal.is_removed(id) {
            if let Some(old) = committed.get(id) {
                w.alloc.free_meta(old)?;
                w.wal.remove_committed(id);
            }
        }
        self.pages.insert(id, CachedPage::freed(id));
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.lock.is_none() {
            return;
        }
        if self.write.is_some() {
            debug!(txid = self.id.0, "tx.drop.rollback");
            self.abort_write();
        }
        self.finish();
    }
}
