use crate::types::{PageId, Result};

use super::tx::Tx;

/// Per-transaction state of one page.
#[derive(Debug)]
pub(crate) struct CachedPage {
    /// Page whose bytes `buf` holds; differs from the page id while the
    /// content lives in an overwrite page.
    pub disk_id: PageId,
    /// Page content, `None` until loaded.
    pub buf: Option<Vec<u8>>,
    /// Allocated by this transaction.
    pub new: bool,
    /// Freed by this transaction.
    pub freed: bool,
    /// Handed to the writer; no further modification allowed.
    pub flushed: bool,
    /// Modified since loaded.
    pub dirty: bool,
}

impl CachedPage {
    pub fn durable(id: PageId) -> Self {
        Self {
            disk_id: id,
            buf: None,
            new: false,
            freed: false,
            flushed: false,
            dirty: false,
        }
    }

    pub fn allocated(id: PageId, page_size: usize) -> Self {
        Self {
            disk_id: id,
            buf: Some(vec![0u8; page_size]),
            new: true,
            freed: false,
            flushed: false,
            dirty: false,
        }
    }

    pub fn freed(id: PageId) -> Self {
        Self {
            freed: true,
            ..Self::durable(id)
        }
    }

    pub fn cached(&self) -> bool {
        self.buf.is_some()
    }
}

/// Handle to one page within a transaction.
///
/// The handle borrows the transaction mutably; drop it before touching
/// another page.
pub struct Page<'t, 'f> {
    tx: &'t mut Tx<'f>,
    id: PageId,
}

impl<'t, 'f> Page<'t, 'f> {
    pub(crate) fn new(tx: &'t mut Tx<'f>, id: PageId) -> Self {
        Self { tx, id }
    }

    /// Page id.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Reads the page into the transaction cache if not yet loaded.
    pub fn load(&mut self) -> Result<()> {
        self.tx.load_page(self.id)
    }

    /// Current page content.
    pub fn bytes(&mut self) -> Result<&[u8]> {
        self.tx.page_bytes(self.id)
    }

    /// Mutable page content. Marks the page dirty.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.tx.page_bytes_mut(self.id)
    }

    /// Replaces the page content with `data`, zero-filling the remainder.
    pub fn set_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.tx.set_page_bytes(self.id, data)
    }

    /// Marks the page as modified so it is written at flush or commit.
    pub fn mark_dirty(&mut self) -> Result<()> {
        self.tx.mark_page_dirty(self.id)
    }

    /// Schedules the page write now. Later modification fails with
    /// [`StoreError::PageFlushed`](crate::types::StoreError::PageFlushed).
    pub fn flush(&mut self) -> Result<()> {
        self.tx.flush_page(self.id)
    }

    /// Returns true if the page was modified and not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.tx.page_state(self.id).is_some_and(|p| p.dirty)
    }

    /// Returns true if the page was allocated by this transaction.
    pub fn is_new(&self) -> bool {
        self.tx.page_state(self.id).is_some_and(|p| p.new)
    }

    /// Returns true if the page content is loaded.
    pub fn is_cached(&self) -> bool {
        self.tx.page_state(self.id).is_some_and(CachedPage::cached)
    }

    /// Frees the page.
    pub fn free(self) -> Result<()> {
        self.tx.free_page(self.id)
    }
}
