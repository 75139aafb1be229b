//! Overwrite log.
//!
//! Writes to a page that is already durable go to a fresh meta page instead,
//! so concurrent readers keep seeing the committed bytes. The committed
//! mapping records which pages currently live elsewhere; a transaction's
//! [`WalDelta`] records what it added and dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{PageId, Result, StoreError};

use super::list::WalEntry;
use super::region::RegionList;

/// Default committed mapping size that triggers an automatic checkpoint.
pub const DEFAULT_WAL_LIMIT: usize = 1000;

/// Committed original -> overwrite page mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalMapping {
    map: BTreeMap<PageId, PageId>,
    targets: BTreeSet<PageId>,
    /// Pages holding the persisted mapping.
    pub pages: RegionList,
    /// First list page of the persisted mapping.
    pub root: PageId,
}

impl WalMapping {
    /// Rebuilds the mapping from persisted entries.
    pub fn restore(root: PageId, entries: &[WalEntry], pages: &[PageId]) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut targets = BTreeSet::new();
        for entry in entries {
            if entry.original.0 < PageId::FIRST_DATA.0 || entry.overwrite.0 < PageId::FIRST_DATA.0 {
                return Err(StoreError::Corruption("wal entry references a meta slot"));
            }
            if map.insert(entry.original, entry.overwrite).is_some()
                || !targets.insert(entry.overwrite)
            {
                return Err(StoreError::Corruption("duplicate wal entry"));
            }
        }
        Ok(Self {
            map,
            targets,
            pages: RegionList::from_pages(pages.iter().copied())?,
            root,
        })
    }

    /// Number of redirected pages.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true when no page is redirected.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Page holding the committed content of `id`.
    pub fn resolve(&self, id: PageId) -> PageId {
        self.map.get(&id).copied().unwrap_or(id)
    }

    /// Overwrite page of `id`, if redirected.
    pub fn get(&self, id: PageId) -> Option<PageId> {
        self.map.get(&id).copied()
    }

    /// Returns true if `id` is an overwrite page or holds the mapping itself.
    pub fn owns(&self, id: PageId) -> bool {
        self.pages.contains(id) || self.targets.contains(&id)
    }

    /// All mappings in original page order.
    pub fn iter(&self) -> impl Iterator<Item = (PageId, PageId)> + '_ {
        self.map.iter().map(|(&p, &w)| (p, w))
    }

    /// Mapping after applying `delta`, as entries ready to persist.
    pub fn merged_entries(&self, delta: &WalDelta) -> Vec<WalEntry> {
        let mut merged: BTreeMap<PageId, PageId> = self
            .map
            .iter()
            .filter(|(p, _)| !delta.removed.contains(p))
            .map(|(&p, &w)| (p, w))
            .collect();
        merged.extend(delta.added.iter().map(|(&p, &w)| (p, w)));
        merged
            .into_iter()
            .map(|(original, overwrite)| WalEntry {
                original,
                overwrite,
            })
            .collect()
    }

    /// Builds the committed mapping that replaces this one.
    pub fn from_entries(entries: &[WalEntry], pages: &[PageId]) -> Result<Self> {
        Self::restore(pages.first().copied().unwrap_or(PageId::NONE), entries, pages)
    }
}

/// Mapping changes of one write transaction.
#[derive(Clone, Debug, Default)]
pub struct WalDelta {
    added: BTreeMap<PageId, PageId>,
    removed: BTreeSet<PageId>,
}

impl WalDelta {
    /// Empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite page allocated for `id` in this transaction.
    pub fn added(&self, id: PageId) -> Option<PageId> {
        self.added.get(&id).copied()
    }

    /// Returns true if the committed mapping of `id` was dropped.
    pub fn is_removed(&self, id: PageId) -> bool {
        self.removed.contains(&id)
    }

    /// Returns true if `id` is an overwrite page allocated by this transaction.
    pub fn owns(&self, id: PageId) -> bool {
        self.added.values().any(|&w| w == id)
    }

    /// Page currently holding the content of `id` as seen by this transaction.
    pub fn resolve(&self, committed: &WalMapping, id: PageId) -> PageId {
        if let Some(w) = self.added.get(&id) {
            return *w;
        }
        if self.removed.contains(&id) {
            return id;
        }
        committed.resolve(id)
    }

    /// Records a new redirect of `id` to `overwrite`.
    pub fn insert(&mut self, id: PageId, overwrite: PageId) {
        self.added.insert(id, overwrite);
    }

    /// Drops the redirect added in this transaction, returning its page.
    pub fn take_added(&mut self, id: PageId) -> Option<PageId> {
        self.added.remove(&id)
    }

    /// Marks the committed redirect of `id` as dropped.
    pub fn remove_committed(&mut self, id: PageId) {
        self.removed.insert(id);
    }

    /// Committed mapping size after applying this delta.
    pub fn projected_len(&self, committed: &WalMapping) -> usize {
        let kept = committed
            .iter()
            .filter(|(p, _)| !self.removed.contains(p) && !self.added.contains_key(p))
            .count();
        kept + self.added.len()
    }

    /// Committed redirects that are still live and not rewritten by this
    /// transaction; these are the checkpoint candidates.
    pub fn checkpoint_candidates(&self, committed: &WalMapping) -> Vec<(PageId, PageId)> {
        committed
            .iter()
            .filter(|(p, _)| !self.removed.contains(p) && !self.added.contains_key(p))
            .collect()
    }

    /// Returns true when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
