//! Page allocation across the data area, the meta area and the overflow area.
//!
//! All three share one page id space. Pages `[2, data_end)` belong either to
//! the data area or, once moved there, to the meta area. The overflow area
//! `[max_pages, meta_end)` only ever belongs to the meta area and exists only
//! while a transaction explicitly allowed it.

use tracing::{debug, warn};

use crate::types::{PageId, Result, StoreError};

use super::freelist::{AllocOrder, Freelist};
use super::list::{self, FreeEntry};
use super::region::{Region, RegionList};

/// Default meta-area utilization (percent) that triggers growing it further.
pub const DEFAULT_META_GROW_PERCENTAGE: u8 = 80;

const MAX_PLAN_ROUNDS: usize = 16;

/// Committed allocator state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocState {
    /// Page capacity derived from the configured maximum size (0 = unbounded).
    pub max_pages: u64,
    /// One past the highest page of the data and meta areas.
    pub data_end: u64,
    /// One past the highest overflow page, 0 while no overflow page exists.
    pub meta_end: u64,
    /// Pages owned by the meta area.
    pub meta_total: u64,
    /// Free data pages.
    pub data_free: Freelist,
    /// Free meta pages.
    pub meta_free: Freelist,
    /// First list page of the persisted freelist.
    pub freelist_root: PageId,
    /// Pages holding the persisted freelist.
    pub freelist_pages: RegionList,
}

impl AllocState {
    /// State of an empty file.
    pub fn new(max_pages: u64) -> Self {
        Self {
            max_pages,
            data_end: PageId::FIRST_DATA.0,
            ..Self::default()
        }
    }

    /// Rebuilds the state from the persisted freelist.
    pub fn restore(
        max_pages: u64,
        data_end: u64,
        meta_end: u64,
        meta_total: u64,
        freelist_root: PageId,
        entries: &[FreeEntry],
        list_pages: &[PageId],
    ) -> Result<Self> {
        if max_pages > 0 && data_end > max_pages {
            return Err(StoreError::Corruption("data end beyond maximum size"));
        }
        let mut state = Self {
            max_pages,
            data_end,
            meta_end,
            meta_total,
            data_free: Freelist::new(),
            meta_free: Freelist::new(),
            freelist_root,
            freelist_pages: RegionList::from_pages(list_pages.iter().copied())?,
        };
        for entry in entries {
            let region = entry.region;
            let in_data = region.start.0 >= PageId::FIRST_DATA.0 && region.end() <= data_end;
            if entry.meta {
                let in_overflow =
                    region.start.0 >= state.overflow_base() && region.end() <= meta_end;
                if !in_data && !in_overflow {
                    return Err(StoreError::Corruption("meta freelist region out of bounds"));
                }
                state.meta_free.add(region)?;
            } else {
                if !in_data {
                    return Err(StoreError::Corruption("data freelist region out of bounds"));
                }
                state.data_free.add(region)?;
            }
        }
        if state.meta_free.avail() > meta_total {
            return Err(StoreError::Corruption("meta freelist larger than meta area"));
        }
        Ok(state)
    }

    /// One past the highest page in use by any area.
    pub fn extent(&self) -> u64 {
        self.data_end.max(self.meta_end)
    }

    /// First page of the overflow area.
    pub fn overflow_base(&self) -> u64 {
        self.max_pages.max(self.data_end)
    }

    fn data_headroom(&self) -> u64 {
        if self.max_pages == 0 {
            u64::MAX - self.data_end
        } else {
            self.max_pages.saturating_sub(self.data_end)
        }
    }

    /// Freelist entries in ascending page order, as persisted.
    pub fn free_entries(&self) -> Vec<FreeEntry> {
        let mut entries: Vec<FreeEntry> = self
            .data_free
            .regions()
            .iter()
            .map(|&region| FreeEntry {
                region,
                meta: false,
            })
            .chain(self.meta_free.regions().iter().map(|&region| FreeEntry {
                region,
                meta: true,
            }))
            .collect();
        entries.sort_unstable_by_key(|e| e.region.start);
        entries
    }

    /// Checks the freelists and that the two areas never overlap.
    pub fn is_consistent(&self) -> bool {
        if !self.data_free.is_consistent() || !self.meta_free.is_consistent() {
            return false;
        }
        let entries = self.free_entries();
        entries
            .windows(2)
            .all(|w| w[0].region.end() <= w[1].region.start.0)
            && self.meta_free.avail() <= self.meta_total
    }
}

/// Meta pages a commit writes its freelist and WAL mapping to, together with
/// the allocator state the commit publishes.
#[derive(Debug)]
pub struct ListPlan {
    /// Allocator state after the commit, deferred frees applied.
    pub state: AllocState,
    /// Freelist entries to persist.
    pub free_entries: Vec<FreeEntry>,
    /// Pages receiving the freelist chain.
    pub freelist_pages: Vec<PageId>,
    /// Pages receiving the WAL mapping chain.
    pub wal_pages: Vec<PageId>,
}

/// Allocation delta of one write transaction.
///
/// Pages allocated by the transaction can be handed back immediately. Every
/// other free is deferred until commit so that a page a concurrent reader may
/// still look at is never reused before that reader is gone.
#[derive(Clone, Debug)]
pub struct TxAlloc {
    state: AllocState,
    committed_data_end: u64,
    new_data: RegionList,
    new_meta: RegionList,
    freed_data: RegionList,
    freed_meta: RegionList,
    overflow: bool,
    grow_percentage: u8,
}

impl TxAlloc {
    /// Starts a delta on top of the committed state.
    pub fn new(base: &AllocState, overflow: bool, grow_percentage: u8) -> Self {
        Self {
            state: base.clone(),
            committed_data_end: base.data_end,
            new_data: RegionList::new(),
            new_meta: RegionList::new(),
            freed_data: RegionList::new(),
            freed_meta: RegionList::new(),
            overflow,
            grow_percentage: grow_percentage.clamp(1, 100),
        }
    }

    /// Working state including this transaction's allocations.
    pub fn state(&self) -> &AllocState {
        &self.state
    }

    /// Current data end marker.
    pub fn data_end(&self) -> u64 {
        self.state.data_end
    }

    /// Returns true if `id` was allocated as a meta page by this transaction.
    pub fn is_new_meta(&self, id: PageId) -> bool {
        self.new_meta.contains(id)
    }

    /// Returns true if `id` is free or freed in this transaction.
    pub fn is_free_data(&self, id: PageId) -> bool {
        self.freed_data.contains(id) || self.state.data_free.contains(id)
    }

    /// Allocates `n` data pages, lowest free ids first, growing the data area
    /// for the remainder.
    pub fn alloc_data(&mut self, n: u64) -> Result<Vec<Region>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.state.data_free.avail().saturating_add(self.state.data_headroom()) < n {
            return Err(StoreError::OutOfMemory { requested: n });
        }
        let mut regions = self.state.data_free.alloc_regions(n, AllocOrder::Ascending);
        let got: u64 = regions.iter().map(|r| u64::from(r.count)).sum();
        regions.extend(self.grow_data(n - got));
        for region in &regions {
            self.new_data.add(*region)?;
        }
        Ok(regions)
    }

    /// Allocates `n` contiguous data pages, best fit from the freelist or
    /// from the end of the data area.
    pub fn alloc_data_continuous(&mut self, n: u32) -> Result<Region> {
        if n == 0 {
            return Err(StoreError::Invalid("empty region requested"));
        }
        let region = match self.state.data_free.alloc_continuous(n) {
            Some(region) => region,
            None => {
                if self.state.data_headroom() < u64::from(n) {
                    return Err(StoreError::OutOfMemory {
                        requested: u64::from(n),
                    });
                }
                let region = Region::new(PageId(self.state.data_end), n);
                self.state.data_end += u64::from(n);
                region
            }
        };
        self.new_data.add(region)?;
        Ok(region)
    }

    fn grow_data(&mut self, n: u64) -> Vec<Region> {
        let mut out = Vec::new();
        let mut left = n;
        while left > 0 {
            let count = left.min(u64::from(u32::MAX)) as u32;
            out.push(Region::new(PageId(self.state.data_end), count));
            self.state.data_end += u64::from(count);
            left -= u64::from(count);
        }
        out
    }

    /// Frees a data page. Pages allocated by this transaction are reusable
    /// right away and may pull the data end marker back; others are deferred.
    pub fn free_data(&mut self, id: PageId) -> Result<()> {
        if id.0 < PageId::FIRST_DATA.0 || id.0 >= self.state.data_end {
            return Err(StoreError::OutOfBounds(id));
        }
        let page = Region::single(id);
        if self.new_data.contains(id) {
            self.new_data.remove(page)?;
            self.state.data_free.add(page)?;
            self.state.data_end = self
                .state
                .data_free
                .trim_tail(self.state.data_end, self.committed_data_end);
            return Ok(());
        }
        if self.is_free_data(id) {
            return Err(StoreError::FreedPage(id));
        }
        if self.state.meta_free.contains(id) || self.freed_meta.contains(id) {
            return Err(StoreError::Invalid("page belongs to the meta area"));
        }
        self.freed_data.add(page)
    }

    /// Allocates `n` meta pages, highest free ids first, growing the meta area
    /// when its freelist runs short.
    pub fn alloc_meta(&mut self, n: u64) -> Result<Vec<Region>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.state.meta_free.avail() < n {
            self.grow_meta(n)?;
        }
        let regions = self.state.meta_free.alloc_regions(n, AllocOrder::Descending);
        for region in &regions {
            self.new_meta.add(*region)?;
        }
        Ok(regions)
    }

    /// Sizes and performs meta area growth so that `n` pages become free.
    ///
    /// The area is grown to the next power of two above the pages in use,
    /// doubled again while utilization would exceed the grow percentage. If
    /// the data area cannot give that much, only the deficit is moved; if it
    /// cannot give even that, the overflow area is used when permitted.
    fn grow_meta(&mut self, n: u64) -> Result<()> {
        let avail = self.state.meta_free.avail();
        let used = self.state.meta_total - avail;
        let target = used + n;
        let pct = u64::from(self.grow_percentage);
        let mut max_total = target.checked_next_power_of_two().unwrap_or(u64::MAX);
        while target.saturating_mul(100) > max_total.saturating_mul(pct)
            && max_total < u64::MAX / 2
        {
            max_total *= 2;
        }
        let full = max_total.saturating_sub(self.state.meta_total);
        let min = n - avail;
        if full > min && self.move_from_data(full)? {
            return Ok(());
        }
        if self.move_from_data(min)? {
            return Ok(());
        }
        if self.overflow && self.state.max_pages > 0 {
            self.grow_overflow(min)?;
            return Ok(());
        }
        Err(StoreError::OutOfMemory { requested: n })
    }

    fn move_from_data(&mut self, k: u64) -> Result<bool> {
        if self.state.data_free.avail().saturating_add(self.state.data_headroom()) < k {
            return Ok(false);
        }
        let mut moved = self.state.data_free.alloc_regions(k, AllocOrder::Descending);
        let got: u64 = moved.iter().map(|r| u64::from(r.count)).sum();
        moved.extend(self.grow_data(k - got));
        for region in moved {
            self.state.meta_free.add(region)?;
        }
        self.state.meta_total += k;
        debug!(
            pages = k,
            meta_total = self.state.meta_total,
            data_end = self.state.data_end,
            "alloc.meta.grow"
        );
        Ok(true)
    }

    fn grow_overflow(&mut self, k: u64) -> Result<()> {
        let mut start = self.state.meta_end.max(self.state.overflow_base());
        let mut left = k;
        while left > 0 {
            let count = left.min(u64::from(u32::MAX)) as u32;
            self.state.meta_free.add(Region::new(PageId(start), count))?;
            start += u64::from(count);
            left -= u64::from(count);
        }
        self.state.meta_end = start;
        self.state.meta_total += k;
        warn!(
            pages = k,
            meta_end = self.state.meta_end,
            max_pages = self.state.max_pages,
            "alloc.overflow.grow"
        );
        Ok(())
    }

    /// Frees a meta page. Pages allocated by this transaction are reusable
    /// right away; others are deferred.
    pub fn free_meta(&mut self, id: PageId) -> Result<()> {
        let page = Region::single(id);
        if self.new_meta.contains(id) {
            self.new_meta.remove(page)?;
            return self.state.meta_free.add(page);
        }
        if self.freed_meta.contains(id) || self.state.meta_free.contains(id) {
            return Err(StoreError::FreedPage(id));
        }
        self.freed_meta.add(page)
    }

    /// Frees every page of `region` from the meta area.
    pub fn free_meta_region(&mut self, region: Region) -> Result<()> {
        for id in region.pages() {
            self.free_meta(id)?;
        }
        Ok(())
    }

    /// Allocator state as it will look once deferred frees are applied and
    /// trailing free overflow pages are dropped.
    pub fn commit_view(&self) -> Result<AllocState> {
        let mut view = self.state.clone();
        view.data_free.add_list(&self.freed_data)?;
        view.meta_free.add_list(&self.freed_meta)?;
        if view.meta_end > 0 {
            let base = view.overflow_base();
            let end = view.meta_free.trim_tail(view.meta_end, base);
            view.meta_total -= view.meta_end - end;
            view.meta_end = if end <= base { 0 } else { end };
        }
        Ok(view)
    }

    /// Allocates the list pages a commit needs to persist the freelist plus
    /// `wal_pages` pages for the WAL mapping.
    ///
    /// Allocating list pages changes the freelist being persisted, so the
    /// page count is recomputed until it settles. Surplus pages are chained
    /// into the freelist as empty list pages.
    pub fn plan_lists(&mut self, wal_pages: usize, page_size: usize) -> Result<ListPlan> {
        let mut pool: Vec<PageId> = Vec::new();
        for _ in 0..MAX_PLAN_ROUNDS {
            let view = self.commit_view()?;
            let entries = view.free_entries();
            let need = list::pages_needed(&entries, page_size) + wal_pages;
            if pool.len() >= need {
                pool.sort_unstable();
                let wal = pool.split_off(pool.len() - wal_pages);
                let mut state = view;
                state.freelist_root = pool.first().copied().unwrap_or(PageId::NONE);
                state.freelist_pages = RegionList::from_pages(pool.iter().copied())?;
                return Ok(ListPlan {
                    state,
                    free_entries: entries,
                    freelist_pages: pool,
                    wal_pages: wal,
                });
            }
            let more = self.alloc_meta((need - pool.len()) as u64)?;
            pool.extend(more.iter().flat_map(Region::pages));
        }
        Err(StoreError::Invalid("freelist layout did not settle"))
    }
}
