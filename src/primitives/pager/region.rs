//! Contiguous page runs and sorted, merged lists of them.

use std::fmt;

use crate::types::{PageId, Result, StoreError};

/// Encoded size of a region whose count fits the inline byte.
pub const REGION_SMALL_LEN: usize = 8;
/// Encoded size of a region carrying an extended 32-bit count.
pub const REGION_LARGE_LEN: usize = 12;

const REGION_ID_BITS: u32 = 55;
const REGION_ID_MASK: u64 = (1 << REGION_ID_BITS) - 1;
const REGION_META_FLAG: u64 = 1 << REGION_ID_BITS;
const REGION_COUNT_SHIFT: u32 = 56;

/// A run of `count` pages starting at `start`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages in the run.
    pub count: u32,
}

impl Region {
    /// Creates a region.
    pub const fn new(start: PageId, count: u32) -> Self {
        Self { start, count }
    }

    /// Single page region.
    pub const fn single(id: PageId) -> Self {
        Self::new(id, 1)
    }

    /// One past the last page id of the run.
    pub fn end(&self) -> u64 {
        self.start.0 + u64::from(self.count)
    }

    /// Returns true if `id` lies within the run.
    pub fn contains(&self, id: PageId) -> bool {
        id.0 >= self.start.0 && id.0 < self.end()
    }

    /// Iterates over every page id of the run.
    pub fn pages(&self) -> impl Iterator<Item = PageId> {
        (self.start.0..self.end()).map(PageId)
    }

    /// Number of bytes [`Region::encode`] produces for this region.
    pub fn encoded_len(&self) -> usize {
        if self.count > 0 && self.count <= u32::from(u8::MAX) {
            REGION_SMALL_LEN
        } else {
            REGION_LARGE_LEN
        }
    }

    /// Appends the encoding of this region to `out`. `meta` records which
    /// allocator area the region belongs to.
    pub fn encode(&self, meta: bool, out: &mut Vec<u8>) -> Result<()> {
        if self.start.0 > REGION_ID_MASK {
            return Err(StoreError::Invalid("page id exceeds region encoding"));
        }
        let mut word = self.start.0;
        if meta {
            word |= REGION_META_FLAG;
        }
        let small = self.encoded_len() == REGION_SMALL_LEN;
        if small {
            word |= u64::from(self.count) << REGION_COUNT_SHIFT;
        }
        out.extend_from_slice(&word.to_le_bytes());
        if !small {
            out.extend_from_slice(&self.count.to_le_bytes());
        }
        Ok(())
    }

    /// Decodes one region from the front of `buf`, returning the region, its
    /// area flag, and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Region, bool, usize)> {
        let word = buf
            .get(..REGION_SMALL_LEN)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or(StoreError::Corruption("region entry truncated"))?;
        let start = PageId(word & REGION_ID_MASK);
        let meta = word & REGION_META_FLAG != 0;
        let inline = (word >> REGION_COUNT_SHIFT) as u32;
        let (count, used) = if inline != 0 {
            (inline, REGION_SMALL_LEN)
        } else {
            let count = buf
                .get(REGION_SMALL_LEN..REGION_LARGE_LEN)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or(StoreError::Corruption("region entry truncated"))?;
            (count, REGION_LARGE_LEN)
        };
        if count == 0 {
            return Err(StoreError::Corruption("empty region entry"));
        }
        Ok((Region::new(start, count), meta, used))
    }

    fn merge_right(&mut self, next: Region) -> bool {
        if self.end() != next.start.0 {
            return false;
        }
        match self.count.checked_add(next.count) {
            Some(count) => {
                self.count = count;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start.0, self.end())
    }
}

/// Sorted list of disjoint regions. Neighbours are merged whenever the merged
/// count still fits in a `u32`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionList(Vec<Region>);

impl RegionList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from arbitrary, possibly unsorted page ids. Duplicates
    /// are rejected.
    pub fn from_pages<I>(pages: I) -> Result<Self>
    where
        I: IntoIterator<Item = PageId>,
    {
        let mut sorted: Vec<PageId> = pages.into_iter().collect();
        sorted.sort_unstable();
        let mut list = RegionList::new();
        for id in sorted {
            if let Some(last) = list.0.last_mut() {
                if last.contains(id) {
                    return Err(StoreError::Corruption("duplicate page in region list"));
                }
                if last.merge_right(Region::single(id)) {
                    continue;
                }
            }
            list.0.push(Region::single(id));
        }
        Ok(list)
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when the list holds no pages.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Regions in ascending page order.
    pub fn as_slice(&self) -> &[Region] {
        &self.0
    }

    /// Iterates over the regions in ascending order.
    pub fn iter(&self) -> std::slice::Iter<'_, Region> {
        self.0.iter()
    }

    /// Iterates over every page id in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.0.iter().flat_map(Region::pages)
    }

    /// Total number of pages.
    pub fn page_count(&self) -> u64 {
        self.0.iter().map(|r| u64::from(r.count)).sum()
    }

    /// Last region, if any.
    pub fn last(&self) -> Option<Region> {
        self.0.last().copied()
    }

    /// Removes every region.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns true when `id` is covered by a region.
    pub fn contains(&self, id: PageId) -> bool {
        let idx = self.0.partition_point(|r| r.end() <= id.0);
        self.0.get(idx).is_some_and(|r| r.contains(id))
    }

    /// Returns true when every page of `region` is covered by the list.
    pub fn covers(&self, region: Region) -> bool {
        let mut cur = region.start.0;
        let end = region.end();
        let mut idx = self.0.partition_point(|r| r.end() <= cur);
        while cur < end {
            match self.0.get(idx) {
                Some(r) if r.start.0 <= cur => {
                    cur = r.end();
                    idx += 1;
                }
                _ => return false,
            }
        }
        true
    }

    /// Inserts `region`, merging it with adjacent neighbours.
    ///
    /// Fails without modifying the list if any page is already present.
    pub fn add(&mut self, region: Region) -> Result<()> {
        if region.count == 0 {
            return Ok(());
        }
        let idx = self.0.partition_point(|r| r.start.0 < region.start.0);
        if let Some(left) = idx.checked_sub(1).and_then(|i| self.0.get(i)) {
            if left.end() > region.start.0 {
                return Err(StoreError::Corruption("overlapping region"));
            }
        }
        if let Some(right) = self.0.get(idx) {
            if region.end() > right.start.0 {
                return Err(StoreError::Corruption("overlapping region"));
            }
        }

        if idx > 0 && self.0[idx - 1].merge_right(region) {
            if idx < self.0.len() {
                let right = self.0[idx];
                if self.0[idx - 1].merge_right(right) {
                    self.0.remove(idx);
                }
            }
            return Ok(());
        }
        if idx < self.0.len() {
            let mut merged = region;
            if merged.merge_right(self.0[idx]) {
                self.0[idx] = merged;
                return Ok(());
            }
        }
        self.0.insert(idx, region);
        Ok(())
    }

    /// Inserts every region of `other`.
    pub fn add_list(&mut self, other: &RegionList) -> Result<()> {
        for region in other.iter() {
            self.add(*region)?;
        }
        Ok(())
    }

    /// Removes the pages of `region`, splitting entries as needed.
    ///
    /// Fails without modifying the list unless every page is present.
    pub fn remove(&mut self, region: Region) -> Result<()> {
        if region.count == 0 {
            return Ok(());
        }
        if !self.covers(region) {
            return Err(StoreError::Corruption("region not present in list"));
        }
        let mut cur = region.start.0;
        let end = region.end();
        while cur < end {
            let idx = self.0.partition_point(|r| r.end() <= cur);
            let r = self.0[idx];
            let cut_end = r.end().min(end);
            let mut pieces = Vec::with_capacity(2);
            if r.start.0 < cur {
                pieces.push(Region::new(r.start, (cur - r.start.0) as u32));
            }
            if cut_end < r.end() {
                pieces.push(Region::new(PageId(cut_end), (r.end() - cut_end) as u32));
            }
            self.0.splice(idx..=idx, pieces);
            cur = cut_end;
        }
        Ok(())
    }

    /// Removes and returns the region at `idx`.
    pub(crate) fn take_at(&mut self, idx: usize) -> Region {
        self.0.remove(idx)
    }

    /// Replaces the region at `idx`.
    pub(crate) fn set_at(&mut self, idx: usize, region: Region) {
        self.0[idx] = region;
    }

    /// Checks ordering and disjointness.
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(|r| r.count > 0)
            && self.0.windows(2).all(|w| w[0].end() <= w[1].start.0)
    }
}

impl<'a> IntoIterator for &'a RegionList {
    type Item = &'a Region;
    type IntoIter = std::slice::Iter<'a, Region>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
