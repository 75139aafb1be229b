use crate::types::{PageId, Result};

use super::region::{Region, RegionList};

/// End of the region list an allocation is served from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocOrder {
    /// Lowest page ids first (data area).
    Ascending,
    /// Highest page ids first (meta area).
    Descending,
}

/// Free pages of one allocator area.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Freelist {
    avail: u64,
    regions: RegionList,
}

impl Freelist {
    /// Creates an empty freelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free pages.
    pub fn avail(&self) -> u64 {
        self.avail
    }

    /// Returns true when no page is free.
    pub fn is_empty(&self) -> bool {
        self.avail == 0
    }

    /// Free regions in ascending order.
    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    /// Returns true if `id` is free.
    pub fn contains(&self, id: PageId) -> bool {
        self.regions.contains(id)
    }

    /// Adds a free region.
    pub fn add(&mut self, region: Region) -> Result<()> {
        self.regions.add(region)?;
        self.avail += u64::from(region.count);
        Ok(())
    }

    /// Adds every region of `list`.
    pub fn add_list(&mut self, list: &RegionList) -> Result<()> {
        for region in list {
            self.add(*region)?;
        }
        Ok(())
    }

    /// Removes pages that are no longer free.
    pub fn remove(&mut self, region: Region) -> Result<()> {
        self.regions.remove(region)?;
        self.avail -= u64::from(region.count);
        Ok(())
    }

    /// Best-fit allocation of `n` contiguous pages. Ties go to the lowest
    /// region; pages are taken from the region's start.
    pub fn alloc_continuous(&mut self, n: u32) -> Option<Region> {
        if n == 0 || u64::from(n) > self.avail {
            return None;
        }
        let (idx, best) = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.count >= n)
            .min_by_key(|(_, r)| r.count)
            .map(|(idx, r)| (idx, *r))?;
        let out = Region::new(best.start, n);
        if best.count == n {
            self.regions.take_at(idx);
        } else {
            self.regions.set_at(
                idx,
                Region::new(PageId(best.start.0 + u64::from(n)), best.count - n),
            );
        }
        self.avail -= u64::from(n);
        Some(out)
    }

    /// Allocates up to `n` pages, consuming regions from the end selected by
    /// `order`. Returns fewer pages only if the freelist runs dry.
    pub fn alloc_regions(&mut self, n: u64, order: AllocOrder) -> Vec<Region> {
        let mut out = Vec::new();
        let mut need = n.min(self.avail);
        while need > 0 {
            let idx = match order {
                AllocOrder::Ascending => 0,
                AllocOrder::Descending => self.regions.len() - 1,
            };
            let region = self.regions.as_slice()[idx];
            let take = need.min(u64::from(region.count)) as u32;
            if take == region.count {
                self.regions.take_at(idx);
                out.push(region);
            } else {
                match order {
                    AllocOrder::Ascending => {
                        out.push(Region::new(region.start, take));
                        self.regions.set_at(
                            idx,
                            Region::new(
                                PageId(region.start.0 + u64::from(take)),
                                region.count - take,
                            ),
                        );
                    }
                    AllocOrder::Descending => {
                        out.push(Region::new(PageId(region.end() - u64::from(take)), take));
                        self.regions
                            .set_at(idx, Region::new(region.start, region.count - take));
                    }
                }
            }
            self.avail -= u64::from(take);
            need -= u64::from(take);
        }
        out
    }

    /// Removes free pages at the top of the area, from `end` downwards but
    /// never below `floor`. Returns the new end.
    pub fn trim_tail(&mut self, end: u64, floor: u64) -> u64 {
        let mut end = end;
        while let Some(last) = self.regions.last() {
            if last.end() != end {
                break;
            }
            let lo = last.start.0.max(floor);
            if lo >= end {
                break;
            }
            let cut = Region::new(PageId(lo), (end - lo) as u32);
            if self.remove(cut).is_err() {
                break;
            }
            end = lo;
            if lo > last.start.0 {
                break;
            }
        }
        end
    }

    /// Returns true when the cached page count matches the regions.
    pub fn is_consistent(&self) -> bool {
        self.regions.is_well_formed() && self.regions.page_count() == self.avail
    }
}
