#![allow(unsafe_code)]
//! Read-only memory map over the store file and the remap growth policy.

use std::fs::File;

use memmap2::{Mmap, MmapOptions};

use crate::types::{PageId, Result, StoreError};

/// Smallest mapping ever created.
pub const MIN_MAP_SIZE: u64 = 64 * 1024;
/// Past this size the mapping grows in whole multiples instead of doubling.
pub const MAP_GROWTH_STEP: u64 = 1 << 30;
/// Largest mapping the platform can address.
pub const MAX_MAP_SIZE: u64 = isize::MAX as u64;

/// Read-only view of the file. Writes never go through the map; they are
/// issued with positioned writes and become visible through the shared page
/// cache.
#[derive(Default)]
pub struct Mapping {
    map: Option<Mmap>,
}

impl Mapping {
    /// Maps the first `len` bytes of `file`. A zero length yields an empty map.
    ///
    /// The caller guarantees the file is at least `len` bytes long for as long
    /// as the mapping lives.
    pub fn map(file: &File, len: u64) -> Result<Self> {
        if len == 0 {
            return Ok(Self { map: None });
        }
        if len > MAX_MAP_SIZE {
            return Err(StoreError::Invalid("mapping exceeds addressable size"));
        }
        // SAFETY: the mapping is read-only and the store never shrinks the
        // file below the mapped length while the map is alive.
        let map = unsafe { MmapOptions::new().len(len as usize).map(file)? };
        Ok(Self { map: Some(map) })
    }

    /// Number of mapped bytes.
    pub fn len(&self) -> u64 {
        self.map.as_ref().map(|m| m.len() as u64).unwrap_or(0)
    }

    /// Returns true when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bytes of page `id`, or `None` if the page lies past the map.
    pub fn page(&self, id: PageId, page_size: usize) -> Option<&[u8]> {
        let map = self.map.as_ref()?;
        let start = usize::try_from(id.offset(page_size)).ok()?;
        let end = start.checked_add(page_size)?;
        map.get(start..end)
    }
}

/// Computes the next mapping size able to hold `required` bytes.
///
/// Sizes double from [`MIN_MAP_SIZE`] until [`MAP_GROWTH_STEP`], then round up
/// to whole steps. `cap` (0 = none) bounds the result unless `required`
/// itself is larger, which only happens for overflow-area pages.
pub fn grow_size(required: u64, cap: u64) -> Result<u64> {
    let mut size = if required <= MAP_GROWTH_STEP {
        required.max(MIN_MAP_SIZE).next_power_of_two()
    } else {
        required
            .checked_add(MAP_GROWTH_STEP - 1)
            .ok_or(StoreError::Invalid("mapping size overflow"))?
            / MAP_GROWTH_STEP
            * MAP_GROWTH_STEP
    };
    if cap > 0 {
        size = size.min(cap.max(required));
    }
    if size > MAX_MAP_SIZE {
        if required > MAX_MAP_SIZE {
            return Err(StoreError::Invalid("mapping exceeds addressable size"));
        }
        size = MAX_MAP_SIZE;
    }
    Ok(size)
}
