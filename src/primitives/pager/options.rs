use serde::{Deserialize, Serialize};

use crate::types::{Result, StoreError};

use super::alloc::DEFAULT_META_GROW_PERCENTAGE;
use super::meta::valid_page_size;
use super::wal::DEFAULT_WAL_LIMIT;

/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Options controlling how a store file is opened.
///
/// Deserializable so embedding applications can keep them in their own
/// config files; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum file size in bytes (0 = unbounded).
    pub max_size: u64,
    /// Page size in bytes for new files (0 = default). Must be a power of
    /// two between 1 KiB and 64 KiB; existing files must match.
    pub page_size: u32,
    /// Extend the file to `max_size` when opening.
    pub prealloc: bool,
    /// Open read-only. Only read transactions are available.
    pub readonly: bool,
    /// Permission bits for a newly created file (unix only).
    pub file_mode: u32,
    /// Committed WAL mapping size that triggers an automatic checkpoint.
    pub wal_limit: usize,
    /// Meta-area utilization (percent) above which the area grows further.
    pub meta_grow_percentage: u8,
    /// Replace the maximum size stored in an existing file with `max_size`.
    pub update_max_size: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_size: 0,
            page_size: 0,
            prealloc: false,
            readonly: false,
            file_mode: 0o600,
            wal_limit: DEFAULT_WAL_LIMIT,
            meta_grow_percentage: DEFAULT_META_GROW_PERCENTAGE,
            update_max_size: false,
        }
    }
}

impl Options {
    /// Checks option values that do not depend on the file contents.
    pub fn validate(&self) -> Result<()> {
        if self.page_size != 0 && !valid_page_size(self.page_size) {
            return Err(StoreError::Invalid(
                "page size must be a power of two between 1KiB and 64KiB",
            ));
        }
        if self.meta_grow_percentage == 0 || self.meta_grow_percentage > 100 {
            return Err(StoreError::Invalid("meta grow percentage must be in 1..=100"));
        }
        if self.max_size != 0 && self.max_size < 4 * u64::from(self.effective_page_size()) {
            return Err(StoreError::Invalid("max size must hold at least four pages"));
        }
        if self.prealloc && self.max_size == 0 {
            return Err(StoreError::Invalid("prealloc requires a max size"));
        }
        Ok(())
    }

    /// Page size to create new files with.
    pub fn effective_page_size(&self) -> u32 {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// Per-transaction overrides passed to [`File::begin_with`](super::File::begin_with).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Begin a read-only transaction.
    pub readonly: bool,
    /// Allow meta allocations past the maximum file size when the data area
    /// cannot provide them. Off by default; see the crate docs.
    pub enable_overflow_area: bool,
    /// Overrides [`Options::meta_grow_percentage`].
    pub meta_area_grow_percentage: Option<u8>,
    /// Overrides [`Options::wal_limit`].
    pub wal_limit: Option<usize>,
}
