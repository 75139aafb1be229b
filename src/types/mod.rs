#![forbid(unsafe_code)]
//! Identifiers, the crate error type, and checksum helpers shared by every layer.

use std::fmt;
use std::io;

mod checksum;

pub use checksum::{fnv1a32, list_crc32, Checksum, Crc32Fast, Fnv1a32};

/// Address of a fixed-size page within the store file.
///
/// Page 0 and page 1 hold the two redundant meta pages; everything else is
/// data, meta-area, or overwrite-log content.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel used for "no page" (root not set, empty list chain).
    pub const NONE: PageId = PageId(0);
    /// First page id that may hold data or meta-area content.
    pub const FIRST_DATA: PageId = PageId(2);

    /// Returns true when this id is the "no page" sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Byte offset of this page within the file.
    pub fn offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic transaction id stored in the meta page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the page store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file or writer I/O failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or option.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Allocation could not be satisfied, even from the overflow area.
    #[error("out of memory: cannot allocate {requested} pages")]
    OutOfMemory {
        /// Number of pages that were requested.
        requested: u64,
    },
    /// Operation on a transaction that already committed or rolled back.
    #[error("transaction already finished")]
    TxFinished,
    /// Mutating operation on a read-only transaction.
    #[error("transaction is read-only")]
    TxReadonly,
    /// Access to a page freed earlier in the same transaction.
    #[error("page {0} has been freed")]
    FreedPage(PageId),
    /// Modification of a page after it was flushed.
    #[error("page {0} has already been flushed")]
    PageFlushed(PageId),
    /// Page id outside the allocated data area.
    #[error("page {0} out of bounds")]
    OutOfBounds(PageId),
    /// Write transaction requested on a file opened read-only.
    #[error("file is opened read-only")]
    ReadOnly,
    /// Another process holds a conflicting lock on the file.
    #[error("file is locked by another process")]
    Locked,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Duplicates an error so one failure can be reported to several waiters.
    ///
    /// `io::Error` is not `Clone`; the copy keeps the kind and message.
    pub fn duplicate(&self) -> StoreError {
        match self {
            StoreError::Io(err) => StoreError::Io(io::Error::new(err.kind(), err.to_string())),
            StoreError::Corruption(msg) => StoreError::Corruption(msg),
            StoreError::Invalid(msg) => StoreError::Invalid(msg),
            StoreError::OutOfMemory { requested } => StoreError::OutOfMemory {
                requested: *requested,
            },
            StoreError::TxFinished => StoreError::TxFinished,
            StoreError::TxReadonly => StoreError::TxReadonly,
            StoreError::FreedPage(id) => StoreError::FreedPage(*id),
            StoreError::PageFlushed(id) => StoreError::PageFlushed(*id),
            StoreError::OutOfBounds(id) => StoreError::OutOfBounds(*id),
            StoreError::ReadOnly => StoreError::ReadOnly,
            StoreError::Locked => StoreError::Locked,
        }
    }
}
