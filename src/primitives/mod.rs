//! Building blocks of the page store.
//!
//! Positioned file I/O and memory mapping, the transaction lock monitor, the
//! background page writer, and the pager itself.

/// Transaction locks and the cross-process file lock.
pub mod concurrency;

/// Positioned file I/O and the read-only memory map.
pub mod io;

/// Page allocation, the overwrite log, and transactions.
pub mod pager;

/// Background page writer with sync barriers.
pub mod writer;
