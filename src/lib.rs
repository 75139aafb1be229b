//! Transactional page store.
//!
//! A single file of fixed-size pages with one writer and any number of
//! readers. Commits are crash safe: page content and bookkeeping are synced
//! before the inactive of two meta pages is rewritten, so reopening after a
//! crash always lands on the last fully completed commit.
//!
//! ```no_run
//! use txstore::{File, Options};
//!
//! # fn main() -> txstore::Result<()> {
//! let file = File::open("state.db", Options::default())?;
//! let mut tx = file.begin()?;
//! let mut page = tx.alloc()?;
//! page.set_bytes(b"hello")?;
//! let id = page.id();
//! tx.set_root(id)?;
//! tx.commit()?;
//! drop(tx);
//!
//! let mut tx = file.begin_readonly()?;
//! let root = tx.root();
//! assert_eq!(&tx.page(root)?.bytes()?[..5], b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Overflow area
//!
//! When a maximum size is configured, bookkeeping pages may be needed even
//! after the data area filled up, e.g. to persist the freelist of a
//! transaction that only frees pages. Such a transaction can opt in with
//! [`TxOptions::enable_overflow_area`] to allocate meta pages past the
//! maximum size. The store never enables it on its own; the pages are given
//! back by later commits once they are free again.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::pager::{File, FileStats, Options, Page, Region, Tx, TxOptions};
pub use types::{PageId, Result, StoreError, TxId};
