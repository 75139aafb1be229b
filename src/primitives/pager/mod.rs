#![forbid(unsafe_code)]
//! Transactional page store on top of a single file.
//!
//! Pages `0` and `1` hold the two meta pages. Everything above belongs to the
//! data area, the meta area (freelist and WAL list pages, overwrite pages) or
//! the overflow area past the configured maximum size.

mod alloc;
mod file;
mod freelist;
mod list;
mod meta;
mod options;
mod page;
mod region;
mod tx;
mod wal;

pub use alloc::{AllocState, ListPlan, TxAlloc, DEFAULT_META_GROW_PERCENTAGE};
pub use file::{File, FileStats};
pub use freelist::{AllocOrder, Freelist};
pub use list::{FreeEntry, ListEntry, WalEntry, LIST_HEADER_LEN};
pub use meta::{MetaPage, MAX_PAGE_SIZE, META_LEN, META_MAGIC, META_VERSION, MIN_PAGE_SIZE};
pub use options::{Options, TxOptions, DEFAULT_PAGE_SIZE};
pub use page::Page;
pub use region::{Region, RegionList, REGION_LARGE_LEN, REGION_SMALL_LEN};
pub use tx::Tx;
pub use wal::{WalDelta, WalMapping, DEFAULT_WAL_LIMIT};
