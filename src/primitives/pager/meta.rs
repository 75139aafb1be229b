use std::fmt;
use std::ops::Range;

use crate::types::{fnv1a32, PageId, Result, StoreError, TxId};

/// `b"TXPS"` read as a little-endian u32.
pub const META_MAGIC: u32 = u32::from_le_bytes(*b"TXPS");
/// On-disk format version.
pub const META_VERSION: u32 = 1;
/// Bytes of the meta page covered by the layout (including checksum).
pub const META_LEN: usize = 84;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 1024;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_VERSION_RANGE: Range<usize> = 4..8;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_MAX_SIZE: Range<usize> = 12..20;
const META_FLAGS: Range<usize> = 20..24;
const META_ROOT: Range<usize> = 24..32;
const META_TXID: Range<usize> = 32..40;
const META_FREELIST_ROOT: Range<usize> = 40..48;
const META_WAL_ROOT: Range<usize> = 48..56;
const META_DATA_END: Range<usize> = 56..64;
const META_META_END: Range<usize> = 64..72;
const META_META_TOTAL: Range<usize> = 72..80;
const META_CHECKSUM: Range<usize> = 80..84;

/// One of the two redundant file headers stored in pages 0 and 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaPage {
    /// Page size of the file in bytes.
    pub page_size: u32,
    /// Configured maximum file size in bytes (0 = unbounded).
    pub max_size: u64,
    /// Reserved flag bits.
    pub flags: u32,
    /// Application root page.
    pub root: PageId,
    /// Transaction that wrote this header.
    pub txid: TxId,
    /// First list page of the persisted freelist.
    pub freelist_root: PageId,
    /// First list page of the persisted WAL mapping.
    pub wal_root: PageId,
    /// One past the highest page of the data and meta areas.
    pub data_end: u64,
    /// One past the highest overflow page (0 = no overflow area).
    pub meta_end: u64,
    /// Pages owned by the meta area.
    pub meta_total: u64,
}

/// Returns true when `page_size` is a supported power of two.
pub fn valid_page_size(page_size: u32) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

impl MetaPage {
    /// Header of a freshly created file.
    pub fn initial(page_size: u32, max_size: u64, txid: TxId) -> Self {
        Self {
            page_size,
            max_size,
            flags: 0,
            root: PageId::NONE,
            txid,
            freelist_root: PageId::NONE,
            wal_root: PageId::NONE,
            data_end: PageId::FIRST_DATA.0,
            meta_end: 0,
            meta_total: 0,
        }
    }

    /// Encodes the header into `buf`, zeroing the rest of the buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < META_LEN {
            return Err(StoreError::Invalid("meta buffer too small"));
        }
        buf.fill(0);
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[META_VERSION_RANGE].copy_from_slice(&META_VERSION.to_le_bytes());
        buf[META_PAGE_SIZE].copy_from_slice(&self.page_size.to_le_bytes());
        buf[META_MAX_SIZE].copy_from_slice(&self.max_size.to_le_bytes());
        buf[META_FLAGS].copy_from_slice(&self.flags.to_le_bytes());
        buf[META_ROOT].copy_from_slice(&self.root.0.to_le_bytes());
        buf[META_TXID].copy_from_slice(&self.txid.0.to_le_bytes());
        buf[META_FREELIST_ROOT].copy_from_slice(&self.freelist_root.0.to_le_bytes());
        buf[META_WAL_ROOT].copy_from_slice(&self.wal_root.0.to_le_bytes());
        buf[META_DATA_END].copy_from_slice(&self.data_end.to_le_bytes());
        buf[META_META_END].copy_from_slice(&self.meta_end.to_le_bytes());
        buf[META_META_TOTAL].copy_from_slice(&self.meta_total.to_le_bytes());
        let checksum = fnv1a32(&buf[..META_CHECKSUM.start]);
        buf[META_CHECKSUM].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    /// Encodes the header into a full page image.
    pub fn to_page(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size as usize];
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes and validates a header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_LEN {
            return Err(StoreError::Corruption("meta page truncated"));
        }
        let stored = u32::from_le_bytes(array(buf, META_CHECKSUM));
        if fnv1a32(&buf[..META_CHECKSUM.start]) != stored {
            return Err(StoreError::Corruption("meta page checksum mismatch"));
        }
        if u32::from_le_bytes(array(buf, META_MAGIC_RANGE)) != META_MAGIC {
            return Err(StoreError::Corruption("meta page magic mismatch"));
        }
        if u32::from_le_bytes(array(buf, META_VERSION_RANGE)) != META_VERSION {
            return Err(StoreError::Corruption("unsupported meta page version"));
        }
        let page_size = u32::from_le_bytes(array(buf, META_PAGE_SIZE));
        if !valid_page_size(page_size) {
            return Err(StoreError::Corruption("meta page has invalid page size"));
        }
        let meta = MetaPage {
            page_size,
            max_size: u64::from_le_bytes(array(buf, META_MAX_SIZE)),
            flags: u32::from_le_bytes(array(buf, META_FLAGS)),
            root: PageId(u64::from_le_bytes(array(buf, META_ROOT))),
            txid: TxId(u64::from_le_bytes(array(buf, META_TXID))),
            freelist_root: PageId(u64::from_le_bytes(array(buf, META_FREELIST_ROOT))),
            wal_root: PageId(u64::from_le_bytes(array(buf, META_WAL_ROOT))),
            data_end: u64::from_le_bytes(array(buf, META_DATA_END)),
            meta_end: u64::from_le_bytes(array(buf, META_META_END)),
            meta_total: u64::from_le_bytes(array(buf, META_META_TOTAL)),
        };
        if meta.data_end < PageId::FIRST_DATA.0 {
            return Err(StoreError::Corruption("meta page data end below first data page"));
        }
        Ok(meta)
    }
}

// Callers check the buffer length against META_LEN first.
fn array<const N: usize>(buf: &[u8], range: Range<usize>) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[range]);
    out
}

/// Picks the authoritative header: the valid one with the higher txid.
pub fn select_active(slots: [Option<&MetaPage>; 2]) -> Option<usize> {
    match slots {
        [Some(a), Some(b)] => Some(if b.txid > a.txid { 1 } else { 0 }),
        [Some(_), None] => Some(0),
        [None, Some(_)] => Some(1),
        [None, None] => None,
    }
}

impl fmt::Display for MetaPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetaPage(txid={}, page_size={}, max_size={}, root={}, freelist_root={}, wal_root={}, data_end={}, meta_end={}, meta_total={})",
            self.txid,
            self.page_size,
            self.max_size,
            self.root,
            self.freelist_root,
            self.wal_root,
            self.data_end,
            self.meta_end,
            self.meta_total,
        )
    }
}
