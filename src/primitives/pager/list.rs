//! Chained list pages used to persist the freelist and the WAL mapping.
//!
//! Every list page starts with a 16 byte header (little endian):
//!
//! | bytes  | field                         |
//! |--------|-------------------------------|
//! | 0..8   | next list page (0 = end)      |
//! | 8..12  | number of entries on the page |
//! | 12..16 | CRC-32 of the entry bytes     |
//!
//! Entries are packed back to back after the header and never straddle pages.

use std::collections::HashSet;
use std::ops::Range;

use crate::types::{list_crc32, PageId, Result, StoreError};

use super::region::{Region, REGION_LARGE_LEN};

/// Size of the list page header.
pub const LIST_HEADER_LEN: usize = 16;

const LIST_NEXT: Range<usize> = 0..8;
const LIST_COUNT: Range<usize> = 8..12;
const LIST_CRC32: Range<usize> = 12..16;

/// An item that can be packed into list pages.
pub trait ListEntry: Sized {
    /// Largest encoding any entry of this type can have.
    const MAX_LEN: usize;

    /// Bytes this entry occupies when encoded.
    fn encoded_len(&self) -> usize;

    /// Appends the encoding to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes one entry from the front of `buf`, returning it and the bytes used.
    fn decode(buf: &[u8]) -> Result<(Self, usize)>;
}

/// Freelist entry: a free region and the area it belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeEntry {
    /// Free pages.
    pub region: Region,
    /// True for meta-area pages.
    pub meta: bool,
}

impl ListEntry for FreeEntry {
    const MAX_LEN: usize = REGION_LARGE_LEN;

    fn encoded_len(&self) -> usize {
        self.region.encoded_len()
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.region.encode(self.meta, out)
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (region, meta, used) = Region::decode(buf)?;
        Ok((FreeEntry { region, meta }, used))
    }
}

/// WAL mapping entry: the original page and the page holding its content.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WalEntry {
    /// Page id callers address.
    pub original: PageId,
    /// Page currently holding the content.
    pub overwrite: PageId,
}

impl ListEntry for WalEntry {
    const MAX_LEN: usize = 16;

    fn encoded_len(&self) -> usize {
        Self::MAX_LEN
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.original.0.to_le_bytes());
        out.extend_from_slice(&self.overwrite.0.to_le_bytes());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let read = |range: Range<usize>| {
            buf.get(range)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or(StoreError::Corruption("wal entry truncated"))
        };
        let original = PageId(read(0..8)?);
        let overwrite = PageId(read(8..16)?);
        Ok((
            WalEntry {
                original,
                overwrite,
            },
            Self::MAX_LEN,
        ))
    }
}

fn payload_capacity(page_size: usize) -> usize {
    page_size - LIST_HEADER_LEN
}

/// Number of list pages needed to store `entries`.
pub fn pages_needed<E: ListEntry>(entries: &[E], page_size: usize) -> usize {
    let capacity = payload_capacity(page_size);
    let mut pages = 0;
    let mut used = capacity;
    for entry in entries {
        let len = entry.encoded_len();
        if used + len > capacity {
            pages += 1;
            used = 0;
        }
        used += len;
    }
    pages
}

/// Encodes `entries` into the page images of the list chain stored in
/// `pages`, in order. Pages beyond what the entries need are written as
/// empty links so the chain always covers every page it was given.
pub fn encode_pages<E: ListEntry>(
    entries: &[E],
    pages: &[PageId],
    page_size: usize,
) -> Result<Vec<(PageId, Vec<u8>)>> {
    if pages_needed(entries, page_size) > pages.len() {
        return Err(StoreError::Invalid("not enough list pages for entries"));
    }
    let capacity = payload_capacity(page_size);
    let mut out = Vec::with_capacity(pages.len());
    let mut remaining = entries.iter().peekable();
    for (idx, &id) in pages.iter().enumerate() {
        let mut payload = Vec::with_capacity(capacity);
        let mut count = 0u32;
        while let Some(entry) = remaining.peek() {
            if payload.len() + entry.encoded_len() > capacity {
                break;
            }
            entry.encode(&mut payload)?;
            count += 1;
            remaining.next();
        }
        let next = pages.get(idx + 1).copied().unwrap_or(PageId::NONE);
        let crc = list_crc32(next.0, count, &payload);
        let mut buf = vec![0u8; page_size];
        buf[LIST_NEXT].copy_from_slice(&next.0.to_le_bytes());
        buf[LIST_COUNT].copy_from_slice(&count.to_le_bytes());
        buf[LIST_CRC32].copy_from_slice(&crc.to_le_bytes());
        buf[LIST_HEADER_LEN..LIST_HEADER_LEN + payload.len()].copy_from_slice(&payload);
        out.push((id, buf));
    }
    Ok(out)
}

/// Reads a list chain starting at `root`. `read_page` loads one page image.
///
/// Returns the decoded entries and the ids of the pages the chain occupies.
pub fn read_list<E, F>(
    root: PageId,
    page_size: usize,
    mut read_page: F,
) -> Result<(Vec<E>, Vec<PageId>)>
where
    E: ListEntry,
    F: FnMut(PageId) -> Result<Vec<u8>>,
{
    let mut entries = Vec::new();
    let mut pages = Vec::new();
    let mut seen = HashSet::new();
    let mut next = root;
    while !next.is_none() {
        if next.0 < PageId::FIRST_DATA.0 || !seen.insert(next) {
            return Err(StoreError::Corruption("invalid list page link"));
        }
        let buf = read_page(next)?;
        if buf.len() < page_size {
            return Err(StoreError::Corruption("list page truncated"));
        }
        let link = u64::from_le_bytes(field(&buf, LIST_NEXT)?);
        let count = u32::from_le_bytes(field(&buf, LIST_COUNT)?);
        let stored_crc = u32::from_le_bytes(field(&buf, LIST_CRC32)?);

        let mut offset = LIST_HEADER_LEN;
        for _ in 0..count {
            let (entry, used) = E::decode(&buf[offset..page_size])?;
            offset += used;
            entries.push(entry);
        }
        if list_crc32(link, count, &buf[LIST_HEADER_LEN..offset]) != stored_crc {
            return Err(StoreError::Corruption("list page checksum mismatch"));
        }
        pages.push(next);
        next = PageId(link);
    }
    Ok((entries, pages))
}

fn field<const N: usize>(buf: &[u8], range: Range<usize>) -> Result<[u8; N]> {
    buf.get(range)
        .and_then(|b| b.try_into().ok())
        .ok_or(StoreError::Corruption("list page header truncated"))
}
