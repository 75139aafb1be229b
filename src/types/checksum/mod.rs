#![forbid(unsafe_code)]

//! Checksums guarding on-disk structures.
//!
//! Meta pages carry FNV-1a over their fixed fields. List pages carry a
//! CRC-32 that also binds the chain link and entry count, so a torn header
//! is caught as well as a torn payload.

/// Streaming 32-bit checksum.
pub trait Checksum: Default {
    /// Clears all state.
    fn reset(&mut self);
    /// Feeds `bytes`.
    fn update(&mut self, bytes: &[u8]);
    /// Digest of everything fed since the last reset.
    fn finalize(&self) -> u32;

    /// Digest of `parts` fed in order.
    fn digest(parts: &[&[u8]]) -> u32 {
        let mut sum = Self::default();
        for part in parts {
            sum.update(part);
        }
        sum.finalize()
    }
}

/// CRC-32 (IEEE).
#[derive(Default)]
pub struct Crc32Fast(crc32fast::Hasher);

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.0.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.0.clone().finalize()
    }
}

const FNV_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub struct Fnv1a32(u32);

impl Default for Fnv1a32 {
    fn default() -> Self {
        Self(FNV_BASIS)
    }
}

impl Checksum for Fnv1a32 {
    fn reset(&mut self) {
        self.0 = FNV_BASIS;
    }

    fn update(&mut self, bytes: &[u8]) {
        self.0 = bytes
            .iter()
            .fold(self.0, |h, &b| (h ^ u32::from(b)).wrapping_mul(FNV_PRIME));
    }

    fn finalize(&self) -> u32 {
        self.0
    }
}

/// FNV-1a over `bytes`.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    Fnv1a32::digest(&[bytes])
}

/// CRC of one list page: link, entry count, then the encoded entries.
pub fn list_crc32(next: u64, count: u32, payload: &[u8]) -> u32 {
    Crc32Fast::digest(&[&next.to_le_bytes(), &count.to_le_bytes(), payload])
}
