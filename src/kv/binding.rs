//! Order-preserving byte encodings for table keys.
//!
//! Keys are compared as raw bytes by the store, so every binding here must
//! sort the same way the decoded values do. Inode ids use a compressed
//! length-prefixed form for key compactness; data-page keys are a fixed
//! 12-byte struct so that all pages of one inode form a contiguous key range
//! and appear in page order during scans.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Compressed encoding of a non-negative 64-bit integer: one length byte
/// followed by the minimal big-endian representation.
///
/// Lexicographic byte order equals numeric order because a larger value
/// never has a shorter encoding.
pub fn compressed_u64(v: u64) -> Vec<u8> {
    let be = v.to_be_bytes();
    // Keep at least one payload byte so zero still encodes.
    let skip = be.iter().take_while(|b| **b == 0).count().min(7);
    let mut out = Vec::with_capacity(9 - skip);
    out.push((8 - skip) as u8);
    out.extend_from_slice(&be[skip..]);
    out
}

/// Inverse of [`compressed_u64`]. `None` on any length mismatch.
pub fn read_compressed_u64(bytes: &[u8]) -> Option<u64> {
    let (&len, rest) = bytes.split_first()?;
    let len = len as usize;
    if !(1..=8).contains(&len) || rest.len() != len {
        return None;
    }
    let mut be = [0u8; 8];
    be[8 - len..].copy_from_slice(rest);
    Some(u64::from_be_bytes(be))
}

/// Table key of one data page: 8-byte inode id followed by the 4-byte page
/// index, both big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Debug, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PageKey {
    id: U64<BigEndian>,
    page: U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<PageKey>(), 12);

impl PageKey {
    pub fn new(id: u64, page: u32) -> Self {
        Self {
            id: U64::new(id),
            page: U32::new(page),
        }
    }

    pub fn id(&self) -> u64 {
        self.id.get()
    }

    pub fn page(&self) -> u32 {
        self.page.get()
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_u64_round_trip() {
        for v in [
            0u64,
            1,
            255,
            256,
            1 << 31,
            (1 << 31) + 17,
            (1 << 63) - 11,
            u64::MAX,
        ] {
            let enc = compressed_u64(v);
            assert_eq!(read_compressed_u64(&enc), Some(v), "value {v}");
        }
    }

    #[test]
    fn compressed_u64_sorts_numerically() {
        let values = [0u64, 1, 2, 127, 128, 255, 256, 65535, 65536, 1 << 31, 1 << 40, u64::MAX];
        let mut encoded: Vec<Vec<u8>> = values.iter().map(|v| compressed_u64(*v)).collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn compressed_u64_rejects_garbage() {
        assert_eq!(read_compressed_u64(&[]), None);
        assert_eq!(read_compressed_u64(&[0]), None);
        assert_eq!(read_compressed_u64(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(read_compressed_u64(&[2, 1]), None);
    }

    #[test]
    fn page_key_layout_and_order() {
        let k = PageKey::new(0xDEAD_BEEF, 7);
        assert_eq!(k.as_bytes().len(), 12);
        assert_eq!(PageKey::parse(k.as_bytes()), Some(k));

        // Pages of one inode sort together and in page order.
        let a = PageKey::new(5, 0);
        let b = PageKey::new(5, 1);
        let c = PageKey::new(6, 0);
        assert!(a.as_bytes() < b.as_bytes());
        assert!(b.as_bytes() < c.as_bytes());
    }
}
