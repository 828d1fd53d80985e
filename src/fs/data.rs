//! Paged file data.
//!
//! Regular file contents live in a page table keyed by (inode id, page
//! index); a separate table holds each inode's logical length. Trailing
//! zero bytes of a page are elided on write and reconstructed on read, so a
//! stored page may be shorter than the page size; a missing page inside the
//! logical extent reads as zeros. Page size is fixed per database.

use log::debug;

use super::inode::InodeId;
use crate::error::KvError;
use crate::kv::{binding, StoreKind, StoreRef, Txn};

const PAGE_STORE_NAME: &str = "jcxfs.data.page";
const LEN_STORE_NAME: &str = "jcxfs.data.len";

/// Page indexes are 32-bit signed and non-negative, bounding file size to
/// `page_size * 2^31` bytes.
const PAGE_INDEX_MAX: u64 = i32::MAX as u64;

#[derive(Debug)]
pub(crate) struct DataStore {
    pages: StoreRef,
    lens: StoreRef,
    page_size: u64,
}

impl DataStore {
    pub fn open(txn: &mut Txn<'_>, page_size: u32) -> Result<DataStore, KvError> {
        Ok(DataStore {
            pages: txn.open_store(PAGE_STORE_NAME, StoreKind::Unique)?,
            lens: txn.open_store(LEN_STORE_NAME, StoreKind::Unique)?,
            page_size: page_size as u64,
        })
    }

    /// Logical length in bytes; a missing entry means zero.
    pub fn length(&self, txn: &mut Txn<'_>, id: InodeId) -> Result<u64, KvError> {
        match txn.get(self.lens, &binding::compressed_u64(id)) {
            Some(bytes) => binding::read_compressed_u64(&bytes)
                .ok_or_else(|| KvError::Corrupt("malformed length entry".into())),
            None => Ok(0),
        }
    }

    /// Random-access read into `buf`, clamped to the logical length.
    /// Returns the number of bytes copied.
    pub fn read_data(
        &self,
        txn: &mut Txn<'_>,
        id: InodeId,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, KvError> {
        let len = self.length(txn, id)?;
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(len - offset) as usize;

        let mut copied = 0usize;
        let mut page = offset / self.page_size;
        let mut page_off = (offset % self.page_size) as usize;
        while copied < count {
            let n = (self.page_size as usize - page_off).min(count - copied);
            let out = &mut buf[copied..copied + n];
            out.fill(0);
            if let Some(stored) = txn.get(self.pages, &self.page_key(id, page)?) {
                if stored.len() > page_off {
                    let take = (stored.len() - page_off).min(n);
                    out[..take].copy_from_slice(&stored[page_off..page_off + take]);
                }
            }
            copied += n;
            page += 1;
            page_off = 0;
        }
        Ok(count)
    }

    /// Random-access write of `data`, growing the logical length as needed.
    /// Returns the number of bytes written.
    pub fn write_data(
        &self,
        txn: &mut Txn<'_>,
        id: InodeId,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, KvError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| KvError::Fatal("write extent overflows".into()))?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        let mut page = offset / self.page_size;
        let mut page_off = (offset % self.page_size) as usize;
        while written < data.len() {
            let n = (self.page_size as usize - page_off).min(data.len() - written);
            let chunk = &data[written..written + n];
            let key = self.page_key(id, page)?;
            let stored = if page_off == 0 && n == self.page_size as usize {
                trim_trailing_zeros(chunk.to_vec())
            } else {
                // Partial page: overlay the incoming slice on what is there.
                let mut merged = txn.get(self.pages, &key).unwrap_or_default();
                if merged.len() < page_off + n {
                    merged.resize(page_off + n, 0);
                }
                merged[page_off..page_off + n].copy_from_slice(chunk);
                trim_trailing_zeros(merged)
            };
            txn.put(self.pages, &key, &stored)?;
            written += n;
            page += 1;
            page_off = 0;
        }

        if end > self.length(txn, id)? {
            self.put_length(txn, id, end)?;
        }
        Ok(data.len())
    }

    /// Truncate to `new_len`. Shrinking rewrites the partial last page and
    /// discards every page past it; growing just raises the length, and the
    /// gap reads back as zeros like any other hole.
    pub fn truncate(&self, txn: &mut Txn<'_>, id: InodeId, new_len: u64) -> Result<(), KvError> {
        let current = self.length(txn, id)?;
        if new_len >= current {
            if new_len > current {
                self.put_length(txn, id, new_len)?;
            }
            return Ok(());
        }
        let total_pages = current / self.page_size;
        if new_len == 0 {
            for page in 0..=total_pages {
                let _ = txn.delete_key(self.pages, &self.page_key(id, page)?)?;
            }
        } else {
            let last_keep = (new_len - 1) / self.page_size;
            let tail = (new_len % self.page_size) as usize;
            if tail > 0 {
                if let Some(stored) = txn.get(self.pages, &self.page_key(id, last_keep)?) {
                    let mut kept = stored;
                    kept.truncate(tail);
                    txn.put(
                        self.pages,
                        &self.page_key(id, last_keep)?,
                        &trim_trailing_zeros(kept),
                    )?;
                }
            }
            for page in last_keep + 1..=total_pages {
                let _ = txn.delete_key(self.pages, &self.page_key(id, page)?)?;
            }
        }
        debug!("truncated inode {id} from {current} to {new_len}");
        self.put_length(txn, id, new_len)
    }

    /// Remove every page and the length entry for `id`.
    pub fn delete_entry(&self, txn: &mut Txn<'_>, id: InodeId) -> Result<(), KvError> {
        let current = self.length(txn, id)?;
        let total_pages = current / self.page_size;
        for page in 0..=total_pages {
            let _ = txn.delete_key(self.pages, &self.page_key(id, page)?)?;
        }
        let _ = txn.delete_key(self.lens, &binding::compressed_u64(id))?;
        Ok(())
    }

    /// Cardinality of the page table.
    pub fn total_pages_used(&self, txn: &mut Txn<'_>) -> u64 {
        txn.count(self.pages)
    }

    /// Number of length entries (files that have ever been written).
    pub fn count_lengths(&self, txn: &mut Txn<'_>) -> u64 {
        txn.count(self.lens)
    }

    fn put_length(&self, txn: &mut Txn<'_>, id: InodeId, len: u64) -> Result<(), KvError> {
        txn.put(
            self.lens,
            &binding::compressed_u64(id),
            &binding::compressed_u64(len),
        )
    }

    fn page_key(&self, id: InodeId, page: u64) -> Result<Vec<u8>, KvError> {
        if page > PAGE_INDEX_MAX {
            return Err(KvError::Fatal(format!("page index {page} out of range")));
        }
        use zerocopy::AsBytes;
        Ok(binding::PageKey::new(id, page as u32).as_bytes().to_vec())
    }
}

/// Drop the run of trailing zero bytes; reads reconstruct them.
fn trim_trailing_zeros(mut page: Vec<u8>) -> Vec<u8> {
    let keep = page.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    page.truncate(keep);
    page
}
