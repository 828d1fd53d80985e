//! Inodes.
//!
//! An inode record describes one filesystem object independent of any path:
//! type and permission bits, owner ids, timestamps, and the target path for
//! symlinks. Records are keyed by inode id and serialized as JSON with
//! short field names so the format can grow without breaking old databases.
//!
//! Fresh ids are drawn from `[2^31, 2^63 - 10)`, wrapping to the low end on
//! exhaustion and probing until an unused id is found. The persisted
//! counter advances in the same transaction that uses the id, so a crash
//! either commits both or neither.

use std::num::NonZeroUsize;

use log::{debug, info};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FileOpError, KvError};
use crate::kv::{binding, StoreKind, StoreRef, Txn};

/// A 64-bit positive inode identifier.
pub type InodeId = u64;

/// The root directory's inode id.
pub const ROOT_ID: InodeId = 1;

const INODE_STORE_NAME: &str = "jcxfs.inode";
const META_STORE_NAME: &str = "jcxfs.meta";
const ID_COUNTER_KEY: &[u8] = b"ID_COUNTER";
const CACHE_CAP: usize = 1000;

/// Low end of the fresh-id range.
const ID_FLOOR: u64 = 1 << 31;
/// One past the high end of the fresh-id range.
const ID_CEIL: u64 = (1 << 63) - 10;

/// File type mask and the three accepted types.
pub const S_IFMT: u32 = 0xF000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xA000;

/// Permission bits kept on chmod.
pub const MODE_PERM_MASK: u32 = 0o7777;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Dir,
    File,
    Symlink,
}

/// One inode record. Timestamps are seconds since the epoch.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct InodeRecord {
    #[serde(rename = "mo")]
    pub mode: u32,
    #[serde(rename = "at")]
    pub atime: i64,
    #[serde(rename = "bt")]
    pub btime: i64,
    #[serde(rename = "ct")]
    pub ctime: i64,
    #[serde(rename = "mt")]
    pub mtime: i64,
    #[serde(rename = "ui")]
    pub uid: i32,
    #[serde(rename = "gi")]
    pub gid: i32,
    #[serde(rename = "tp", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl InodeRecord {
    /// A record must match exactly one of the three supported types; any
    /// other type mask is rejected.
    pub fn new(mode: u32, uid: i32, gid: i32, now: i64) -> Result<InodeRecord, KvError> {
        let record = InodeRecord {
            mode,
            atime: now,
            btime: now,
            ctime: now,
            mtime: now,
            uid,
            gid,
            target: None,
        };
        let _ = record.typ()?;
        Ok(record)
    }

    pub fn typ(&self) -> Result<InodeType, KvError> {
        match self.mode & S_IFMT {
            S_IFDIR => Ok(InodeType::Dir),
            S_IFREG => Ok(InodeType::File),
            S_IFLNK => Ok(InodeType::Symlink),
            other => Err(KvError::Corrupt(format!(
                "inode mode {:#o} has unsupported type mask {other:#x}",
                self.mode
            ))),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    fn encode(&self) -> Result<Vec<u8>, KvError> {
        serde_json::to_vec(self).map_err(|e| KvError::Corrupt(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<InodeRecord, KvError> {
        serde_json::from_slice(bytes).map_err(|e| KvError::Corrupt(e.to_string()))
    }
}

/// The inode store: id-keyed records, a bounded cache, and the id issuer.
#[derive(Debug)]
pub(crate) struct InodeStore {
    store: StoreRef,
    meta: StoreRef,
    cache: Mutex<LruCache<InodeId, Option<InodeRecord>>>,
    issuer: IdIssuer,
}

impl InodeStore {
    pub fn open(txn: &mut Txn<'_>, meta: StoreRef) -> Result<InodeStore, KvError> {
        let store = txn.open_store(INODE_STORE_NAME, StoreKind::Unique)?;
        let seed = match txn.get(meta, ID_COUNTER_KEY) {
            Some(bytes) => binding::read_compressed_u64(&bytes)
                .ok_or_else(|| KvError::Corrupt("malformed id counter".into()))?,
            None => ID_FLOOR,
        };
        if !(ID_FLOOR..ID_CEIL).contains(&seed) {
            return Err(KvError::Corrupt(format!("id counter {seed} out of range")));
        }
        Ok(InodeStore {
            store,
            meta,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAP).expect("nonzero cache capacity"),
            )),
            issuer: IdIssuer {
                next: Mutex::new(seed),
            },
        })
    }

    /// Idempotent put of `id -> record`.
    pub fn create_entry(
        &self,
        txn: &mut Txn<'_>,
        id: InodeId,
        record: &InodeRecord,
    ) -> Result<(), KvError> {
        txn.put(self.store, &binding::compressed_u64(id), &record.encode()?)?;
        let _ = self.cache.lock().pop(&id);
        Ok(())
    }

    /// Cached lookup; a miss reads the store.
    pub fn read_entry(
        &self,
        txn: &mut Txn<'_>,
        id: InodeId,
    ) -> Result<Option<InodeRecord>, KvError> {
        if let Some(cached) = self.cache.lock().get(&id) {
            return Ok(cached.clone());
        }
        let record = match txn.get(self.store, &binding::compressed_u64(id)) {
            Some(bytes) => Some(InodeRecord::decode(&bytes)?),
            None => None,
        };
        let _ = self.cache.lock().put(id, record.clone());
        Ok(record)
    }

    /// Replace the full record.
    pub fn update_entry(
        &self,
        txn: &mut Txn<'_>,
        id: InodeId,
        record: &InodeRecord,
    ) -> Result<(), KvError> {
        txn.put(self.store, &binding::compressed_u64(id), &record.encode()?)?;
        let _ = self.cache.lock().pop(&id);
        Ok(())
    }

    /// Delete the record; the id must be present.
    pub fn remove_entry(&self, txn: &mut Txn<'_>, id: InodeId) -> Result<(), FileOpError> {
        let present = txn.delete_key(self.store, &binding::compressed_u64(id))?;
        let _ = self.cache.lock().pop(&id);
        if !present {
            return Err(KvError::Corrupt(format!("removing absent inode {id}")).into());
        }
        Ok(())
    }

    pub fn has_id(&self, txn: &mut Txn<'_>, id: InodeId) -> Result<bool, KvError> {
        Ok(self.read_entry(txn, id)?.is_some())
    }

    /// Return an unused id in the valid range and persist the advanced
    /// counter in the same transaction.
    pub fn next_id(&self, txn: &mut Txn<'_>) -> Result<InodeId, KvError> {
        let mut next = self.issuer.next.lock();
        let mut attempts: u64 = 0;
        loop {
            let id = *next;
            *next = if id + 1 >= ID_CEIL { ID_FLOOR } else { id + 1 };
            if !self.has_id(txn, id)? {
                txn.put(self.meta, ID_COUNTER_KEY, &binding::compressed_u64(*next))?;
                return Ok(id);
            }
            debug!("inode id {id} in use, probing on");
            attempts += 1;
            if attempts >= ID_CEIL - ID_FLOOR {
                return Err(KvError::Fatal("inode id space exhausted".into()));
            }
        }
    }

    /// On first open of a writable environment, make sure the root
    /// directory exists.
    pub fn ensure_root(&self, txn: &mut Txn<'_>, now: i64) -> Result<(), KvError> {
        if self.has_id(txn, ROOT_ID)? {
            return Ok(());
        }
        info!("creating root inode");
        let root = InodeRecord::new(S_IFDIR | 0o777, 0, 0, now)?;
        self.create_entry(txn, ROOT_ID, &root)
    }

    /// Total number of inode records.
    pub fn count(&self, txn: &mut Txn<'_>) -> u64 {
        txn.count(self.store)
    }

    pub fn purge_cache(&self) {
        self.cache.lock().clear();
    }

    #[cfg(test)]
    pub fn set_issuer_seed(&self, seed: u64) {
        *self.issuer.next.lock() = seed;
    }
}

/// Mutex-serialized id counter. The in-memory value may advance past ids
/// whose transactions later abort; those ids are simply skipped.
#[derive(Debug)]
struct IdIssuer {
    next: Mutex<u64>,
}

pub(crate) fn open_meta_store(txn: &mut Txn<'_>) -> Result<StoreRef, KvError> {
    txn.open_store(META_STORE_NAME, StoreKind::Unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_short_field_names() {
        let record = InodeRecord::new(S_IFREG | 0o644, 1000, 1000, 77).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"mo\""), "{json}");
        assert!(json.contains("\"mt\""), "{json}");
        assert!(!json.contains("\"tp\""), "absent target serializes nothing: {json}");
        assert_eq!(InodeRecord::decode(json.as_bytes()).unwrap(), record);
    }

    #[test]
    fn symlink_target_round_trips() {
        let mut record = InodeRecord::new(S_IFLNK | 0o444, 0, 0, 0).unwrap();
        record.target = Some("/somewhere/else".to_string());
        let bytes = record.encode().unwrap();
        assert_eq!(InodeRecord::decode(&bytes).unwrap().target.as_deref(), Some("/somewhere/else"));
    }

    #[test]
    fn unsupported_type_masks_are_rejected() {
        // Socket and character-device masks are outside the model.
        assert!(InodeRecord::new(0xC000 | 0o644, 0, 0, 0).is_err());
        assert!(InodeRecord::new(0x2000 | 0o644, 0, 0, 0).is_err());
        assert!(InodeRecord::new(0o644, 0, 0, 0).is_err());
    }

    #[test]
    fn type_predicates_follow_the_mask() {
        let dir = InodeRecord::new(S_IFDIR | 0o755, 0, 0, 0).unwrap();
        assert!(dir.is_dir() && !dir.is_file() && !dir.is_symlink());
        assert_eq!(dir.typ().unwrap(), InodeType::Dir);
    }
}
