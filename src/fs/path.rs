//! Paths and the path store.
//!
//! A directory tree is encoded as duplicate-keyed index entries: the `PATH`
//! store maps a parent inode id to one [`PathRecord`] per child. Lookups
//! cannot be keyed by full path because encrypting equal-plaintext keys
//! would leak structure, so resolution walks from the root one segment at a
//! time; a bounded cache keeps the hot paths cheap. Walk-from-root also
//! keeps per-entry storage independent of full path length.

use std::num::NonZeroUsize;

use itertools::Itertools;
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use super::inode::{InodeId, ROOT_ID};
use crate::error::{FileOpError, KvError};
use crate::kv::{binding, StoreKind, StoreRef, Txn};

const PATH_STORE_NAME: &str = "jcxfs.path";
const CACHE_CAP: usize = 1000;

/// Record format version in encoded path records.
const RECORD_VERSION: u8 = b'1';
const RECORD_SEP: u8 = b'!';

/// A validated, normalized absolute path.
///
/// Invariant: the canonical form starts with `/`, has no trailing `/`
/// (except the root itself), no empty segments, and no segment consisting
/// entirely of `.` characters.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PathKey {
    canonical: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("path is not absolute")]
    NotAbsolute,
    #[error("trailing slash")]
    TrailingSlash,
    #[error("empty path segment")]
    EmptySegment,
    #[error("dots-only path segment")]
    DotsSegment,
}

impl From<PathError> for FileOpError {
    fn from(e: PathError) -> FileOpError {
        FileOpError::Io(KvError::Fatal(format!("invalid path: {e}")))
    }
}

impl PathKey {
    /// Validate and normalize `raw`. Consecutive leading `/` collapse to
    /// one; everything else is taken literally.
    pub fn parse(raw: &str) -> Result<PathKey, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(PathError::NotAbsolute);
        }
        let rest = raw.trim_start_matches('/');
        if rest.is_empty() {
            return Ok(PathKey::root());
        }
        if rest.ends_with('/') {
            return Err(PathError::TrailingSlash);
        }
        if rest.contains("//") {
            return Err(PathError::EmptySegment);
        }
        for segment in rest.split('/') {
            if segment.bytes().all(|b| b == b'.') {
                return Err(PathError::DotsSegment);
            }
        }
        Ok(PathKey {
            canonical: format!("/{}", rest.split('/').join("/")),
        })
    }

    pub fn root() -> PathKey {
        PathKey {
            canonical: "/".to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.canonical == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The last segment; empty for the root.
    pub fn suffix(&self) -> &str {
        match self.canonical.rfind('/') {
            Some(idx) => &self.canonical[idx + 1..],
            None => "",
        }
    }

    /// The path with the last segment stripped, collapsing to the root when
    /// nothing remains. The root's parent is the root itself; callers never
    /// ask for it.
    pub fn parent(&self) -> PathKey {
        match self.canonical.rfind('/') {
            Some(0) | None => PathKey::root(),
            Some(idx) => PathKey {
                canonical: self.canonical[..idx].to_string(),
            },
        }
    }

    /// Ordered non-empty segments; empty for the root.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.canonical[1..].split('/').filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// One child entry of a directory, encoded as
/// `"1!<16-hex-digits-of-id>!<name>"`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PathRecord {
    pub id: InodeId,
    pub name: String,
}

impl PathRecord {
    pub fn encode(id: InodeId, name: &str) -> Vec<u8> {
        format!("{}{}{:016x}{}{}", RECORD_VERSION as char, RECORD_SEP as char, id, RECORD_SEP as char, name)
            .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<PathRecord, KvError> {
        let bad = || KvError::Corrupt("malformed path record".into());
        if bytes.len() < 19 || bytes[0] != RECORD_VERSION || bytes[1] != RECORD_SEP || bytes[18] != RECORD_SEP {
            return Err(bad());
        }
        let hex = std::str::from_utf8(&bytes[2..18]).map_err(|_| bad())?;
        let id = u64::from_str_radix(hex, 16).map_err(|_| bad())?;
        let name = String::from_utf8(bytes[19..].to_vec()).map_err(|_| bad())?;
        Ok(PathRecord { id, name })
    }
}

/// The path store: child entries plus the resolution cache.
#[derive(Debug)]
pub(crate) struct PathStore {
    store: StoreRef,
    cache: Mutex<LruCache<String, InodeId>>,
}

impl PathStore {
    pub fn open(txn: &mut Txn<'_>) -> Result<PathStore, KvError> {
        Ok(PathStore {
            store: txn.open_store(PATH_STORE_NAME, StoreKind::Duplicates)?,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAP).expect("nonzero cache capacity"),
            )),
        })
    }

    /// Resolve `path` to an inode id, `None` if any segment is missing.
    pub fn read_entry(
        &self,
        txn: &mut Txn<'_>,
        path: &PathKey,
    ) -> Result<Option<InodeId>, KvError> {
        if path.is_root() {
            return Ok(Some(ROOT_ID));
        }
        if let Some(id) = self.cache.lock().get(path.as_str()) {
            return Ok(Some(*id));
        }
        let mut id = ROOT_ID;
        for segment in path.segments() {
            match self.find_child(txn, id, segment)? {
                Some(next) => id = next,
                None => return Ok(None),
            }
        }
        let _ = self.cache.lock().put(path.as_str().to_string(), id);
        Ok(Some(id))
    }

    /// Add a child record for `path` pointing at `id`.
    pub fn create_entry(
        &self,
        txn: &mut Txn<'_>,
        path: &PathKey,
        id: InodeId,
    ) -> Result<(), FileOpError> {
        if path.is_root() {
            return Err(FileOpError::FileExists);
        }
        if self.read_entry(txn, path)?.is_some() {
            return Err(FileOpError::FileExists);
        }
        let parent = self
            .read_entry(txn, &path.parent())?
            .ok_or(FileOpError::NoSuchDir)?;
        txn.put(
            self.store,
            &binding::compressed_u64(parent),
            &PathRecord::encode(id, path.suffix()),
        )?;
        Ok(())
    }

    /// Remove the child record for `path`. With `check_children` the call
    /// refuses to detach a node that still has children of its own; the
    /// rename path suppresses the check because the subtree moves intact.
    pub fn remove_entry(
        &self,
        txn: &mut Txn<'_>,
        path: &PathKey,
        check_children: bool,
    ) -> Result<(), FileOpError> {
        if path.is_root() {
            return Err(KvError::Fatal("refusing to remove the root".into()).into());
        }
        let id = self
            .read_entry(txn, path)?
            .ok_or(FileOpError::NoSuchFile)?;
        if check_children && self.has_children(txn, id)? {
            return Err(FileOpError::DirNotEmpty);
        }
        let parent = self
            .read_entry(txn, &path.parent())?
            .ok_or_else(|| KvError::Corrupt("resolvable path has no parent".into()))?;
        let removed = txn.delete_pair(
            self.store,
            &binding::compressed_u64(parent),
            &PathRecord::encode(id, path.suffix()),
        )?;
        if !removed {
            return Err(KvError::Corrupt("resolvable path has no child record".into()).into());
        }
        let _ = self.cache.lock().pop(path.as_str());
        Ok(())
    }

    /// Child names under the directory at `path`, in storage order.
    pub fn read_sub_paths(
        &self,
        txn: &mut Txn<'_>,
        path: &PathKey,
    ) -> Result<Vec<String>, FileOpError> {
        let id = self
            .read_entry(txn, path)?
            .ok_or(FileOpError::NoSuchDir)?;
        let key = binding::compressed_u64(id);
        let mut names = Vec::new();
        let mut cursor = txn.cursor(self.store);
        let mut value = cursor.search_key(&key);
        while let Some(v) = value {
            names.push(PathRecord::decode(&v)?.name);
            value = cursor.next_dup();
        }
        Ok(names)
    }

    /// Detach `old` from its parent and reattach it under `new`'s parent
    /// with `new`'s suffix, keeping the inode id.
    pub fn rename(
        &self,
        txn: &mut Txn<'_>,
        old: &PathKey,
        new: &PathKey,
    ) -> Result<(), FileOpError> {
        if old.is_root() || new.is_root() {
            return Err(KvError::Fatal("refusing to rename the root".into()).into());
        }
        let id = self
            .read_entry(txn, old)?
            .ok_or(FileOpError::NoSuchFile)?;
        if self.read_entry(txn, new)?.is_some() {
            return Err(FileOpError::FileExists);
        }
        let new_parent = self
            .read_entry(txn, &new.parent())?
            .ok_or(FileOpError::NoSuchDir)?;
        let old_parent = self
            .read_entry(txn, &old.parent())?
            .ok_or_else(|| KvError::Corrupt("resolvable path has no parent".into()))?;

        let removed = txn.delete_pair(
            self.store,
            &binding::compressed_u64(old_parent),
            &PathRecord::encode(id, old.suffix()),
        )?;
        if !removed {
            return Err(KvError::Corrupt("resolvable path has no child record".into()).into());
        }
        txn.put(
            self.store,
            &binding::compressed_u64(new_parent),
            &PathRecord::encode(id, new.suffix()),
        )?;

        let mut cache = self.cache.lock();
        let _ = cache.pop(old.as_str());
        drop(cache);
        if self.has_children(txn, id)? {
            // Any number of descendant-path mappings may now point into an
            // incorrect subtree; a wholesale purge is coarse but correct.
            debug!("rename of non-leaf {old} purges the path cache");
            self.purge_cache();
        }
        Ok(())
    }

    /// Whether any child record exists under inode `id`.
    pub fn has_children(&self, txn: &mut Txn<'_>, id: InodeId) -> Result<bool, KvError> {
        let key = binding::compressed_u64(id);
        let mut cursor = txn.cursor(self.store);
        Ok(cursor.search_key(&key).is_some())
    }

    /// Total number of child records.
    pub fn count(&self, txn: &mut Txn<'_>) -> u64 {
        txn.count(self.store)
    }

    pub fn purge_cache(&self) {
        self.cache.lock().clear();
    }

    fn find_child(
        &self,
        txn: &mut Txn<'_>,
        parent: InodeId,
        name: &str,
    ) -> Result<Option<InodeId>, KvError> {
        let key = binding::compressed_u64(parent);
        let mut cursor = txn.cursor(self.store);
        let mut value = cursor.search_key(&key);
        while let Some(v) = value {
            let record = PathRecord::decode(&v)?;
            if record.name == name {
                return Ok(Some(record.id));
            }
            value = cursor.next_dup();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_paths() {
        for bad in ["", "bad", "/bad/", "/bad//", "/bad//bad", "/bad/../bad", "/bad/.../bad", "/bad/..", "/bad/..."] {
            assert!(PathKey::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn accepts_valid_paths() {
        for good in ["/", "//", "/good", "/good/good", "/good/.good", "/good/..good", "/good/.good.", "/good/..good.."] {
            assert!(PathKey::parse(good).is_ok(), "{good:?} should be accepted");
        }
    }

    #[test]
    fn leading_slashes_collapse() {
        assert_eq!(PathKey::parse("//").unwrap().as_str(), "/");
        assert_eq!(PathKey::parse("///a/b").unwrap().as_str(), "/a/b");
    }

    #[test]
    fn suffix_parent_segments() {
        let p = PathKey::parse("/a/bb/ccc").unwrap();
        assert_eq!(p.suffix(), "ccc");
        assert_eq!(p.parent().as_str(), "/a/bb");
        assert_eq!(p.segments().collect::<Vec<_>>(), ["a", "bb", "ccc"]);

        let top = PathKey::parse("/a").unwrap();
        assert_eq!(top.parent().as_str(), "/");
        assert_eq!(top.suffix(), "a");

        let root = PathKey::root();
        assert!(root.is_root());
        assert_eq!(root.segments().count(), 0);
    }

    #[test]
    fn record_round_trips() {
        let encoded = PathRecord::encode(0x8000_0001, "hello");
        assert_eq!(
            String::from_utf8(encoded.clone()).unwrap(),
            "1!0000000080000001!hello"
        );
        let record = PathRecord::decode(&encoded).unwrap();
        assert_eq!(record.id, 0x8000_0001);
        assert_eq!(record.name, "hello");
    }

    #[test]
    fn record_names_may_contain_separators() {
        let encoded = PathRecord::encode(42, "a!b!c");
        assert_eq!(PathRecord::decode(&encoded).unwrap().name, "a!b!c");
    }

    #[test]
    fn record_rejects_garbage() {
        assert!(PathRecord::decode(b"").is_err());
        assert!(PathRecord::decode(b"2!0000000000000001!x").is_err());
        assert!(PathRecord::decode(b"1!zzzzzzzzzzzzzzzz!x").is_err());
        assert!(PathRecord::decode(b"1!00000001!x").is_err());
    }
}
