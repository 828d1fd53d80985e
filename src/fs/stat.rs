//! Attribute and filesystem-statistics types handed to the host binding.

use super::inode::InodeId;

/// Answer to `getattr`: the inode record flattened for the host, plus the
/// derived size and link count.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttrs {
    pub id: InodeId,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub uid: i32,
    pub gid: i32,
    pub atime: i64,
    pub btime: i64,
    pub ctime: i64,
    pub mtime: i64,
}

/// Answer to `statfs`. Free space is a large constant: the underlying
/// store is an append-only log whose physical consumption is not
/// page-proportional, so there is no honest number to report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks_used: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub max_name_len: u32,
}

/// Per-table entry counts, for the dump/stats surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableStats {
    pub inodes: u64,
    pub path_entries: u64,
    pub pages: u64,
    pub lengths: u64,
}
