//! Error taxonomy. Three kinds, split by who can observe them:
//!
//! * [`FileOpError`] is what a single filesystem operation returns to the
//!   host binding; it maps onto POSIX errno values.
//! * [`AuthError`] is raised only at init/open/changepassword, never during
//!   steady-state filesystem calls (the mount already holds the DEK).
//! * [`KvError`] covers the underlying store. A store failure inside an
//!   operation aborts its transaction and surfaces as `FileOpError::Io`.

use std::io;

use thiserror::Error;

/// Per-operation failures returned to the host binding.
///
/// Invariant violations that should be impossible (a resolvable path with no
/// inode record, a missing root inode) are reported through the `Io`
/// catch-all rather than panicking; the mount stays up.
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("no such file")]
    NoSuchFile,
    #[error("no such directory")]
    NoSuchDir,
    #[error("not a file")]
    NotAFile,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("file exists")]
    FileExists,
    #[error("store failure: {0}")]
    Io(#[from] KvError),
}

impl FileOpError {
    /// Negated errno for the host binding, per the facade contract:
    /// `0` or a positive byte count on success, `-errno` on failure.
    pub fn errno(&self) -> i32 {
        let e = match self {
            FileOpError::NoSuchFile | FileOpError::NoSuchDir => libc::ENOENT,
            FileOpError::NotADirectory => libc::ENOTDIR,
            FileOpError::NotAFile => libc::EISDIR,
            FileOpError::DirNotEmpty => libc::ENOTEMPTY,
            FileOpError::FileExists => libc::EEXIST,
            FileOpError::Io(_) => libc::EIO,
        };
        -e
    }
}

/// Key-hierarchy and sidecar failures.
///
/// A wrong password is detected exactly because CBC/PKCS7 padding validation
/// fails under the wrong KEK; no separate password verifier is stored.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password does not unlock this database")]
    WrongPassword,
    #[error("cipher failure: {0}")]
    Cipher(&'static str),
    #[error("malformed environment data: {0}")]
    Malformed(String),
    #[error("sidecar i/o: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the underlying transactional store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("database directory is locked by another process")]
    Locked,
    #[error("environment is read-only")]
    ReadOnly,
    #[error("environment is closed")]
    Closed,
    #[error("unknown store {0:?}")]
    UnknownStore(String),
    #[error("store {0:?} reopened with a different configuration")]
    KindMismatch(String),
    #[error("corrupt database: {0}")]
    Corrupt(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Failure to open or create a database environment.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
