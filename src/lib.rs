//! jcxfs: an encrypted POSIX-like filesystem whose entire on-disk
//! representation is a single encrypted append-only key-value database.
//!
//! Five layers, leaves first:
//!   + Store: transactional tables over an encrypted append-only journal.
//!   + Keys: Argon2-derived KEK wrapping a random DEK (the store key).
//!   + Inodes: id-keyed records, id issuer, root bootstrap.
//!   + Paths: directory tree as duplicate-keyed child entries.
//!   + Facade: path-addressed POSIX operations, one transaction each.
//!
//! File sizes, names, and directory structure are not observable from the
//! raw storage; only the small `jcxfs.env` sidecar is plaintext, and it
//! contains nothing but what is needed to *start* unlocking the database.
//!
//! ```no_run
//! use jcxfs::{Jcxfs, InitOptions};
//!
//! let db = Jcxfs::init("/tmp/db".as_ref(), "hunter2", InitOptions::default())?;
//! db.create("/hello", 0o644, 1000, 1000)?;
//! let written = db.write("/hello", b"world", 0)?;
//! assert_eq!(written, 5);
//! db.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use log::info;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::auth::AuthMachine;
use crate::params::EnvSidecar;

mod auth;
pub mod error;
pub mod fs;
pub mod kv;
mod params;

pub use error::{AuthError, FileOpError, KvError, OpenError};
pub use fs::inode::{InodeId, InodeRecord, InodeType, ROOT_ID};
pub use fs::path::{PathError, PathKey};
pub use fs::stat::{FileAttrs, StatFs, TableStats};
pub use fs::{DirStream, Filesystem};
pub use params::{PAGE_SIZE_DEFAULT, PAGE_SIZE_MAX, PAGE_SIZE_MIN};

/// Options for creating a new database.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Fixed for the life of the database.
    pub page_size: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            page_size: params::PAGE_SIZE_DEFAULT,
        }
    }
}

/// Options for opening an existing database.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    /// Skip per-commit fsync; throughput over durability.
    pub no_sync: bool,
}

/// An open database: the environment plus the filesystem facade over it.
///
/// Dereferences to [`Filesystem`], so the operation surface is available
/// directly on the handle.
#[derive(Debug)]
pub struct Jcxfs {
    fs: Filesystem,
}

impl Jcxfs {
    /// Create a new database in `dir`: generate the DEK, salt, and IV,
    /// write the sidecar, and bootstrap the store with the internal
    /// parameters and the root inode.
    pub fn init(dir: &Path, password: &str, options: InitOptions) -> Result<Jcxfs, OpenError> {
        // Validate before any file is touched.
        let _ = params::DbParams::new(options.page_size)?;
        std::fs::create_dir_all(dir)
            .map_err(|e| OpenError::Config(format!("cannot create {}: {e}", dir.display())))?;
        if EnvSidecar::path(dir).exists() {
            return Err(OpenError::Config(format!(
                "{} already contains a database",
                dir.display()
            )));
        }
        let (machine, dek) = AuthMachine::init_new_env(password)?;
        let mut iv = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|_| AuthError::Cipher("os rng failure"))?;
        let sidecar = EnvSidecar {
            iv: u64::from_be_bytes(iv),
            cipher_class: params::CIPHER_CHACHA20.to_string(),
            auth_class: params::AUTH_ARGON.to_string(),
            auth_data: machine.store_env()?,
        };
        sidecar.store(dir)?;
        info!("initialized database at {}", dir.display());

        let env = open_env(dir, &sidecar, dek, kv::EnvFlags::empty())?;
        let fs = Filesystem::mount(Arc::new(env), Some(options.page_size))?;
        Ok(Jcxfs { fs })
    }

    /// Open an existing database. A wrong password surfaces as
    /// [`AuthError::WrongPassword`]; a missing or malformed sidecar is a
    /// fatal open error.
    pub fn open(dir: &Path, password: &str, options: OpenOptions) -> Result<Jcxfs, OpenError> {
        let sidecar = EnvSidecar::load(dir)?;
        sidecar.check_auth_class()?;
        let machine = AuthMachine::load_env(&sidecar.auth_data)?;
        let dek = machine.read_cipher(password)?;

        let mut flags = kv::EnvFlags::empty();
        if options.read_only {
            flags |= kv::EnvFlags::READ_ONLY;
        }
        if options.no_sync {
            flags |= kv::EnvFlags::NO_SYNC;
        }
        let env = open_env(dir, &sidecar, dek, flags)?;
        let fs = Filesystem::mount(Arc::new(env), None)?;
        Ok(Jcxfs { fs })
    }

    /// Rotate the password offline. Only the salt and the wrapped-key blob
    /// in the sidecar change; the DEK and all prior ciphertext remain
    /// valid.
    pub fn change_password(dir: &Path, old: &str, new: &str) -> Result<(), AuthError> {
        let mut sidecar = EnvSidecar::load(dir)?;
        sidecar.check_auth_class()?;
        let machine = AuthMachine::load_env(&sidecar.auth_data)?;
        let rotated = machine.change_password(old, new)?;
        sidecar.auth_data = rotated.store_env()?;
        sidecar.store(dir)?;
        info!("password changed for {}", dir.display());
        Ok(())
    }

    /// Drain in-flight operations and close the environment.
    pub fn close(self) -> Result<(), KvError> {
        self.fs.close()
    }
}

impl Deref for Jcxfs {
    type Target = Filesystem;

    fn deref(&self) -> &Filesystem {
        &self.fs
    }
}

fn open_env(
    dir: &Path,
    sidecar: &EnvSidecar,
    dek: auth::Dek,
    flags: kv::EnvFlags,
) -> Result<kv::Env, OpenError> {
    let cfg = kv::CipherConfig {
        id: sidecar.cipher_id()?,
        key: dek,
        iv: sidecar.iv,
    };
    Ok(kv::Env::open(dir, cfg, flags)?)
}
