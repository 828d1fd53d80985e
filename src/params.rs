//! Environment parameters.
//!
//! Two homes. The sidecar `jcxfs.env` is a small plaintext key/value file
//! next to the store files holding exactly what is needed to *open* the
//! encrypted store: the stream-cipher IV, the cipher and auth module
//! identifiers, and the opaque auth-state blob. Editing it independently of
//! the store renders the store unopenable; that is part of its design.
//!
//! The internal parameters (format version, page size) live *inside* the
//! encrypted store under a reserved key of the metadata table and are
//! invisible until the correct password is supplied.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, KvError};
use crate::kv::CipherId;

/// Sidecar file name.
pub const SIDECAR_FILE: &str = "jcxfs.env";

/// Registry identifiers accepted in the sidecar.
pub const CIPHER_CHACHA20: &str = "CHACHA20";
pub const AUTH_ARGON: &str = "ARGON";

/// Page size accepted range and default, fixed at database creation.
pub const PAGE_SIZE_MIN: u32 = 64;
pub const PAGE_SIZE_MAX: u32 = 1_024_000;
pub const PAGE_SIZE_DEFAULT: u32 = 65_536;

/// Current internal format version.
pub const DB_VERSION: u32 = 1;

/// Reserved metadata-table key of the internal parameters record.
pub(crate) const PARAMS_KEY: &[u8] = b"DB_PARAMS";

/// The plaintext sidecar.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EnvSidecar {
    pub iv: u64,
    pub cipher_class: String,
    pub auth_class: String,
    pub auth_data: String,
}

impl EnvSidecar {
    pub fn path(dir: &Path) -> std::path::PathBuf {
        dir.join(SIDECAR_FILE)
    }

    pub fn load(dir: &Path) -> Result<EnvSidecar, AuthError> {
        let text = fs::read_to_string(Self::path(dir))?;
        Self::parse(&text)
    }

    pub fn store(&self, dir: &Path) -> Result<(), AuthError> {
        let mut out = String::from("# jcxfs environment parameters\n");
        out.push_str(&format!("iv={:016x}\n", self.iv));
        out.push_str(&format!("cipher_class={}\n", self.cipher_class));
        out.push_str(&format!("auth_class={}\n", self.auth_class));
        out.push_str(&format!("auth_data={}\n", self.auth_data));
        fs::write(Self::path(dir), out)?;
        Ok(())
    }

    fn parse(text: &str) -> Result<EnvSidecar, AuthError> {
        let mut iv = None;
        let mut cipher_class = None;
        let mut auth_class = None;
        let mut auth_data = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| AuthError::Malformed(format!("sidecar line {line:?}")))?;
            match key {
                "iv" => {
                    iv = Some(u64::from_str_radix(value, 16).map_err(|_| {
                        AuthError::Malformed(format!("sidecar iv {value:?}"))
                    })?)
                }
                "cipher_class" => cipher_class = Some(value.to_string()),
                "auth_class" => auth_class = Some(value.to_string()),
                "auth_data" => auth_data = Some(value.to_string()),
                _ => {
                    // Unknown keys are tolerated for forward compatibility.
                }
            }
        }
        let missing = |what: &str| AuthError::Malformed(format!("sidecar is missing {what}"));
        Ok(EnvSidecar {
            iv: iv.ok_or_else(|| missing("iv"))?,
            cipher_class: cipher_class.ok_or_else(|| missing("cipher_class"))?,
            auth_class: auth_class.ok_or_else(|| missing("auth_class"))?,
            auth_data: auth_data.ok_or_else(|| missing("auth_data"))?,
        })
    }

    /// Map the `cipher_class` identifier onto a store cipher.
    pub fn cipher_id(&self) -> Result<CipherId, AuthError> {
        match self.cipher_class.as_str() {
            CIPHER_CHACHA20 => Ok(CipherId::ChaCha20),
            other => Err(AuthError::Malformed(format!("unknown cipher class {other:?}"))),
        }
    }

    /// The only supported auth module; anything else fails the open.
    pub fn check_auth_class(&self) -> Result<(), AuthError> {
        match self.auth_class.as_str() {
            AUTH_ARGON => Ok(()),
            other => Err(AuthError::Malformed(format!("unknown auth class {other:?}"))),
        }
    }
}

/// Internal parameters stored under the reserved metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct DbParams {
    pub version: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
}

impl DbParams {
    pub fn new(page_size: u32) -> Result<DbParams, KvError> {
        check_page_size(page_size)?;
        Ok(DbParams {
            version: DB_VERSION,
            page_size,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        serde_json::to_vec(self).map_err(|e| KvError::Corrupt(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<DbParams, KvError> {
        let params: DbParams =
            serde_json::from_slice(bytes).map_err(|e| KvError::Corrupt(e.to_string()))?;
        if params.version != DB_VERSION {
            return Err(KvError::Corrupt(format!(
                "unsupported database version {}",
                params.version
            )));
        }
        check_page_size(params.page_size)?;
        Ok(params)
    }
}

fn check_page_size(page_size: u32) -> Result<(), KvError> {
    if !(PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&page_size) {
        return Err(KvError::Corrupt(format!(
            "page size {page_size} outside {PAGE_SIZE_MIN}..={PAGE_SIZE_MAX}"
        )));
    }
    Ok(())
}
