//! Key hierarchy: user password to store key.
//!
//! Two levels. The DEK (data encryption key) is 32 random bytes generated
//! once at init and handed to the store as its stream-cipher key. The KEK
//! (key encryption key) is derived from `password ‖ salt` with Argon2 and
//! wraps the DEK under AES-128-CBC with PKCS7 padding. A wrong password is
//! detected exactly because padding validation fails under the wrong KEK;
//! no separate password verifier is stored. Changing the password rewrites
//! only the salt and the wrapped-key blob; the DEK, and therefore all prior
//! ciphertext, remains valid.

use aes::Aes128;
use argon2::Argon2;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Key handed to the underlying store.
pub(crate) type Dek = [u8; 32];

const DEK_LEN: usize = 32;
const KEK_LEN: usize = 16;
const SALT_LEN: usize = 64;
const WRAP_IV_LEN: usize = 16;

const STATE_VERSION: &str = "1";

/// Persisted auth state, serialized as JSON into the sidecar's `auth_data`.
#[derive(Serialize, Deserialize, Clone)]
struct AuthState {
    version: String,
    salt: String,
    #[serde(rename = "wrappedDek")]
    wrapped_dek: String,
}

/// The Argon2 + AES-CBC auth module.
pub(crate) struct AuthMachine {
    state: AuthState,
}

impl AuthMachine {
    /// Generate a fresh DEK, salt, and wrapped-key blob for a new database.
    pub fn init_new_env(password: &str) -> Result<(AuthMachine, Dek), AuthError> {
        if password.is_empty() {
            return Err(AuthError::Malformed("empty password".into()));
        }
        let mut dek = [0u8; DEK_LEN];
        OsRng
            .try_fill_bytes(&mut dek)
            .map_err(|_| AuthError::Cipher("os rng failure"))?;
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| AuthError::Cipher("os rng failure"))?;

        let kek = derive_kek(password, &salt)?;
        let wrapped = wrap_dek(&kek, &dek)?;
        let state = AuthState {
            version: STATE_VERSION.to_string(),
            salt: hex::encode(salt),
            wrapped_dek: wrapped,
        };
        Ok((AuthMachine { state }, dek))
    }

    /// Parse a previously stored state blob. Parse-only; the password is not
    /// verified until [`AuthMachine::read_cipher`].
    pub fn load_env(blob: &str) -> Result<AuthMachine, AuthError> {
        let state: AuthState =
            serde_json::from_str(blob).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if state.version != STATE_VERSION {
            return Err(AuthError::Malformed(format!(
                "unsupported auth state version {:?}",
                state.version
            )));
        }
        Ok(AuthMachine { state })
    }

    /// Serialize the state for the sidecar.
    pub fn store_env(&self) -> Result<String, AuthError> {
        serde_json::to_string(&self.state).map_err(|e| AuthError::Malformed(e.to_string()))
    }

    /// Unwrap the DEK with `password`. Fails with [`AuthError::WrongPassword`]
    /// when the password does not match.
    pub fn read_cipher(&self, password: &str) -> Result<Dek, AuthError> {
        let salt = hex::decode(&self.state.salt)
            .map_err(|e| AuthError::Malformed(format!("salt: {e}")))?;
        let kek = derive_kek(password, &salt)?;
        unwrap_dek(&kek, &self.state.wrapped_dek)
    }

    /// Re-wrap the DEK under a fresh salt and the new password. The old
    /// password must unwrap the current blob.
    pub fn change_password(&self, old: &str, new: &str) -> Result<AuthMachine, AuthError> {
        if new.is_empty() {
            return Err(AuthError::Malformed("empty password".into()));
        }
        let dek = self.read_cipher(old)?;
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| AuthError::Cipher("os rng failure"))?;
        let kek = derive_kek(new, &salt)?;
        let wrapped = wrap_dek(&kek, &dek)?;
        Ok(AuthMachine {
            state: AuthState {
                version: STATE_VERSION.to_string(),
                salt: hex::encode(salt),
                wrapped_dek: wrapped,
            },
        })
    }
}

/// Argon2 with the crate's default parameters, 16-byte output.
fn derive_kek(password: &str, salt: &[u8]) -> Result<[u8; KEK_LEN], AuthError> {
    let mut kek = [0u8; KEK_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut kek)
        .map_err(|_| AuthError::Cipher("argon2 derivation failed"))?;
    Ok(kek)
}

/// `hex(iv ‖ AES-128-CBC(dek))`.
fn wrap_dek(kek: &[u8; KEK_LEN], dek: &Dek) -> Result<String, AuthError> {
    let mut iv = [0u8; WRAP_IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|_| AuthError::Cipher("os rng failure"))?;
    let ciphertext = Aes128CbcEnc::new(kek.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(dek);
    let mut record = iv.to_vec();
    record.extend_from_slice(&ciphertext);
    Ok(hex::encode(record))
}

fn unwrap_dek(kek: &[u8; KEK_LEN], wrapped: &str) -> Result<Dek, AuthError> {
    let record =
        hex::decode(wrapped).map_err(|e| AuthError::Malformed(format!("wrapped dek: {e}")))?;
    if record.len() <= WRAP_IV_LEN {
        return Err(AuthError::Malformed("wrapped dek too short".into()));
    }
    let (iv, ciphertext) = record.split_at(WRAP_IV_LEN);
    let iv: [u8; WRAP_IV_LEN] = iv.try_into().map_err(|_| AuthError::Cipher("iv length"))?;
    let plaintext = Aes128CbcDec::new(kek.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AuthError::WrongPassword)?;
    Dek::try_from(plaintext.as_slice()).map_err(|_| AuthError::WrongPassword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_returns_the_dek() {
        let (machine, dek) = AuthMachine::init_new_env("secret").unwrap();
        assert_eq!(machine.read_cipher("secret").unwrap(), dek);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (machine, _) = AuthMachine::init_new_env("secret").unwrap();
        assert!(matches!(
            machine.read_cipher("wrong"),
            Err(AuthError::WrongPassword)
        ));
    }

    #[test]
    fn empty_password_is_rejected_at_init() {
        assert!(AuthMachine::init_new_env("").is_err());
    }

    #[test]
    fn state_blob_round_trips() {
        let (machine, dek) = AuthMachine::init_new_env("secret").unwrap();
        let blob = machine.store_env().unwrap();
        let loaded = AuthMachine::load_env(&blob).unwrap();
        assert_eq!(loaded.read_cipher("secret").unwrap(), dek);
    }

    #[test]
    fn password_change_keeps_the_dek() {
        let (machine, dek) = AuthMachine::init_new_env("old").unwrap();
        let rotated = machine.change_password("old", "new").unwrap();
        assert_eq!(rotated.read_cipher("new").unwrap(), dek);
        assert!(matches!(
            rotated.read_cipher("old"),
            Err(AuthError::WrongPassword)
        ));
        assert!(matches!(
            machine.change_password("wrong", "new"),
            Err(AuthError::WrongPassword)
        ));
    }
}
