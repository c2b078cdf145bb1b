//! At-rest protection of the identity blob under a password-derived key.
//!
//! Blob layout: `version(1) || salt(32) || iv(12) || ciphertext`. The key is
//! PBKDF2-HMAC-SHA256 over the password; the iteration count is bound to the
//! version tag so future versions can raise it.

use pbkdf2::pbkdf2_hmac;
use rand_core::CryptoRngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives::{self, KEY_LEN, NONCE_LEN};

pub const VAULT_VERSION: u8 = 0x01;

const VAULT_AAD: &[u8] = b"chai/vault/v1";
const SALT_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Encrypt the identity blob under a password.
pub fn lock<R: CryptoRngCore>(
    rng: &mut R,
    identity_bytes: &[u8],
    password: &str,
) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; NONCE_LEN];
    primitives::rand_bytes(rng, &mut salt);
    primitives::rand_bytes(rng, &mut iv);

    let mut key = derive_key(password, &salt);
    let ciphertext = primitives::aead_seal(&key, &iv, VAULT_AAD, identity_bytes);
    key.zeroize();
    let ciphertext = ciphertext?;

    let mut out = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.push(VAULT_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a locked blob. A wrong password, truncated blob, or unknown
/// version all surface as `VaultUnlockFailed`.
pub fn unlock(locked_blob: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    if locked_blob.len() < 1 + SALT_LEN + NONCE_LEN || locked_blob[0] != VAULT_VERSION {
        return Err(CryptoError::VaultUnlockFailed);
    }

    let salt: [u8; SALT_LEN] = locked_blob[1..1 + SALT_LEN]
        .try_into()
        .map_err(|_| CryptoError::VaultUnlockFailed)?;
    let iv: [u8; NONCE_LEN] = locked_blob[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::VaultUnlockFailed)?;
    let ciphertext = &locked_blob[1 + SALT_LEN + NONCE_LEN..];

    let mut key = derive_key(password, &salt);
    let plaintext = primitives::aead_open(&key, &iv, VAULT_AAD, ciphertext);
    key.zeroize();
    plaintext.map_err(|_| CryptoError::VaultUnlockFailed)
}

/// Whether a stored blob is vault-locked (versus a plain identity export).
pub fn is_locked(blob: &[u8]) -> bool {
    blob.first() == Some(&VAULT_VERSION) && blob.len() >= 1 + SALT_LEN + NONCE_LEN
}

fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}
