//! The narrow primitive surface everything else builds on.
//!
//! Curve25519 signing and Diffie-Hellman, HKDF-SHA256, AES-256-GCM and the
//! OS CSPRNG. All operations on secret inputs run in time independent of the
//! secret bits (guaranteed by the underlying RustCrypto/dalek crates).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;

/// Length of every key handled by the core (Curve25519 points, AEAD keys).
pub const KEY_LEN: usize = 32;
/// AES-256-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-256-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Sign a message with an Ed25519 signing key.
pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    signing_key.sign(message).to_bytes()
}

/// Verify an Ed25519 signature.
///
/// Returns a bare boolean; callers never learn why verification failed.
pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    public_key.verify(message, &signature).is_ok()
}

/// X25519 Diffie-Hellman.
pub fn dh(secret: &StaticSecret, public: &X25519Public) -> [u8; KEY_LEN] {
    secret.diffie_hellman(public).to_bytes()
}

/// HKDF-SHA256 extract-and-expand into a caller-provided buffer.
///
/// Panics only if `out` exceeds the HKDF output limit (255 * 32 bytes),
/// which no caller in this crate does.
pub fn hkdf(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out).expect("HKDF output length in range");
}

/// AES-256-GCM seal: returns ciphertext || tag.
pub fn aead_seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("AEAD key must be 32 bytes".into()))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// AES-256-GCM open. Fails with `DecryptionFailed` on any tag mismatch.
pub fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("AEAD key must be 32 bytes".into()))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Fill a buffer from the injected CSPRNG.
pub fn rand_bytes<R: CryptoRngCore>(rng: &mut R, out: &mut [u8]) {
    rng.fill_bytes(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_verify_roundtrip() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign(&key, b"frame");
        assert!(verify(&key.verifying_key(), b"frame", &sig));
        assert!(!verify(&key.verifying_key(), b"other", &sig));
    }

    #[test]
    fn verify_rejects_bad_signature_length() {
        let key = SigningKey::generate(&mut OsRng);
        assert!(!verify(&key.verifying_key(), b"frame", &[0u8; 63]));
    }

    #[test]
    fn dh_is_symmetric() {
        let a = StaticSecret::random_from_rng(OsRng);
        let b = StaticSecret::random_from_rng(OsRng);
        let a_pub = X25519Public::from(&a);
        let b_pub = X25519Public::from(&b);
        assert_eq!(dh(&a, &b_pub), dh(&b, &a_pub));
    }

    #[test]
    fn aead_roundtrip_and_tamper() {
        let key = [7u8; KEY_LEN];
        let nonce = [3u8; NONCE_LEN];
        let sealed = aead_seal(&key, &nonce, b"aad", b"secret").unwrap();
        assert_eq!(
            aead_open(&key, &nonce, b"aad", &sealed).unwrap(),
            b"secret"
        );

        let mut tampered = sealed.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            aead_open(&key, &nonce, b"aad", &tampered),
            Err(CryptoError::DecryptionFailed)
        ));
        assert!(matches!(
            aead_open(&key, &nonce, b"wrong", &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn hkdf_is_deterministic() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf(Some(&[1u8; 32]), &[2u8; 32], b"info", &mut a);
        hkdf(Some(&[1u8; 32]), &[2u8; 32], b"info", &mut b);
        assert_eq!(a, b);
    }
}
