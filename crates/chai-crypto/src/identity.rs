use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::primitives;

/// A device's long-term cryptographic identity.
///
/// The Ed25519 keypair signs prekeys; its X25519 form feeds the identity
/// legs of X3DH. The private half never leaves the device except wrapped by
/// the vault.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            signing_key: SigningKey::generate(rng),
        }
    }

    /// Restore an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public identity as raw bytes (32 bytes); this is the account's
    /// address on the network.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret key bytes, for the vault-wrapped identity blob only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        self.signing_key.sign(message)
    }

    /// Derive the X25519 static secret from this Ed25519 key.
    ///
    /// Uses the SHA-512-expanded scalar (the same scalar Ed25519 uses
    /// internally) so that `to_x25519_public()` agrees with
    /// `peer_x25519_public()` applied to our own public key via the
    /// Edwards→Montgomery map.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// X25519 public key derived from this identity.
    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Convert a peer's Ed25519 public key to its X25519 form.
    ///
    /// The standard Edwards→Montgomery birational map (RFC 7748). This is
    /// the public-key counterpart of `to_x25519_secret`.
    pub fn peer_x25519_public(
        ed25519_public: &[u8; 32],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(ed25519_public)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        let montgomery = verifying_key.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }

    /// Verify a signature against an identity public key.
    pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
        primitives::verify(public_key, message, signature)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}
