//! Medium-term and ephemeral key material: DH keypairs, signed prekeys,
//! one-time prekeys, and the public prekey bundle.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::primitives::SIGNATURE_LEN;

/// An X25519 keypair used for the DH legs of X3DH and the ratchet.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhKeyPair {
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519Public,
}

impl DhKeyPair {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> X25519Public {
        self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn diffie_hellman(&self, their_public: &X25519Public) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish()
    }
}

/// A medium-term prekey, signed by the identity key and rotated on policy.
#[derive(Debug, Clone)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Generate and sign a new prekey. The signature covers the X25519
    /// public bytes under the identity signing key.
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32, identity: &Identity) -> Self {
        let key_pair = DhKeyPair::generate(rng);
        let signature = identity.sign(key_pair.public().as_bytes()).to_bytes().to_vec();
        Self {
            id,
            key_pair,
            signature,
        }
    }

    pub fn public(&self) -> X25519Public {
        self.key_pair.public()
    }
}

/// An ephemeral prekey consumed exactly once on first use by a sender.
#[derive(Debug, Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    pub key_pair: DhKeyPair,
}

impl OneTimePreKey {
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32) -> Self {
        Self {
            id,
            key_pair: DhKeyPair::generate(rng),
        }
    }

    pub fn public(&self) -> X25519Public {
        self.key_pair.public()
    }
}

/// The public packet a directory hands to an initiator for X3DH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    pub identity_key: [u8; 32],
    /// X25519 signed prekey public.
    pub signed_prekey: [u8; 32],
    /// Signature over `signed_prekey` under `identity_key`.
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_id: u32,
    /// Optional one-time prekey, already marked consumed at the directory.
    pub one_time_prekey: Option<[u8; 32]>,
    pub one_time_prekey_id: Option<u32>,
}

impl PreKeyBundle {
    /// Assemble the publishable bundle for a local signed prekey.
    pub fn new(identity: &Identity, signed_prekey: &SignedPreKey) -> Self {
        Self {
            identity_key: identity.public_key_bytes(),
            signed_prekey: signed_prekey.key_pair.public_bytes(),
            signed_prekey_signature: signed_prekey.signature.clone(),
            signed_prekey_id: signed_prekey.id,
            one_time_prekey: None,
            one_time_prekey_id: None,
        }
    }

    /// Verify the bundle before any DH is computed.
    ///
    /// Rejects dev-mode mock material (the all-zero point can never be a
    /// contributory key) and enforces the signature invariant
    /// `Verify(identity_pub, signed_prekey_pub, signed_prekey_sig)`.
    pub fn verify(&self) -> Result<(), CryptoError> {
        if self.identity_key == [0u8; 32]
            || self.signed_prekey == [0u8; 32]
            || self.one_time_prekey == Some([0u8; 32])
        {
            return Err(CryptoError::InvalidBundle);
        }
        if self.signed_prekey_signature.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidBundle);
        }
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&self.identity_key)
            .map_err(|_| CryptoError::InvalidBundle)?;
        if !Identity::verify(
            &verifying_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        ) {
            return Err(CryptoError::InvalidBundle);
        }
        Ok(())
    }

    pub fn signed_prekey_public(&self) -> X25519Public {
        X25519Public::from(self.signed_prekey)
    }

    pub fn one_time_prekey_public(&self) -> Option<X25519Public> {
        self.one_time_prekey.map(X25519Public::from)
    }
}
