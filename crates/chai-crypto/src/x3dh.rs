//! X3DH key agreement.
//!
//! Derives a 32-byte shared secret between an initiator holding the
//! responder's published bundle and a responder holding the matching
//! private halves:
//!
//! - DH1 = DH(IK_A, SPK_B)
//! - DH2 = DH(EK_A, IK_B)
//! - DH3 = DH(EK_A, SPK_B)
//! - DH4 = DH(EK_A, OPK_B) when a one-time prekey is present
//!
//! SK = HKDF(salt = zeroes, ikm = F || DH1 || DH2 || DH3 [|| DH4]) with a
//! 32-byte 0xFF domain-separation prefix.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::keys::{DhKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::primitives;

const X3DH_INFO: &[u8] = b"chai/x3dh/v1";

/// Domain-separation prefix prepended to the concatenated DH outputs.
const DOMAIN_SEP: [u8; 32] = [0xFF; 32];

/// The X3DH output keying the initial ratchet state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// The handshake block an initiator attaches to its first envelopes so the
/// responder can reconstruct X3DH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialHandshake {
    /// Initiator's Ed25519 identity public key.
    pub identity_key: [u8; 32],
    /// Initiator's ephemeral X25519 public key.
    pub ephemeral_key: [u8; 32],
    /// Id of the responder signed prekey the bundle named.
    pub signed_prekey_id: u32,
    /// Id of the consumed one-time prekey, if the bundle carried one.
    pub one_time_prekey_id: Option<u32>,
}

/// Initiator-side output: the shared secret plus the handshake to send.
pub struct InitiatorStart {
    pub shared_secret: SharedSecret,
    pub handshake: InitialHandshake,
}

/// Run X3DH as the initiator against a fetched bundle.
///
/// Verifies the bundle signature first; no DH is computed for a bundle that
/// fails verification.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    our_identity: &Identity,
    bundle: &PreKeyBundle,
) -> Result<InitiatorStart, CryptoError> {
    bundle.verify()?;

    let ephemeral = DhKeyPair::generate(rng);

    let their_identity_dh = Identity::peer_x25519_public(&bundle.identity_key)
        .map_err(|_| CryptoError::InvalidBundle)?;
    let their_signed_prekey = bundle.signed_prekey_public();

    let dh1 = primitives::dh(&our_identity.to_x25519_secret(), &their_signed_prekey);
    let dh2 = ephemeral.diffie_hellman(&their_identity_dh);
    let dh3 = ephemeral.diffie_hellman(&their_signed_prekey);
    let dh4 = bundle
        .one_time_prekey_public()
        .map(|opk| ephemeral.diffie_hellman(&opk));

    let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref());

    let handshake = InitialHandshake {
        identity_key: our_identity.public_key_bytes(),
        ephemeral_key: ephemeral.public_bytes(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey_id,
    };

    Ok(InitiatorStart {
        shared_secret,
        handshake,
    })
}

/// Run X3DH as the responder with the private halves the handshake names.
///
/// The caller (session manager) resolves the signed prekey and consumes the
/// one-time prekey before calling; this function only mirrors the DH
/// computation.
pub fn respond(
    our_identity: &Identity,
    signed_prekey: &SignedPreKey,
    one_time_prekey: Option<&OneTimePreKey>,
    handshake: &InitialHandshake,
) -> Result<SharedSecret, CryptoError> {
    let their_identity_dh = Identity::peer_x25519_public(&handshake.identity_key)
        .map_err(|_| CryptoError::InvalidBundle)?;
    let their_ephemeral = x25519_dalek::PublicKey::from(handshake.ephemeral_key);

    let dh1 = signed_prekey.key_pair.diffie_hellman(&their_identity_dh);
    let dh2 = primitives::dh(&our_identity.to_x25519_secret(), &their_ephemeral);
    let dh3 = signed_prekey.key_pair.diffie_hellman(&their_ephemeral);
    let dh4 = one_time_prekey.map(|opk| opk.key_pair.diffie_hellman(&their_ephemeral));

    Ok(derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref()))
}

fn derive_shared_secret(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> SharedSecret {
    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&DOMAIN_SEP);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let mut secret = [0u8; 32];
    primitives::hkdf(Some(&[0u8; 32]), &ikm, X3DH_INFO, &mut secret);

    ikm.zeroize();
    SharedSecret(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn responder_setup() -> (Identity, SignedPreKey, OneTimePreKey, PreKeyBundle) {
        let identity = Identity::generate(&mut OsRng);
        let spk = SignedPreKey::generate(&mut OsRng, 1, &identity);
        let opk = OneTimePreKey::generate(&mut OsRng, 7);

        let mut bundle = PreKeyBundle::new(&identity, &spk);
        bundle.one_time_prekey = Some(opk.key_pair.public_bytes());
        bundle.one_time_prekey_id = Some(opk.id);

        (identity, spk, opk, bundle)
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let (bob, bob_spk, bob_opk, bundle) = responder_setup();
        let alice = Identity::generate(&mut OsRng);

        let start = initiate(&mut OsRng, &alice, &bundle).unwrap();
        let bob_secret = respond(&bob, &bob_spk, Some(&bob_opk), &start.handshake).unwrap();

        assert_eq!(start.shared_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn agreement_without_one_time_prekey() {
        let bob = Identity::generate(&mut OsRng);
        let bob_spk = SignedPreKey::generate(&mut OsRng, 3, &bob);
        let bundle = PreKeyBundle::new(&bob, &bob_spk);
        let alice = Identity::generate(&mut OsRng);

        let start = initiate(&mut OsRng, &alice, &bundle).unwrap();
        assert!(start.handshake.one_time_prekey_id.is_none());

        let bob_secret = respond(&bob, &bob_spk, None, &start.handshake).unwrap();
        assert_eq!(start.shared_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn tampered_bundle_is_rejected_before_any_dh() {
        let (_, _, _, mut bundle) = responder_setup();
        bundle.signed_prekey[0] ^= 0x01;

        let alice = Identity::generate(&mut OsRng);
        assert!(matches!(
            initiate(&mut OsRng, &alice, &bundle),
            Err(CryptoError::InvalidBundle)
        ));
    }

    #[test]
    fn missing_otp_changes_the_secret() {
        let (bob, bob_spk, _, bundle) = responder_setup();
        let alice = Identity::generate(&mut OsRng);

        let start = initiate(&mut OsRng, &alice, &bundle).unwrap();
        // Responder computing without the OTP leg must not agree.
        let without_otp = respond(&bob, &bob_spk, None, &start.handshake).unwrap();
        assert_ne!(start.shared_secret.as_bytes(), without_otp.as_bytes());
    }
}
