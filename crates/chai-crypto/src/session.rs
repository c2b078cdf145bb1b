//! Per-peer sessions and the session manager.
//!
//! The manager owns the device identity, the local prekey pools, and one
//! session per peer. All session mutation flows through it, which is what
//! serializes access per peer.

use std::collections::HashMap;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::keys::{DhKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::ratchet::DoubleRatchet;
use crate::x3dh::{self, InitialHandshake};

/// Version tag prefixed to exported session blobs.
const SESSION_EXPORT_VERSION: u8 = 0x01;

/// Version tag prefixed to exported identity blobs. 0x01 belongs to the
/// vault format so `vault::is_locked` can tell the two apart.
const IDENTITY_EXPORT_VERSION: u8 = 0x02;

/// Signed prekey generations kept alive for in-flight initial envelopes.
const SIGNED_PREKEY_GENERATIONS: usize = 3;

/// An established session with one peer.
#[derive(Serialize, Deserialize)]
pub struct Session {
    ratchet: DoubleRatchet,
    /// Peer identity bound at X3DH time.
    peer_identity: [u8; 32],
    /// Handshake block attached to outgoing envelopes until the first
    /// successful inbound decrypt proves the peer holds the session.
    pending_handshake: Option<InitialHandshake>,
    is_initiator: bool,
    received_any: bool,
}

impl Session {
    /// Encrypt one message, producing envelope bytes.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (header, ciphertext) = self.ratchet.encrypt(plaintext)?;
        let envelope = Envelope {
            handshake: self.pending_handshake.clone(),
            header,
            ciphertext,
        };
        Ok(envelope.to_bytes())
    }

    fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = self.ratchet.decrypt(rng, &envelope.header, &envelope.ciphertext)?;
        self.received_any = true;
        self.pending_handshake = None;
        Ok(plaintext)
    }

    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    /// Skipped-key evictions since session creation, for observability.
    pub fn skipped_evictions(&self) -> u64 {
        self.ratchet.skipped_evictions()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredSignedPreKey {
    id: u32,
    secret: [u8; 32],
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredOneTimePreKey {
    id: u32,
    secret: [u8; 32],
}

/// Serialized form of the identity blob (identity secret plus the private
/// prekey pools that published bundles reference).
#[derive(Serialize, Deserialize)]
struct IdentityState {
    identity_secret: [u8; 32],
    next_signed_prekey_id: u32,
    signed_prekeys: Vec<StoredSignedPreKey>,
    next_one_time_prekey_id: u32,
    one_time_prekeys: Vec<StoredOneTimePreKey>,
}

/// Owns `peer id -> Session` plus the local key material.
pub struct SessionManager {
    identity: Identity,
    /// Newest generation first; older generations linger for a grace
    /// window so in-flight initial envelopes still resolve.
    signed_prekeys: Vec<SignedPreKey>,
    next_signed_prekey_id: u32,
    one_time_prekeys: Vec<OneTimePreKey>,
    next_one_time_prekey_id: u32,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    /// Create a manager with a fresh identity and first signed prekey.
    pub fn new<R: CryptoRngCore>(rng: &mut R) -> Self {
        let identity = Identity::generate(rng);
        let signed_prekey = SignedPreKey::generate(rng, 1, &identity);
        Self {
            identity,
            signed_prekeys: vec![signed_prekey],
            next_signed_prekey_id: 2,
            one_time_prekeys: Vec::new(),
            next_one_time_prekey_id: 1,
            sessions: HashMap::new(),
        }
    }

    /// Restore a manager from an exported identity blob.
    pub fn from_identity_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let Some((&version, body)) = data.split_first() else {
            return Err(CryptoError::Serialization("empty identity blob".into()));
        };
        if version != IDENTITY_EXPORT_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported identity blob version {version}"
            )));
        }
        let state: IdentityState = bincode::deserialize(body)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;

        let identity = Identity::from_secret_bytes(&state.identity_secret);
        let signed_prekeys = state
            .signed_prekeys
            .into_iter()
            .map(|s| SignedPreKey {
                id: s.id,
                key_pair: DhKeyPair::from_secret_bytes(s.secret),
                signature: s.signature,
            })
            .collect();
        let one_time_prekeys = state
            .one_time_prekeys
            .into_iter()
            .map(|o| OneTimePreKey {
                id: o.id,
                key_pair: DhKeyPair::from_secret_bytes(o.secret),
            })
            .collect();

        Ok(Self {
            identity,
            signed_prekeys,
            next_signed_prekey_id: state.next_signed_prekey_id,
            one_time_prekeys,
            next_one_time_prekey_id: state.next_one_time_prekey_id,
            sessions: HashMap::new(),
        })
    }

    /// Export the identity blob. Never leaves the device except wrapped by
    /// the vault.
    pub fn export_identity(&self) -> Result<Vec<u8>, CryptoError> {
        let state = IdentityState {
            identity_secret: *self.identity.secret_key_bytes(),
            next_signed_prekey_id: self.next_signed_prekey_id,
            signed_prekeys: self
                .signed_prekeys
                .iter()
                .map(|s| StoredSignedPreKey {
                    id: s.id,
                    secret: s.key_pair.secret_bytes(),
                    signature: s.signature.clone(),
                })
                .collect(),
            next_one_time_prekey_id: self.next_one_time_prekey_id,
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .map(|o| StoredOneTimePreKey {
                    id: o.id,
                    secret: o.key_pair.secret_bytes(),
                })
                .collect(),
        };
        let mut out = vec![IDENTITY_EXPORT_VERSION];
        out.extend(
            bincode::serialize(&state).map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );
        Ok(out)
    }

    /// Public identity key bytes.
    pub fn public_identity(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    /// The publishable bundle for the current signed prekey (no OTP; the
    /// directory pairs those per fetch).
    pub fn generate_prekey_bundle(&self) -> PreKeyBundle {
        PreKeyBundle::new(&self.identity, &self.signed_prekeys[0])
    }

    /// Generate `count` one-time prekeys, retaining the private halves and
    /// returning `(id, public)` pairs for upload.
    pub fn generate_one_time_prekeys<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        count: u32,
    ) -> Vec<(u32, [u8; 32])> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let prekey = OneTimePreKey::generate(rng, self.next_one_time_prekey_id);
            out.push((prekey.id, prekey.key_pair.public_bytes()));
            self.one_time_prekeys.push(prekey);
            self.next_one_time_prekey_id += 1;
        }
        out
    }

    /// Unused one-time prekeys still held locally.
    pub fn remaining_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Rotate the signed prekey, retiring the oldest generation beyond the
    /// grace window. Returns the new id.
    pub fn rotate_signed_prekey<R: CryptoRngCore>(&mut self, rng: &mut R) -> u32 {
        let id = self.next_signed_prekey_id;
        self.next_signed_prekey_id += 1;
        self.signed_prekeys
            .insert(0, SignedPreKey::generate(rng, id, &self.identity));
        self.signed_prekeys.truncate(SIGNED_PREKEY_GENERATIONS);
        id
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn session_peers(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Tear down a session (logout or explicit reset).
    pub fn remove_session(&mut self, peer_id: &str) {
        self.sessions.remove(peer_id);
    }

    /// Run X3DH against a fetched bundle and create the session.
    ///
    /// Returns the initial envelope (a session-establishment message with
    /// an empty payload) that must reach the peer first. Every envelope the
    /// session produces keeps carrying the handshake block until the peer's
    /// first reply, so losing this one does not strand the session.
    pub fn init_session<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        peer_id: &str,
        bundle: &PreKeyBundle,
    ) -> Result<Vec<u8>, CryptoError> {
        let start = x3dh::initiate(rng, &self.identity, bundle)?;
        let ratchet = DoubleRatchet::init_sender(rng, &start.shared_secret, bundle.signed_prekey);

        let mut session = Session {
            ratchet,
            peer_identity: bundle.identity_key,
            pending_handshake: Some(start.handshake),
            is_initiator: true,
            received_any: false,
        };
        let initial_envelope = session.encrypt(&[])?;
        self.sessions.insert(peer_id.to_string(), session);
        Ok(initial_envelope)
    }

    /// Run X3DH as the responder for an initial envelope, creating the
    /// session without decrypting the payload (that goes through
    /// [`Self::decrypt`]).
    pub fn receive_session<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        peer_id: &str,
        envelope_bytes: &[u8],
    ) -> Result<(), CryptoError> {
        let envelope = Envelope::from_bytes(envelope_bytes)?;
        let (session, consumed_otp) = self.responder_session(rng, &envelope)?;
        if let Some(id) = consumed_otp {
            self.consume_one_time_prekey(id);
        }
        self.sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    /// Encrypt for a peer. Fails `NoSession` when no session exists.
    pub fn encrypt(&mut self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;
        session.encrypt(plaintext)
    }

    /// Decrypt an envelope from a peer.
    ///
    /// Initial envelopes create the session on demand. When both sides
    /// initiated simultaneously, the deterministic rule is that the party
    /// with the higher identity public key initiates: a fresh
    /// initiator-side session yields to an inbound handshake from a
    /// higher-keyed peer and is re-keyed as responder.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        peer_id: &str,
        envelope_bytes: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let envelope = Envelope::from_bytes(envelope_bytes)?;

        if !self.sessions.contains_key(peer_id) {
            if envelope.handshake.is_none() {
                return Err(CryptoError::NoSession(peer_id.to_string()));
            }
            let (mut session, consumed_otp) = self.responder_session(rng, &envelope)?;
            let plaintext = session.decrypt(rng, &envelope)?;
            if let Some(id) = consumed_otp {
                self.consume_one_time_prekey(id);
            }
            self.sessions.insert(peer_id.to_string(), session);
            return Ok(plaintext);
        }

        if self.should_yield_initiation(peer_id, &envelope) {
            // Candidate-commit: the existing session survives unless the
            // responder view actually decrypts.
            if let Ok((mut candidate, consumed_otp)) = self.responder_session(rng, &envelope) {
                if let Ok(plaintext) = candidate.decrypt(rng, &envelope) {
                    if let Some(id) = consumed_otp {
                        self.consume_one_time_prekey(id);
                    }
                    self.sessions.insert(peer_id.to_string(), candidate);
                    return Ok(plaintext);
                }
            }
        }

        let session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;
        session.decrypt(rng, &envelope)
    }

    /// Export one session as a versioned opaque blob.
    pub fn export_session(&self, peer_id: &str) -> Result<Vec<u8>, CryptoError> {
        let session = self
            .sessions
            .get(peer_id)
            .ok_or_else(|| CryptoError::NoSession(peer_id.to_string()))?;
        let mut out = vec![SESSION_EXPORT_VERSION];
        out.extend(
            bincode::serialize(session).map_err(|e| CryptoError::Serialization(e.to_string()))?,
        );
        Ok(out)
    }

    /// Import a previously exported session blob for a peer.
    pub fn import_session(&mut self, peer_id: &str, data: &[u8]) -> Result<(), CryptoError> {
        let Some((&version, body)) = data.split_first() else {
            return Err(CryptoError::Serialization("empty session blob".into()));
        };
        if version != SESSION_EXPORT_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported session blob version {version}"
            )));
        }
        let session: Session = bincode::deserialize(body)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        self.sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    /// Observability hook for the session's silent skipped-key evictions.
    pub fn skipped_evictions(&self, peer_id: &str) -> Option<u64> {
        self.sessions.get(peer_id).map(Session::skipped_evictions)
    }

    fn should_yield_initiation(&self, peer_id: &str, envelope: &Envelope) -> bool {
        let Some(session) = self.sessions.get(peer_id) else {
            return false;
        };
        let Some(handshake) = &envelope.handshake else {
            return false;
        };
        session.is_initiator
            && !session.received_any
            && handshake.identity_key > self.identity.public_key_bytes()
    }

    /// Build a responder-side session for an initial envelope. The one-time
    /// prekey, if named, is only removed once the caller commits.
    fn responder_session<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        envelope: &Envelope,
    ) -> Result<(Session, Option<u32>), CryptoError> {
        let handshake = envelope
            .handshake
            .as_ref()
            .ok_or(CryptoError::MalformedEnvelope)?;

        let signed_prekey = self
            .signed_prekeys
            .iter()
            .find(|s| s.id == handshake.signed_prekey_id)
            .ok_or(CryptoError::UnknownSignedPrekey(handshake.signed_prekey_id))?;

        let one_time_prekey = match handshake.one_time_prekey_id {
            Some(id) => Some(
                self.one_time_prekeys
                    .iter()
                    .find(|o| o.id == id)
                    .ok_or(CryptoError::OneTimePrekeyConsumed(id))?,
            ),
            None => None,
        };

        let shared_secret = x3dh::respond(
            &self.identity,
            signed_prekey,
            one_time_prekey,
            handshake,
        )?;
        let ratchet = DoubleRatchet::init_receiver(
            rng,
            &shared_secret,
            &signed_prekey.key_pair,
            envelope.header.dh_public,
        );

        Ok((
            Session {
                ratchet,
                peer_identity: handshake.identity_key,
                pending_handshake: None,
                is_initiator: false,
                received_any: false,
            },
            handshake.one_time_prekey_id,
        ))
    }

    fn consume_one_time_prekey(&mut self, id: u32) {
        self.one_time_prekeys.retain(|o| o.id != id);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &hex::encode(self.public_identity()))
            .field("sessions", &self.sessions.len())
            .field("one_time_prekeys", &self.one_time_prekeys.len())
            .finish()
    }
}
