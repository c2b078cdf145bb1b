//! Double Ratchet state machine.
//!
//! A symmetric-key ratchet advances on every message; a DH ratchet turns on
//! every reply, giving forward secrecy and post-compromise security. Message
//! keys for out-of-order deliveries are cached in a bounded,
//! insertion-ordered structure so oldest-first eviction is O(1).

use std::collections::{HashMap, VecDeque};

use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519Public;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::keys::DhKeyPair;
use crate::primitives::{self, NONCE_LEN};
use crate::x3dh::SharedSecret;

/// Maximum number of message keys skipped within one receiving chain.
pub const MAX_SKIP: u32 = 1000;

/// Maximum skipped keys cached per session; oldest evicted beyond this.
pub const MAX_SKIP_TOTAL: usize = 5000;

/// Receiving-chain publics remembered for late-arrival detection.
const MAX_PREVIOUS_CHAINS: usize = 32;

const ROOT_INFO: &[u8] = b"chai/ratchet/root";
const NONCE_INFO: &[u8] = b"chai/ratchet/nonce";

type HmacSha256 = Hmac<Sha256>;

/// Root key, advanced on every DH ratchet turn.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct RootKey([u8; 32]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// One root ratchet step: mixes a DH output into the root key and
    /// emits a fresh chain key.
    fn ratchet(&self, dh_output: &[u8; 32]) -> (RootKey, ChainKey) {
        let mut okm = [0u8; 64];
        primitives::hkdf(Some(&self.0), dh_output, ROOT_INFO, &mut okm);

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        root.copy_from_slice(&okm[..32]);
        chain.copy_from_slice(&okm[32..]);
        okm.zeroize();

        (RootKey(root), ChainKey(chain))
    }
}

/// Chain key, advanced on every message in its direction.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Derive the next chain key and this step's message key.
    ///
    /// next = HMAC(ck, 0x02), message = HMAC(ck, 0x01).
    fn advance(&self) -> (ChainKey, MessageKey) {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key size");
        mac.update(&[0x02]);
        let next: [u8; 32] = mac.finalize().into_bytes().into();

        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key size");
        mac.update(&[0x01]);
        let message: [u8; 32] = mac.finalize().into_bytes().into();

        (ChainKey(next), MessageKey(message))
    }
}

/// Key encrypting exactly one message.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Plaintext header authenticated alongside every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    pub dh_public: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub previous_count: u32,
    /// Message number within the current sending chain.
    pub counter: u32,
}

/// Encoded header length: 32-byte public + two big-endian u32s.
pub const HEADER_LEN: usize = 40;

impl RatchetHeader {
    /// Big-endian encoding, also used as AEAD associated data.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..32].copy_from_slice(&self.dh_public);
        out[32..36].copy_from_slice(&self.previous_count.to_be_bytes());
        out[36..40].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != HEADER_LEN {
            return Err(CryptoError::MalformedEnvelope);
        }
        let mut dh_public = [0u8; 32];
        dh_public.copy_from_slice(&bytes[..32]);
        let previous_count = u32::from_be_bytes(
            bytes[32..36]
                .try_into()
                .map_err(|_| CryptoError::MalformedEnvelope)?,
        );
        let counter = u32::from_be_bytes(
            bytes[36..40]
                .try_into()
                .map_err(|_| CryptoError::MalformedEnvelope)?,
        );
        Ok(Self {
            dh_public,
            previous_count,
            counter,
        })
    }
}

type SkippedKeyId = ([u8; 32], u32);

/// Bounded skipped-message-key cache with insertion-order eviction.
///
/// Consumed entries leave a stale id in the order queue; eviction skips
/// those lazily so both insert and take stay O(1).
#[derive(Clone, Default, Serialize, Deserialize)]
struct SkippedKeys {
    keys: HashMap<SkippedKeyId, MessageKey>,
    order: VecDeque<SkippedKeyId>,
    evictions: u64,
}

impl SkippedKeys {
    fn insert(&mut self, id: SkippedKeyId, key: MessageKey) {
        while self.keys.len() >= MAX_SKIP_TOTAL {
            self.evict_oldest();
        }
        self.keys.insert(id, key);
        self.order.push_back(id);
    }

    fn take(&mut self, id: &SkippedKeyId) -> Option<MessageKey> {
        self.keys.remove(id)
    }

    fn evict_oldest(&mut self) {
        while let Some(id) = self.order.pop_front() {
            if self.keys.remove(&id).is_some() {
                self.evictions += 1;
                return;
            }
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}

/// The per-peer ratchet state.
#[derive(Clone, Serialize, Deserialize)]
pub struct DoubleRatchet {
    /// Our current DH ratchet secret.
    dh_secret: [u8; 32],
    /// Peer's current DH ratchet public, once one has been observed.
    dh_remote: Option<[u8; 32]>,
    root_key: RootKey,
    chain_key_send: Option<ChainKey>,
    chain_key_recv: Option<ChainKey>,
    send_counter: u32,
    recv_counter: u32,
    previous_counter: u32,
    skipped: SkippedKeys,
    /// Prior receiving-chain publics; arrivals on these chains whose keys
    /// are gone fail `LateBeyondWindow` instead of corrupting the ratchet.
    previous_chains: VecDeque<[u8; 32]>,
}

impl DoubleRatchet {
    /// Initiator-side initialization after X3DH.
    ///
    /// Performs the first send-side ratchet step against the peer's signed
    /// prekey so the first message can be encrypted immediately.
    pub fn init_sender<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: &SharedSecret,
        remote_dh_public: [u8; 32],
    ) -> Self {
        let dh = DhKeyPair::generate(rng);
        let root = RootKey::from_bytes(*shared_secret.as_bytes());
        let dh_output = dh.diffie_hellman(&X25519Public::from(remote_dh_public));
        let (root, chain_key_send) = root.ratchet(&dh_output);

        Self {
            dh_secret: dh.secret_bytes(),
            dh_remote: Some(remote_dh_public),
            root_key: root,
            chain_key_send: Some(chain_key_send),
            chain_key_recv: None,
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped: SkippedKeys::default(),
            previous_chains: VecDeque::new(),
        }
    }

    /// Responder-side initialization after X3DH.
    ///
    /// `our_dh` is the signed prekey the initiator ratcheted against;
    /// `remote_dh_public` is the initiator's first ratchet public from the
    /// envelope header. The receiving turn happens here so the responder
    /// can both decrypt the first message and send before decrypting.
    pub fn init_receiver<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: &SharedSecret,
        our_dh: &DhKeyPair,
        remote_dh_public: [u8; 32],
    ) -> Self {
        let root = RootKey::from_bytes(*shared_secret.as_bytes());
        let remote = X25519Public::from(remote_dh_public);

        let dh_output = our_dh.diffie_hellman(&remote);
        let (root, chain_key_recv) = root.ratchet(&dh_output);

        let next_dh = DhKeyPair::generate(rng);
        let dh_output = next_dh.diffie_hellman(&remote);
        let (root, chain_key_send) = root.ratchet(&dh_output);

        Self {
            dh_secret: next_dh.secret_bytes(),
            dh_remote: Some(remote_dh_public),
            root_key: root,
            chain_key_send: Some(chain_key_send),
            chain_key_recv: Some(chain_key_recv),
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped: SkippedKeys::default(),
            previous_chains: VecDeque::new(),
        }
    }

    /// Our current ratchet public key, as carried in outgoing headers.
    pub fn our_public(&self) -> [u8; 32] {
        DhKeyPair::from_secret_bytes(self.dh_secret).public_bytes()
    }

    /// Number of skipped keys silently evicted over the session lifetime.
    pub fn skipped_evictions(&self) -> u64 {
        self.skipped.evictions
    }

    /// Skipped keys currently cached.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let chain_key = self
            .chain_key_send
            .as_ref()
            .ok_or_else(|| CryptoError::NoSession("sending chain not established".into()))?;
        let (next_chain, message_key) = chain_key.advance();

        let header = RatchetHeader {
            dh_public: self.our_public(),
            previous_count: self.previous_counter,
            counter: self.send_counter,
        };

        let nonce = derive_nonce(&message_key, self.send_counter);
        let ciphertext = primitives::aead_seal(
            message_key.as_bytes(),
            &nonce,
            &header.to_bytes(),
            plaintext,
        )?;

        self.chain_key_send = Some(next_chain);
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(CryptoError::CounterOverflow)?;

        Ok((header, ciphertext))
    }

    /// Decrypt one message.
    ///
    /// Transactional: on any failure the pre-call state is restored, so a
    /// bad or replayed envelope never poisons the session.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let snapshot = self.clone();
        match self.decrypt_inner(rng, header, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                *self = snapshot;
                Err(e)
            }
        }
    }

    fn decrypt_inner<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        // Out-of-order arrival whose key was cached earlier.
        if let Some(message_key) = self.skipped.take(&(header.dh_public, header.counter)) {
            return open_message(&message_key, header, ciphertext);
        }

        if self.dh_remote != Some(header.dh_public) {
            if self.previous_chains.contains(&header.dh_public) {
                return Err(CryptoError::LateBeyondWindow);
            }
            // Cache the remainder of the current receiving chain, then turn.
            self.skip_message_keys(header.previous_count)?;
            self.dh_ratchet(rng, header.dh_public)?;
        } else if header.counter < self.recv_counter {
            // Slot already consumed: replay.
            return Err(CryptoError::DecryptionFailed);
        }

        self.skip_message_keys(header.counter)?;

        let chain_key = self
            .chain_key_recv
            .as_ref()
            .ok_or(CryptoError::DecryptionFailed)?;
        let (next_chain, message_key) = chain_key.advance();
        self.chain_key_recv = Some(next_chain);
        self.recv_counter = header
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterOverflow)?;

        open_message(&message_key, header, ciphertext)
    }

    /// Advance the receiving chain to `until`, caching each skipped key.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        if self.chain_key_recv.is_none() || until <= self.recv_counter {
            return Ok(());
        }
        if until - self.recv_counter > MAX_SKIP {
            return Err(CryptoError::TooManySkipped);
        }
        let dh_remote = self.dh_remote.ok_or(CryptoError::DecryptionFailed)?;

        while self.recv_counter < until {
            let chain_key = self
                .chain_key_recv
                .as_ref()
                .ok_or(CryptoError::DecryptionFailed)?;
            let (next_chain, message_key) = chain_key.advance();
            self.chain_key_recv = Some(next_chain);
            self.skipped
                .insert((dh_remote, self.recv_counter), message_key);
            self.recv_counter = self
                .recv_counter
                .checked_add(1)
                .ok_or(CryptoError::CounterOverflow)?;
        }
        Ok(())
    }

    /// DH ratchet turn: new receiving chain, fresh keypair, new sending
    /// chain.
    fn dh_ratchet<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        their_new_public: [u8; 32],
    ) -> Result<(), CryptoError> {
        if let Some(old) = self.dh_remote {
            if self.previous_chains.len() == MAX_PREVIOUS_CHAINS {
                self.previous_chains.pop_front();
            }
            self.previous_chains.push_back(old);
        }

        self.previous_counter = self.send_counter;
        self.send_counter = 0;
        self.recv_counter = 0;
        self.dh_remote = Some(their_new_public);

        let their_public = X25519Public::from(their_new_public);

        let current = DhKeyPair::from_secret_bytes(self.dh_secret);
        let dh_output = current.diffie_hellman(&their_public);
        let (root, chain_key_recv) = self.root_key.ratchet(&dh_output);
        self.root_key = root;
        self.chain_key_recv = Some(chain_key_recv);

        let next_dh = DhKeyPair::generate(rng);
        let dh_output = next_dh.diffie_hellman(&their_public);
        let (root, chain_key_send) = self.root_key.ratchet(&dh_output);
        self.root_key = root;
        self.chain_key_send = Some(chain_key_send);
        self.dh_secret = next_dh.secret_bytes();

        Ok(())
    }
}

fn derive_nonce(message_key: &MessageKey, counter: u32) -> [u8; NONCE_LEN] {
    let mut info = [0u8; 22];
    info[..18].copy_from_slice(NONCE_INFO);
    info[18..].copy_from_slice(&counter.to_be_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    primitives::hkdf(None, message_key.as_bytes(), &info, &mut nonce);
    nonce
}

fn open_message(
    message_key: &MessageKey,
    header: &RatchetHeader,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = derive_nonce(message_key, header.counter);
    primitives::aead_open(
        message_key.as_bytes(),
        &nonce,
        &header.to_bytes(),
        ciphertext,
    )
}

impl Zeroize for DoubleRatchet {
    fn zeroize(&mut self) {
        self.dh_secret.zeroize();
        self.root_key.zeroize();
        if let Some(ck) = self.chain_key_send.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.chain_key_recv.as_mut() {
            ck.zeroize();
        }
        self.skipped.clear();
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("skipped", &self.skipped.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DhKeyPair;
    use rand::rngs::OsRng;

    fn pair() -> (DoubleRatchet, DoubleRatchet) {
        let shared = SharedSecret([0x42; 32]);
        let bob_spk = DhKeyPair::generate(&mut OsRng);

        let alice = DoubleRatchet::init_sender(&mut OsRng, &shared, bob_spk.public_bytes());
        let bob = DoubleRatchet::init_receiver(&mut OsRng, &shared, &bob_spk, alice.our_public());
        (alice, bob)
    }

    #[test]
    fn roundtrip_both_directions() {
        let (mut alice, mut bob) = pair();

        let (h, ct) = alice.encrypt(b"hello bob").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &h, &ct).unwrap(), b"hello bob");

        let (h, ct) = bob.encrypt(b"hello alice").unwrap();
        assert_eq!(alice.decrypt(&mut OsRng, &h, &ct).unwrap(), b"hello alice");
    }

    #[test]
    fn dh_turn_changes_header_key_and_resets_counters() {
        let (mut alice, mut bob) = pair();

        let mut first_public = None;
        for i in 0..3u32 {
            let (h, ct) = alice.encrypt(format!("m{i}").as_bytes()).unwrap();
            first_public.get_or_insert(h.dh_public);
            assert_eq!(h.counter, i);
            bob.decrypt(&mut OsRng, &h, &ct).unwrap();
        }

        let (h, ct) = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&mut OsRng, &h, &ct).unwrap();

        let (h, _) = alice.encrypt(b"after turn").unwrap();
        assert_ne!(Some(h.dh_public), first_public);
        assert_eq!(h.previous_count, 3);
        assert_eq!(h.counter, 0);
    }

    #[test]
    fn out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();

        let m1 = alice.encrypt(b"a").unwrap();
        let m2 = alice.encrypt(b"b").unwrap();
        let m3 = alice.encrypt(b"c").unwrap();

        assert_eq!(bob.decrypt(&mut OsRng, &m1.0, &m1.1).unwrap(), b"a");
        assert_eq!(bob.decrypt(&mut OsRng, &m3.0, &m3.1).unwrap(), b"c");
        assert_eq!(bob.skipped_len(), 1);
        assert_eq!(bob.decrypt(&mut OsRng, &m2.0, &m2.1).unwrap(), b"b");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn out_of_order_across_turn() {
        let (mut alice, mut bob) = pair();

        let early = alice.encrypt(b"early").unwrap();
        let m2 = alice.encrypt(b"second").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &m2.0, &m2.1).unwrap(), b"second");

        // A full turn in each direction, then the stale message arrives.
        let r = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&mut OsRng, &r.0, &r.1).unwrap();
        let m3 = alice.encrypt(b"third").unwrap();
        assert_eq!(bob.decrypt(&mut OsRng, &m3.0, &m3.1).unwrap(), b"third");

        assert_eq!(bob.decrypt(&mut OsRng, &early.0, &early.1).unwrap(), b"early");
    }

    #[test]
    fn replay_fails_and_leaves_state_usable() {
        let (mut alice, mut bob) = pair();

        let m1 = alice.encrypt(b"first").unwrap();
        let m2 = alice.encrypt(b"second").unwrap();

        assert_eq!(bob.decrypt(&mut OsRng, &m1.0, &m1.1).unwrap(), b"first");
        assert!(matches!(
            bob.decrypt(&mut OsRng, &m1.0, &m1.1),
            Err(CryptoError::DecryptionFailed)
        ));
        assert_eq!(bob.decrypt(&mut OsRng, &m2.0, &m2.1).unwrap(), b"second");
    }

    #[test]
    fn tampered_ciphertext_rolls_back() {
        let (mut alice, mut bob) = pair();

        let (h, mut ct) = alice.encrypt(b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert!(bob.decrypt(&mut OsRng, &h, &ct).is_err());

        // The chain did not advance; the intact envelope still decrypts.
        ct[0] ^= 0xFF;
        assert_eq!(bob.decrypt(&mut OsRng, &h, &ct).unwrap(), b"payload");
    }

    #[test]
    fn too_many_skipped_rejected() {
        let (mut alice, mut bob) = pair();

        for _ in 0..=MAX_SKIP {
            alice.encrypt(b"skipped").unwrap();
        }
        let (h, ct) = alice.encrypt(b"far ahead").unwrap();
        assert!(matches!(
            bob.decrypt(&mut OsRng, &h, &ct),
            Err(CryptoError::TooManySkipped)
        ));
    }

    #[test]
    fn late_arrival_on_expired_chain() {
        let (mut alice, mut bob) = pair();

        let stale = alice.encrypt(b"never delivered in time").unwrap();
        let m = alice.encrypt(b"delivered").unwrap();
        bob.decrypt(&mut OsRng, &m.0, &m.1).unwrap();

        // Turn the ratchet so alice's old chain is retired, then evict the
        // cached key by replacing the skipped entry set wholesale.
        let r = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&mut OsRng, &r.0, &r.1).unwrap();
        let m2 = alice.encrypt(b"new chain").unwrap();
        bob.decrypt(&mut OsRng, &m2.0, &m2.1).unwrap();

        bob.skipped.clear();
        assert!(matches!(
            bob.decrypt(&mut OsRng, &stale.0, &stale.1),
            Err(CryptoError::LateBeyondWindow)
        ));
    }

    #[test]
    fn header_encoding_is_big_endian_and_fixed_width() {
        let header = RatchetHeader {
            dh_public: [0xAB; 32],
            previous_count: 0x01020304,
            counter: 0x0A0B0C0D,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[32..36], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[36..40], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(RatchetHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn skipped_cache_evicts_oldest_beyond_total_cap() {
        let mut cache = SkippedKeys::default();
        for i in 0..(MAX_SKIP_TOTAL as u32 + 10) {
            cache.insert(([0u8; 32], i), MessageKey([0u8; 32]));
        }
        assert_eq!(cache.len(), MAX_SKIP_TOTAL);
        assert_eq!(cache.evictions, 10);
        // The oldest ten are gone, the newest survive.
        assert!(cache.take(&([0u8; 32], 5)).is_none());
        assert!(cache.take(&([0u8; 32], MAX_SKIP_TOTAL as u32 + 9)).is_some());
    }
}
