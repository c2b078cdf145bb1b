//! The client: connection state machine, session restore, message flow,
//! and prekey upkeep.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chai_crypto::{vault, CryptoError, PreKeyBundle, SessionManager};
use chai_protocol::{
    ClientFrame, ErrorCode, MessageId, MessageType, OneTimePrekeyUpload, PrekeyBundleData,
    ServerFrame, UserId,
};
use rand::rngs::OsRng;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::storage::ClientStore;

/// Reconnect backoff schedule in seconds; the last entry repeats.
pub const BACKOFF_SCHEDULE_SECS: [u64; 5] = [1, 2, 5, 10, 30];

/// Keepalive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Two missed pongs close the connection.
const PONG_TIMEOUT: Duration = Duration::from_secs(75);

/// Replenish when the local unused pool falls below this.
const LOW_WATERMARK: usize = 10;

const ROTATED_AT_KEY: &str = "spk_rotated_at";
const PUBLISHED_KEY: &str = "prekeys_published";

/// Delay before the given reconnect attempt (0-based).
pub fn backoff_delay(attempt: usize) -> Duration {
    let secs = BACKOFF_SCHEDULE_SECS[attempt.min(BACKOFF_SCHEDULE_SECS.len() - 1)];
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Application-visible events produced by the client.
#[derive(Debug)]
pub enum ClientEvent {
    Disconnected,
    ConnectionReplaced,
    MessageReceived {
        message_id: MessageId,
        sender_id: UserId,
        plaintext: Vec<u8>,
        created_at: i64,
    },
    /// Delivered but not decryptable; shown as a placeholder, never
    /// silently dropped.
    Undecryptable {
        message_id: MessageId,
        sender_id: UserId,
    },
    MessageSent { message_id: MessageId },
    PrekeysReplenished { uploaded: u32 },
    RelayError { code: ErrorCode, message: String },
}

/// Injected wall clock for rotation policy, so tests are reproducible.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

pub struct ChatClient {
    config: Config,
    store: ClientStore,
    manager: SessionManager,
    vault_password: Option<String>,
    clock: Arc<dyn Clock>,
    connection: Option<Connection>,
    state: ConnectionState,
    user_id: Option<UserId>,
    /// Frames received while waiting for a solicited response.
    pending: VecDeque<ServerFrame>,
    last_ping_at: Option<Instant>,
    last_activity_at: Instant,
}

impl ChatClient {
    /// Open (or create) the client with its persistent store. When a vault
    /// password is given the identity blob is kept locked at rest.
    pub fn open(config: Config, vault_password: Option<&str>) -> Result<Self> {
        let store = ClientStore::open(&config.storage_path)?;
        Self::with_store(config, store, vault_password, Arc::new(SystemClock))
    }

    /// Construct over an explicit store and clock. Test seam.
    pub fn with_store(
        config: Config,
        store: ClientStore,
        vault_password: Option<&str>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let manager = match store.load_identity()? {
            Some(blob) => {
                let raw = if vault::is_locked(&blob) {
                    let password = vault_password
                        .ok_or(ClientError::Crypto(CryptoError::VaultUnlockFailed))?;
                    vault::unlock(&blob, password)?
                } else {
                    blob
                };
                SessionManager::from_identity_bytes(&raw)?
            }
            None => SessionManager::new(&mut OsRng),
        };

        let mut client = Self {
            config,
            store,
            manager,
            vault_password: vault_password.map(str::to_owned),
            clock,
            connection: None,
            state: ConnectionState::Disconnected,
            user_id: None,
            pending: VecDeque::new(),
            last_ping_at: None,
            last_activity_at: Instant::now(),
        };
        client.persist_identity()?;
        Ok(client)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn public_identity(&self) -> [u8; 32] {
        self.manager.public_identity()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// One attach attempt: connect, restore sessions, top up prekeys.
    pub async fn connect(&mut self) -> Result<UserId> {
        self.state = ConnectionState::Connecting;
        let connection =
            match Connection::attach(&self.config.relay_addr, &self.config.session_token).await {
                Ok(c) => c,
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e);
                }
            };
        let user_id = connection.user_id();
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        self.user_id = Some(user_id);
        self.last_ping_at = None;
        self.last_activity_at = Instant::now();

        self.restore_sessions();
        self.maintain_prekeys().await?;

        tracing::info!(user = %user_id, "attached to relay");
        Ok(user_id)
    }

    /// Reconnect until an attach succeeds, on the `{1, 2, 5, 10, 30}` s
    /// schedule (steady at 30 s).
    pub async fn connect_with_backoff(&mut self) -> UserId {
        let mut attempt = 0usize;
        loop {
            match self.connect().await {
                Ok(user_id) => return user_id,
                Err(e) => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "attach failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.connection = None;
        self.state = ConnectionState::Disconnected;
        self.pending.clear();
    }

    /// Encrypt and send to a peer, establishing the session first when
    /// needed. Fails immediately while disconnected; nothing is queued.
    pub async fn send_message(&mut self, peer: UserId, plaintext: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let peer_key = peer.to_string();

        if !self.manager.has_session(&peer_key) {
            let bundle = self.fetch_bundle(peer).await?;
            let initial = self.manager.init_session(&mut OsRng, &peer_key, &bundle)?;
            self.send_frame(ClientFrame::SendMessage {
                recipient_id: peer,
                ciphertext: initial,
                message_type: MessageType::Control,
            })
            .await?;
        }

        let envelope = self.manager.encrypt(&peer_key, plaintext)?;
        self.send_frame(ClientFrame::SendMessage {
            recipient_id: peer,
            ciphertext: envelope,
            message_type: MessageType::Normal,
        })
        .await?;
        self.persist_session(&peer_key)?;
        Ok(())
    }

    /// Next application-visible event. Internal frames (pongs, unsolicited
    /// bundles) are absorbed. Returns `Disconnected` once when the
    /// connection drops.
    pub async fn next_event(&mut self) -> Result<ClientEvent> {
        loop {
            let frame = match self.pending.pop_front() {
                Some(frame) => Some(frame),
                None => {
                    let connection =
                        self.connection.as_mut().ok_or(ClientError::NotConnected)?;
                    connection.recv().await
                }
            };
            let Some(frame) = frame else {
                self.disconnect();
                return Ok(ClientEvent::Disconnected);
            };
            self.last_activity_at = Instant::now();
            if let Some(event) = self.process_frame(frame).await? {
                return Ok(event);
            }
        }
    }

    /// Keepalive step: ping on the 30 s cadence, drop the connection after
    /// two silent rounds. Call periodically from the app loop.
    pub async fn heartbeat(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        if self.last_activity_at.elapsed() > PONG_TIMEOUT {
            tracing::warn!("relay silent past pong timeout, disconnecting");
            self.disconnect();
            return Err(ClientError::NotConnected);
        }
        let due = self
            .last_ping_at
            .map_or(true, |t| t.elapsed() >= PING_INTERVAL);
        if due {
            self.send_frame(ClientFrame::Ping).await?;
            self.last_ping_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn process_frame(&mut self, frame: ServerFrame) -> Result<Option<ClientEvent>> {
        match frame {
            ServerFrame::Message {
                id,
                sender_id,
                ciphertext,
                message_type,
                created_at,
            } => {
                let peer_key = sender_id.to_string();
                let decrypted = self.manager.decrypt(&mut OsRng, &peer_key, &ciphertext);

                // Delivery happened either way; the placeholder path keeps
                // the envelope id visible to the UI.
                self.send_frame(ClientFrame::AckMessages {
                    message_ids: vec![id],
                })
                .await?;

                match decrypted {
                    Ok(plaintext) => {
                        self.persist_session(&peer_key)?;
                        self.persist_identity()?;
                        if message_type == MessageType::Control && plaintext.is_empty() {
                            // Session establishment, not an app message.
                            return Ok(None);
                        }
                        Ok(Some(ClientEvent::MessageReceived {
                            message_id: id,
                            sender_id,
                            plaintext,
                            created_at,
                        }))
                    }
                    Err(e) => {
                        tracing::warn!(
                            sender = %sender_id,
                            message = %id,
                            error = %e,
                            "failed to decrypt message"
                        );
                        Ok(Some(ClientEvent::Undecryptable {
                            message_id: id,
                            sender_id,
                        }))
                    }
                }
            }

            ServerFrame::MessageSent { message_id } => {
                Ok(Some(ClientEvent::MessageSent { message_id }))
            }

            ServerFrame::LowPrekeys { remaining } => {
                tracing::info!(remaining, "relay reports low prekeys, replenishing");
                let uploaded = self.replenish_prekeys().await?;
                Ok(Some(ClientEvent::PrekeysReplenished { uploaded }))
            }

            ServerFrame::Pong => Ok(None),

            ServerFrame::PrekeyBundle { user_id, .. } => {
                tracing::debug!(user = %user_id, "unsolicited prekey bundle ignored");
                Ok(None)
            }

            ServerFrame::Error { code, message } => match code {
                ErrorCode::Replaced => {
                    self.disconnect();
                    Ok(Some(ClientEvent::ConnectionReplaced))
                }
                ErrorCode::Backpressure => {
                    tracing::warn!("relay applied backpressure, reconnect required");
                    self.disconnect();
                    Ok(Some(ClientEvent::Disconnected))
                }
                code => Ok(Some(ClientEvent::RelayError { code, message })),
            },
        }
    }

    /// Request a peer's bundle, buffering unrelated frames for
    /// [`Self::next_event`].
    async fn fetch_bundle(&mut self, peer: UserId) -> Result<PreKeyBundle> {
        self.send_frame(ClientFrame::GetPrekeyBundle { user_id: peer })
            .await?;

        let mut buffered = Vec::new();
        let outcome = {
            let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
            loop {
                match connection.recv().await {
                    Some(ServerFrame::PrekeyBundle { user_id, bundle }) if user_id == peer => {
                        break match bundle {
                            Some(data) => bundle_from_wire(&data),
                            None => Err(ClientError::BundleUnavailable(peer)),
                        };
                    }
                    Some(other) => buffered.push(other),
                    None => break Err(ClientError::NotConnected),
                }
            }
        };
        self.pending.extend(buffered);
        if matches!(outcome, Err(ClientError::NotConnected)) {
            self.disconnect();
        }
        outcome
    }

    /// Best-effort session restore; failures degrade to per-peer warnings.
    fn restore_sessions(&mut self) {
        let peers = match self.store.session_peers() {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate persisted sessions");
                return;
            }
        };
        for peer in peers {
            if self.manager.has_session(&peer) {
                continue;
            }
            let restored = self
                .store
                .load_session(&peer)
                .and_then(|blob| match blob {
                    Some(blob) => self
                        .manager
                        .import_session(&peer, &blob)
                        .map_err(ClientError::from),
                    None => Ok(()),
                });
            if let Err(e) = restored {
                tracing::warn!(peer = %peer, error = %e, "failed to restore session");
            }
        }
    }

    /// Rotation policy plus pool top-up, applied on every attach.
    async fn maintain_prekeys(&mut self) -> Result<()> {
        let now = self.clock.now_millis();
        let rotated_at = self
            .store
            .get(ROTATED_AT_KEY)?
            .and_then(|raw| raw.try_into().ok().map(i64::from_le_bytes));

        let rotation_due = match rotated_at {
            Some(at) => now - at > self.config.rotation_days * 24 * 3600 * 1000,
            None => false,
        };
        if rotation_due {
            let id = self.manager.rotate_signed_prekey(&mut OsRng);
            tracing::info!(signed_prekey_id = id, "rotated signed prekey");
        }
        if rotated_at.is_none() || rotation_due {
            self.store.put(ROTATED_AT_KEY, &now.to_le_bytes())?;
        }

        let never_published = self.store.get(PUBLISHED_KEY)?.is_none();
        let pool_low = self.manager.remaining_one_time_prekeys() < LOW_WATERMARK;
        if never_published || rotation_due || pool_low {
            self.replenish_prekeys().await?;
            self.store.put(PUBLISHED_KEY, &[1])?;
        }
        Ok(())
    }

    /// Upload the current bundle plus a fresh batch of one-time prekeys.
    async fn replenish_prekeys(&mut self) -> Result<u32> {
        let batch = self.config.replenish_batch;
        let otps: Vec<OneTimePrekeyUpload> = self
            .manager
            .generate_one_time_prekeys(&mut OsRng, batch)
            .into_iter()
            .map(|(id, key)| OneTimePrekeyUpload {
                id,
                key: key.to_vec(),
            })
            .collect();
        let bundle = self.manager.generate_prekey_bundle();
        self.send_frame(ClientFrame::UploadPrekeys {
            bundle: bundle_to_wire(&bundle),
            one_time_prekeys: otps,
        })
        .await?;
        self.persist_identity()?;
        Ok(batch)
    }

    async fn send_frame(&mut self, frame: ClientFrame) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(ClientError::NotConnected)?;
        match connection.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.disconnect();
                Err(e)
            }
        }
    }

    fn persist_session(&mut self, peer_key: &str) -> Result<()> {
        let blob = self.manager.export_session(peer_key)?;
        self.store.store_session(peer_key, &blob)
    }

    fn persist_identity(&mut self) -> Result<()> {
        let raw = self.manager.export_identity()?;
        let blob = match &self.vault_password {
            Some(password) => vault::lock(&mut OsRng, &raw, password)?,
            None => raw,
        };
        self.store.store_identity(&blob)
    }
}

fn bundle_to_wire(bundle: &PreKeyBundle) -> PrekeyBundleData {
    PrekeyBundleData {
        identity_key: bundle.identity_key.to_vec(),
        signed_prekey: bundle.signed_prekey.to_vec(),
        signed_prekey_signature: bundle.signed_prekey_signature.clone(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey: bundle.one_time_prekey.map(|k| k.to_vec()),
        one_time_prekey_id: bundle.one_time_prekey_id,
    }
}

fn bundle_from_wire(data: &PrekeyBundleData) -> Result<PreKeyBundle> {
    let invalid =
        |what: &str| ClientError::Crypto(CryptoError::InvalidKey(format!("{what} wrong length")));
    Ok(PreKeyBundle {
        identity_key: data
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| invalid("identity key"))?,
        signed_prekey: data
            .signed_prekey
            .as_slice()
            .try_into()
            .map_err(|_| invalid("signed prekey"))?,
        signed_prekey_signature: data.signed_prekey_signature.clone(),
        signed_prekey_id: data.signed_prekey_id,
        one_time_prekey: data
            .one_time_prekey
            .as_ref()
            .map(|k| k.as_slice().try_into().map_err(|_| invalid("one-time prekey")))
            .transpose()?,
        one_time_prekey_id: data.one_time_prekey_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(5));
        assert_eq!(backoff_delay(3), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn wire_bundle_conversion_checks_lengths() {
        let data = PrekeyBundleData {
            identity_key: vec![1; 31],
            signed_prekey: vec![2; 32],
            signed_prekey_signature: vec![3; 64],
            signed_prekey_id: 1,
            one_time_prekey: None,
            one_time_prekey_id: None,
        };
        assert!(bundle_from_wire(&data).is_err());
    }

    #[test]
    fn send_while_disconnected_is_rejected() {
        let config = Config::default();
        let store = ClientStore::open_in_memory().unwrap();
        let mut client =
            ChatClient::with_store(config, store, None, Arc::new(SystemClock)).unwrap();

        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(client.send_message(UserId::new(), b"queued?"));
        assert!(matches!(err, Err(ClientError::NotConnected)));
    }

    #[test]
    fn vault_password_locks_the_stored_identity() {
        let store = ClientStore::open_in_memory().unwrap();
        let client = ChatClient::with_store(
            Config::default(),
            store,
            Some("hunter2"),
            Arc::new(SystemClock),
        )
        .unwrap();

        let blob = client.store.load_identity().unwrap().unwrap();
        assert!(vault::is_locked(&blob));
        assert!(vault::unlock(&blob, "hunter2").is_ok());
        assert!(vault::unlock(&blob, "wrong").is_err());
    }
}
