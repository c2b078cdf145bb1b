//! Frame type definitions.
//!
//! Frames are tagged JSON documents `{ "type": <string>, "payload":
//! <object|null> }`. Binary payloads (keys, ciphertext) are encoded as
//! arrays of byte values, which is serde_json's default for `Vec<u8>`.

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, UserId};

/// Client-to-server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    /// Keepalive; the relay answers `Pong`.
    Ping,

    /// Send an encrypted envelope to a recipient.
    SendMessage {
        recipient_id: UserId,
        ciphertext: Vec<u8>,
        message_type: MessageType,
    },

    /// Request a user's prekey bundle, consuming one of their one-time
    /// prekeys if any remain.
    GetPrekeyBundle { user_id: UserId },

    /// Acknowledge delivered messages. Already-acked ids are a no-op.
    AckMessages { message_ids: Vec<MessageId> },

    /// Publish the signed prekey bundle and append one-time prekeys.
    UploadPrekeys {
        bundle: PrekeyBundleData,
        one_time_prekeys: Vec<OneTimePrekeyUpload>,
    },
}

/// Server-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerFrame {
    Pong,

    /// An encrypted envelope addressed to this connection's user.
    Message {
        id: MessageId,
        sender_id: UserId,
        ciphertext: Vec<u8>,
        message_type: MessageType,
        created_at: i64,
    },

    /// The relay persisted a `SendMessage`; delivery may still be pending.
    MessageSent { message_id: MessageId },

    /// Response to `GetPrekeyBundle`. `bundle` is absent for unknown users
    /// or users who never published.
    PrekeyBundle {
        user_id: UserId,
        bundle: Option<PrekeyBundleData>,
    },

    /// The recipient's unused one-time prekey pool fell below the
    /// low-water mark.
    LowPrekeys { remaining: u32 },

    Error { code: ErrorCode, message: String },
}

/// Routing class of a message payload. The relay reads nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Regular conversation payload.
    Normal = 1,
    /// Session-establishment and other protocol control payloads.
    Control = 2,
}

impl MessageType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Normal),
            2 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Error codes carried on `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    BadSignature = 1000,
    Unauthorized = 1001,
    UnknownUser = 1002,
    FrameTooLarge = 1003,
    Backpressure = 1004,
    Replaced = 1005,
    Internal = 5000,
}

/// Prekey bundle as carried over the wire and stored by the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundleData {
    pub identity_key: Vec<u8>,
    pub signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_id: u32,
    pub one_time_prekey: Option<Vec<u8>>,
    pub one_time_prekey_id: Option<u32>,
}

/// One-time prekey upload entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyUpload {
    pub id: u32,
    pub key: Vec<u8>,
}

/// First line a client sends on a fresh connection. Authentication itself
/// is external; the relay only resolves the token to a user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub token: String,
}

/// First line the relay sends back on a successful attach. On failure the
/// relay sends an `Error` frame and closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachAck {
    pub user_id: UserId,
}
