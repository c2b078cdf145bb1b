use thiserror::Error;

/// Errors surfaced by the cryptographic core.
///
/// This is a closed set: adding a variant is a versioned protocol change.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("prekey bundle signature verification failed")]
    InvalidBundle,

    #[error("unknown signed prekey id {0}")]
    UnknownSignedPrekey(u32),

    #[error("one-time prekey {0} already consumed")]
    OneTimePrekeyConsumed(u32),

    #[error("no session for peer {0}")]
    NoSession(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("message belongs to an expired receiving chain")]
    LateBeyondWindow,

    #[error("too many skipped messages in receiving chain")]
    TooManySkipped,

    #[error("vault unlock failed")]
    VaultUnlockFailed,

    #[error("message counter overflow")]
    CounterOverflow,

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Self::InvalidKey(e.to_string())
    }
}
