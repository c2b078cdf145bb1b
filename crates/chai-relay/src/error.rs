use chai_protocol::{ErrorCode, ProtocolError, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("prekey bundle signature does not verify")]
    BadSignature,

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Code carried on the `Error` frame for this failure. Internal detail
    /// never crosses the wire.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadSignature => ErrorCode::BadSignature,
            Self::UnknownUser(_) => ErrorCode::UnknownUser,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::Protocol(ProtocolError::FrameTooLarge(_)) => ErrorCode::FrameTooLarge,
            Self::Protocol(_) => ErrorCode::Internal,
            Self::Storage(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
