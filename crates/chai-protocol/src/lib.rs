//! Frame types and wire codec shared by the chai relay and client.

pub mod error;
pub mod frames;
pub mod types;
pub mod wire;

pub use error::ProtocolError;
pub use frames::{
    AttachAck, AttachRequest, ClientFrame, ErrorCode, MessageType, OneTimePrekeyUpload,
    PrekeyBundleData, ServerFrame,
};
pub use types::{MessageId, UserId};
pub use wire::MAX_FRAME_LEN;
