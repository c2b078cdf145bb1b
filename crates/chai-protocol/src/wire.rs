//! Wire codec: one JSON document per line, capped at 1 MiB.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::frames::{AttachAck, AttachRequest, ClientFrame, ServerFrame};

/// Maximum encoded frame size. Larger frames are rejected on both sides.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(encoded.len()));
    }
    Ok(encoded)
}

fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    if line.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(line.len()));
    }
    serde_json::from_str(line).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, ProtocolError> {
    encode(frame)
}

pub fn decode_client_frame(line: &str) -> Result<ClientFrame, ProtocolError> {
    decode(line)
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, ProtocolError> {
    encode(frame)
}

pub fn decode_server_frame(line: &str) -> Result<ServerFrame, ProtocolError> {
    decode(line)
}

pub fn encode_attach_request(request: &AttachRequest) -> Result<String, ProtocolError> {
    encode(request)
}

pub fn decode_attach_request(line: &str) -> Result<AttachRequest, ProtocolError> {
    decode(line)
}

pub fn encode_attach_ack(ack: &AttachAck) -> Result<String, ProtocolError> {
    encode(ack)
}

pub fn decode_attach_ack(line: &str) -> Result<AttachAck, ProtocolError> {
    decode(line)
}
