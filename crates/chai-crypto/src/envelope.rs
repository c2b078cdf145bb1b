//! Envelope wire format.
//!
//! The bytes on the wire for one encrypted message. All integers are
//! big-endian:
//!
//! ```text
//! envelope = version(1) || flags(1) || [initial] || header || body
//! initial  = identity_pub(32) || ephemeral_pub(32) || spk_id(u32)
//!            || otp_flag(1) || otp_id(u32, only when otp_flag == 1)
//! header   = dh_send_pub(32) || pn(u32) || n(u32)
//! body     = ciphertext_len(u32) || ciphertext
//! ```
//!
//! Flags bit 0 marks the presence of the initial handshake block, which
//! precedes the header.

use crate::error::CryptoError;
use crate::ratchet::{RatchetHeader, HEADER_LEN};
use crate::x3dh::InitialHandshake;

pub const ENVELOPE_VERSION: u8 = 0x01;

const FLAG_INITIAL: u8 = 0b0000_0001;

/// A decoded envelope: optional handshake block, ratchet header,
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub handshake: Option<InitialHandshake>,
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let initial_len = match &self.handshake {
            Some(hs) => 32 + 32 + 4 + 1 + if hs.one_time_prekey_id.is_some() { 4 } else { 0 },
            None => 0,
        };
        let mut out = Vec::with_capacity(2 + initial_len + HEADER_LEN + 4 + self.ciphertext.len());

        out.push(ENVELOPE_VERSION);
        out.push(if self.handshake.is_some() {
            FLAG_INITIAL
        } else {
            0
        });

        if let Some(hs) = &self.handshake {
            out.extend_from_slice(&hs.identity_key);
            out.extend_from_slice(&hs.ephemeral_key);
            out.extend_from_slice(&hs.signed_prekey_id.to_be_bytes());
            match hs.one_time_prekey_id {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(&id.to_be_bytes());
                }
                None => out.push(0),
            }
        }

        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = Cursor::new(data);

        let version = cursor.take_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::MalformedEnvelope);
        }
        let flags = cursor.take_u8()?;
        if flags & !FLAG_INITIAL != 0 {
            return Err(CryptoError::MalformedEnvelope);
        }

        let handshake = if flags & FLAG_INITIAL != 0 {
            let identity_key = cursor.take_array::<32>()?;
            let ephemeral_key = cursor.take_array::<32>()?;
            let signed_prekey_id = cursor.take_u32()?;
            let one_time_prekey_id = match cursor.take_u8()? {
                0 => None,
                1 => Some(cursor.take_u32()?),
                _ => return Err(CryptoError::MalformedEnvelope),
            };
            Some(InitialHandshake {
                identity_key,
                ephemeral_key,
                signed_prekey_id,
                one_time_prekey_id,
            })
        } else {
            None
        };

        let header = RatchetHeader::from_bytes(cursor.take_slice(HEADER_LEN)?)?;

        let ciphertext_len = cursor.take_u32()? as usize;
        let ciphertext = cursor.take_slice(ciphertext_len)?.to_vec();
        if !cursor.is_empty() {
            return Err(CryptoError::MalformedEnvelope);
        }

        Ok(Self {
            handshake,
            header,
            ciphertext,
        })
    }
}

/// Bounds-checked reader over the raw envelope bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(CryptoError::MalformedEnvelope)?;
        if end > self.data.len() {
            return Err(CryptoError::MalformedEnvelope);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.take_slice(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, CryptoError> {
        let bytes = self.take_slice(4)?;
        Ok(u32::from_be_bytes(
            bytes.try_into().map_err(|_| CryptoError::MalformedEnvelope)?,
        ))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let bytes = self.take_slice(N)?;
        bytes.try_into().map_err(|_| CryptoError::MalformedEnvelope)
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}
