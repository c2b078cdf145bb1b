//! chai cryptographic core: X3DH key agreement, Double Ratchet sessions,
//! and at-rest identity protection.
//!
//! The relay never sees anything this crate does not put inside an
//! envelope; everything here runs client-side.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod keys;
pub mod primitives;
pub mod ratchet;
pub mod session;
pub mod vault;
pub mod x3dh;

pub use envelope::Envelope;
pub use error::CryptoError;
pub use identity::Identity;
pub use keys::{DhKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use ratchet::{DoubleRatchet, RatchetHeader};
pub use session::{Session, SessionManager};
pub use x3dh::InitialHandshake;

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
