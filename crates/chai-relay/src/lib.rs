//! chai relay: authenticated frame transport, store-and-forward message
//! routing, and the prekey directory. The relay never sees plaintext or
//! private key material.

pub mod auth;
pub mod clock;
pub mod connection;
pub mod db;
pub mod error;
pub mod messages;
pub mod prekeys;
pub mod registry;

pub use clock::{Clock, SystemClock};
pub use connection::{serve, RelayState};
pub use error::RelayError;
pub use registry::ConnectionRegistry;
