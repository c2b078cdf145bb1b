//! chai client: reconnecting relay connection, session persistence, and
//! the message send/receive loop around the crypto core.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod storage;

pub use client::{backoff_delay, ChatClient, ClientEvent, ConnectionState};
pub use config::Config;
pub use connection::Connection;
pub use error::ClientError;
pub use storage::ClientStore;
