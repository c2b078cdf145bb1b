//! Relay database: open, migrate, share.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{RelayError, Result};

/// Shared handle to the single relay connection. Every query takes the
/// mutex for its full statement, which is what serializes one-time prekey
/// consumption.
pub type Db = Arc<Mutex<Connection>>;

/// Relay schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 1;

/// Open (or create) the relay database and run migrations.
pub fn open(path: &str) -> Result<Db> {
    let conn = Connection::open(path)?;
    init(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    init(conn)
}

fn init(conn: Connection) -> Result<Db> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != SCHEMA_VERSION {
        if current != 0 {
            return Err(RelayError::Storage(format!(
                "unsupported relay schema version {current} (expected {SCHEMA_VERSION})"
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(Arc::new(Mutex::new(conn)))
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    identity_key BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_tokens (
    token_hash BLOB PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL
);

-- Opaque ciphertext envelopes; the relay reads nothing but message_type.
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    message_type INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    delivered_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_messages_undelivered
    ON messages(recipient_id, created_at)
    WHERE delivered_at IS NULL;

-- Signed prekey generations; the newest row per user is served.
CREATE TABLE IF NOT EXISTS prekey_bundles (
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    signed_prekey BLOB NOT NULL,
    signed_prekey_signature BLOB NOT NULL,
    prekey_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, prekey_id)
);

CREATE TABLE IF NOT EXISTS one_time_prekeys (
    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    prekey BLOB NOT NULL,
    prekey_id INTEGER NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, prekey_id)
);

CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_unused
    ON one_time_prekeys(user_id, prekey_id)
    WHERE used = 0;
";
