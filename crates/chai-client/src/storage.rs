//! Persistent client state: one identity blob (optionally vault-locked)
//! plus one session blob per peer, in a small key-value table.

use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

const IDENTITY_KEY: &str = "identity";
const SESSION_PREFIX: &str = "session:";

/// Client-side schema version.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

pub struct ClientStore {
    conn: Mutex<Connection>,
}

impl ClientStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("client store mutex poisoned");
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("client store mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("client store mutex poisoned");
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn load_identity(&self) -> Result<Option<Vec<u8>>> {
        self.get(IDENTITY_KEY)
    }

    pub fn store_identity(&self, blob: &[u8]) -> Result<()> {
        self.put(IDENTITY_KEY, blob)
    }

    pub fn load_session(&self, peer_id: &str) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{SESSION_PREFIX}{peer_id}"))
    }

    pub fn store_session(&self, peer_id: &str, blob: &[u8]) -> Result<()> {
        self.put(&format!("{SESSION_PREFIX}{peer_id}"), blob)
    }

    pub fn delete_session(&self, peer_id: &str) -> Result<()> {
        self.delete(&format!("{SESSION_PREFIX}{peer_id}"))
    }

    /// Peer ids with a persisted session.
    pub fn session_peers(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("client store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 ORDER BY key")?;
        let rows = stmt.query_map([format!("{SESSION_PREFIX}%")], |row| {
            row.get::<_, String>(0)
        })?;
        let mut peers = Vec::new();
        for key in rows {
            peers.push(key?[SESSION_PREFIX.len()..].to_string());
        }
        Ok(peers)
    }
}
