//! Session-token resolution.
//!
//! Producing tokens (registration, login) belongs to the external
//! authentication component; the relay only stores hashes and resolves a
//! presented token to a user id on attach.

use chai_protocol::UserId;
use sha2::{Digest, Sha256};

use crate::db::Db;
use crate::error::Result;

/// Register a user id with its public identity key.
pub fn register_user(db: &Db, user_id: UserId, identity_key: &[u8], now: i64) -> Result<()> {
    let conn = db.lock().expect("relay db mutex poisoned");
    conn.execute(
        "INSERT OR IGNORE INTO users (user_id, identity_key, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![user_id.to_string(), identity_key, now],
    )?;
    Ok(())
}

/// The registered identity key for a user, if any.
pub fn identity_key(db: &Db, user_id: UserId) -> Result<Option<Vec<u8>>> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let mut stmt = conn.prepare("SELECT identity_key FROM users WHERE user_id = ?1")?;
    let mut rows = stmt.query([user_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Store a session token for a user. Only the SHA-256 hash is persisted.
pub fn issue_token(db: &Db, user_id: UserId, token: &str, now: i64) -> Result<()> {
    let conn = db.lock().expect("relay db mutex poisoned");
    conn.execute(
        "INSERT OR REPLACE INTO session_tokens (token_hash, user_id, created_at)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![hash_token(token), user_id.to_string(), now],
    )?;
    Ok(())
}

/// Resolve a presented token to its user id.
pub fn resolve_token(db: &Db, token: &str) -> Result<Option<UserId>> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let mut stmt = conn.prepare("SELECT user_id FROM session_tokens WHERE token_hash = ?1")?;
    let mut rows = stmt.query([hash_token(token)])?;
    match rows.next()? {
        Some(row) => {
            let raw: String = row.get(0)?;
            Ok(UserId::parse(&raw))
        }
        None => Ok(None),
    }
}

fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn token_roundtrip() {
        let db = db::open_in_memory().unwrap();
        let user = UserId::new();

        register_user(&db, user, b"identity", 1).unwrap();
        issue_token(&db, user, "tok-123", 1).unwrap();

        assert_eq!(resolve_token(&db, "tok-123").unwrap(), Some(user));
        assert_eq!(resolve_token(&db, "tok-456").unwrap(), None);
        assert_eq!(identity_key(&db, user).unwrap().as_deref(), Some(&b"identity"[..]));
    }
}
