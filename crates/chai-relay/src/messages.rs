//! Persisted message store: store-and-forward with delivery tracking.

use chai_protocol::{MessageId, UserId};

use crate::db::Db;
use crate::error::Result;

/// One stored envelope. The ciphertext is opaque to the relay.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub ciphertext: Vec<u8>,
    pub message_type: i64,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

/// Persist an envelope. `MessageSent` goes back to the sender once this
/// returns, independent of delivery.
pub fn store(
    db: &Db,
    sender_id: UserId,
    recipient_id: UserId,
    ciphertext: &[u8],
    message_type: i64,
    created_at: i64,
) -> Result<MessageId> {
    let id = MessageId::new();
    let conn = db.lock().expect("relay db mutex poisoned");
    conn.execute(
        "INSERT INTO messages (id, sender_id, recipient_id, ciphertext, message_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id.to_string(),
            sender_id.to_string(),
            recipient_id.to_string(),
            ciphertext,
            message_type,
            created_at
        ],
    )?;
    Ok(id)
}

/// All undelivered envelopes for a recipient, oldest first. Acceptance
/// order is preserved within each sender-recipient pair.
pub fn undelivered(db: &Db, recipient_id: UserId) -> Result<Vec<StoredMessage>> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, recipient_id, ciphertext, message_type, created_at, delivered_at
         FROM messages
         WHERE recipient_id = ?1 AND delivered_at IS NULL
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([recipient_id.to_string()], row_to_message)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Mark messages delivered for this recipient. Already-delivered ids are a
/// no-op; returns the number of rows newly marked.
pub fn mark_delivered(
    db: &Db,
    recipient_id: UserId,
    message_ids: &[MessageId],
    delivered_at: i64,
) -> Result<usize> {
    let mut conn = db.lock().expect("relay db mutex poisoned");
    let tx = conn.transaction()?;
    let mut marked = 0;
    {
        let mut stmt = tx.prepare(
            "UPDATE messages SET delivered_at = ?1
             WHERE id = ?2 AND recipient_id = ?3 AND delivered_at IS NULL",
        )?;
        for id in message_ids {
            marked += stmt.execute(rusqlite::params![
                delivered_at,
                id.to_string(),
                recipient_id.to_string()
            ])?;
        }
    }
    tx.commit()?;
    Ok(marked)
}

/// Delete envelopes past the retention window, delivered or not. Returns
/// the number of rows removed.
pub fn sweep_expired(db: &Db, cutoff_millis: i64) -> Result<usize> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let removed = conn.execute(
        "DELETE FROM messages
         WHERE COALESCE(delivered_at, created_at) < ?1",
        [cutoff_millis],
    )?;
    Ok(removed)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient: String = row.get(2)?;
    Ok(StoredMessage {
        id: MessageId::parse(&id).unwrap_or_default(),
        sender_id: UserId::parse(&sender).unwrap_or_default(),
        recipient_id: UserId::parse(&recipient).unwrap_or_default(),
        ciphertext: row.get(3)?,
        message_type: row.get(4)?,
        created_at: row.get(5)?,
        delivered_at: row.get(6)?,
    })
}
