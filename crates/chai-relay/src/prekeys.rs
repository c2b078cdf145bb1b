//! Server-side prekey directory.
//!
//! Holds each user's current signed prekey record (older generations stay
//! referenceable for in-flight sessions) and their one-time prekey pool.
//! One-time prekeys are consumed at most once; consumption runs inside an
//! IMMEDIATE transaction on the single guarded connection, the SQLite
//! equivalent of a `FOR UPDATE SKIP LOCKED` row claim.

use chai_protocol::{PrekeyBundleData, UserId};
use ed25519_dalek::VerifyingKey;

use crate::db::Db;
use crate::error::{RelayError, Result};

/// Unused-pool size below which the owner is told to replenish.
pub const LOW_WATERMARK: i64 = 10;

/// Validate and store a published bundle, replacing the current signed
/// prekey and appending the one-time prekeys as unused.
///
/// Fails `BadSignature` without modifying state when the signed prekey
/// signature does not verify under the user's registered identity key, or
/// when the bundle names a different identity than the one registered.
pub fn publish_bundle(
    db: &Db,
    user_id: UserId,
    bundle: &PrekeyBundleData,
    one_time_prekeys: &[(u32, Vec<u8>)],
    now: i64,
) -> Result<()> {
    let registered = crate::auth::identity_key(db, user_id)?
        .ok_or(RelayError::UnknownUser(user_id))?;
    verify_bundle_signature(&registered, bundle)?;

    let mut conn = db.lock().expect("relay db mutex poisoned");
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT OR REPLACE INTO prekey_bundles
             (user_id, signed_prekey, signed_prekey_signature, prekey_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            user_id.to_string(),
            bundle.signed_prekey,
            bundle.signed_prekey_signature,
            bundle.signed_prekey_id,
            now
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO one_time_prekeys
                 (user_id, prekey, prekey_id, used, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
        )?;
        for (id, key) in one_time_prekeys {
            stmt.execute(rusqlite::params![user_id.to_string(), key, id, now])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Append unused one-time prekeys for a user.
pub fn append_one_time_prekeys(
    db: &Db,
    user_id: UserId,
    prekeys: &[(u32, Vec<u8>)],
    now: i64,
) -> Result<usize> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO one_time_prekeys (user_id, prekey, prekey_id, used, created_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
    )?;
    let mut appended = 0;
    for (id, key) in prekeys {
        appended += stmt.execute(rusqlite::params![user_id.to_string(), key, id, now])?;
    }
    Ok(appended)
}

/// Fetch a user's bundle, atomically claiming one unused one-time prekey.
///
/// Returns `None` when the user has never published a signed prekey. The
/// OTP field is omitted when the pool is empty. No two fetches ever return
/// the same one-time prekey.
pub fn fetch_bundle(db: &Db, user_id: UserId) -> Result<Option<PrekeyBundleData>> {
    let identity_key = match crate::auth::identity_key(db, user_id)? {
        Some(k) => k,
        None => return Ok(None),
    };

    let mut conn = db.lock().expect("relay db mutex poisoned");
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let signed: Option<(Vec<u8>, Vec<u8>, u32)> = {
        let mut stmt = tx.prepare(
            "SELECT signed_prekey, signed_prekey_signature, prekey_id
             FROM prekey_bundles
             WHERE user_id = ?1
             ORDER BY created_at DESC, prekey_id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query([user_id.to_string()])?;
        match rows.next()? {
            Some(row) => Some((row.get(0)?, row.get(1)?, row.get(2)?)),
            None => None,
        }
    };
    let Some((signed_prekey, signed_prekey_signature, signed_prekey_id)) = signed else {
        return Ok(None);
    };

    // Claim the oldest unused OTP, if any.
    let claimed: Option<(u32, Vec<u8>)> = {
        let mut stmt = tx.prepare(
            "SELECT prekey_id, prekey FROM one_time_prekeys
             WHERE user_id = ?1 AND used = 0
             ORDER BY created_at ASC, prekey_id ASC
             LIMIT 1",
        )?;
        let mut rows = stmt.query([user_id.to_string()])?;
        match rows.next()? {
            Some(row) => Some((row.get(0)?, row.get(1)?)),
            None => None,
        }
    };
    if let Some((id, _)) = &claimed {
        tx.execute(
            "UPDATE one_time_prekeys SET used = 1 WHERE user_id = ?1 AND prekey_id = ?2",
            rusqlite::params![user_id.to_string(), id],
        )?;
    }
    tx.commit()?;

    Ok(Some(PrekeyBundleData {
        identity_key,
        signed_prekey,
        signed_prekey_signature,
        signed_prekey_id,
        one_time_prekey: claimed.as_ref().map(|(_, key)| key.clone()),
        one_time_prekey_id: claimed.as_ref().map(|(id, _)| *id),
    }))
}

/// Count of unused one-time prekeys for a user.
pub fn remaining_one_time_prekeys(db: &Db, user_id: UserId) -> Result<i64> {
    let conn = db.lock().expect("relay db mutex poisoned");
    let count = conn.query_row(
        "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND used = 0",
        [user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn verify_bundle_signature(identity_key: &[u8], bundle: &PrekeyBundleData) -> Result<()> {
    if bundle.identity_key != identity_key {
        return Err(RelayError::BadSignature);
    }
    let key_bytes: [u8; 32] = identity_key
        .try_into()
        .map_err(|_| RelayError::BadSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| RelayError::BadSignature)?;
    let sig_bytes: [u8; 64] = bundle
        .signed_prekey_signature
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::BadSignature)?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    use ed25519_dalek::Verifier;
    verifying_key
        .verify(&bundle.signed_prekey, &signature)
        .map_err(|_| RelayError::BadSignature)
}
