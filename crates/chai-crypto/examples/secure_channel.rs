//! Two parties establish a secure channel and exchange messages, the way
//! the client drives the session manager in production.

use chai_crypto::{Result, SessionManager};
use rand::rngs::OsRng;

fn main() -> Result<()> {
    // Each device owns a session manager holding its identity and prekeys.
    let mut alice = SessionManager::new(&mut OsRng);
    let mut bob = SessionManager::new(&mut OsRng);

    // Bob publishes a bundle; the directory pairs it with one of his
    // one-time prekeys per fetch.
    let otps = bob.generate_one_time_prekeys(&mut OsRng, 20);
    let mut bundle = bob.generate_prekey_bundle();
    bundle.one_time_prekey = Some(otps[0].1);
    bundle.one_time_prekey_id = Some(otps[0].0);

    // Alice fetches the bundle and initiates. The returned envelope is the
    // session-establishment message Bob must see first.
    let establishment = alice.init_session(&mut OsRng, "bob", &bundle)?;
    bob.decrypt(&mut OsRng, "alice", &establishment)?;
    println!("session established, bob holds {} unused one-time prekeys", bob.remaining_one_time_prekeys());

    // Messages now flow in both directions with per-message keys.
    let envelope = alice.encrypt("bob", b"hello bob")?;
    let plaintext = bob.decrypt(&mut OsRng, "alice", &envelope)?;
    println!("bob read: {}", String::from_utf8_lossy(&plaintext));

    let envelope = bob.encrypt("alice", b"hello alice")?;
    let plaintext = alice.decrypt(&mut OsRng, "bob", &envelope)?;
    println!("alice read: {}", String::from_utf8_lossy(&plaintext));

    // Session state survives a restart as a versioned opaque blob.
    let exported = alice.export_session("bob")?;
    let mut restored = SessionManager::from_identity_bytes(&alice.export_identity()?)?;
    restored.import_session("bob", &exported)?;

    let envelope = restored.encrypt("bob", b"still me")?;
    let plaintext = bob.decrypt(&mut OsRng, "alice", &envelope)?;
    println!("bob read after restore: {}", String::from_utf8_lossy(&plaintext));

    Ok(())
}
