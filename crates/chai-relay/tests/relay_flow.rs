//! Relay integration tests over a real TCP listener: attach, routing,
//! offline drain, prekey directory, and replacement policy.

use std::sync::Arc;
use std::time::Duration;

use chai_protocol::{
    wire, AttachRequest, ClientFrame, ErrorCode, MessageType, OneTimePrekeyUpload,
    PrekeyBundleData, ServerFrame, UserId,
};
use chai_relay::connection::{serve, RelayState};
use chai_relay::{auth, db, messages, prekeys, ConnectionRegistry, SystemClock};
use rand::rngs::OsRng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    addr: String,
    db: db::Db,
}

async fn start_relay() -> Harness {
    let db = db::open_in_memory().unwrap();
    let state = Arc::new(RelayState {
        db: db.clone(),
        registry: ConnectionRegistry::new(),
        clock: Arc::new(SystemClock),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(listener, state));
    Harness { addr, db }
}

fn register(harness: &Harness, token: &str, identity_key: &[u8]) -> UserId {
    let user = UserId::new();
    auth::register_user(&harness.db, user, identity_key, 1).unwrap();
    auth::issue_token(&harness.db, user, token, 1).unwrap();
    user
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: &str, token: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        client
            .send_line(
                &wire::encode_attach_request(&AttachRequest {
                    token: token.to_string(),
                })
                .unwrap(),
            )
            .await;
        client
    }

    async fn expect_attach_ack(&mut self) -> UserId {
        let line = self.recv_line().await;
        wire::decode_attach_ack(&line).expect("attach ack").user_id
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send_frame(&mut self, frame: &ClientFrame) {
        let encoded = wire::encode_client_frame(frame).unwrap();
        self.send_line(&encoded).await;
    }

    async fn recv_line(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for line")
            .expect("read error")
            .expect("connection closed")
    }

    async fn recv_frame(&mut self) -> ServerFrame {
        let line = self.recv_line().await;
        wire::decode_server_frame(&line).expect("server frame")
    }
}

/// Bundle + OTP uploads as a client would publish them.
fn publishable(
    manager: &mut chai_crypto::SessionManager,
    otp_count: u32,
) -> (PrekeyBundleData, Vec<OneTimePrekeyUpload>) {
    let bundle = manager.generate_prekey_bundle();
    let data = PrekeyBundleData {
        identity_key: bundle.identity_key.to_vec(),
        signed_prekey: bundle.signed_prekey.to_vec(),
        signed_prekey_signature: bundle.signed_prekey_signature.clone(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey: None,
        one_time_prekey_id: None,
    };
    let otps = manager
        .generate_one_time_prekeys(&mut OsRng, otp_count)
        .into_iter()
        .map(|(id, key)| OneTimePrekeyUpload {
            id,
            key: key.to_vec(),
        })
        .collect();
    (data, otps)
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_and_ping() {
    let harness = start_relay().await;
    let user = register(&harness, "tok-ping", b"id");

    let mut client = TestClient::connect(&harness.addr, "tok-ping").await;
    assert_eq!(client.expect_attach_ack().await, user);

    client.send_frame(&ClientFrame::Ping).await;
    assert!(matches!(client.recv_frame().await, ServerFrame::Pong));
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_token_is_rejected() {
    let harness = start_relay().await;

    let mut client = TestClient::connect(&harness.addr, "no-such-token").await;
    let line = client.recv_line().await;
    let frame = wire::decode_server_frame(&line).unwrap();
    assert!(matches!(
        frame,
        ServerFrame::Error {
            code: ErrorCode::Unauthorized,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn first_contact_end_to_end() {
    let harness = start_relay().await;

    let mut alice_mgr = chai_crypto::SessionManager::new(&mut OsRng);
    let mut bob_mgr = chai_crypto::SessionManager::new(&mut OsRng);

    let alice = register(&harness, "tok-alice", &alice_mgr.public_identity());
    let bob = register(&harness, "tok-bob", &bob_mgr.public_identity());

    let mut alice_conn = TestClient::connect(&harness.addr, "tok-alice").await;
    alice_conn.expect_attach_ack().await;
    let mut bob_conn = TestClient::connect(&harness.addr, "tok-bob").await;
    bob_conn.expect_attach_ack().await;

    // Bob publishes his bundle with one OTP.
    let (bundle, otps) = publishable(&mut bob_mgr, 1);
    bob_conn
        .send_frame(&ClientFrame::UploadPrekeys {
            bundle,
            one_time_prekeys: otps,
        })
        .await;

    // Alice fetches it. Wait for the upload to land first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice_conn
        .send_frame(&ClientFrame::GetPrekeyBundle { user_id: bob })
        .await;
    let fetched = match alice_conn.recv_frame().await {
        ServerFrame::PrekeyBundle { bundle, .. } => bundle.expect("bob published"),
        other => panic!("expected PrekeyBundle, got {other:?}"),
    };
    assert!(fetched.one_time_prekey.is_some());

    let crypto_bundle = chai_crypto::PreKeyBundle {
        identity_key: fetched.identity_key.clone().try_into().unwrap(),
        signed_prekey: fetched.signed_prekey.clone().try_into().unwrap(),
        signed_prekey_signature: fetched.signed_prekey_signature.clone(),
        signed_prekey_id: fetched.signed_prekey_id,
        one_time_prekey: fetched
            .one_time_prekey
            .clone()
            .map(|k| k.try_into().unwrap()),
        one_time_prekey_id: fetched.one_time_prekey_id,
    };

    // Alice initiates and sends both establishment and content envelopes.
    let initial = alice_mgr
        .init_session(&mut OsRng, &bob.to_string(), &crypto_bundle)
        .unwrap();
    alice_conn
        .send_frame(&ClientFrame::SendMessage {
            recipient_id: bob,
            ciphertext: initial,
            message_type: MessageType::Control,
        })
        .await;
    let m1 = alice_mgr.encrypt(&bob.to_string(), b"hello").unwrap();
    alice_conn
        .send_frame(&ClientFrame::SendMessage {
            recipient_id: bob,
            ciphertext: m1,
            message_type: MessageType::Normal,
        })
        .await;

    // Sender sees persistence confirmations.
    assert!(matches!(
        alice_conn.recv_frame().await,
        ServerFrame::MessageSent { .. }
    ));
    assert!(matches!(
        alice_conn.recv_frame().await,
        ServerFrame::MessageSent { .. }
    ));

    // Bob receives both envelopes live and decrypts the content. The
    // exhausted OTP pool also earns him LowPrekeys frames along the way.
    let mut plaintexts = Vec::new();
    let mut ids = Vec::new();
    while plaintexts.len() < 2 {
        match bob_conn.recv_frame().await {
            ServerFrame::Message {
                id,
                sender_id,
                ciphertext,
                ..
            } => {
                assert_eq!(sender_id, alice);
                ids.push(id);
                plaintexts.push(
                    bob_mgr
                        .decrypt(&mut OsRng, &alice.to_string(), &ciphertext)
                        .unwrap(),
                );
            }
            ServerFrame::LowPrekeys { .. } => {}
            other => panic!("expected Message, got {other:?}"),
        }
    }
    assert_eq!(plaintexts[0], b"");
    assert_eq!(plaintexts[1], b"hello");

    // OTP consumed: a second fetch serves the signed prekey without OTP.
    alice_conn
        .send_frame(&ClientFrame::GetPrekeyBundle { user_id: bob })
        .await;
    match alice_conn.recv_frame().await {
        ServerFrame::PrekeyBundle { bundle, .. } => {
            let bundle = bundle.expect("signed prekey still served");
            assert!(bundle.one_time_prekey.is_none());
        }
        other => panic!("expected PrekeyBundle, got {other:?}"),
    }

    // Acking marks delivery.
    bob_conn
        .send_frame(&ClientFrame::AckMessages { message_ids: ids })
        .await;
    wait_until(|| messages::undelivered(&harness.db, bob).unwrap().is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_messages_drain_in_order_on_reconnect() {
    let harness = start_relay().await;
    let alice = register(&harness, "tok-alice", b"a");
    let bob = register(&harness, "tok-bob", b"b");

    let mut alice_conn = TestClient::connect(&harness.addr, "tok-alice").await;
    alice_conn.expect_attach_ack().await;

    // Bob is offline; five messages queue up.
    for i in 0..5u8 {
        alice_conn
            .send_frame(&ClientFrame::SendMessage {
                recipient_id: bob,
                ciphertext: vec![i],
                message_type: MessageType::Normal,
            })
            .await;
        assert!(matches!(
            alice_conn.recv_frame().await,
            ServerFrame::MessageSent { .. }
        ));
    }

    // Bob attaches and receives exactly the backlog, oldest first.
    let mut bob_conn = TestClient::connect(&harness.addr, "tok-bob").await;
    bob_conn.expect_attach_ack().await;

    let mut ids = Vec::new();
    for i in 0..5u8 {
        match bob_conn.recv_frame().await {
            ServerFrame::Message {
                id,
                sender_id,
                ciphertext,
                ..
            } => {
                assert_eq!(sender_id, alice);
                assert_eq!(ciphertext, vec![i]);
                ids.push(id);
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    bob_conn
        .send_frame(&ClientFrame::AckMessages {
            message_ids: ids.clone(),
        })
        .await;
    wait_until(|| messages::undelivered(&harness.db, bob).unwrap().is_empty()).await;

    // Re-acking is a no-op.
    bob_conn
        .send_frame(&ClientFrame::AckMessages { message_ids: ids })
        .await;
    bob_conn.send_frame(&ClientFrame::Ping).await;
    assert!(matches!(bob_conn.recv_frame().await, ServerFrame::Pong));
}

#[tokio::test(flavor = "multi_thread")]
async fn low_prekey_watermark_notifies_the_owner() {
    let harness = start_relay().await;

    let mut bob_mgr = chai_crypto::SessionManager::new(&mut OsRng);
    let bob = register(&harness, "tok-bob", &bob_mgr.public_identity());
    let _carol = register(&harness, "tok-carol", b"c");

    let mut bob_conn = TestClient::connect(&harness.addr, "tok-bob").await;
    bob_conn.expect_attach_ack().await;

    let (bundle, otps) = publishable(&mut bob_mgr, 12);
    bob_conn
        .send_frame(&ClientFrame::UploadPrekeys {
            bundle,
            one_time_prekeys: otps,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut carol_conn = TestClient::connect(&harness.addr, "tok-carol").await;
    carol_conn.expect_attach_ack().await;

    // Twelve fetches exhaust the pool, crossing the low-water mark.
    for _ in 0..12 {
        carol_conn
            .send_frame(&ClientFrame::GetPrekeyBundle { user_id: bob })
            .await;
        match carol_conn.recv_frame().await {
            ServerFrame::PrekeyBundle { .. } => {}
            other => panic!("expected PrekeyBundle, got {other:?}"),
        }
    }

    // Bob hears about it while online.
    match bob_conn.recv_frame().await {
        ServerFrame::LowPrekeys { remaining } => assert!(remaining <= 9),
        other => panic!("expected LowPrekeys, got {other:?}"),
    }

    // Bob replenishes.
    let replenishment: Vec<OneTimePrekeyUpload> = bob_mgr
        .generate_one_time_prekeys(&mut OsRng, 20)
        .into_iter()
        .map(|(id, key)| OneTimePrekeyUpload {
            id,
            key: key.to_vec(),
        })
        .collect();
    let (bundle, _) = publishable(&mut bob_mgr, 0);
    bob_conn
        .send_frame(&ClientFrame::UploadPrekeys {
            bundle,
            one_time_prekeys: replenishment,
        })
        .await;

    wait_until(|| prekeys::remaining_one_time_prekeys(&harness.db, bob).unwrap() >= 20).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frames_are_rejected() {
    let harness = start_relay().await;
    register(&harness, "tok-bob", b"b");

    let mut client = TestClient::connect(&harness.addr, "tok-bob").await;
    client.expect_attach_ack().await;

    // A frame past the 1 MiB cap draws an error, and the connection
    // keeps serving afterwards.
    let huge = format!("{{\"type\":\"Ping\",\"pad\":\"{}\"}}", "x".repeat(1024 * 1024));
    client.send_line(&huge).await;
    match client.recv_frame().await {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::FrameTooLarge),
        other => panic!("expected FrameTooLarge error, got {other:?}"),
    }

    client.send_frame(&ClientFrame::Ping).await;
    assert!(matches!(client.recv_frame().await, ServerFrame::Pong));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_attach_replaces_the_first() {
    let harness = start_relay().await;
    register(&harness, "tok-bob", b"b");

    let mut first = TestClient::connect(&harness.addr, "tok-bob").await;
    first.expect_attach_ack().await;

    let mut second = TestClient::connect(&harness.addr, "tok-bob").await;
    second.expect_attach_ack().await;

    // The first connection is told it was replaced.
    match first.recv_frame().await {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::Replaced),
        other => panic!("expected Replaced error, got {other:?}"),
    }

    // The replacement keeps working.
    second.send_frame(&ClientFrame::Ping).await;
    assert!(matches!(second.recv_frame().await, ServerFrame::Pong));
}

#[tokio::test(flavor = "multi_thread")]
async fn forged_upload_is_rejected_with_bad_signature() {
    let harness = start_relay().await;

    let bob_mgr = chai_crypto::SessionManager::new(&mut OsRng);
    let mut mallory_mgr = chai_crypto::SessionManager::new(&mut OsRng);
    let bob = register(&harness, "tok-bob", &bob_mgr.public_identity());

    let mut bob_conn = TestClient::connect(&harness.addr, "tok-bob").await;
    bob_conn.expect_attach_ack().await;

    // A bundle signed by a different identity.
    let (mut bundle, otps) = publishable(&mut mallory_mgr, 2);
    bundle.identity_key = bob_mgr.public_identity().to_vec();
    bob_conn
        .send_frame(&ClientFrame::UploadPrekeys {
            bundle,
            one_time_prekeys: otps,
        })
        .await;

    match bob_conn.recv_frame().await {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::BadSignature),
        other => panic!("expected BadSignature error, got {other:?}"),
    }
    assert_eq!(prekeys::remaining_one_time_prekeys(&harness.db, bob).unwrap(), 0);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
