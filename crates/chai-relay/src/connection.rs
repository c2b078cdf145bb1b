//! Per-connection actor: attach, drain, dispatch.
//!
//! Each accepted socket gets one task owning both halves of the stream.
//! Frames are newline-delimited JSON. The relay never decrypts; the only
//! content field it reads is `message_type`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chai_protocol::{
    wire, AttachAck, ClientFrame, ErrorCode, MessageType, OneTimePrekeyUpload, PrekeyBundleData,
    ServerFrame, UserId,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{RelayError, Result};
use crate::registry::{CloseSignal, ConnectionRegistry, Delivery, OUTBOUND_QUEUE};
use crate::{auth, messages, prekeys};

/// Window for the attach line after the TCP connect.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness sweep cadence.
const LIVENESS_CHECK: Duration = Duration::from_secs(15);

/// Clients ping every 30 s; two missed rounds close the connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

/// Shared relay state handed to every connection task.
pub struct RelayState {
    pub db: Db,
    pub registry: ConnectionRegistry,
    pub clock: Arc<dyn Clock>,
}

/// Accept loop. Runs until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<RelayState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = connection_loop(stream, peer, state).await {
                        tracing::debug!(error = %e, peer = %peer, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

async fn connection_loop(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Attach: first line must resolve a session token.
    let attach_line = match tokio::time::timeout(ATTACH_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            tracing::debug!(peer = %peer, "attach timed out");
            return Ok(());
        }
    };

    let user_id = match wire::decode_attach_request(&attach_line)
        .ok()
        .and_then(|req| auth::resolve_token(&state.db, &req.token).ok().flatten())
    {
        Some(user_id) => user_id,
        None => {
            let frame = ServerFrame::Error {
                code: ErrorCode::Unauthorized,
                message: "invalid session token".into(),
            };
            write_line(&mut write_half, &wire::encode_server_frame(&frame)?).await?;
            return Ok(());
        }
    };

    write_line(
        &mut write_half,
        &wire::encode_attach_ack(&AttachAck { user_id })?,
    )
    .await?;
    tracing::info!(user = %user_id, peer = %peer, "connection attached");

    // Drain the backlog before this connection sees any new traffic.
    let backlog = messages::undelivered(&state.db, user_id)?;
    let mut drained = HashSet::with_capacity(backlog.len());
    for message in &backlog {
        drained.insert(message.id);
        write_line(
            &mut write_half,
            &wire::encode_server_frame(&message_frame(message))?,
        )
        .await?;
    }
    if !backlog.is_empty() {
        tracing::debug!(user = %user_id, count = backlog.len(), "backlog drained");
    }

    // Register for live delivery (latest wins).
    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);
    let close = CloseSignal::new();
    let (connection_id, replaced) = state
        .registry
        .register(user_id, outbound_tx, close.clone());
    if let Some(old) = replaced {
        tracing::info!(user = %user_id, "closing previous connection (latest wins)");
        old.close(ErrorCode::Replaced);
    }

    // The registry entry must come down with this task, whatever happens
    // inside the attached phase.
    let result = attached_loop(
        &state,
        user_id,
        drained,
        &mut lines,
        &mut write_half,
        outbound_rx,
        &close,
    )
    .await;

    state.registry.remove(user_id, connection_id);
    tracing::info!(user = %user_id, "connection closed");
    result
}

async fn attached_loop(
    state: &Arc<RelayState>,
    user_id: UserId,
    drained: HashSet<chai_protocol::MessageId>,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write_half: &mut OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
    close: &CloseSignal,
) -> Result<()> {
    // Anything persisted between the drain query and registration.
    for message in messages::undelivered(&state.db, user_id)? {
        if !drained.contains(&message.id) {
            write_line(
                write_half,
                &wire::encode_server_frame(&message_frame(&message))?,
            )
            .await?;
        }
    }
    drop(drained);

    let mut liveness = tokio::time::interval(LIVENESS_CHECK);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        last_activity = Instant::now();
                        if let Err(e) = dispatch(state, user_id, &line, write_half).await {
                            match e {
                                RelayError::Io(e) => return Err(e.into()),
                                e => {
                                    tracing::debug!(user = %user_id, error = %e, "frame rejected");
                                    let frame = ServerFrame::Error {
                                        code: e.error_code(),
                                        message: surface_message(&e),
                                    };
                                    write_line(
                                        write_half,
                                        &wire::encode_server_frame(&frame)?,
                                    )
                                    .await?;
                                }
                            }
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        write_line(write_half, &wire::encode_server_frame(&frame)?).await?;
                    }
                    None => return Ok(()),
                }
            }
            _ = close.notified() => {
                let code = close.reason().unwrap_or(ErrorCode::Internal);
                let frame = ServerFrame::Error {
                    code,
                    message: close_message(code).into(),
                };
                // Best effort: the socket may already be wedged.
                if let Ok(encoded) = wire::encode_server_frame(&frame) {
                    let _ = write_line(write_half, &encoded).await;
                }
                return Ok(());
            }
            _ = liveness.tick() => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    tracing::debug!(user = %user_id, "idle past liveness window");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle one client frame. Errors bubble to the caller, which reports
/// them on an `Error` frame without dropping the connection.
async fn dispatch(
    state: &Arc<RelayState>,
    user_id: UserId,
    line: &str,
    write_half: &mut OwnedWriteHalf,
) -> Result<()> {
    let frame = wire::decode_client_frame(line)?;
    match frame {
        ClientFrame::Ping => {
            write_line(write_half, &wire::encode_server_frame(&ServerFrame::Pong)?).await?;
        }

        ClientFrame::SendMessage {
            recipient_id,
            ciphertext,
            message_type,
        } => {
            handle_send_message(state, user_id, recipient_id, ciphertext, message_type, write_half)
                .await?;
        }

        ClientFrame::GetPrekeyBundle { user_id: target } => {
            handle_get_prekey_bundle(state, target, write_half).await?;
        }

        ClientFrame::AckMessages { message_ids } => {
            let marked = messages::mark_delivered(
                &state.db,
                user_id,
                &message_ids,
                state.clock.now_millis(),
            )?;
            tracing::debug!(
                user = %user_id,
                acked = message_ids.len(),
                marked,
                "messages acknowledged"
            );
        }

        ClientFrame::UploadPrekeys {
            bundle,
            one_time_prekeys,
        } => {
            handle_upload_prekeys(state, user_id, bundle, one_time_prekeys)?;
        }
    }
    Ok(())
}

async fn handle_send_message(
    state: &Arc<RelayState>,
    sender_id: UserId,
    recipient_id: UserId,
    ciphertext: Vec<u8>,
    message_type: MessageType,
    write_half: &mut OwnedWriteHalf,
) -> Result<()> {
    let created_at = state.clock.now_millis();
    let message_id = messages::store(
        &state.db,
        sender_id,
        recipient_id,
        &ciphertext,
        message_type.as_i64(),
        created_at,
    )?;

    // Persisted is the contract; delivery is tracked separately via acks.
    write_line(
        write_half,
        &wire::encode_server_frame(&ServerFrame::MessageSent { message_id })?,
    )
    .await?;

    let delivery = state.registry.deliver(
        recipient_id,
        ServerFrame::Message {
            id: message_id,
            sender_id,
            ciphertext,
            message_type,
            created_at,
        },
    );
    if delivery == Delivery::Overflow {
        tracing::warn!(
            recipient = %recipient_id,
            "recipient outbound queue overflowed, connection closed"
        );
    }
    Ok(())
}

async fn handle_get_prekey_bundle(
    state: &Arc<RelayState>,
    target: UserId,
    write_half: &mut OwnedWriteHalf,
) -> Result<()> {
    let bundle = prekeys::fetch_bundle(&state.db, target)?;

    if bundle.is_some() {
        let remaining = prekeys::remaining_one_time_prekeys(&state.db, target)?;
        if remaining < prekeys::LOW_WATERMARK {
            // Nudge the owner to replenish while they are online.
            state.registry.deliver(
                target,
                ServerFrame::LowPrekeys {
                    remaining: remaining as u32,
                },
            );
        }
    }

    write_line(
        write_half,
        &wire::encode_server_frame(&ServerFrame::PrekeyBundle {
            user_id: target,
            bundle,
        })?,
    )
    .await?;
    Ok(())
}

fn handle_upload_prekeys(
    state: &Arc<RelayState>,
    user_id: UserId,
    bundle: PrekeyBundleData,
    one_time_prekeys: Vec<OneTimePrekeyUpload>,
) -> Result<()> {
    let otps: Vec<(u32, Vec<u8>)> = one_time_prekeys
        .into_iter()
        .map(|p| (p.id, p.key))
        .collect();
    prekeys::publish_bundle(&state.db, user_id, &bundle, &otps, state.clock.now_millis())?;
    tracing::info!(
        user = %user_id,
        signed_prekey_id = bundle.signed_prekey_id,
        otps = otps.len(),
        "prekeys published"
    );
    Ok(())
}

fn message_frame(message: &messages::StoredMessage) -> ServerFrame {
    ServerFrame::Message {
        id: message.id,
        sender_id: message.sender_id,
        ciphertext: message.ciphertext.clone(),
        message_type: MessageType::from_i64(message.message_type).unwrap_or(MessageType::Normal),
        created_at: message.created_at,
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

/// Wire-safe rendering of a relay error. Storage and transport detail stays
/// in the logs.
fn surface_message(e: &RelayError) -> String {
    match e {
        RelayError::Storage(_) | RelayError::Io(_) => "internal error".into(),
        e => e.to_string(),
    }
}

fn close_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Replaced => "connection replaced by a newer attach",
        ErrorCode::Backpressure => "outbound queue overflow",
        _ => "connection closed",
    }
}
