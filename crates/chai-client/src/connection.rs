//! Frame transport to the relay: TCP, newline-delimited JSON, with an
//! attach handshake up front.

use chai_protocol::{wire, AttachRequest, ClientFrame, ServerFrame, UserId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};

const CHANNEL_CAPACITY: usize = 100;

/// An attached relay connection.
///
/// Reader and writer tasks own the socket halves; the connection is just a
/// pair of channels. Dropping it tears both tasks down.
pub struct Connection {
    user_id: UserId,
    outgoing: mpsc::Sender<ClientFrame>,
    incoming: mpsc::Receiver<ServerFrame>,
}

impl Connection {
    /// Connect and attach with a session token.
    pub async fn attach(addr: &str, token: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let request = wire::encode_attach_request(&AttachRequest {
            token: token.to_string(),
        })?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;

        let first = lines
            .next_line()
            .await?
            .ok_or_else(|| ClientError::AttachFailed("connection closed during attach".into()))?;

        let user_id = match wire::decode_attach_ack(&first) {
            Ok(ack) => ack.user_id,
            Err(_) => {
                // The relay answers a bad attach with an Error frame.
                let reason = match wire::decode_server_frame(&first) {
                    Ok(ServerFrame::Error { message, .. }) => message,
                    _ => "unrecognized attach response".into(),
                };
                return Err(ClientError::AttachFailed(reason));
            }
        };

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientFrame>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerFrame>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let encoded = match wire::encode_client_frame(&frame) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if write_half.write_all(encoded.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match wire::decode_server_frame(&line) {
                        Ok(frame) => {
                            if incoming_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable server frame");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "relay read error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            user_id,
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Queue a frame for the relay.
    pub async fn send(&self, frame: ClientFrame) -> Result<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Next frame from the relay; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.incoming.recv().await
    }
}
