//! WebSocket signaling server

use crate::hub::Outlet;
use crate::protocol::{ClientMessage, Envelope, ServerEnvelope, ServerMessage};
use crate::relay::{RelayOutcome, SignalingRelay};
use classcast_core::{ClassroomError, ConnectionKey, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Signaling server: one WebSocket per participant connection
#[derive(Debug, Clone)]
pub struct SignalingServer {
    /// Address the server binds to
    pub bind_addr: SocketAddr,
    relay: Arc<SignalingRelay>,
    outbound_buffer: usize,
}

impl SignalingServer {
    /// Create new signaling server
    pub fn new(bind_addr: SocketAddr, relay: Arc<SignalingRelay>) -> Self {
        // The registry may hold an unvalidated config; channels need capacity > 0
        let outbound_buffer = relay.registry().config().session.outbound_buffer.max(1);
        Self {
            bind_addr,
            relay,
            outbound_buffer,
        }
    }

    /// Relay behind this server
    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    /// Bind and serve until the task is cancelled
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            ClassroomError::ServerStartFailed {
                address: self.bind_addr,
                source: e.into(),
            }
        })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().unwrap_or(self.bind_addr);
        tracing::info!("Signaling server listening on {}", local);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Drive one WebSocket until it closes
    pub async fn handle_connection(&self, stream: TcpStream) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut sink, mut source) = ws_stream.split();
        let (outlet, mut outbound) = mpsc::channel::<ServerEnvelope>(self.outbound_buffer);

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!("Failed to write to socket: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut joined: Option<ConnectionKey> = None;
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => self.dispatch(envelope, &outlet, &mut joined),
                    Err(e) => {
                        tracing::warn!("Invalid message format: {}", e);
                        let error = ClassroomError::InvalidMessage {
                            message: text,
                            source: e.into(),
                        };
                        let session_id = joined
                            .as_ref()
                            .map(|k| k.session_id.clone())
                            .unwrap_or_else(|| "".into());
                        reply(&outlet, ServerEnvelope::direct(session_id, ServerMessage::rejected(&error, None)));
                    }
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    if let Some(key) = &joined {
                        self.relay.heartbeat(key);
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::debug!("Connection closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        if let Some(key) = joined.take() {
            self.relay.disconnect(&key);
        }
        drop(outlet);
        if let Err(e) = writer.await {
            tracing::debug!("Writer task ended abnormally: {}", e);
        }
    }

    fn dispatch(&self, envelope: Envelope, outlet: &Outlet, joined: &mut Option<ConnectionKey>) {
        let seq = envelope.seq;
        let session_id = envelope.session_id.clone();

        // A socket speaks for exactly one participant
        let identity_error = match joined.as_ref() {
            Some(key)
                if key.session_id != envelope.session_id
                    || key.participant_id != envelope.sender =>
            {
                Some(ClassroomError::InvalidState {
                    expected: format!("messages from {}", key),
                    actual: format!("{}/{}", envelope.session_id, envelope.sender),
                })
            }
            None if !matches!(envelope.message, ClientMessage::Join { .. }) => {
                Some(ClassroomError::InvalidState {
                    expected: "join".to_string(),
                    actual: envelope.message.kind().to_string(),
                })
            }
            _ => None,
        };
        if let Some(error) = identity_error {
            tracing::warn!("Rejecting message #{}: {}", seq, error);
            reply(outlet, ServerEnvelope::direct(session_id, ServerMessage::rejected(&error, Some(seq))));
            return;
        }

        match self.relay.route(envelope, outlet) {
            Ok(RelayOutcome::Joined(key)) => *joined = Some(key),
            Ok(RelayOutcome::Left) => *joined = None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Rejecting message #{} in session {}: {}", seq, session_id, e);
                reply(outlet, ServerEnvelope::direct(session_id, ServerMessage::rejected(&e, Some(seq))));
            }
        }
    }
}

fn reply(outlet: &Outlet, envelope: ServerEnvelope) {
    if let Err(e) = outlet.try_send(envelope) {
        tracing::debug!("Dropping direct reply: {}", e);
    }
}
