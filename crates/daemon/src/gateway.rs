//! WebSocket gateway carrying the client event contract.
//!
//! Every accepted connection gets a fresh session id and an output channel in
//! the [`OutputRouter`](crate::session::OutputRouter). Text frames carry JSON,
//! binary frames carry MessagePack; events sent back use the format of the
//! most recent inbound frame.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use labterm_protocol::{decode, encode, ClientEvent, ProtocolError, ServerEvent, WireFormat};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::router::MessageRouter;
use crate::session::LifecycleController;

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Accepts WebSocket clients and feeds their events to the router.
pub struct Gateway {
    router: Arc<MessageRouter<LifecycleController>>,
    max_message_size: usize,
}

impl Gateway {
    pub fn new(router: Arc<MessageRouter<LifecycleController>>, max_message_size: usize) -> Self {
        Self {
            router,
            max_message_size,
        }
    }

    /// Binds the listening socket.
    pub async fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), GatewayError> {
        tracing::info!(addr = %listener.local_addr()?, "Gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Gateway shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&self);
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            gateway.handle_connection(stream, peer, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let output = Arc::clone(self.router.output());
        let mut events = output.register_client(&session_id);
        tracing::info!(session_id = %session_id, peer = %peer, "Client connected");

        let (mut sink, mut frames) = ws.split();
        let mut format = WireFormat::Json;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
                Some(event) = events.recv() => {
                    if let Err(e) = send_event(&mut sink, &event, format).await {
                        tracing::debug!(session_id = %session_id, error = %e, "Send failed");
                        break;
                    }
                }
                frame = frames.next() => {
                    let (payload, frame_format) = match frame {
                        Some(Ok(WsMessage::Text(text))) => (text.into_bytes(), WireFormat::Json),
                        Some(Ok(WsMessage::Binary(data))) => (data, WireFormat::MessagePack),
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(session_id = %session_id, error = %e, "WebSocket error");
                            break;
                        }
                    };
                    format = frame_format;

                    let Some(event) = self.decode_frame(&session_id, &payload, format) else {
                        continue;
                    };
                    if let Some(reply) = self.router.dispatch(&session_id, event).await {
                        if let Err(e) = send_event(&mut sink, &reply, format).await {
                            tracing::debug!(session_id = %session_id, error = %e, "Send failed");
                            break;
                        }
                    }
                }
            }
        }

        self.router.handle_disconnect(&session_id).await;
    }

    fn decode_frame(&self, session_id: &str, payload: &[u8], format: WireFormat) -> Option<ClientEvent> {
        if payload.len() > self.max_message_size {
            tracing::warn!(
                session_id = %session_id,
                size = payload.len(),
                max = self.max_message_size,
                "Dropping oversized frame"
            );
            return None;
        }
        match decode::<ClientEvent>(payload, format) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Dropping undecodable frame");
                None
            }
        }
    }
}

/// Encodes an event as a WebSocket frame of the given format.
pub fn to_frame(event: &ServerEvent, format: WireFormat) -> Result<WsMessage, ProtocolError> {
    let bytes = encode(event, format)?;
    match format {
        WireFormat::Json => String::from_utf8(bytes)
            .map(WsMessage::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string())),
        WireFormat::MessagePack => Ok(WsMessage::Binary(bytes)),
    }
}

async fn send_event(sink: &mut WsSink, event: &ServerEvent, format: WireFormat) -> anyhow::Result<()> {
    let frame = to_frame(event, format)?;
    sink.send(frame).await?;
    Ok(())
}
