//! Event definitions exchanged between terminal clients and the daemon.
//!
//! Inbound events never carry the session id: the session id of an inbound
//! event is the identity of the transport connection that delivered it.
//! Outbound events are addressed to a room by the daemon's output router.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Default terminal rows when neither the client nor the config sets one.
pub const DEFAULT_ROWS: u16 = 24;

/// Default terminal columns when neither the client nor the config sets one.
pub const DEFAULT_COLS: u16 = 80;

/// Events sent by a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Open a shell inside a container.
    StartSession(StartSession),
    /// Keystrokes for the session's shell.
    SessionInput(SessionInput),
    /// The client's terminal changed size.
    SessionResize(SessionResize),
    /// Explicitly end the session while keeping the connection.
    StopSession,
    /// Keepalive ping.
    Ping(Ping),
}

/// Request to open an interactive shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSession {
    /// Container reference. When absent it is derived from `role` and `room`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    /// Role inside the lab (e.g. `attacker`, `HostA`).
    pub role: String,
    /// Broadcast group for the session's output.
    pub room: String,
    /// Terminal rows. The daemon's configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Terminal columns. The daemon's configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

/// Raw input bytes for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    /// Bytes written verbatim to the terminal.
    pub data: Bytes,
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResize {
    /// New row count.
    pub rows: u16,
    /// New column count.
    pub cols: u16,
}

/// Keepalive ping carrying an opaque nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping {
    /// Echoed back in the pong.
    #[serde(default)]
    pub nonce: u64,
}

/// Outcome of a `start_session` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Events sent by the daemon to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Direct reply to a `start_session` request.
    StartSessionReply(StartSessionReply),
    /// Bytes read from a session's terminal, addressed to its room.
    SessionOutput(SessionOutput),
    /// Non-fatal per-session failure, addressed to the session's room.
    SessionError(SessionErrorEvent),
    /// A session's shell has gone away.
    SessionClosed(SessionClosed),
    /// Reply to a ping.
    Pong(Ping),
}

/// Reply to `start_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_id: Option<String>,
}

impl StartSessionReply {
    /// A successful reply for the given bridge.
    pub fn ok(bridge_id: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            message: None,
            bridge_id: Some(bridge_id.into()),
        }
    }

    /// A failed reply carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: Some(message.into()),
            bridge_id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// Terminal output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    /// Bridge that produced the bytes.
    pub bridge_id: String,
    /// Role of the session that owns the bridge.
    pub role: String,
    /// Raw terminal bytes.
    pub data: Bytes,
}

/// Per-session failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorEvent {
    pub role: String,
    pub message: String,
}

/// Notification that a bridge has been torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub bridge_id: String,
    pub role: String,
    pub reason: String,
}

impl ServerEvent {
    /// Returns the bridge id this event refers to, if any.
    pub fn bridge_id(&self) -> Option<&str> {
        match self {
            ServerEvent::SessionOutput(out) => Some(&out.bridge_id),
            ServerEvent::SessionClosed(closed) => Some(&closed.bridge_id),
            ServerEvent::StartSessionReply(reply) => reply.bridge_id.as_deref(),
            ServerEvent::SessionError(_) | ServerEvent::Pong(_) => None,
        }
    }
}
