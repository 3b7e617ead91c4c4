//! Control requests and responses exchanged over the IPC socket.

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionStatus};

/// Requests from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Liveness check.
    Ping,
    /// Daemon status summary.
    Status,
    /// Graceful shutdown.
    Stop,
    /// All live terminal sessions.
    ListSessions,
    /// Tear down one session.
    KillSession { session_id: String },
    /// Tear down every session in a room.
    StopRoom { room: String },
}

/// Responses from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    Pong,
    Status {
        running: bool,
        uptime_secs: u64,
        session_count: usize,
        /// Connected WebSocket clients.
        client_count: usize,
    },
    Stopping,
    Sessions {
        sessions: Vec<IpcSessionInfo>,
    },
    SessionKilled {
        session_id: String,
    },
    RoomStopped {
        room: String,
        sessions_closed: usize,
    },
    Error {
        message: String,
    },
}

/// A live session as reported to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub session_id: String,
    pub bridge_id: String,
    pub container: String,
    pub role: String,
    pub room: String,
    pub status: SessionStatus,
    /// Unix timestamp of session creation.
    pub created_at: u64,
}

impl From<&Session> for IpcSessionInfo {
    fn from(session: &Session) -> Self {
        let created_at = session
            .created_at
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            session_id: session.session_id.clone(),
            bridge_id: session.bridge_id.clone(),
            container: session.container_ref.clone(),
            role: session.role.clone(),
            room: session.room.clone(),
            status: session.status(),
            created_at,
        }
    }
}
