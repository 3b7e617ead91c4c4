//! Message router for dispatching client events to the session lifecycle.
//!
//! The router receives decoded [`ClientEvent`]s together with the id of the
//! connection that delivered them, validates them and calls the lifecycle.
//! Its return value is the direct reply for the connection, if any; output
//! addressed to rooms travels through the [`OutputRouter`].

use std::ops::RangeInclusive;
use std::sync::Arc;

use labterm_protocol::{
    ClientEvent, Ping, ServerEvent, SessionErrorEvent, SessionResize, StartSession,
    StartSessionReply, DEFAULT_COLS, DEFAULT_ROWS,
};
use tracing::{debug, info, warn};

use crate::session::{LabError, OutputRouter, SessionLifecycle, SessionRequest};

/// Accepted terminal heights.
pub const ROWS_RANGE: RangeInclusive<u16> = 1..=500;

/// Accepted terminal widths.
pub const COLS_RANGE: RangeInclusive<u16> = 1..=1000;

/// Result type for router operations.
pub type RouterResult = Result<Option<ServerEvent>, RouterError>;

/// Errors that can occur during event routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Lifecycle error.
    #[error(transparent)]
    Lab(#[from] LabError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Converts the error into a failed `start_session` reply.
    pub fn to_reply(&self) -> ServerEvent {
        ServerEvent::StartSessionReply(StartSessionReply::error(self.to_string()))
    }
}

/// Dispatches client events to a [`SessionLifecycle`].
pub struct MessageRouter<S: SessionLifecycle> {
    lifecycle: Arc<S>,
    output: Arc<OutputRouter>,
    default_size: (u16, u16),
}

impl<S: SessionLifecycle> MessageRouter<S> {
    /// Create a new message router with the given dependencies.
    pub fn new(lifecycle: Arc<S>, output: Arc<OutputRouter>) -> Self {
        Self {
            lifecycle,
            output,
            default_size: (DEFAULT_ROWS, DEFAULT_COLS),
        }
    }

    /// Terminal size used when a `start_session` request omits one.
    pub fn with_default_size(mut self, rows: u16, cols: u16) -> Self {
        self.default_size = (rows, cols);
        self
    }

    pub fn lifecycle(&self) -> &Arc<S> {
        &self.lifecycle
    }

    pub fn output(&self) -> &Arc<OutputRouter> {
        &self.output
    }

    /// Routes one event and returns the reply for the sending connection.
    ///
    /// Failed `start_session` requests are answered with an error reply;
    /// failures of fire-and-forget events are logged and produce no reply.
    pub async fn dispatch(&self, session_id: &str, event: ClientEvent) -> Option<ServerEvent> {
        let is_start = matches!(event, ClientEvent::StartSession(_));
        match self.route(session_id, event).await {
            Ok(reply) => reply,
            Err(e) if is_start => Some(e.to_reply()),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Dropping failed event");
                None
            }
        }
    }

    /// Routes one event.
    pub async fn route(&self, session_id: &str, event: ClientEvent) -> RouterResult {
        match event {
            ClientEvent::StartSession(start) => self.handle_start_session(session_id, start).await,
            ClientEvent::SessionInput(input) => {
                // Failures are reported to the room by the lifecycle.
                let _ = self.lifecycle.handle_input(session_id, &input.data).await;
                Ok(None)
            }
            ClientEvent::SessionResize(resize) => {
                self.handle_session_resize(session_id, resize).await
            }
            ClientEvent::StopSession => {
                info!(session_id = %session_id, "Stop requested by client");
                self.lifecycle.cleanup_session(session_id).await;
                Ok(None)
            }
            ClientEvent::Ping(ping) => Ok(Some(ServerEvent::Pong(Ping { nonce: ping.nonce }))),
        }
    }

    /// Tears down everything owned by a connection that went away.
    pub async fn handle_disconnect(&self, session_id: &str) {
        let cleaned = self.lifecycle.cleanup_session(session_id).await;
        if let Some(stats) = self.output.unregister_client(session_id) {
            debug!(
                session_id = %session_id,
                sent = stats.messages_sent,
                dropped = stats.messages_dropped,
                "Client output closed"
            );
        }
        info!(session_id = %session_id, cleaned, "Client disconnected");
    }

    async fn handle_start_session(&self, session_id: &str, start: StartSession) -> RouterResult {
        let rows = start.rows.unwrap_or(self.default_size.0);
        let cols = start.cols.unwrap_or(self.default_size.1);
        validate_start(&start.role, &start.room, rows, cols)?;

        let container_ref = start
            .container_ref
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.lifecycle.container_name(&start.role, &start.room));

        info!(
            session_id = %session_id,
            container = %container_ref,
            role = %start.role,
            room = %start.room,
            rows,
            cols,
            "Starting session"
        );

        let request = SessionRequest {
            session_id: session_id.to_string(),
            container_ref,
            role: start.role.clone(),
            room: start.room.clone(),
            rows,
            cols,
        };

        // Join first so the shell's first output is not missed.
        let previous_room = self.output.client_room(session_id);
        self.output.join_room(session_id, &start.room);

        match self.lifecycle.create_session(request).await {
            Ok(session) => Ok(Some(ServerEvent::StartSessionReply(StartSessionReply::ok(
                session.bridge_id,
            )))),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to start session");
                match previous_room {
                    Some(room) => {
                        self.output.join_room(session_id, &room);
                    }
                    None => self.output.leave_room(session_id),
                }
                self.output.send_to_room(
                    &start.room,
                    ServerEvent::SessionError(SessionErrorEvent {
                        role: start.role,
                        message: e.to_string(),
                    }),
                );
                Err(e.into())
            }
        }
    }

    async fn handle_session_resize(&self, session_id: &str, resize: SessionResize) -> RouterResult {
        validate_size(resize.rows, resize.cols)?;
        debug!(
            session_id = %session_id,
            rows = resize.rows,
            cols = resize.cols,
            "Resizing session"
        );
        self.lifecycle
            .handle_resize(session_id, resize.rows, resize.cols)
            .await?;
        Ok(None)
    }
}

fn validate_start(role: &str, room: &str, rows: u16, cols: u16) -> Result<(), RouterError> {
    if role.trim().is_empty() {
        return Err(RouterError::InvalidRequest("role must not be empty".to_string()));
    }
    if room.trim().is_empty() {
        return Err(RouterError::InvalidRequest("room must not be empty".to_string()));
    }
    validate_size(rows, cols)
}

fn validate_size(rows: u16, cols: u16) -> Result<(), RouterError> {
    if !ROWS_RANGE.contains(&rows) {
        return Err(RouterError::InvalidRequest(format!(
            "rows must be between {} and {}, got {}",
            ROWS_RANGE.start(),
            ROWS_RANGE.end(),
            rows
        )));
    }
    if !COLS_RANGE.contains(&cols) {
        return Err(RouterError::InvalidRequest(format!(
            "cols must be between {} and {}, got {}",
            COLS_RANGE.start(),
            COLS_RANGE.end(),
            cols
        )));
    }
    Ok(())
}
