//! CLI side of the control socket.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse, IpcSessionInfo};
use super::server::{IpcError, LineChannel};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response client for a running daemon.
pub struct IpcClient {
    lines: LineChannel,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to the daemon. Fails if nothing is listening at `path`.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        Ok(Self {
            lines: LineChannel::new(stream),
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends one request and waits for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, async {
            self.lines.send(&request).await?;
            self.lines.recv::<IpcResponse>().await?.ok_or_else(|| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed connection",
                ))
            })
        })
        .await
        .map_err(|_| timed_out("operation timed out"))?
    }

    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcRequest::Ping).await?, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        expect_ok(self.send(IpcRequest::Status).await?)
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        expect_ok(self.send(IpcRequest::Stop).await?)
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<IpcSessionInfo>, IpcError> {
        match expect_ok(self.send(IpcRequest::ListSessions).await?)? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(IpcError::UnexpectedResponse(other)),
        }
    }

    /// Tears down one session. Returns the id the daemon acknowledged.
    pub async fn kill_session(&mut self, session_id: &str) -> Result<String, IpcError> {
        let request = IpcRequest::KillSession {
            session_id: session_id.to_string(),
        };
        match expect_ok(self.send(request).await?)? {
            IpcResponse::SessionKilled { session_id } => Ok(session_id),
            other => Err(IpcError::UnexpectedResponse(other)),
        }
    }

    /// Tears down a room. Returns how many sessions were closed.
    pub async fn stop_room(&mut self, room: &str) -> Result<usize, IpcError> {
        let request = IpcRequest::StopRoom {
            room: room.to_string(),
        };
        match expect_ok(self.send(request).await?)? {
            IpcResponse::RoomStopped {
                sessions_closed, ..
            } => Ok(sessions_closed),
            other => Err(IpcError::UnexpectedResponse(other)),
        }
    }
}

fn expect_ok(response: IpcResponse) -> Result<IpcResponse, IpcError> {
    match response {
        IpcResponse::Error { message } => Err(IpcError::Daemon(message)),
        other => Ok(other),
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}
