//! Listening side of the control socket.

use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Control socket listener.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Binds the socket, creating parent directories and replacing a stale
    /// socket file. The socket is made accessible to its owner only.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self { listener })
    }

    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// One accepted CLI connection.
pub struct IpcConnection {
    lines: LineChannel,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        Self {
            lines: LineChannel::new(stream),
        }
    }

    /// Reads the next request. `None` means the client hung up.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.lines.recv().await
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.lines.send(response).await
    }
}

/// Newline-delimited JSON over a Unix stream.
pub(super) struct LineChannel {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
}

impl LineChannel {
    pub(super) fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub(super) async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(message)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub(super) async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }
}

/// Control channel errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(IpcResponse),
}
