//! Unix domain socket control channel between the CLI and the daemon.
//!
//! Messages are newline-delimited JSON: one request per line, one response
//! per line.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/labterm/daemon.sock`
//! - Fallback: `/tmp/labterm-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     for session in client.list_sessions().await? {
//!         println!("{} {} {}", session.session_id, session.room, session.role);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{pid_file_path, read_pid};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Directory name used under the runtime dir for the socket.
pub const RUNTIME_DIR_NAME: &str = "labterm";

/// Returns the per-user runtime directory for the control socket.
#[cfg(unix)]
pub fn runtime_dir() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join(RUNTIME_DIR_NAME)
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);
        PathBuf::from(format!("/tmp/{}-{}", RUNTIME_DIR_NAME, uid))
    }
}

/// Path of the daemon's control socket.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    runtime_dir().join("daemon.sock")
}
