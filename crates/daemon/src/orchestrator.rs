//! Daemon orchestrator wiring the subsystems together.
//!
//! Owns the output router, the lifecycle controller and the message router,
//! and runs the two listeners: the WebSocket gateway for terminal clients and
//! the control socket for the CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::ipc::pidfile::{remove_pid_file, write_pid_file};
use crate::ipc::{IpcConnection, IpcRequest, IpcResponse, IpcServer, IpcSessionInfo};
use crate::router::MessageRouter;
use crate::runtime::ContainerRuntime;
use crate::session::{LifecycleController, OutputRouter, SessionLifecycle};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// Sessions were torn down by a control request or shutdown.
    SessionsClosed { count: usize },
}

/// Runs the daemon.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    output: Arc<OutputRouter>,
    controller: Arc<LifecycleController>,
    router: Arc<MessageRouter<LifecycleController>>,
    socket_path: Option<PathBuf>,
    pid_path: Option<PathBuf>,
    local_addr: Option<SocketAddr>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let output = Arc::new(OutputRouter::new(config.session.client_buffer));
        let controller = LifecycleController::new(
            runtime,
            Arc::clone(&output),
            config.session.lifecycle_options(),
        );
        let router = Arc::new(
            MessageRouter::new(Arc::clone(&controller), Arc::clone(&output)).with_default_size(
                config.session.default_rows,
                config.session.default_cols,
            ),
        );
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            output,
            controller,
            router,
            socket_path: None,
            pid_path: None,
            local_addr: None,
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Serve the control socket at `path` once started.
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Write a PID file at `path` once started.
    pub fn with_pid_file(mut self, path: PathBuf) -> Self {
        self.pid_path = Some(path);
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Address the gateway is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn router(&self) -> &Arc<MessageRouter<LifecycleController>> {
        &self.router
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Resolves when a client asks the daemon to stop over the control socket.
    pub async fn stop_requested(&self) {
        self.stop_requested.cancelled().await
    }

    /// Binds the listeners and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));
        info!("Starting daemon orchestrator...");

        self.controller.start_exit_watcher();

        let listener = Gateway::bind(&self.config.gateway.listen_addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&self.router),
            self.config.gateway.max_message_size,
        ));
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.serve(listener, token).await {
                warn!("Gateway stopped with error: {}", e);
            }
        });

        if let Some(path) = &self.socket_path {
            let server = IpcServer::bind(path)
                .await
                .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
            debug!("Control socket at {}", path.display());
            tokio::spawn(Self::ipc_loop(server, self.ipc_context()));
        }

        if let Some(path) = &self.pid_path {
            write_pid_file(path)
                .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = ?self.local_addr, "Daemon orchestrator started");
        Ok(())
    }

    /// Stops listening and tears down every session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));
        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let closed = self.controller.shutdown().await;
        self.emit_event(OrchestratorEvent::SessionsClosed { count: closed });

        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Control socket already gone: {}", e);
            }
        }
        if let Some(path) = &self.pid_path {
            remove_pid_file(path);
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn ipc_context(&self) -> IpcContext {
        IpcContext {
            controller: Arc::clone(&self.controller),
            output: Arc::clone(&self.output),
            started_at: self.started_at,
            shutdown: self.shutdown_token.clone(),
            stop_requested: self.stop_requested.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    async fn ipc_loop(server: IpcServer, ctx: IpcContext) {
        let ctx = Arc::new(ctx);
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(Self::serve_ipc_connection(conn, Arc::clone(&ctx)));
                    }
                    Err(e) => warn!("Control socket accept failed: {}", e),
                },
            }
        }
        debug!("Control socket loop stopped");
    }

    async fn serve_ipc_connection(mut conn: IpcConnection, ctx: Arc<IpcContext>) {
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    let reply = IpcResponse::Error {
                        message: e.to_string(),
                    };
                    let _ = conn.send_response(&reply).await;
                    break;
                }
            };
            let response = ctx.handle(request).await;
            if conn.send_response(&response).await.is_err() {
                break;
            }
        }
    }
}

/// Shared state for control socket handlers.
struct IpcContext {
    controller: Arc<LifecycleController>,
    output: Arc<OutputRouter>,
    started_at: Instant,
    shutdown: CancellationToken,
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl IpcContext {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        debug!(?request, "Control request");
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.controller.is_shutting_down(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.controller.session_count(),
                client_count: self.output.client_count(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => {
                let mut sessions: Vec<IpcSessionInfo> = self
                    .controller
                    .list_sessions()
                    .iter()
                    .map(IpcSessionInfo::from)
                    .collect();
                sessions.sort_by(|a, b| (&a.room, &a.role).cmp(&(&b.room, &b.role)));
                IpcResponse::Sessions { sessions }
            }
            IpcRequest::KillSession { session_id } => {
                if self.controller.cleanup_session(&session_id).await {
                    let _ = self.event_tx.send(OrchestratorEvent::SessionsClosed { count: 1 });
                    IpcResponse::SessionKilled { session_id }
                } else {
                    IpcResponse::Error {
                        message: format!("session not found: {}", session_id),
                    }
                }
            }
            IpcRequest::StopRoom { room } => {
                let sessions_closed = self.controller.cleanup_room(&room).await;
                if sessions_closed > 0 {
                    let _ = self.event_tx.send(OrchestratorEvent::SessionsClosed {
                        count: sessions_closed,
                    });
                }
                IpcResponse::RoomStopped {
                    room,
                    sessions_closed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use crate::runtime::LocalRuntime;
    use crate::session::SessionRequest;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.gateway.listen_addr = "127.0.0.1:0".to_string();
        config.session.shell = vec!["/bin/sh".to_string()];
        config
    }

    fn orchestrator(temp_dir: &TempDir) -> DaemonOrchestrator {
        DaemonOrchestrator::new(test_config(temp_dir), Arc::new(LocalRuntime::new()))
            .unwrap()
            .with_socket_path(temp_dir.path().join("daemon.sock"))
            .with_pid_file(temp_dir.path().join("daemon.pid"))
    }

    fn request(session_id: &str, role: &str, room: &str) -> SessionRequest {
        SessionRequest {
            session_id: session_id.to_string(),
            container_ref: format!("{}-{}", role, room),
            role: role.to_string(),
            room: room.to_string(),
            rows: 24,
            cols: 80,
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.session.max_sessions = 0;
        assert!(DaemonOrchestrator::new(config, Arc::new(LocalRuntime::new())).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&temp_dir);
        let mut events = orchestrator.subscribe();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());
        assert!(temp_dir.path().join("daemon.sock").exists());
        assert!(temp_dir.path().join("daemon.pid").exists());
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!temp_dir.path().join("daemon.sock").exists());
        assert!(!temp_dir.path().join("daemon.pid").exists());

        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::StateChanged(OrchestratorState::Starting)
        ));
    }

    #[tokio::test]
    async fn test_control_socket_session_management() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();

        let controller = Arc::clone(orchestrator.controller());
        controller.create_session(request("s1", "HostA", "arp")).await.unwrap();
        controller.create_session(request("s2", "HostB", "arp")).await.unwrap();
        controller.create_session(request("s3", "attacker", "sniff")).await.unwrap();

        let mut client = IpcClient::connect(&temp_dir.path().join("daemon.sock"))
            .await
            .unwrap();
        assert!(client.ping().await.unwrap());

        let sessions = client.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].room, "arp");

        assert_eq!(client.kill_session("s3").await.unwrap(), "s3");
        assert!(client.kill_session("s3").await.is_err());

        assert_eq!(client.stop_room("arp").await.unwrap(), 2);
        assert_eq!(controller.session_count(), 0);

        match client.status().await.unwrap() {
            IpcResponse::Status {
                running,
                session_count,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_request_over_control_socket() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();

        let mut client = IpcClient::connect(&temp_dir.path().join("daemon.sock"))
            .await
            .unwrap();
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);

        tokio::time::timeout(std::time::Duration::from_secs(2), orchestrator.stop_requested())
            .await
            .unwrap();
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_tears_down_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();

        let controller = Arc::clone(orchestrator.controller());
        controller.create_session(request("s1", "HostA", "arp")).await.unwrap();

        orchestrator.stop().await.unwrap();
        assert_eq!(controller.session_count(), 0);
        assert!(controller.is_shutting_down());
    }
}
