//! # labterm Daemon Library
//!
//! Terminal session manager for lab containers. Remote clients open
//! interactive shells inside running containers and drive them over a
//! persistent WebSocket channel; every connected member of a lab room sees
//! the output of every shell in that room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌────────────────┐   ┌───────────────┐   │
//! │  │   Gateway    │──▶│ Message Router │──▶│   Lifecycle   │   │
//! │  │ (WebSocket)  │   └────────────────┘   │  Controller   │   │
//! │  └──────▲───────┘                        └───────┬───────┘   │
//! │         │                                        │           │
//! │  ┌──────┴───────┐   ┌────────────────┐   ┌───────▼───────┐   │
//! │  │    Output    │◀──│   PTY Bridge   │◀──│   Session     │   │
//! │  │    Router    │   │ (reader thread)│   │   Registry    │   │
//! │  └──────────────┘   └───────┬────────┘   └───────────────┘   │
//! │                             │                                │
//! │                     ┌───────▼────────┐   ┌───────────────┐   │
//! │                     │   Container    │   │  IPC control  │   │
//! │                     │    Runtime     │   │    socket     │   │
//! │                     └────────────────┘   └───────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use daemon::{Config, DaemonOrchestrator, DockerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let runtime = DockerRuntime::new(
//!         &config.runtime.docker_binary,
//!         config.runtime.auto_start,
//!         config.runtime.container_names.clone(),
//!     )?
//!     .with_command_timeout(config.runtime.command_timeout());
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config, Arc::new(runtime))?;
//!     orchestrator.start().await?;
//!     orchestrator.stop_requested().await;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration, env overrides and validation
//! - [`runtime`]: Container runtime (docker, or local shells for development)
//! - [`session`]: PTY bridges, registry, output fan-out and lifecycle
//! - [`router`]: Inbound event dispatch
//! - [`gateway`]: WebSocket transport
//! - [`ipc`]: CLI control socket
//! - [`orchestrator`]: Wiring and graceful shutdown

pub mod config;
pub mod gateway;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod runtime;
pub mod session;

pub use labterm_protocol as protocol;

pub use config::Config;

pub use runtime::{ContainerHandle, ContainerRuntime, DockerRuntime, LocalRuntime, RuntimeError};

pub use session::{
    LabError, LifecycleController, OutputRouter, PtyBridge, PtyError, Session, SessionId,
    SessionLifecycle, SessionRegistry, SessionStatus,
};

pub use router::{MessageRouter, RouterError, RouterResult};

pub use gateway::{Gateway, GatewayError};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
