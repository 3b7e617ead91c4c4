//! labterm daemon
//!
//! Serves interactive shells inside lab containers to remote terminal clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_socket_path, pid_file_path, read_pid, IpcClient, IpcResponse, IpcSessionInfo};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::runtime::{ContainerRuntime, DockerRuntime, LocalRuntime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// labterm - terminal sessions into lab containers.
#[derive(Parser, Debug)]
#[command(name = "labterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Run shells on this host instead of inside containers
        #[arg(long)]
        local: bool,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage terminal sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Manage lab rooms
    #[command(subcommand)]
    Rooms(RoomsCommands),

    /// List configured labs and their roles
    Labs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Tear down one session
    Kill {
        /// Session (connection) id
        session_id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum RoomsCommands {
    /// Tear down every session in a room
    Stop {
        /// Room name
        room: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let file_logging = matches!(cli.command, Commands::Start { .. });
    let _log_guard = init_tracing(&config, cli.verbose, file_logging)?;

    match cli.command {
        Commands::Start { local } => run_daemon(config, local).await?,
        Commands::Stop { force, timeout } => {
            let pid_path = pid_file_path(&config.daemon.data_dir);
            let result = if force {
                force_stop_daemon(&pid_path)
            } else {
                graceful_stop_daemon(timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {}", e);
                    if !force {
                        eprintln!("Try: labterm stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => match connect().await?.status().await? {
            IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                client_count,
            } => {
                println!(
                    "Daemon Status: {}",
                    if running { "running" } else { "shutting down" }
                );
                println!("  Uptime:   {}", format_duration(uptime_secs));
                println!("  Sessions: {}", session_count);
                println!("  Clients:  {}", client_count);
            }
            other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
        },
        Commands::Sessions(SessionsCommands::List { json }) => {
            let sessions = connect().await?.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions);
            }
        }
        Commands::Sessions(SessionsCommands::Kill { session_id }) => {
            let killed = connect().await?.kill_session(&session_id).await?;
            println!("Session {} terminated", killed);
        }
        Commands::Rooms(RoomsCommands::Stop { room }) => {
            let closed = connect().await?.stop_room(&room).await?;
            println!("Room {}: {} session(s) closed", room, closed);
        }
        Commands::Labs => print_labs(&config),
    }

    Ok(())
}

/// Installs the global subscriber. Returns the guard that flushes the
/// file writer; keep it alive for the life of the process.
fn init_tracing(
    config: &Config,
    verbose: bool,
    file_logging: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match (&config.daemon.log_dir, file_logging) {
        (Some(dir), true) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "labterm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run_daemon(config: Config, local: bool) -> anyhow::Result<()> {
    let pid_path = pid_file_path(&config.daemon.data_dir);
    if let Some(pid) = read_pid(&pid_path) {
        eprintln!("Error: Daemon already running (PID: {})", pid);
        eprintln!();
        eprintln!("To stop the existing daemon, run:");
        eprintln!("  labterm stop");
        std::process::exit(1);
    }

    let runtime: Arc<dyn ContainerRuntime> = if local {
        tracing::warn!("Local mode: shells run on this host, not in containers");
        Arc::new(LocalRuntime::new())
    } else {
        Arc::new(
            DockerRuntime::new(
                &config.runtime.docker_binary,
                config.runtime.auto_start,
                config.runtime.container_names.clone(),
            )?
            .with_command_timeout(config.runtime.command_timeout()),
        )
    };

    let mut orchestrator = DaemonOrchestrator::new(config, runtime)?
        .with_socket_path(get_socket_path())
        .with_pid_file(pid_path);
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionsClosed { count } => {
                    tracing::info!("Closed {} session(s)", count);
                }
            }
        }
    });

    if let Some(addr) = orchestrator.local_addr() {
        println!("labterm listening on ws://{}", addr);
    }

    tokio::select! {
        signal = wait_for_shutdown_signal() => signal?,
        _ = orchestrator.stop_requested() => {
            tracing::info!("Stop requested by CLI");
        }
    }

    orchestrator.stop().await
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn connect() -> anyhow::Result<IpcClient> {
    let socket_path = get_socket_path();
    IpcClient::connect(&socket_path).await.map_err(|e| {
        anyhow::anyhow!(
            "Daemon is not running (cannot connect to {}): {}",
            socket_path.display(),
            e
        )
    })
}

/// Asks the daemon to stop and waits for its socket to disappear.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await? {
        IpcResponse::Stopping => println!("Shutdown acknowledged, waiting for daemon to exit..."),
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if !socket_path.exists() {
            return Ok(());
        }
        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Kills the daemon with SIGKILL and removes the files it left behind.
fn force_stop_daemon(pid_path: &std::path::Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = read_pid(pid_path)
        .ok_or_else(|| anyhow::anyhow!("No running daemon found ({})", pid_path.display()))?;
    let raw = i32::try_from(pid)?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(pid_path);
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_w = column_width(sessions.iter().map(|s| s.session_id.len()), 10);
    let room_w = column_width(sessions.iter().map(|s| s.room.len()), 4);
    let role_w = column_width(sessions.iter().map(|s| s.role.len()), 4);
    let cont_w = column_width(sessions.iter().map(|s| s.container.len()), 9);

    println!(
        "{:<id_w$}  {:<room_w$}  {:<role_w$}  {:<cont_w$}  {:<8}  {:>8}",
        "SESSION", "ROOM", "ROLE", "CONTAINER", "STATUS", "STARTED",
    );
    println!("{}", "-".repeat(id_w + room_w + role_w + cont_w + 28));

    for s in sessions {
        println!(
            "{:<id_w$}  {:<room_w$}  {:<role_w$}  {:<cont_w$}  {:<8}  {:>8}",
            s.session_id,
            s.room,
            s.role,
            s.container,
            s.status.to_string(),
            format_relative_time(s.created_at),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn column_width(lengths: impl Iterator<Item = usize>, min: usize) -> usize {
    lengths.max().unwrap_or(min).max(min)
}

fn print_labs(config: &Config) {
    if config.labs.is_empty() {
        println!("No labs configured.");
        return;
    }
    for (name, lab) in &config.labs {
        println!("{} - {}", name, lab.description);
        for role in &lab.roles {
            println!("  {:<12} {}", role, config.container_name(role, name));
        }
    }
}

/// Formats a Unix timestamp relative to now ("5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
