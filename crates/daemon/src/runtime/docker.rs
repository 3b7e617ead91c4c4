//! Docker CLI backed container runtime.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use super::{ContainerHandle, ContainerRuntime, ProcessHandle, RuntimeError, ShellProcess};

/// Default bound on one docker command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to the Docker engine through the `docker` command line client.
pub struct DockerRuntime {
    binary: PathBuf,
    auto_start: bool,
    container_names: BTreeMap<String, String>,
    command_timeout: Duration,
}

impl DockerRuntime {
    /// Locates the docker binary on `PATH` (or uses it as given when it is a path).
    pub fn new(
        docker_binary: &str,
        auto_start: bool,
        container_names: BTreeMap<String, String>,
    ) -> Result<Self, RuntimeError> {
        let binary = which::which(docker_binary)
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", docker_binary, e)))?;

        tracing::debug!(binary = %binary.display(), auto_start, "Using docker runtime");

        Ok(Self {
            binary,
            auto_start,
            container_names,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Bounds every inspect, start and resize command. A command that runs
    /// longer is killed and reported as `Unavailable`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn binary_str(&self) -> String {
        self.binary.display().to_string()
    }

    fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.binary_str(), args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // These commands print a line or two, well within the pipe buffer.
        let status = match child.wait_timeout(self.command_timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    command = %command,
                    timeout_secs = self.command_timeout.as_secs_f64(),
                    "Docker command timed out"
                );
                return Err(RuntimeError::Unavailable(format!(
                    "`{}` timed out after {:?}",
                    command, self.command_timeout
                )));
            }
        };

        let stdout = drain(child.stdout.take());
        if status.success() {
            Ok(stdout)
        } else {
            Err(RuntimeError::Command {
                command,
                message: drain(child.stderr.take()),
            })
        }
    }

    fn inspect(&self, container_ref: &str) -> Result<(String, bool), RuntimeError> {
        let stdout = self
            .run(&[
                "inspect",
                "--type",
                "container",
                "--format",
                "{{.Id}} {{.State.Running}}",
                container_ref,
            ])
            .map_err(|e| match e {
                RuntimeError::Command { ref message, .. } if is_missing_container(message) => {
                    RuntimeError::NotFound(container_ref.to_string())
                }
                other => other,
            })?;

        parse_inspect(&stdout).ok_or_else(|| RuntimeError::Command {
            command: "docker inspect".to_string(),
            message: format!("unexpected output: {}", stdout),
        })
    }
}

impl ContainerRuntime for DockerRuntime {
    fn resolve(&self, container_ref: &str) -> Result<ContainerHandle, RuntimeError> {
        let (id, running) = self.inspect(container_ref)?;

        if !running {
            if !self.auto_start {
                return Err(RuntimeError::Unavailable(format!(
                    "container {} is not running",
                    container_ref
                )));
            }
            tracing::info!(container = %container_ref, "Starting stopped container");
            self.run(&["start", container_ref])?;
        }

        Ok(ContainerHandle {
            reference: container_ref.to_string(),
            id,
        })
    }

    fn attach_interactive(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &[(String, String)],
        subordinate: BorrowedFd<'_>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let args = exec_args(&handle.id, argv, env);
        let process = ShellProcess::spawn_on_pty(&self.binary_str(), &args, &[], subordinate)?;
        Ok(Box::new(process))
    }

    fn propagate_size(
        &self,
        handle: &ContainerHandle,
        rows: u16,
        cols: u16,
    ) -> Result<(), RuntimeError> {
        let rows = rows.to_string();
        let cols = cols.to_string();
        self.run(&["exec", &handle.id, "stty", "rows", &rows, "cols", &cols])
            .map(|_| ())
    }

    fn container_name(&self, role: &str, room: &str) -> String {
        self.container_names
            .get(role)
            .cloned()
            .unwrap_or_else(|| format!("{}-{}", role, room))
    }
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Builds `docker exec -it -e K=V ... <id> <argv...>`.
fn exec_args(container_id: &str, argv: &[String], env: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-it".to_string()];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(container_id.to_string());
    args.extend(argv.iter().cloned());
    args
}

/// Parses `"<id> <running>"` as printed by the inspect format string.
fn parse_inspect(stdout: &str) -> Option<(String, bool)> {
    let mut parts = stdout.split_whitespace();
    let id = parts.next()?.to_string();
    let running = parts.next()?.parse().ok()?;
    Some((id, running))
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}
