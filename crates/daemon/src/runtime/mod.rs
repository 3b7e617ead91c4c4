//! Container runtime collaborator.
//!
//! The session core never talks to a container engine directly. It resolves
//! container references, attaches interactive processes to a PTY's
//! subordinate end and propagates terminal sizes through the
//! [`ContainerRuntime`] trait.

pub mod docker;
pub mod local;

use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{setsid, Pid};
use thiserror::Error;

pub use docker::DockerRuntime;
pub use local::LocalRuntime;

/// Errors reported by a container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No container matches the reference.
    #[error("no such container: {0}")]
    NotFound(String),

    /// The runtime (or the container) cannot be used right now.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// A runtime command ran but reported failure.
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    /// Spawning or talking to the runtime failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A container resolved by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// The reference the client asked for.
    pub reference: String,
    /// The runtime's own identifier for the container.
    pub id: String,
}

/// Handle to a process attached to a PTY.
///
/// May be a local process or the local end of a remote exec into a container.
pub trait ProcessHandle: Send {
    /// Operating system process id, if known.
    fn id(&self) -> Option<u32>;

    /// Returns the exit code if the process has already exited.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Forcefully terminates the process.
    fn kill(&mut self) -> io::Result<()>;

    /// Blocks until the process exits and returns its exit code.
    fn wait(&mut self) -> io::Result<i32>;
}

/// Operations the session core needs from a container engine.
pub trait ContainerRuntime: Send + Sync {
    /// Resolves a container reference, making sure the container can run a shell.
    fn resolve(&self, container_ref: &str) -> Result<ContainerHandle, RuntimeError>;

    /// Starts an interactive process inside the container with its standard
    /// streams bound to `subordinate`.
    fn attach_interactive(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        env: &[(String, String)],
        subordinate: BorrowedFd<'_>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError>;

    /// Tells the process inside the container about a new terminal size.
    fn propagate_size(
        &self,
        handle: &ContainerHandle,
        rows: u16,
        cols: u16,
    ) -> Result<(), RuntimeError>;

    /// Container that serves `role` in `room` when the client names none.
    fn container_name(&self, role: &str, room: &str) -> String {
        format!("{}-{}", role, room)
    }
}

/// Upper bound on kill sweeps over a session that keeps forking.
const SESSION_SWEEP_PASSES: usize = 5;

/// A child process running on a PTY subordinate in its own session.
pub struct ShellProcess {
    child: Child,
    /// The child leads its session, so this is also its pid.
    sid: i32,
}

impl ShellProcess {
    /// Spawns `program` with stdin, stdout and stderr bound to `subordinate`.
    ///
    /// The child becomes a session leader with the PTY as its controlling
    /// terminal, so job control and SIGWINCH work as in a local terminal.
    pub fn spawn_on_pty(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        subordinate: BorrowedFd<'_>,
    ) -> io::Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(subordinate.try_clone_to_owned()?))
            .stdout(Stdio::from(subordinate.try_clone_to_owned()?))
            .stderr(Stdio::from(subordinate.try_clone_to_owned()?));

        // SAFETY: only async-signal-safe syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let sid = child.id() as i32;
        Ok(Self { child, sid })
    }
}

impl ProcessHandle for ShellProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    /// Kills every process in the child's session, not only its group.
    ///
    /// Background jobs of a job-control shell run in process groups of their
    /// own, and they may outlive the shell itself.
    fn kill(&mut self) -> io::Result<()> {
        match killpg(Pid::from_raw(self.sid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(_) => {
                // Only fails once the child has been reaped.
                let _ = self.child.kill();
            }
        }

        let mut result = Ok(());
        for pass in 0..SESSION_SWEEP_PASSES {
            let members = session_members(self.sid);
            if members.is_empty() {
                break;
            }
            if pass > 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            for pid in members {
                match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => result = Err(io::Error::from(e)),
                }
            }
        }
        result
    }

    fn wait(&mut self) -> io::Result<i32> {
        Ok(exit_code(self.child.wait()?))
    }
}

/// Live (non-zombie) processes whose session id is `sid`.
///
/// Reads `/proc/<pid>/stat`; yields nothing where procfs is unavailable.
pub fn session_members(sid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut members = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if let Some((state, session)) = parse_stat(&stat) {
            if session == sid && state != 'Z' {
                members.push(pid);
            }
        }
    }
    members
}

/// Extracts `(state, session)` from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    // state, ppid, pgrp, session
    let session = fields.nth(2)?.parse().ok()?;
    Some((state, session))
}

/// Maps an exit status to a shell-style exit code (128 + signal when killed).
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
