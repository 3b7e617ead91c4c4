//! PTY bridge between a container shell and the output router.
//!
//! A bridge owns one pseudo-terminal pair and the process attached to its
//! subordinate end. Bytes written by clients go straight to the controlling
//! end; a dedicated reader thread polls the controlling end with a bounded
//! timeout and forwards everything it reads to an [`OutputSink`].

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::unistd;
use tokio::sync::mpsc::UnboundedSender;

use super::error::{BridgeId, PtyError, SessionId};
use super::output::OutputSink;
use crate::runtime::{ContainerHandle, ContainerRuntime, ProcessHandle};

nix::ioctl_write_ptr_bad!(set_window_size, nix::libc::TIOCSWINSZ, Winsize);

/// Longest a single write may wait for the terminal to accept input.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(2);

static BRIDGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a bridge id unique for the life of the process.
///
/// Embeds the session id and a millisecond timestamp so reconnects of the
/// same session are easy to tell apart in logs.
pub fn new_bridge_id(session_id: &str) -> BridgeId {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = BRIDGE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", session_id, millis, seq)
}

/// Tunables for a bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Command run inside the container.
    pub shell: Vec<String>,
    /// Value of `TERM` for the shell.
    pub term: String,
    /// Maximum bytes per read.
    pub read_buffer_size: usize,
    /// Upper bound of one reader wait.
    pub poll_interval: Duration,
    /// How long `stop` waits for the reader thread.
    pub join_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            shell: vec![
                "/bin/bash".to_string(),
                "--login".to_string(),
                "-i".to_string(),
            ],
            term: "xterm-256color".to_string(),
            read_buffer_size: 1024,
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_millis(500),
        }
    }
}

/// Why a reader loop ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The shell side of the terminal went away.
    Eof,
    /// Reading failed with an unrecoverable error.
    Failed(PtyError),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Eof => write!(f, "shell exited"),
            ExitReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Sent by a reader loop that ended without `stop` being called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeExit {
    pub session_id: SessionId,
    pub bridge_id: BridgeId,
    pub reason: ExitReason,
}

struct ReaderThread {
    handle: JoinHandle<()>,
    /// Disconnects when the thread finishes, panicking or not.
    done: std_mpsc::Receiver<()>,
}

/// One pseudo-terminal pair plus the process attached to it.
pub struct PtyBridge {
    bridge_id: BridgeId,
    session_id: SessionId,
    container: ContainerHandle,
    runtime: Arc<dyn ContainerRuntime>,
    options: BridgeOptions,
    /// Cleared exactly once; guards all further I/O.
    running: Arc<AtomicBool>,
    /// Set by the first `stop`.
    stopped: AtomicBool,
    /// The reader holds its own clone, so the descriptor closes when both are dropped.
    controlling: Mutex<Option<Arc<OwnedFd>>>,
    child: Mutex<Option<Box<dyn ProcessHandle>>>,
    reader: Mutex<Option<ReaderThread>>,
    write_lock: Mutex<()>,
    size: Mutex<(u16, u16)>,
    pid: Option<u32>,
}

impl PtyBridge {
    /// Allocates a PTY, attaches a shell from `runtime` and starts the reader.
    ///
    /// On failure nothing is left running: the descriptors are closed and an
    /// already spawned process is killed.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        bridge_id: BridgeId,
        session_id: SessionId,
        container: ContainerHandle,
        rows: u16,
        cols: u16,
        runtime: Arc<dyn ContainerRuntime>,
        options: BridgeOptions,
        sink: Arc<dyn OutputSink>,
        exits: UnboundedSender<BridgeExit>,
    ) -> Result<Self, PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| PtyError::StartFailed(format!("openpty: {}", e)))?;

        // Keep concurrently spawned processes from inheriting either end.
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;
        set_raw(&pty.master)?;
        set_raw(&pty.slave)?;

        let env = vec![("TERM".to_string(), options.term.clone())];
        let mut child = runtime
            .attach_interactive(&container, &options.shell, &env, pty.slave.as_fd())
            .map_err(|e| PtyError::StartFailed(e.to_string()))?;
        let pid = child.id();

        // The child holds its own copies of the subordinate end.
        drop(pty.slave);
        let controlling = Arc::new(pty.master);

        if let Err(e) = set_nonblocking(&controlling) {
            kill_quietly(child.as_mut());
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        let context = ReaderContext {
            bridge_id: bridge_id.clone(),
            session_id: session_id.clone(),
            fd: Arc::clone(&controlling),
            running: Arc::clone(&running),
            sink,
            exits,
            buffer_size: options.read_buffer_size.max(1),
            poll_timeout: poll_timeout(options.poll_interval),
        };

        let handle = std::thread::Builder::new()
            .name(format!("pty-{}", bridge_id))
            .spawn(move || {
                let _done = done_tx;
                context.run();
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                kill_quietly(child.as_mut());
                return Err(PtyError::StartFailed(format!("reader thread: {}", e)));
            }
        };

        tracing::info!(
            session_id = %session_id,
            bridge_id = %bridge_id,
            container = %container.reference,
            pid = ?pid,
            rows,
            cols,
            "PTY bridge started"
        );

        Ok(Self {
            bridge_id,
            session_id,
            container,
            runtime,
            options,
            running,
            stopped: AtomicBool::new(false),
            controlling: Mutex::new(Some(controlling)),
            child: Mutex::new(Some(child)),
            reader: Mutex::new(Some(ReaderThread {
                handle,
                done: done_rx,
            })),
            write_lock: Mutex::new(()),
            size: Mutex::new((rows, cols)),
            pid,
        })
    }

    pub fn bridge_id(&self) -> &BridgeId {
        &self.bridge_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    /// Process id of the attached process, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn controlling_fd(&self) -> Option<Arc<OwnedFd>> {
        if !self.is_running() {
            return None;
        }
        lock(&self.controlling).clone()
    }

    /// Writes `data` verbatim to the terminal.
    ///
    /// After teardown this is a silent no-op.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let _guard = lock(&self.write_lock);
        let Some(fd) = self.controlling_fd() else {
            return Ok(());
        };

        let deadline = Instant::now() + WRITE_STALL_TIMEOUT;
        let mut written = 0;
        while written < data.len() {
            if !self.is_running() {
                return Ok(());
            }
            match unistd::write(fd.as_fd(), &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(PtyError::WriteFailed(
                            "terminal is not accepting input".to_string(),
                        ));
                    }
                    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                    match poll(&mut fds, poll_timeout(self.options.poll_interval)) {
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(e) => return Err(PtyError::WriteFailed(e.to_string())),
                    }
                }
                Err(e) => return Err(PtyError::WriteFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Applies a new terminal size locally and inside the container.
    ///
    /// Both steps are attempted even if one fails; the first failure is
    /// returned. A stopped bridge ignores resizes.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let Some(fd) = self.controlling_fd() else {
            return Ok(());
        };

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let mut result = Ok(());

        // SAFETY: the descriptor stays open while `fd` is held.
        match unsafe { set_window_size(fd.as_raw_fd(), &winsize) } {
            Ok(_) => *lock(&self.size) = (rows, cols),
            Err(e) => {
                tracing::warn!(bridge_id = %self.bridge_id, error = %e, "PTY resize failed");
                result = Err(PtyError::ResizeFailed(e.to_string()));
            }
        }

        if let Err(e) = self.runtime.propagate_size(&self.container, rows, cols) {
            tracing::warn!(
                bridge_id = %self.bridge_id,
                container = %self.container.reference,
                error = %e,
                "Failed to propagate terminal size"
            );
            if result.is_ok() {
                result = Err(PtyError::ResizeFailed(e.to_string()));
            }
        }

        tracing::debug!(bridge_id = %self.bridge_id, rows, cols, "Resized PTY");
        result
    }

    /// Tears the bridge down. Idempotent.
    ///
    /// Clears `running`, releases the controlling end, kills the process along
    /// with everything else in its session and waits up to the join timeout
    /// for the reader. Once
    /// this returns the reader emits nothing more, unless the join timed out,
    /// which is logged as a leak.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        drop(lock(&self.controlling).take());

        if let Some(mut child) = lock(&self.child).take() {
            // Killed before reaping, even if the shell is gone: its jobs can
            // outlive it and keep the terminal open.
            if let Err(e) = child.kill() {
                tracing::warn!(bridge_id = %self.bridge_id, error = %e, "Failed to kill process");
            }
            match child.wait() {
                Ok(code) => {
                    tracing::debug!(bridge_id = %self.bridge_id, code, "Process reaped")
                }
                Err(e) => {
                    tracing::warn!(bridge_id = %self.bridge_id, error = %e, "Failed to reap process")
                }
            }
        }

        if let Some(reader) = lock(&self.reader).take() {
            match reader.done.recv_timeout(self.options.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if reader.handle.join().is_err() {
                        tracing::error!(bridge_id = %self.bridge_id, "PTY reader thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        bridge_id = %self.bridge_id,
                        timeout_ms = self.options.join_timeout.as_millis() as u64,
                        "PTY reader did not exit in time, leaking thread"
                    );
                }
            }
        }

        tracing::info!(
            session_id = %self.session_id,
            bridge_id = %self.bridge_id,
            "PTY bridge stopped"
        );
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PtyBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyBridge")
            .field("bridge_id", &self.bridge_id)
            .field("session_id", &self.session_id)
            .field("container", &self.container.reference)
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish()
    }
}

struct ReaderContext {
    bridge_id: BridgeId,
    session_id: SessionId,
    fd: Arc<OwnedFd>,
    running: Arc<AtomicBool>,
    sink: Arc<dyn OutputSink>,
    exits: UnboundedSender<BridgeExit>,
    buffer_size: usize,
    poll_timeout: PollTimeout,
}

impl ReaderContext {
    fn run(self) {
        let reason = self.pump();

        // Only report an exit nobody asked for.
        if let Some(reason) = reason {
            if self.running.swap(false, Ordering::SeqCst) {
                tracing::info!(
                    session_id = %self.session_id,
                    bridge_id = %self.bridge_id,
                    reason = %reason,
                    "PTY reader ended"
                );
                let _ = self.exits.send(BridgeExit {
                    session_id: self.session_id.clone(),
                    bridge_id: self.bridge_id.clone(),
                    reason,
                });
            }
        }
        tracing::debug!(bridge_id = %self.bridge_id, "PTY reader loop finished");
    }

    /// Returns `None` when stopped from outside.
    fn pump(&self) -> Option<ExitReason> {
        let mut buffer = vec![0u8; self.buffer_size];

        while self.running.load(Ordering::SeqCst) {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, self.poll_timeout) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Some(read_failed(e)),
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLNVAL) {
                return Some(ExitReason::Failed(PtyError::ReadFailed(
                    "descriptor closed".to_string(),
                )));
            }
            if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                continue;
            }

            match unistd::read(self.fd.as_raw_fd(), &mut buffer) {
                Ok(0) => return Some(ExitReason::Eof),
                Ok(n) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return None;
                    }
                    self.sink
                        .emit(&self.bridge_id, Bytes::copy_from_slice(&buffer[..n]));
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                // Linux reports a hung-up subordinate as EIO.
                Err(Errno::EIO) => return Some(ExitReason::Eof),
                Err(e) => return Some(read_failed(e)),
            }
        }
        None
    }
}

fn read_failed(errno: Errno) -> ExitReason {
    ExitReason::Failed(PtyError::ReadFailed(errno.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = interval.as_millis().clamp(1, u16::MAX as u128) as u16;
    PollTimeout::from(millis)
}

fn set_raw(fd: &OwnedFd) -> Result<(), PtyError> {
    let mut termios =
        tcgetattr(fd).map_err(|e| PtyError::StartFailed(format!("tcgetattr: {}", e)))?;
    cfmakeraw(&mut termios);
    tcsetattr(fd, SetArg::TCSANOW, &termios)
        .map_err(|e| PtyError::StartFailed(format!("tcsetattr: {}", e)))
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), PtyError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(|e| PtyError::StartFailed(format!("fcntl: {}", e)))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), PtyError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| PtyError::StartFailed(format!("fcntl: {}", e)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))
        .map(|_| ())
        .map_err(|e| PtyError::StartFailed(format!("fcntl: {}", e)))
}

fn kill_quietly(child: &mut dyn ProcessHandle) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LocalRuntime, RuntimeError};
    use std::io;
    use std::os::fd::BorrowedFd;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Collects everything emitted, across bridges.
    #[derive(Default)]
    struct Collector {
        chunks: Mutex<Vec<(String, Bytes)>>,
    }

    impl Collector {
        fn text(&self) -> String {
            let chunks = lock(&self.chunks);
            chunks
                .iter()
                .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
                .collect()
        }

        fn count_for(&self, bridge_id: &str) -> usize {
            lock(&self.chunks)
                .iter()
                .filter(|(id, _)| id == bridge_id)
                .count()
        }

        fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.text().contains(needle) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            false
        }
    }

    impl OutputSink for Collector {
        fn emit(&self, bridge_id: &str, data: Bytes) {
            lock(&self.chunks).push((bridge_id.to_string(), data));
        }
    }

    /// Local runtime that counts kills of the processes it spawns.
    struct CountingRuntime {
        inner: LocalRuntime,
        kills: Arc<AtomicUsize>,
    }

    struct CountingProcess {
        inner: Box<dyn ProcessHandle>,
        kills: Arc<AtomicUsize>,
    }

    impl ProcessHandle for CountingProcess {
        fn id(&self) -> Option<u32> {
            self.inner.id()
        }
        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            self.inner.try_wait()
        }
        fn kill(&mut self) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.inner.kill()
        }
        fn wait(&mut self) -> io::Result<i32> {
            self.inner.wait()
        }
    }

    impl ContainerRuntime for CountingRuntime {
        fn resolve(&self, container_ref: &str) -> Result<ContainerHandle, RuntimeError> {
            self.inner.resolve(container_ref)
        }
        fn attach_interactive(
            &self,
            handle: &ContainerHandle,
            argv: &[String],
            env: &[(String, String)],
            subordinate: BorrowedFd<'_>,
        ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
            let inner = self.inner.attach_interactive(handle, argv, env, subordinate)?;
            Ok(Box::new(CountingProcess {
                inner,
                kills: Arc::clone(&self.kills),
            }))
        }
        fn propagate_size(
            &self,
            handle: &ContainerHandle,
            rows: u16,
            cols: u16,
        ) -> Result<(), RuntimeError> {
            self.inner.propagate_size(handle, rows, cols)
        }
    }

    fn sh_options() -> BridgeOptions {
        BridgeOptions {
            shell: vec!["/bin/sh".to_string()],
            ..BridgeOptions::default()
        }
    }

    fn start_with(
        runtime: Arc<dyn ContainerRuntime>,
        options: BridgeOptions,
        sink: Arc<Collector>,
    ) -> (PtyBridge, mpsc::UnboundedReceiver<BridgeExit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let container = runtime.resolve("c1").unwrap();
        let bridge = PtyBridge::start(
            new_bridge_id("s1"),
            "s1".to_string(),
            container,
            24,
            80,
            runtime,
            options,
            sink,
            tx,
        )
        .unwrap();
        (bridge, rx)
    }

    fn start_sh(sink: Arc<Collector>) -> (PtyBridge, mpsc::UnboundedReceiver<BridgeExit>) {
        start_with(Arc::new(LocalRuntime::new()), sh_options(), sink)
    }

    #[test]
    fn test_bridge_ids_are_unique() {
        let a = new_bridge_id("s1");
        let b = new_bridge_id("s1");
        assert_ne!(a, b);
        assert!(a.starts_with("s1_"));
    }

    #[test]
    fn test_start_and_echo() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        assert!(bridge.is_running());
        assert!(bridge.pid().is_some());
        assert_eq!(bridge.size(), (24, 80));

        bridge.write(b"echo $((6 * 7))\n").unwrap();
        assert!(
            sink.wait_for("42", Duration::from_secs(5)),
            "output was: {:?}",
            sink.text()
        );

        bridge.stop();
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_term_is_exported() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        bridge.write(b"echo term=$TERM\n").unwrap();
        assert!(sink.wait_for("term=xterm-256color", Duration::from_secs(5)));
        bridge.stop();
    }

    #[test]
    fn test_start_failure_is_start_failed() {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(LocalRuntime::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = BridgeOptions {
            shell: vec!["/no/such/shell".to_string()],
            ..BridgeOptions::default()
        };
        let result = PtyBridge::start(
            new_bridge_id("s2"),
            "s2".to_string(),
            runtime.resolve("c1").unwrap(),
            24,
            80,
            runtime,
            options,
            Arc::new(Collector::default()),
            tx,
        );
        assert!(matches!(result, Err(PtyError::StartFailed(_))));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let kills = Arc::new(AtomicUsize::new(0));
        let runtime = Arc::new(CountingRuntime {
            inner: LocalRuntime::new(),
            kills: Arc::clone(&kills),
        });
        let (bridge, _exits) =
            start_with(runtime, sh_options(), Arc::new(Collector::default()));
        let bridge = Arc::new(bridge);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || bridge.stop())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        bridge.stop();

        assert!(bridge.is_stopped());
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_output_after_stop() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        bridge
            .write(b"while true; do echo tick; sleep 0.01; done\n")
            .unwrap();
        assert!(sink.wait_for("tick", Duration::from_secs(5)));

        bridge.stop();
        let after_stop = sink.count_for(bridge.bridge_id());
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sink.count_for(bridge.bridge_id()), after_stop);
    }

    #[test]
    fn test_write_and_resize_after_stop_are_noops() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(sink);
        bridge.stop();

        assert!(bridge.write(b"echo hello\n").is_ok());
        assert!(bridge.resize(40, 120).is_ok());
        assert_eq!(bridge.size(), (24, 80));
    }

    #[test]
    fn test_resize_applies_window_size() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        bridge.resize(40, 120).unwrap();
        assert_eq!(bridge.size(), (40, 120));

        bridge.write(b"stty size\n").unwrap();
        assert!(
            sink.wait_for("40 120", Duration::from_secs(5)),
            "output was: {:?}",
            sink.text()
        );
        bridge.stop();
    }

    /// Extracts the pid printed as `job=<pid>=end`.
    fn job_pid(text: &str) -> i32 {
        let start = text.find("job=").unwrap() + "job=".len();
        let end = start + text[start..].find("=end").unwrap();
        text[start..end].trim().parse().unwrap()
    }

    fn process_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rfind(')')
                .and_then(|i| stat[i + 1..].trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    fn wait_dead(pid: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while process_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        !process_alive(pid)
    }

    #[test]
    fn test_stop_kills_background_jobs() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        bridge.write(b"sleep 4242 & echo job=$!=end\n").unwrap();
        assert!(sink.wait_for("=end", Duration::from_secs(5)));
        let pid = job_pid(&sink.text());
        assert!(process_alive(pid));

        bridge.stop();
        assert!(
            wait_dead(pid, Duration::from_secs(2)),
            "background job {} survived stop",
            pid
        );
    }

    #[test]
    fn test_stop_kills_jobs_of_exited_shell() {
        let sink = Arc::new(Collector::default());
        let (bridge, _exits) = start_sh(Arc::clone(&sink));

        bridge.write(b"sleep 4343 & echo job=$!=end\n").unwrap();
        assert!(sink.wait_for("=end", Duration::from_secs(5)));
        let pid = job_pid(&sink.text());

        // The job keeps the terminal open, so no EOF arrives.
        bridge.write(b"exit\n").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(process_alive(pid));

        bridge.stop();
        assert!(
            wait_dead(pid, Duration::from_secs(2)),
            "job {} of the exited shell survived stop",
            pid
        );
    }

    #[test]
    fn test_shell_exit_reports_eof() {
        let sink = Arc::new(Collector::default());
        let (bridge, mut exits) = start_sh(sink);

        bridge.write(b"exit 3\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let exit = loop {
            match exits.try_recv() {
                Ok(exit) => break exit,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("no exit reported: {:?}", e),
            }
        };

        assert_eq!(exit.session_id, "s1");
        assert_eq!(&exit.bridge_id, bridge.bridge_id());
        assert_eq!(exit.reason, ExitReason::Eof);
        assert!(!bridge.is_running());

        bridge.stop();
    }

    #[test]
    fn test_stop_does_not_report_exit() {
        let sink = Arc::new(Collector::default());
        let (bridge, mut exits) = start_sh(sink);

        bridge.stop();
        std::thread::sleep(Duration::from_millis(200));
        assert!(exits.try_recv().is_err());
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::Eof.to_string(), "shell exited");
        assert_eq!(
            ExitReason::Failed(PtyError::ReadFailed("EBADF".to_string())).to_string(),
            "failed to read from PTY: EBADF"
        );
    }
}
