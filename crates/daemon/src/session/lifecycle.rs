//! Session creation and teardown.
//!
//! [`LifecycleController`] is the only component that mutates the
//! [`SessionRegistry`]. Operations on one session id are serialized by a
//! per-session lock. Registry transitions additionally take a short global
//! lifecycle lock, which is never held across container runtime calls, so a
//! slow or hung runtime only delays the session that is waiting on it. Input
//! and resize go straight to the bridge without either lock. Reader threads
//! never touch the registry: they report EOF over a channel that the exit
//! watcher drains.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use futures_util::future::join_all;
use labterm_protocol::{ServerEvent, SessionClosed, SessionErrorEvent};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;

use super::bridge::{new_bridge_id, BridgeExit, BridgeOptions, ExitReason, PtyBridge};
use super::error::{LabError, SessionId};
use super::output::{OutputRouter, OutputSink};
use super::registry::{Session, SessionRegistry};
use crate::runtime::ContainerRuntime;

/// Parameters of a `create_session` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub container_ref: String,
    pub role: String,
    pub room: String,
    pub rows: u16,
    pub cols: u16,
}

/// Trait for session lifecycle operations.
///
/// Implementations must be safe to call concurrently from any number of
/// connections.
#[allow(async_fn_in_trait)]
pub trait SessionLifecycle: Send + Sync {
    /// Creates a session, superseding any live session with the same id.
    async fn create_session(&self, request: SessionRequest) -> Result<Session, LabError>;

    /// Writes client input to the session's terminal. Unknown ids are ignored.
    async fn handle_input(&self, session_id: &str, data: &[u8]) -> Result<(), LabError>;

    /// Resizes the session's terminal. Unknown ids are ignored.
    async fn handle_resize(&self, session_id: &str, rows: u16, cols: u16)
        -> Result<(), LabError>;

    /// Tears a session down. Returns whether this call did the work.
    async fn cleanup_session(&self, session_id: &str) -> bool;

    /// Tears down every session of a room. Returns how many were closed.
    async fn cleanup_room(&self, room: &str) -> usize;

    /// Snapshot of one session.
    fn get_session(&self, session_id: &str) -> Option<Session>;

    /// Snapshot of all sessions.
    fn list_sessions(&self) -> Vec<Session>;

    /// Container serving `role` in `room` when the client names none.
    fn container_name(&self, role: &str, room: &str) -> String;
}

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub bridge: BridgeOptions,
    pub max_sessions: usize,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            bridge: BridgeOptions::default(),
            max_sessions: 64,
        }
    }
}

/// Per-session mutexes, created on demand.
///
/// An entry is dropped as soon as nobody holds or waits for it.
#[derive(Default)]
struct SessionLocks {
    locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    async fn lock(&self, session_id: &str) -> SessionGuard<'_> {
        let mutex = Arc::clone(&self.locks.entry(session_id.to_string()).or_default());
        let guard = mutex.lock_owned().await;
        SessionGuard {
            locks: &self.locks,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct SessionGuard<'a> {
    locks: &'a DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    session_id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone, so only an unused entry has a count of one.
        self.locks
            .remove_if(&self.session_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Owns the registry and funnels every teardown through one path.
pub struct LifecycleController {
    this: Weak<LifecycleController>,
    registry: SessionRegistry,
    output: Arc<OutputRouter>,
    runtime: Arc<dyn ContainerRuntime>,
    options: LifecycleOptions,
    lifecycle: tokio::sync::Mutex<()>,
    sessions: SessionLocks,
    exits_tx: UnboundedSender<BridgeExit>,
    exits_rx: Mutex<Option<UnboundedReceiver<BridgeExit>>>,
    shutting_down: AtomicBool,
}

impl LifecycleController {
    /// Creates a controller. Call [`start_exit_watcher`](Self::start_exit_watcher)
    /// so sessions whose shell exits get cleaned up.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        output: Arc<OutputRouter>,
        options: LifecycleOptions,
    ) -> Arc<Self> {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: SessionRegistry::new(),
            output,
            runtime,
            options,
            lifecycle: tokio::sync::Mutex::new(()),
            sessions: SessionLocks::default(),
            exits_tx,
            exits_rx: Mutex::new(Some(exits_rx)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Spawns the task that tears down sessions whose reader hit EOF.
    ///
    /// Returns `None` if the watcher was already started.
    pub fn start_exit_watcher(&self) -> Option<JoinHandle<()>> {
        let mut rx = self
            .exits_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let controller = self.this.clone();

        Some(tokio::spawn(async move {
            while let Some(exit) = rx.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                // One exit waiting on its session must not hold up the rest.
                tokio::spawn(async move { controller.handle_bridge_exit(exit).await });
            }
            tracing::debug!("Bridge exit watcher stopped");
        }))
    }

    /// The output router sessions emit into.
    pub fn output(&self) -> &Arc<OutputRouter> {
        &self.output
    }

    /// Read-only view of the registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuses new sessions and tears down every live one.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let closed = self
            .detached(|this| async move {
                let _guard = this.lifecycle.lock().await;
                let ids = this
                    .registry
                    .list()
                    .into_iter()
                    .map(|s| s.session_id)
                    .collect();
                this.teardown_locked(ids, "daemon shutting down").await
            })
            .await
            .unwrap_or(0);
        tracing::info!(closed, "All sessions torn down");
        closed
    }

    /// Runs `f` on its own task so that dropping the caller's future cannot
    /// abandon a half-finished transition.
    async fn detached<F, Fut, T>(&self, f: F) -> Result<T, LabError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.this.upgrade().ok_or(LabError::ShuttingDown)?;
        tokio::spawn(f(this))
            .await
            .map_err(|e| LabError::Internal(e.to_string()))
    }

    /// Number of session ids with a pending or running operation.
    #[cfg(test)]
    fn busy_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn create_serialized(&self, request: SessionRequest) -> Result<Session, LabError> {
        let _session = self.sessions.lock(&request.session_id).await;

        {
            let _guard = self.lifecycle.lock().await;
            if self.is_shutting_down() {
                return Err(LabError::ShuttingDown);
            }
            if self.registry.get(&request.session_id).is_some() {
                tracing::info!(
                    session_id = %request.session_id,
                    "Superseding existing session"
                );
                self.teardown_locked(
                    vec![request.session_id.clone()],
                    "superseded by a new session",
                )
                .await;
            }
            self.check_capacity()?;
        }

        // Runtime calls run without the lifecycle lock.
        let (session, bridge) = self.start_bridge(&request).await?;

        let inserted = {
            let _guard = self.lifecycle.lock().await;
            if self.is_shutting_down() {
                Err(LabError::ShuttingDown)
            } else {
                self.check_capacity().and_then(|()| {
                    self.registry
                        .insert(session.clone(), Arc::clone(&bridge))
                        .map_err(|e| LabError::Internal(e.to_string()))
                })
            }
        };
        if let Err(e) = inserted {
            self.output.unbind_bridge(&session.bridge_id);
            stop_bridge(bridge).await;
            return Err(e);
        }

        let session = self
            .registry
            .get(&request.session_id)
            .unwrap_or(session);

        tracing::info!(
            session_id = %session.session_id,
            bridge_id = %session.bridge_id,
            container = %session.container_ref,
            role = %session.role,
            room = %session.room,
            "Session running"
        );

        Ok(session)
    }

    fn check_capacity(&self) -> Result<(), LabError> {
        if self.registry.len() >= self.options.max_sessions {
            return Err(LabError::CapacityExceeded(self.options.max_sessions));
        }
        Ok(())
    }

    /// Resolves the container and starts a bridge bound to the request's room.
    async fn start_bridge(
        &self,
        request: &SessionRequest,
    ) -> Result<(Session, Arc<PtyBridge>), LabError> {
        let runtime = Arc::clone(&self.runtime);
        let container_ref = request.container_ref.clone();
        let container = tokio::task::spawn_blocking(move || runtime.resolve(&container_ref))
            .await
            .map_err(|e| LabError::Internal(e.to_string()))??;

        let bridge_id = new_bridge_id(&request.session_id);
        let session = Session::new(
            request.session_id.clone(),
            bridge_id.clone(),
            request.container_ref.clone(),
            request.role.clone(),
            request.room.clone(),
        );

        // Bound before the reader starts so the first prompt is not lost.
        self.output
            .bind_bridge(&bridge_id, &request.room, &request.role);

        let runtime = Arc::clone(&self.runtime);
        let options = self.options.bridge.clone();
        let sink: Arc<dyn OutputSink> = Arc::clone(&self.output) as Arc<dyn OutputSink>;
        let exits = self.exits_tx.clone();
        let (session_id, start_bridge_id) = (request.session_id.clone(), bridge_id.clone());
        let (rows, cols) = (request.rows, request.cols);
        let started = tokio::task::spawn_blocking(move || {
            PtyBridge::start(
                start_bridge_id,
                session_id,
                container,
                rows,
                cols,
                runtime,
                options,
                sink,
                exits,
            )
        })
        .await;

        match started {
            Ok(Ok(bridge)) => Ok((session, Arc::new(bridge))),
            Ok(Err(e)) => {
                self.output.unbind_bridge(&bridge_id);
                tracing::warn!(
                    session_id = %request.session_id,
                    container = %request.container_ref,
                    error = %e,
                    "Failed to start PTY bridge"
                );
                Err(e.into())
            }
            Err(e) => {
                self.output.unbind_bridge(&bridge_id);
                Err(LabError::Internal(e.to_string()))
            }
        }
    }

    /// Tears down the given sessions. The lifecycle lock must be held.
    ///
    /// Bridges are stopped concurrently; a failure on one does not keep the
    /// others from being removed.
    async fn teardown_locked(&self, session_ids: Vec<SessionId>, reason: &str) -> usize {
        let claimed: Vec<_> = session_ids
            .iter()
            .filter_map(|id| self.registry.mark_stopping(id))
            .collect();

        let stops = claimed
            .iter()
            .map(|(_, bridge)| stop_bridge(Arc::clone(bridge)));
        join_all(stops).await;

        for (session, _) in &claimed {
            self.output.unbind_bridge(&session.bridge_id);
            if let Some(terminated) = self
                .registry
                .remove(&session.session_id, &session.bridge_id)
            {
                tracing::info!(
                    session_id = %terminated.session_id,
                    bridge_id = %terminated.bridge_id,
                    room = %terminated.room,
                    status = %terminated.status(),
                    reason,
                    "Session torn down"
                );
            }
            self.output.send_to_room(
                &session.room,
                ServerEvent::SessionClosed(SessionClosed {
                    bridge_id: session.bridge_id.clone(),
                    role: session.role.clone(),
                    reason: reason.to_string(),
                }),
            );
        }

        claimed.len()
    }

    async fn handle_bridge_exit(&self, exit: BridgeExit) {
        let result = self
            .detached(|this| async move {
                let _session = this.sessions.lock(&exit.session_id).await;
                let _guard = this.lifecycle.lock().await;

                // A superseded bridge may report after its successor started.
                let Some(session) = this.registry.get(&exit.session_id) else {
                    return;
                };
                if session.bridge_id != exit.bridge_id {
                    return;
                }

                if let ExitReason::Failed(ref error) = exit.reason {
                    this.output.send_to_room(
                        &session.room,
                        ServerEvent::SessionError(SessionErrorEvent {
                            role: session.role.clone(),
                            message: error.to_string(),
                        }),
                    );
                }
                this.teardown_locked(vec![exit.session_id], &exit.reason.to_string())
                    .await;
            })
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to handle bridge exit");
        }
    }
}

impl SessionLifecycle for LifecycleController {
    async fn create_session(&self, request: SessionRequest) -> Result<Session, LabError> {
        if self.is_shutting_down() {
            return Err(LabError::ShuttingDown);
        }
        self.detached(|this| async move { this.create_serialized(request).await })
            .await?
    }

    async fn handle_input(&self, session_id: &str, data: &[u8]) -> Result<(), LabError> {
        let Some(bridge) = self.registry.running_bridge(session_id) else {
            tracing::trace!(session_id = %session_id, "Dropping input for unknown session");
            return Ok(());
        };

        // Written inline so keystrokes keep their order.
        if let Err(e) = bridge.write(data) {
            tracing::warn!(
                session_id = %session_id,
                bridge_id = %bridge.bridge_id(),
                error = %e,
                "PTY write failed"
            );
            if let Some(session) = self.registry.get(session_id) {
                self.output.send_to_room(
                    &session.room,
                    ServerEvent::SessionError(SessionErrorEvent {
                        role: session.role.clone(),
                        message: e.to_string(),
                    }),
                );
            }
            self.cleanup_session(session_id).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn handle_resize(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), LabError> {
        let Some(bridge) = self.registry.running_bridge(session_id) else {
            return Ok(());
        };

        // Resize failures are logged by the bridge and never end the session.
        let _ = tokio::task::spawn_blocking(move || bridge.resize(rows, cols)).await;
        Ok(())
    }

    async fn cleanup_session(&self, session_id: &str) -> bool {
        let session_id = session_id.to_string();
        self.detached(|this| async move {
            // Waits out a create in flight for the same id, so a disconnect
            // during a slow start still tears the new session down.
            let _session = this.sessions.lock(&session_id).await;
            let _guard = this.lifecycle.lock().await;
            this.teardown_locked(vec![session_id.clone()], "session closed").await > 0
        })
        .await
        .unwrap_or(false)
    }

    async fn cleanup_room(&self, room: &str) -> usize {
        let room = room.to_string();
        self.detached(|this| async move {
            let _guard = this.lifecycle.lock().await;
            let ids = this
                .registry
                .list_by_room(&room)
                .into_iter()
                .map(|s| s.session_id)
                .collect();
            let closed = this.teardown_locked(ids, "room stopped").await;
            tracing::info!(room = %room, closed, "Room cleaned up");
            closed
        })
        .await
        .unwrap_or(0)
    }

    fn get_session(&self, session_id: &str) -> Option<Session> {
        self.registry.get(session_id)
    }

    fn list_sessions(&self) -> Vec<Session> {
        self.registry.list()
    }

    fn container_name(&self, role: &str, room: &str) -> String {
        self.runtime.container_name(role, room)
    }
}

async fn stop_bridge(bridge: Arc<PtyBridge>) {
    let bridge_id = bridge.bridge_id().clone();
    if let Err(e) = tokio::task::spawn_blocking(move || bridge.stop()).await {
        tracing::error!(bridge_id = %bridge_id, error = %e, "Bridge teardown panicked");
    }
}
