//! In-memory registry of live sessions and their bridges.
//!
//! Reads return cloned snapshots; an entry is never observed half updated.
//! Only the lifecycle controller mutates the registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::bridge::PtyBridge;
use super::error::{BridgeId, SessionId};

/// Lifecycle state of a session.
///
/// Ordered: a session only ever moves forward, and `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl SessionStatus {
    /// Whether a transition to `next` is allowed.
    pub fn can_advance_to(self, next: SessionStatus) -> bool {
        self != SessionStatus::Terminated && next > self
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One client-to-container terminal attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    pub bridge_id: BridgeId,
    pub container_ref: String,
    pub role: String,
    pub room: String,
    pub created_at: SystemTime,
    status: SessionStatus,
}

impl Session {
    /// A new session in the `Starting` state.
    pub fn new(
        session_id: SessionId,
        bridge_id: BridgeId,
        container_ref: String,
        role: String,
        room: String,
    ) -> Self {
        Self {
            session_id,
            bridge_id,
            container_ref,
            role,
            room,
            created_at: SystemTime::now(),
            status: SessionStatus::Starting,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Moves to `next` if that is a forward transition.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Registry operation errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already registered: {0}")]
    AlreadyRegistered(SessionId),

    #[error("bridge id already in use: {0}")]
    BridgeInUse(BridgeId),

    #[error("bridge {bridge_id} does not belong to session {session_id}")]
    BridgeMismatch {
        session_id: SessionId,
        bridge_id: BridgeId,
    },
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    bridges: HashMap<BridgeId, Arc<PtyBridge>>,
}

/// Maps session ids to sessions and bridge ids to bridges.
#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session together with its started bridge.
    ///
    /// The session becomes `Running`.
    pub fn insert(&self, mut session: Session, bridge: Arc<PtyBridge>) -> Result<(), RegistryError> {
        if bridge.bridge_id() != &session.bridge_id {
            return Err(RegistryError::BridgeMismatch {
                session_id: session.session_id,
                bridge_id: bridge.bridge_id().clone(),
            });
        }

        let mut tables = self.write();
        if tables.sessions.contains_key(&session.session_id) {
            return Err(RegistryError::AlreadyRegistered(session.session_id));
        }
        if tables.bridges.contains_key(&session.bridge_id) {
            return Err(RegistryError::BridgeInUse(session.bridge_id));
        }

        session.advance(SessionStatus::Running);
        tables.bridges.insert(session.bridge_id.clone(), bridge);
        tables.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    /// Snapshot of a session.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.read().sessions.get(session_id).cloned()
    }

    /// The bridge owned by a session that is still `Running`.
    pub fn running_bridge(&self, session_id: &str) -> Option<Arc<PtyBridge>> {
        let tables = self.read();
        let session = tables.sessions.get(session_id)?;
        if session.status != SessionStatus::Running {
            return None;
        }
        tables.bridges.get(&session.bridge_id).cloned()
    }

    /// Looks a bridge up by its id.
    pub fn get_bridge(&self, bridge_id: &str) -> Option<Arc<PtyBridge>> {
        self.read().bridges.get(bridge_id).cloned()
    }

    /// Moves a `Running` session to `Stopping` and hands out its bridge.
    ///
    /// Returns `None` if the session is absent or already being torn down,
    /// so exactly one caller gets to tear a session down.
    pub fn mark_stopping(&self, session_id: &str) -> Option<(Session, Arc<PtyBridge>)> {
        let mut tables = self.write();
        let Tables { sessions, bridges } = &mut *tables;

        let session = sessions.get_mut(session_id)?;
        if !session.advance(SessionStatus::Stopping) {
            return None;
        }
        let bridge = bridges.get(&session.bridge_id).cloned()?;
        Some((session.clone(), bridge))
    }

    /// Removes a session and its bridge, returning the `Terminated` snapshot.
    ///
    /// Nothing is removed unless `bridge_id` still belongs to the session.
    pub fn remove(&self, session_id: &str, bridge_id: &str) -> Option<Session> {
        let mut tables = self.write();
        if tables.sessions.get(session_id)?.bridge_id != bridge_id {
            return None;
        }
        let mut session = tables.sessions.remove(session_id)?;
        tables.bridges.remove(bridge_id);
        session.advance(SessionStatus::Terminated);
        Some(session)
    }

    /// Sessions whose output goes to `room`.
    pub fn list_by_room(&self, room: &str) -> Vec<Session> {
        self.read()
            .sessions
            .values()
            .filter(|s| s.room == room)
            .cloned()
            .collect()
    }

    /// All sessions.
    pub fn list(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    pub fn bridge_count(&self) -> usize {
        self.read().bridges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, LocalRuntime};
    use crate::session::bridge::{new_bridge_id, BridgeOptions};
    use crate::session::output::OutputRouter;
    use tokio::sync::mpsc;

    fn start_bridge(session_id: &str) -> Arc<PtyBridge> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(LocalRuntime::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = BridgeOptions {
            shell: vec!["/bin/sh".to_string()],
            ..BridgeOptions::default()
        };
        let bridge = PtyBridge::start(
            new_bridge_id(session_id),
            session_id.to_string(),
            runtime.resolve("c1").unwrap(),
            24,
            80,
            runtime,
            options,
            Arc::new(OutputRouter::default()),
            tx,
        )
        .unwrap();
        Arc::new(bridge)
    }

    fn session_for(bridge: &PtyBridge, room: &str) -> Session {
        Session::new(
            bridge.session_id().clone(),
            bridge.bridge_id().clone(),
            "c1".to_string(),
            "attacker".to_string(),
            room.to_string(),
        )
    }

    #[test]
    fn test_status_is_monotonic() {
        use SessionStatus::*;
        assert!(Starting.can_advance_to(Running));
        assert!(Running.can_advance_to(Stopping));
        assert!(Starting.can_advance_to(Terminated));
        assert!(!Stopping.can_advance_to(Running));
        assert!(!Running.can_advance_to(Running));
        assert!(!Terminated.can_advance_to(Terminated));
    }

    #[test]
    fn test_session_advance() {
        let mut session = Session::new(
            "s1".into(),
            "b1".into(),
            "c1".into(),
            "attacker".into(),
            "lab1".into(),
        );
        assert_eq!(session.status(), SessionStatus::Starting);
        assert!(session.advance(SessionStatus::Running));
        assert!(!session.advance(SessionStatus::Starting));
        assert!(session.advance(SessionStatus::Terminated));
        assert!(!session.advance(SessionStatus::Stopping));
        assert_eq!(session.status(), SessionStatus::Terminated);
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        let bridge = start_bridge("s1");
        let bridge_id = bridge.bridge_id().clone();

        registry
            .insert(session_for(&bridge, "lab1"), Arc::clone(&bridge))
            .unwrap();

        let session = registry.get("s1").unwrap();
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(registry.running_bridge("s1").is_some());
        assert!(registry.get_bridge(&bridge_id).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("s1", "someone-else").is_none());
        let removed = registry.remove("s1", &bridge_id).unwrap();
        assert_eq!(removed.status(), SessionStatus::Terminated);
        assert!(registry.get("s1").is_none());
        assert!(registry.get_bridge(&bridge_id).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.bridge_count(), 0);

        bridge.stop();
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = SessionRegistry::new();
        let first = start_bridge("s1");
        let second = start_bridge("s1");

        registry
            .insert(session_for(&first, "lab1"), Arc::clone(&first))
            .unwrap();
        let err = registry
            .insert(session_for(&second, "lab1"), Arc::clone(&second))
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("s1".to_string()));
        assert_eq!(registry.bridge_count(), 1);

        first.stop();
        second.stop();
    }

    #[test]
    fn test_insert_rejects_mismatched_bridge() {
        let registry = SessionRegistry::new();
        let bridge = start_bridge("s1");
        let mut session = session_for(&bridge, "lab1");
        session.bridge_id = "other".to_string();

        assert!(matches!(
            registry.insert(session, Arc::clone(&bridge)),
            Err(RegistryError::BridgeMismatch { .. })
        ));
        assert!(registry.is_empty());
        bridge.stop();
    }

    #[test]
    fn test_mark_stopping_only_once() {
        let registry = SessionRegistry::new();
        let bridge = start_bridge("s1");
        registry
            .insert(session_for(&bridge, "lab1"), Arc::clone(&bridge))
            .unwrap();

        let (session, _) = registry.mark_stopping("s1").unwrap();
        assert_eq!(session.status(), SessionStatus::Stopping);
        assert!(registry.mark_stopping("s1").is_none());
        assert!(registry.running_bridge("s1").is_none());
        assert!(registry.mark_stopping("missing").is_none());

        bridge.stop();
    }

    #[test]
    fn test_list_by_room() {
        let registry = SessionRegistry::new();
        let a = start_bridge("a");
        let b = start_bridge("b");
        let c = start_bridge("c");
        registry.insert(session_for(&a, "lab1"), Arc::clone(&a)).unwrap();
        registry.insert(session_for(&b, "lab1"), Arc::clone(&b)).unwrap();
        registry.insert(session_for(&c, "lab2"), Arc::clone(&c)).unwrap();

        let mut ids: Vec<_> = registry
            .list_by_room("lab1")
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.list_by_room("lab3").len(), 0);
        assert_eq!(registry.list().len(), 3);

        for bridge in [a, b, c] {
            bridge.stop();
        }
    }
}
