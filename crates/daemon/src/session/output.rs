//! Room-addressed fan-out of server events.
//!
//! PTY reader threads hand their bytes to [`OutputRouter::emit`], which never
//! blocks: every connected client owns a bounded channel and slow clients lose
//! messages instead of stalling the reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use labterm_protocol::{ServerEvent, SessionOutput};
use tokio::sync::mpsc;

use super::error::BridgeId;

/// Identifier of a transport connection receiving events.
pub type ClientId = String;

/// Default channel capacity for client output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Destination for bytes read from a PTY bridge.
pub trait OutputSink: Send + Sync {
    /// Forwards bytes read from `bridge_id`. Must not block.
    fn emit(&self, bridge_id: &str, data: Bytes);
}

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total messages sent successfully.
    pub messages_sent: u64,
    /// Messages dropped due to slow client.
    pub messages_dropped: u64,
    /// Whether the client is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// A connected client with a bounded event channel.
struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<ServerEvent>,
    room: Option<String>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ClientHandle {
    fn new(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            room: None,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        };
        (handle, rx)
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }

    /// Sends without blocking. Returns true if the event was queued.
    fn try_send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(client_id = %self.id, "Client recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        client_id = %self.id,
                        dropped,
                        "Client is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = %self.id, "Client channel closed");
                false
            }
        }
    }
}

/// Where output of a bridge goes.
#[derive(Debug, Clone)]
struct BridgeRoute {
    room: String,
    role: String,
}

/// Delivers session output and notifications to rooms of clients.
pub struct OutputRouter {
    clients: DashMap<ClientId, ClientHandle>,
    bridges: DashMap<BridgeId, BridgeRoute>,
    capacity: usize,
}

impl OutputRouter {
    /// Creates a router whose client channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            bridges: DashMap::new(),
            capacity,
        }
    }

    /// Registers a client and returns the receiving end of its channel.
    ///
    /// Registering an existing id replaces the previous channel.
    pub fn register_client(&self, client_id: &str) -> mpsc::Receiver<ServerEvent> {
        let (handle, rx) = ClientHandle::new(client_id.to_string(), self.capacity);
        self.clients.insert(client_id.to_string(), handle);
        tracing::debug!(client_id = %client_id, "Registered output client");
        rx
    }

    /// Removes a client, returning its final statistics.
    pub fn unregister_client(&self, client_id: &str) -> Option<ClientStats> {
        self.clients.remove(client_id).map(|(_, handle)| handle.stats())
    }

    /// Moves a client into `room`, leaving whatever room it was in.
    pub fn join_room(&self, client_id: &str, room: &str) -> bool {
        match self.clients.get_mut(client_id) {
            Some(mut handle) => {
                handle.room = Some(room.to_string());
                true
            }
            None => false,
        }
    }

    /// Takes a client out of its room.
    pub fn leave_room(&self, client_id: &str) {
        if let Some(mut handle) = self.clients.get_mut(client_id) {
            handle.room = None;
        }
    }

    /// Room the client currently belongs to.
    pub fn client_room(&self, client_id: &str) -> Option<String> {
        self.clients.get(client_id).and_then(|h| h.room.clone())
    }

    /// Routes output of `bridge_id` to `room`, tagged with `role`.
    pub fn bind_bridge(&self, bridge_id: &str, room: &str, role: &str) {
        self.bridges.insert(
            bridge_id.to_string(),
            BridgeRoute {
                room: room.to_string(),
                role: role.to_string(),
            },
        );
    }

    /// Stops routing output of `bridge_id`. Later emits are discarded.
    pub fn unbind_bridge(&self, bridge_id: &str) {
        self.bridges.remove(bridge_id);
    }

    /// Whether output of `bridge_id` is currently routed.
    pub fn is_bound(&self, bridge_id: &str) -> bool {
        self.bridges.contains_key(bridge_id)
    }

    /// Sends an event to every client in `room`.
    ///
    /// Returns the number of clients that accepted it.
    pub fn send_to_room(&self, room: &str, event: ServerEvent) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.room.as_deref() == Some(room))
            .filter(|entry| entry.try_send(event.clone()))
            .count()
    }

    /// Sends an event to a single client.
    pub fn send_to_client(&self, client_id: &str, event: ServerEvent) -> bool {
        self.clients
            .get(client_id)
            .map(|handle| handle.try_send(event))
            .unwrap_or(false)
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of clients currently in `room`.
    pub fn room_size(&self, room: &str) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.room.as_deref() == Some(room))
            .count()
    }

    /// Statistics for a specific client.
    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.clients.get(client_id).map(|h| h.stats())
    }
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl OutputSink for OutputRouter {
    fn emit(&self, bridge_id: &str, data: Bytes) {
        // Clone the route out so no map guard is held while fanning out.
        let route = match self.bridges.get(bridge_id) {
            Some(route) => route.clone(),
            None => {
                tracing::trace!(bridge_id = %bridge_id, "Dropping output of unbound bridge");
                return;
            }
        };

        let event = ServerEvent::SessionOutput(SessionOutput {
            bridge_id: bridge_id.to_string(),
            role: route.role,
            data,
        });
        self.send_to_room(&route.room, event);
    }
}
