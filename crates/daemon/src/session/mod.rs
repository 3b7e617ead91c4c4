//! Terminal session core.
//!
//! A session attaches one client connection to an interactive shell inside a
//! container through a [`PtyBridge`]. The [`LifecycleController`] creates and
//! tears sessions down, the [`SessionRegistry`] records what is alive and the
//! [`OutputRouter`] fans terminal output out to rooms of clients.

pub mod bridge;
pub mod error;
pub mod lifecycle;
pub mod output;
pub mod registry;

pub use bridge::{new_bridge_id, BridgeExit, BridgeOptions, ExitReason, PtyBridge};
pub use error::{BridgeId, LabError, PtyError, SessionId};
pub use lifecycle::{LifecycleController, LifecycleOptions, SessionLifecycle, SessionRequest};
pub use output::{ClientId, ClientStats, OutputRouter, OutputSink, DEFAULT_CHANNEL_CAPACITY};
pub use registry::{RegistryError, Session, SessionRegistry, SessionStatus};
