//! # labterm Protocol Library
//!
//! Event definitions shared by the labterm daemon and its terminal clients.
//!
//! ## Overview
//!
//! Clients drive interactive shells inside lab containers over a persistent
//! bidirectional channel. This crate defines what travels on that channel:
//!
//! - **Client events**: start a session, send keystrokes, resize, stop
//! - **Server events**: start replies, terminal output, per-session errors
//! - **Codec**: JSON or MessagePack encoding with a size guard
//!
//! ## Example Usage
//!
//! ```rust
//! use labterm_protocol::{decode, encode, ClientEvent, WireFormat};
//!
//! let raw = br#"{"event":"session_input","data":{"data":"ls\n"}}"#;
//! let event: ClientEvent = decode(raw, WireFormat::Json).unwrap();
//! let back = encode(&event, WireFormat::MessagePack).unwrap();
//! assert!(!back.is_empty());
//! ```
//!
//! ## Modules
//!
//! - [`events`]: Client and server event definitions
//! - [`codec`]: Wire encoding
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod events;

pub use codec::{decode, encode, WireFormat, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, Result};
pub use events::{
    ClientEvent, Ping, ReplyStatus, ServerEvent, SessionClosed, SessionErrorEvent, SessionInput,
    SessionOutput, SessionResize, StartSession, StartSessionReply, DEFAULT_COLS, DEFAULT_ROWS,
};
