//! Real-time transport layer
//!
//! One task set per WebSocket connection, a session-grouped hub for
//! broadcasts, and the coordinator that bridges inbound messages to the
//! session domain.

mod connection;
mod coordinator;
mod hub;
mod protocol;
mod validation;

pub use connection::{ClientIdentity, Connection, ConnectionHandle, serve_connection};
pub use coordinator::{Coordinator, attach_disconnect_handler};
pub use hub::{DisconnectedClient, Hub};
pub use protocol::{ClientMessage, ServerMessage};
