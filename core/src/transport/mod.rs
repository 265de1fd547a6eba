//! Transport Module
//!
//! Reconnecting transport wrapper and the underlying transports it drives.

pub mod connection;
pub mod frame;
pub mod reconnect;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// Re-exports for convenience
pub use connection::{
    CloseEvent, Connection, ConnectionEvent, Opened, ReadyState, Transport, TransportOptions,
};
pub use frame::{Frame, TransportError};
pub use reconnect::{Callbacks, ErrorEvent, ReconnectState, ReconnectingTransport};
pub use websocket::WebSocketTransport;
