//! Underlying Connection Contract
//!
//! The seam between the reconnecting wrapper and a concrete message
//! transport. A transport hands back a connection handle together with the
//! stream of events that connection will emit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use super::frame::{Frame, TransportError};

/// Close code used when the peer vanished without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code used when a close frame carried no status
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Close code for a normal, requested closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Readiness of an underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Connection requested, handshake not finished
    Connecting = 0,
    /// Connection established, ready for data
    Open = 1,
    /// Close initiated
    Closing = 2,
    /// Connection terminated
    Closed = 3,
}

impl From<u8> for ReadyState {
    fn from(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Details of a connection closure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseEvent {
    pub fn normal() -> Self {
        CloseEvent {
            code: CLOSE_NORMAL,
            reason: String::new(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        CloseEvent {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

/// Events emitted by an underlying connection, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(Frame),
    Close(CloseEvent),
    Error(String),
}

/// Options passed through to the underlying transport on every connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportOptions {
    pub connect_timeout_ms: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            connect_timeout_ms: 10_000,
        }
    }
}

impl TransportOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// A single underlying connection.
///
/// Implementations report lifecycle changes through the event receiver
/// returned alongside them, never by calling back into the owner.
pub trait Connection: Send {
    /// Queue a frame for delivery
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Begin closing. A `Close` event follows once the connection is down.
    fn close(&self) -> Result<(), TransportError>;

    /// Identifying kind of the active transport (e.g. "websocket")
    fn transport_kind(&self) -> Option<String>;

    fn ready_state(&self) -> ReadyState;
}

/// A freshly requested connection and its event stream
pub struct Opened {
    pub connection: Box<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Factory for underlying connections
pub trait Transport: Send + Sync {
    /// Issue a connection request. Completion is reported asynchronously
    /// through the returned event stream.
    fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        options: &TransportOptions,
    ) -> Result<Opened, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_from_u8() {
        assert_eq!(ReadyState::from(0), ReadyState::Connecting);
        assert_eq!(ReadyState::from(ReadyState::Open as u8), ReadyState::Open);
        assert_eq!(ReadyState::from(2), ReadyState::Closing);
        assert_eq!(ReadyState::from(42), ReadyState::Closed);
    }

    #[test]
    fn test_close_events() {
        let normal = CloseEvent::normal();
        assert_eq!(normal.code, CLOSE_NORMAL);
        assert!(normal.was_clean);

        let abnormal = CloseEvent::abnormal("reset");
        assert_eq!(abnormal.code, CLOSE_ABNORMAL);
        assert_eq!(abnormal.reason, "reset");
        assert!(!abnormal.was_clean);
    }

    #[test]
    fn test_transport_options_defaults() {
        let options: TransportOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, TransportOptions::default());
        assert_eq!(options.connect_timeout(), Duration::from_secs(10));

        let options: TransportOptions =
            serde_json::from_str(r#"{"connectTimeoutMs": 250}"#).unwrap();
        assert_eq!(options.connect_timeout(), Duration::from_millis(250));
    }
}
