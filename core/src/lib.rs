//! Relink Core Library
//! Reconnecting real-time transport with stable event callbacks

pub mod config;
pub mod push;
pub mod transport;

use std::sync::Arc;

pub use config::{ConnectConfig, ReconnectPolicy};
pub use push::{PushConnection, PushError, PushSocket, PushState};
pub use transport::{
    Callbacks, CloseEvent, ErrorEvent, Frame, ReadyState, ReconnectState, ReconnectingTransport,
    Transport, TransportError, WebSocketTransport,
};

/// Initialize the core library (logging)
pub fn init() {
    // Hosts may call this from several entry points; "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("Relink Core Initialized (logger ready)");
}

/// Connect over WebSocket with automatic reconnection.
///
/// Must be called inside a Tokio runtime.
pub fn connect(
    config: ConnectConfig,
    callbacks: Callbacks,
) -> Result<ReconnectingTransport, TransportError> {
    ReconnectingTransport::connect(Arc::new(WebSocketTransport::new()), config, callbacks)
}
