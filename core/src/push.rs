//! Push Connection
//!
//! Pushes rendered state to a peer over a [`PushSocket`]. Pushes requested
//! while no socket is connected are remembered and flushed on connect.

use thiserror::Error;

use crate::transport::{Frame, ReconnectState, ReconnectingTransport, TransportError};

/// Prefix guarding pushed payloads against being evaluated as script
pub const PUSH_PREFIX: &str = "for(;;);";

#[derive(Error, Debug)]
pub enum PushError {
    #[error("Push failed: {0}")]
    Render(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Socket a push connection writes to
pub trait PushSocket {
    fn send(&self, message: &str) -> Result<(), PushError>;
    fn close(&self) -> Result<(), PushError>;
    fn is_connected(&self) -> bool;
}

impl PushSocket for ReconnectingTransport {
    fn send(&self, message: &str) -> Result<(), PushError> {
        Ok(ReconnectingTransport::send(self, Frame::from(message))?)
    }

    fn close(&self) -> Result<(), PushError> {
        Ok(ReconnectingTransport::close(self)?)
    }

    fn is_connected(&self) -> bool {
        self.state() == ReconnectState::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Not connected, nothing pending
    Disconnected,
    /// Not connected, an asynchronous push waits for a connection
    PushPending,
    /// Not connected, a response to a request waits for a connection
    ResponsePending,
    /// Connected, pushes are sent immediately
    Connected,
}

type Renderer = Box<dyn FnMut(bool) -> Result<String, PushError> + Send>;

/// A push channel to one peer.
///
/// The renderer produces the payload for a push; its flag tells whether the
/// push originates asynchronously or answers a request.
pub struct PushConnection<S: PushSocket> {
    socket: Option<S>,
    state: PushState,
    render: Renderer,
}

impl<S: PushSocket> PushConnection<S> {
    pub fn new(render: impl FnMut(bool) -> Result<String, PushError> + Send + 'static) -> Self {
        PushConnection {
            socket: None,
            state: PushState::Disconnected,
            render: Box::new(render),
        }
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == PushState::Connected
            && self.socket.as_ref().is_some_and(|socket| socket.is_connected())
    }

    /// Asynchronous push
    pub fn push(&mut self) -> Result<(), PushError> {
        self.push_with(true)
    }

    /// Push pending changes, or defer until a socket is connected.
    ///
    /// A pending response also covers a pending push, not vice versa.
    pub fn push_with(&mut self, async_push: bool) -> Result<(), PushError> {
        if !self.is_connected() {
            self.state = if async_push && self.state != PushState::ResponsePending {
                PushState::PushPending
            } else {
                PushState::ResponsePending
            };
            tracing::debug!("Push deferred ({:?})", self.state);
            return Ok(());
        }

        let payload = (self.render)(async_push)?;
        let message = format!("{}[{}]", PUSH_PREFIX, payload);
        tracing::debug!("Sending push message {}", message);
        match self.socket.as_ref() {
            Some(socket) => socket.send(&message),
            None => Ok(()),
        }
    }

    /// Install a socket, replacing any live one, and flush pending pushes
    pub fn connect(&mut self, socket: S) -> Result<(), PushError> {
        if self.is_connected() {
            self.disconnect()?;
        }

        self.socket = Some(socket);
        let previous = std::mem::replace(&mut self.state, PushState::Connected);

        match previous {
            PushState::PushPending => self.push_with(true),
            PushState::ResponsePending => self.push_with(false),
            PushState::Disconnected | PushState::Connected => Ok(()),
        }
    }

    /// Close the socket and forget it
    pub fn disconnect(&mut self) -> Result<(), PushError> {
        let Some(socket) = self.socket.as_ref() else {
            tracing::debug!("PushConnection::disconnect() called twice");
            return Ok(());
        };

        let result = socket.close();
        self.connection_lost();
        result
    }

    /// The socket went away. Pending pushes stay pending.
    pub fn connection_lost(&mut self) {
        self.socket = None;
        if self.state == PushState::Connected {
            self.state = PushState::Disconnected;
        }
    }
}
