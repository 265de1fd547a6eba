//! Reconnecting Transport
//!
//! Wraps an underlying [`Transport`] and keeps a logical connection alive
//! across closures. The application sees one stable set of callbacks no
//! matter how many underlying connections come and go.
//!
//! Events of each underlying connection are pumped on their own task. A
//! replacement connection is only requested by the reconnect timer, which is
//! armed once `on_reconnect` has returned, so the old connection's close is
//! always fully handled before the new connection can report anything.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::connection::{
    CloseEvent, Connection, ConnectionEvent, ReadyState, Transport, TransportOptions,
};
use super::frame::{Frame, TransportError};
use crate::config::{ConnectConfig, ReconnectPolicy};

pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(Frame) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(CloseEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ErrorEvent) + Send + Sync>;

/// What the error callback receives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    /// Error reported by the underlying connection, passed through as is
    #[error("Transport error: {0}")]
    Transport(String),
    /// Retry budget used up. Terminal: no further reconnects happen.
    #[error("Reconnection attempts exhausted")]
    ReconnectionExhausted { transport: Option<String> },
}

/// Application callbacks. Every slot is optional.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<LifecycleCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_reconnect: Option<LifecycleCallback>,
    pub on_reopen: Option<LifecycleCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Frame) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(CloseEvent) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Arc::new(f));
        self
    }

    pub fn on_reopen(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reopen = Some(Arc::new(f));
        self
    }
}

/// Lifecycle of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Underlying connection requested, not yet open
    Connecting,
    /// Underlying connection open
    Open,
    /// Application asked to close
    Closing,
    /// Waiting for the reconnect timer
    ReconnectPending,
    /// No further automatic transitions
    Closed,
}

struct ReconnectTimer {
    epoch: u64,
    task: JoinHandle<()>,
}

struct State {
    connection: Option<Box<dyn Connection>>,
    /// Bumped whenever a connection is installed or discarded; events
    /// tagged with an older generation are dropped.
    generation: u64,
    phase: ReconnectState,
    reconnect_enabled: bool,
    reconnect_attempts: u32,
    /// Kept after firing so the next open is recognized as a reopen
    reconnect_timer: Option<ReconnectTimer>,
    timer_epoch: u64,
    first_message: bool,
    last_transport: Option<String>,
}

struct Shared {
    url: Url,
    protocols: Vec<String>,
    options: TransportOptions,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
}

enum CloseOutcome {
    Forward,
    Retry(u32),
    Exhausted(Option<String>),
}

/// Handle to a self-healing logical connection.
///
/// Cloning yields another handle to the same connection. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct ReconnectingTransport {
    shared: Arc<Shared>,
}

impl ReconnectingTransport {
    /// Create the wrapper and request the first underlying connection.
    ///
    /// Reconnection starts enabled iff `config.reconnect_interval` is
    /// positive.
    pub fn connect(
        transport: Arc<dyn Transport>,
        config: ConnectConfig,
        callbacks: Callbacks,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url)?;
        let policy = config.policy();
        let reconnect_enabled = config.reconnect_enabled();

        let shared = Arc::new(Shared {
            url,
            protocols: config.protocols,
            options: config.transport,
            policy,
            transport,
            state: Mutex::new(State {
                connection: None,
                generation: 0,
                phase: ReconnectState::Connecting,
                reconnect_enabled,
                reconnect_attempts: 0,
                reconnect_timer: None,
                timer_epoch: 0,
                first_message: true,
                last_transport: None,
            }),
            callbacks: Mutex::new(callbacks),
        });

        tracing::info!(
            "Connecting to {} (reconnect: {}, max attempts: {:?}, interval: {:?})",
            shared.url,
            reconnect_enabled,
            policy.max_attempts,
            policy.interval
        );

        {
            let mut state = shared.lock_state();
            shared.open_connection(&mut state)?;
        }

        Ok(ReconnectingTransport { shared })
    }

    /// Send a frame over the current connection.
    ///
    /// Fails with [`TransportError::Uninitialized`] while no connection
    /// exists or the current one has not opened yet. Nothing is buffered.
    pub fn send(&self, frame: impl Into<Frame>) -> Result<(), TransportError> {
        let state = self.shared.lock_state();
        match state.connection.as_ref() {
            Some(connection) if connection.ready_state() != ReadyState::Connecting => {
                connection.send(frame.into())
            }
            _ => Err(TransportError::Uninitialized),
        }
    }

    /// Disable reconnection and close the current connection
    pub fn close(&self) -> Result<(), TransportError> {
        self.enable_reconnect(false);

        let mut state = self.shared.lock_state();
        if state.connection.is_none() {
            state.phase = ReconnectState::Closed;
            return Ok(());
        }

        tracing::info!("Closing connection to {}", self.shared.url);
        if state.phase != ReconnectState::Closed {
            state.phase = ReconnectState::Closing;
        }
        match state.connection.as_ref() {
            Some(connection) => connection.close(),
            None => Ok(()),
        }
    }

    /// Toggle automatic reconnection.
    ///
    /// Disabling cancels a pending reconnect and resets the attempt counter.
    /// Safe to call from inside any callback.
    pub fn enable_reconnect(&self, enable: bool) {
        let mut state = self.shared.lock_state();
        state.reconnect_enabled = enable;

        if enable {
            return;
        }
        if let Some(timer) = state.reconnect_timer.take() {
            timer.task.abort();
            state.reconnect_attempts = 0;
            tracing::debug!("Reconnect timer cancelled for {}", self.shared.url);
        }
        if state.phase == ReconnectState::ReconnectPending {
            state.reconnect_attempts = 0;
            state.phase = ReconnectState::Closed;
        }
    }

    /// Kind of the active underlying transport, `None` while disconnected
    pub fn transport_kind(&self) -> Option<String> {
        let state = self.shared.lock_state();
        state
            .connection
            .as_ref()
            .and_then(|connection| connection.transport_kind())
    }

    /// Readiness of the current connection, `Connecting` when none exists
    pub fn ready_state(&self) -> ReadyState {
        let state = self.shared.lock_state();
        state
            .connection
            .as_ref()
            .map_or(ReadyState::Connecting, |connection| connection.ready_state())
    }

    pub fn state(&self) -> ReconnectState {
        self.shared.lock_state().phase
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock_state().reconnect_attempts
    }

    pub fn is_reconnect_enabled(&self) -> bool {
        self.shared.lock_state().reconnect_enabled
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }

    pub fn set_on_open(&self, f: impl Fn() + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_open = Some(Arc::new(f));
    }

    pub fn set_on_message(&self, f: impl Fn(Frame) + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_message = Some(Arc::new(f));
    }

    pub fn set_on_close(&self, f: impl Fn(CloseEvent) + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_close = Some(Arc::new(f));
    }

    pub fn set_on_error(&self, f: impl Fn(ErrorEvent) + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_error = Some(Arc::new(f));
    }

    pub fn set_on_reconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_reconnect = Some(Arc::new(f));
    }

    pub fn set_on_reopen(&self, f: impl Fn() + Send + Sync + 'static) {
        self.shared.lock_callbacks().on_reopen = Some(Arc::new(f));
    }

    /// Replace every callback slot at once
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.shared.lock_callbacks() = callbacks;
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot the callbacks so none are invoked with a lock held
    fn callbacks(&self) -> Callbacks {
        self.lock_callbacks().clone()
    }

    fn open_connection(self: &Arc<Self>, state: &mut State) -> Result<(), TransportError> {
        let opened = self
            .transport
            .connect(&self.url, &self.protocols, &self.options)?;

        state.generation += 1;
        state.connection = Some(opened.connection);
        state.phase = ReconnectState::Connecting;

        spawn_event_pump(Arc::clone(self), state.generation, opened.events);
        Ok(())
    }

    /// Handle one event; returns false once the connection is superseded
    fn dispatch(self: &Arc<Self>, generation: u64, event: ConnectionEvent) -> bool {
        match event {
            ConnectionEvent::Open => self.handle_open(generation),
            ConnectionEvent::Message(frame) => self.handle_message(generation, frame),
            ConnectionEvent::Close(close) => self.handle_close(generation, close),
            ConnectionEvent::Error(message) => self.handle_error(generation, message),
        }
    }

    fn handle_open(&self, generation: u64) -> bool {
        let reopened = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            state.first_message = true;
            if state.phase == ReconnectState::Connecting {
                state.phase = ReconnectState::Open;
            }
            let kind = state.connection.as_ref().and_then(|c| c.transport_kind());
            if kind.is_some() {
                state.last_transport = kind;
            }
            if state.reconnect_timer.is_some() {
                state.reconnect_attempts = 0;
                true
            } else {
                false
            }
        };

        if reopened {
            tracing::info!("Reconnected to {}", self.url);
            if let Some(on_reopen) = self.callbacks().on_reopen {
                on_reopen();
            }
        } else {
            tracing::info!("Connection to {} open", self.url);
        }
        true
    }

    fn handle_message(&self, generation: u64, frame: Frame) -> bool {
        let first = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            std::mem::replace(&mut state.first_message, false)
        };

        let callbacks = self.callbacks();
        if first {
            // The first message of a session completes the handshake
            tracing::debug!("Session on {} established", self.url);
            if let Some(on_open) = callbacks.on_open {
                on_open();
            }
        } else {
            tracing::debug!("Received {} byte message from {}", frame.len(), self.url);
            if let Some(on_message) = callbacks.on_message {
                on_message(frame);
            }
        }
        true
    }

    fn handle_close(self: &Arc<Self>, generation: u64, close: CloseEvent) -> bool {
        let outcome = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return false;
            }
            self.close_outcome(&mut state)
        };

        self.report_close(outcome, close);
        true
    }

    fn handle_error(&self, generation: u64, message: String) -> bool {
        if self.lock_state().generation != generation {
            return false;
        }
        tracing::warn!("Transport error on {}: {}", self.url, message);
        if let Some(on_error) = self.callbacks().on_error {
            on_error(ErrorEvent::Transport(message));
        }
        true
    }

    /// Decide what a closure means. A retry is only armed once
    /// `on_reconnect` has returned, see [`Shared::arm_reconnect`].
    fn close_outcome(&self, state: &mut State) -> CloseOutcome {
        if !state.reconnect_enabled {
            state.phase = ReconnectState::Closed;
            return CloseOutcome::Forward;
        }

        if !self.policy.allows(state.reconnect_attempts) {
            state.phase = ReconnectState::Closed;
            let transport = state
                .connection
                .as_ref()
                .and_then(|c| c.transport_kind())
                .or_else(|| state.last_transport.clone());
            return CloseOutcome::Exhausted(transport);
        }

        state.connection = None;
        state.generation += 1;
        state.phase = ReconnectState::ReconnectPending;
        state.reconnect_attempts += 1;
        CloseOutcome::Retry(state.reconnect_attempts)
    }

    fn report_close(self: &Arc<Self>, outcome: CloseOutcome, close: CloseEvent) {
        let callbacks = self.callbacks();
        match outcome {
            CloseOutcome::Forward => {
                tracing::info!(
                    "Connection to {} closed (code {}, clean: {})",
                    self.url,
                    close.code,
                    close.was_clean
                );
                if let Some(on_close) = callbacks.on_close {
                    on_close(close);
                }
            }
            CloseOutcome::Retry(attempt) => {
                tracing::info!(
                    "Connection to {} lost (code {}), reconnecting in {:?} (attempt {})",
                    self.url,
                    close.code,
                    self.policy.interval,
                    attempt
                );
                if let Some(on_reconnect) = callbacks.on_reconnect {
                    on_reconnect();
                }
                self.arm_reconnect();
            }
            CloseOutcome::Exhausted(transport) => {
                tracing::error!(
                    "Giving up on {} after {:?} reconnect attempts",
                    self.url,
                    self.policy.max_attempts
                );
                if let Some(on_error) = callbacks.on_error {
                    on_error(ErrorEvent::ReconnectionExhausted { transport });
                }
            }
        }
    }

    /// Start the retry timer unless the close handler disabled reconnection
    fn arm_reconnect(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.phase != ReconnectState::ReconnectPending || !state.reconnect_enabled {
            return;
        }
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut State) {
        state.timer_epoch += 1;
        let epoch = state.timer_epoch;
        let shared = Arc::clone(self);
        let interval = self.policy.interval;

        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            shared.fire_reconnect(epoch);
        });

        if let Some(previous) = state.reconnect_timer.replace(ReconnectTimer { epoch, task }) {
            previous.task.abort();
        }
    }

    fn fire_reconnect(self: &Arc<Self>, epoch: u64) {
        let failure = {
            let mut state = self.lock_state();
            let armed = matches!(&state.reconnect_timer, Some(timer) if timer.epoch == epoch);
            if !armed || state.phase != ReconnectState::ReconnectPending {
                return;
            }
            tracing::debug!("Reconnect timer fired for {}", self.url);
            match self.open_connection(&mut state) {
                Ok(()) => return,
                Err(e) => e,
            }
        };

        // A connect request that fails outright counts as a lost connection
        tracing::warn!("Reconnect to {} failed: {}", self.url, failure);
        if let Some(on_error) = self.callbacks().on_error {
            on_error(ErrorEvent::Transport(failure.to_string()));
        }
        let outcome = {
            let mut state = self.lock_state();
            if state.phase != ReconnectState::ReconnectPending {
                return;
            }
            self.close_outcome(&mut state)
        };
        self.report_close(outcome, CloseEvent::abnormal(failure.to_string()));
    }
}

fn spawn_event_pump(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !shared.dispatch(generation, event) {
                break;
            }
        }
        tracing::trace!("Event pump for generation {} finished", generation);
    });
}
