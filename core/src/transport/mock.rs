//! Scripted transport for unit tests.
//!
//! Every connect request yields a [`MockHandle`] the test uses to emit
//! events as the underlying library would.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use url::Url;

use super::connection::{
    CloseEvent, Connection, ConnectionEvent, Opened, ReadyState, Transport, TransportOptions,
};
use super::frame::{Frame, TransportError};

#[derive(Default)]
pub(crate) struct MockTransport {
    connections: Mutex<Vec<MockHandle>>,
    fail_next: AtomicBool,
    auto_open: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle of the n-th connection requested so far
    pub(crate) fn connection(&self, n: usize) -> MockHandle {
        self.connections.lock().unwrap()[n].clone()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Open every connection requested from now on as soon as it is created
    pub(crate) fn auto_open(&self) {
        self.auto_open.store(true, Ordering::SeqCst);
    }

    /// Make the next connect request fail synchronously
    pub(crate) fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        _url: &Url,
        _protocols: &[String],
        _options: &TransportOptions,
    ) -> Result<Opened, TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Handshake("refused".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = MockHandle {
            events: events_tx,
            ready: Arc::new(AtomicU8::new(ReadyState::Connecting as u8)),
            sent: Arc::new(Mutex::new(Vec::new())),
            close_calls: Arc::new(AtomicUsize::new(0)),
        };
        self.connections.lock().unwrap().push(handle.clone());
        if self.auto_open.load(Ordering::SeqCst) {
            handle.open();
        }

        Ok(Opened {
            connection: Box::new(MockConnection { handle }),
            events: events_rx,
        })
    }
}

#[derive(Clone)]
pub(crate) struct MockHandle {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    ready: Arc<AtomicU8>,
    sent: Arc<Mutex<Vec<Frame>>>,
    close_calls: Arc<AtomicUsize>,
}

impl MockHandle {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn open(&self) {
        self.set_ready(ReadyState::Open);
        self.emit(ConnectionEvent::Open);
    }

    pub(crate) fn message(&self, text: &str) {
        self.emit(ConnectionEvent::Message(Frame::from(text)));
    }

    pub(crate) fn error(&self, message: &str) {
        self.emit(ConnectionEvent::Error(message.to_string()));
    }

    /// Peer-side closure
    pub(crate) fn drop_connection(&self) {
        self.set_ready(ReadyState::Closed);
        self.emit(ConnectionEvent::Close(CloseEvent::abnormal("dropped")));
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    handle: MockHandle,
}

impl Connection for MockConnection {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.handle.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.handle.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.ready_state() == ReadyState::Closed {
            return Ok(());
        }
        self.handle.set_ready(ReadyState::Closed);
        self.handle
            .emit(ConnectionEvent::Close(CloseEvent::normal()));
        Ok(())
    }

    fn transport_kind(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from(self.handle.ready.load(Ordering::SeqCst))
    }
}
