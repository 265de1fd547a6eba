//! WebSocket Transport
//!
//! Underlying transport built on tokio-tungstenite. Each connection runs on
//! its own task and reports its lifecycle through the event channel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use url::Url;

use super::connection::{
    CloseEvent, Connection, ConnectionEvent, Opened, ReadyState, Transport, TransportOptions,
    CLOSE_NO_STATUS,
};
use super::frame::{Frame, TransportError};

/// Transport kind reported by WebSocket connections
pub const TRANSPORT_KIND: &str = "websocket";

/// Creates WebSocket connections. Must be used inside a Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        WebSocketTransport
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        url: &Url,
        protocols: &[String],
        options: &TransportOptions,
    ) -> Result<Opened, TransportError> {
        let request = build_request(url, protocols)?;
        let ready = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        tracing::debug!("Opening WebSocket to {}", request.uri());
        tokio::spawn(run_connection(
            request,
            options.clone(),
            ready.clone(),
            events_tx,
            commands_rx,
        ));

        Ok(Opened {
            connection: Box::new(WebSocketConnection {
                commands: commands_tx,
                ready,
            }),
            events: events_rx,
        })
    }
}

/// Map the target address to a WebSocket handshake request
fn build_request(url: &Url, protocols: &[String]) -> Result<Request, TransportError> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    };
    let mut target = url.clone();
    if target.set_scheme(scheme).is_err() {
        return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
    }

    let mut request = target
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    Ok(request)
}

enum Command {
    Send(Frame),
    Close,
}

struct WebSocketConnection {
    commands: mpsc::UnboundedSender<Command>,
    ready: Arc<AtomicU8>,
}

impl Connection for WebSocketConnection {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| TransportError::NotOpen)
    }

    fn close(&self) -> Result<(), TransportError> {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => Ok(()),
            ReadyState::Connecting | ReadyState::Open => {
                self.ready.store(ReadyState::Closing as u8, Ordering::SeqCst);
                // The task may already be gone, in which case it is closed
                let _ = self.commands.send(Command::Close);
                Ok(())
            }
        }
    }

    fn transport_kind(&self) -> Option<String> {
        Some(TRANSPORT_KIND.to_string())
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from(self.ready.load(Ordering::SeqCst))
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
        }
    }
}

fn close_event(frame: Option<CloseFrame>) -> CloseEvent {
    match frame {
        Some(frame) => CloseEvent {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
            was_clean: true,
        },
        None => CloseEvent {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
            was_clean: true,
        },
    }
}

async fn run_connection(
    request: Request,
    options: TransportOptions,
    ready: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let uri = request.uri().to_string();
    let set_ready = |state: ReadyState| ready.store(state as u8, Ordering::SeqCst);

    let stream = match tokio::time::timeout(options.connect_timeout(), connect_async(request)).await
    {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            tracing::warn!("WebSocket connect to {} failed: {}", uri, e);
            set_ready(ReadyState::Closed);
            let _ = events.send(ConnectionEvent::Error(e.to_string()));
            let _ = events.send(ConnectionEvent::Close(CloseEvent::abnormal(e.to_string())));
            return;
        }
        Err(_) => {
            tracing::warn!("WebSocket connect to {} timed out", uri);
            set_ready(ReadyState::Closed);
            let _ = events.send(ConnectionEvent::Error("connect timed out".to_string()));
            let _ = events.send(ConnectionEvent::Close(CloseEvent::abnormal(
                "connect timed out",
            )));
            return;
        }
    };

    let (mut write, mut read) = stream.split();

    // close() while the handshake was still running
    if ReadyState::from(ready.load(Ordering::SeqCst)) == ReadyState::Closing {
        let _ = write.send(Message::Close(None)).await;
        set_ready(ReadyState::Closed);
        let _ = events.send(ConnectionEvent::Close(CloseEvent::normal()));
        return;
    }

    set_ready(ReadyState::Open);
    tracing::info!("WebSocket connected to {}", uri);
    let _ = events.send(ConnectionEvent::Open);

    let close = loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ConnectionEvent::Message(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(ConnectionEvent::Message(Frame::Binary(data)));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket to {} received close frame", uri);
                    break close_event(frame);
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket read error on {}: {}", uri, e);
                    let _ = events.send(ConnectionEvent::Error(e.to_string()));
                    break CloseEvent::abnormal(e.to_string());
                }
                None => break CloseEvent::abnormal("stream ended"),
            },
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if let Err(e) = write.send(Message::from(frame)).await {
                        tracing::warn!("WebSocket send to {} failed: {}", uri, e);
                        let _ = events.send(ConnectionEvent::Error(e.to_string()));
                        break CloseEvent::abnormal(e.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    set_ready(ReadyState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    break CloseEvent::normal();
                }
            },
        }
    };

    set_ready(ReadyState::Closed);
    tracing::debug!("WebSocket to {} closed (code {})", uri, close.code);
    let _ = events.send(ConnectionEvent::Close(close));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_maps_http_schemes() {
        let url = Url::parse("http://localhost:8080/push").unwrap();
        let request = build_request(&url, &[]).unwrap();
        assert_eq!(request.uri().to_string(), "ws://localhost:8080/push");

        let url = Url::parse("https://example.com/push").unwrap();
        let request = build_request(&url, &[]).unwrap();
        assert_eq!(request.uri().scheme_str(), Some("wss"));
    }

    #[test]
    fn test_build_request_sets_protocols() {
        let url = Url::parse("ws://localhost:8080/push").unwrap();
        let protocols = vec!["v1.push".to_string(), "v2.push".to_string()];
        let request = build_request(&url, &protocols).unwrap();
        assert_eq!(
            request.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "v1.push, v2.push"
        );
    }

    #[test]
    fn test_build_request_rejects_other_schemes() {
        let url = Url::parse("ftp://localhost/push").unwrap();
        let result = build_request(&url, &[]);
        assert!(matches!(result, Err(TransportError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[test]
    fn test_frame_to_message() {
        assert_eq!(Message::from(Frame::from("hi")), Message::text("hi"));
        assert_eq!(
            Message::from(Frame::from(vec![1u8, 2])),
            Message::binary(vec![1u8, 2])
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        // Bind and drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{}/push", addr)).unwrap();
        let mut opened = WebSocketTransport::new()
            .connect(&url, &[], &TransportOptions::default())
            .unwrap();

        assert!(matches!(
            opened.events.recv().await,
            Some(ConnectionEvent::Error(_))
        ));
        match opened.events.recv().await {
            Some(ConnectionEvent::Close(close)) => assert!(!close.was_clean),
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(opened.connection.ready_state(), ReadyState::Closed);
        assert!(matches!(
            opened.connection.send(Frame::from("x")),
            Err(TransportError::NotOpen)
        ));
    }
}
