//! WebSocket client for the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Placement and ping requests
//! - An event channel carrying the snapshot, deltas and replies
//!
//! There is no offline queue: a placement made while disconnected fails,
//! and reconnecting delivers a fresh snapshot.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, PixelUpdate, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Full canvas state; always the first server message
    Snapshot {
        size: u16,
        cooldown_secs: u64,
        palette: Vec<String>,
        pixels: Vec<PixelUpdate>,
    },
    /// A pixel committed by anyone
    Delta(PixelUpdate),
    /// Our placement was committed
    Placed(PixelUpdate),
    RateLimited { remaining_secs: u64 },
    Invalid { reason: String },
    Pong,
    /// Connection lost
    Disconnected,
}

impl From<ServerMessage> for ClientEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Snapshot {
                size,
                cooldown_secs,
                palette,
                pixels,
            } => Self::Snapshot {
                size,
                cooldown_secs,
                palette,
                pixels,
            },
            ServerMessage::Delta(pixel) => Self::Delta(pixel),
            ServerMessage::Placed(pixel) => Self::Placed(pixel),
            ServerMessage::RateLimited { remaining_secs } => Self::RateLimited { remaining_secs },
            ServerMessage::Invalid { reason } => Self::Invalid { reason },
            ServerMessage::Pong => Self::Pong,
        }
    }
}

/// The canvas client.
pub struct CanvasClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Extra handshake headers
    headers: Vec<(String, String)>,

    server_url: String,
}

impl CanvasClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            headers: Vec::new(),
            server_url: server_url.into(),
        }
    }

    /// Add a header to the WebSocket handshake (e.g. `X-Forwarded-For`
    /// when talking through a proxy).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = match self.handshake_request() {
            Ok(request) => tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| ProtocolError::HandshakeFailed(e.to_string())),
            Err(e) => Err(e),
        };
        let ws_stream = match ws_result {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::from(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            log::debug!("Server closed connection: {} {}", frame.code, frame.reason);
                        }
                        break;
                    }
                    Err(e) => {
                        log::debug!("Connection error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    fn handshake_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ProtocolError> {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::HandshakeFailed(e.to_string()))?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProtocolError::HandshakeFailed(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProtocolError::HandshakeFailed(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    /// Ask the server to paint `(x, y)`.
    ///
    /// The outcome arrives as `Placed`, `RateLimited` or `Invalid`.
    pub async fn place(&self, x: i64, y: i64, color: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::place(x, y, color)).await
    }

    /// Send a ping to the server.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = msg.encode()?;

        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. `Disconnected` follows on the event channel.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
