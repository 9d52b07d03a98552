//! WebSocket canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PlacementService ── AdmissionController
//!             ├── connection task ──┤          │
//! Client B ──┘   (select! loop)     │          ▼
//!                                   │      GridStore ──► Persister ──► PixelStore
//!                                   │          │                     (RocksDB/none)
//!                                   └── BroadcastHub ◄──┘
//!                                          │
//!                          ┌───────────────┼───────────────┐
//!                          ▼               ▼               ▼
//!                       Client A        Client B        Client C
//! ```
//!
//! Each connection:
//! - derives the client identity from its address (or `X-Forwarded-For`)
//! - subscribes to the hub and sends the snapshot before anything else,
//!   buffering deltas on the connection while the snapshot is written
//! - answers `Place`/`Ping` frames and forwards deltas as they arrive
//! - pings the client on the heartbeat interval
//! - unsubscribes on every exit path

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastHub, CanvasEvent, ObserverHandle};
use crate::config::ServerConfig;
use crate::grid::GridStore;
use crate::placement::{PlacementRequest, PlacementService};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{rehydrate, Persister, PixelStore, RocksPixelStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// State shared by every connection task.
struct ServerState {
    config: ServerConfig,
    service: PlacementService,
    stats: AtomicServerStats,
}

/// The canvas server.
pub struct CanvasServer {
    state: Arc<ServerState>,
    /// Persistent pixel store (optional)
    store: Option<Arc<dyn PixelStore>>,
}

impl CanvasServer {
    /// Create a server, opening RocksDB at `storage_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                let store = RocksPixelStore::open(store_config, config.canvas.size)?;
                Self::with_store(config, Arc::new(store))
            }
            None => Ok(Self::build(config, None)),
        }
    }

    /// Create a server persisting to `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PixelStore>) -> Result<Self, StoreError> {
        let persister = Persister::spawn(store.clone(), config.persist_queue)
            .map_err(|e| StoreError::Unavailable(format!("cannot start persister: {e}")))?;
        Ok(Self::build(config, Some((store, persister))))
    }

    fn build(config: ServerConfig, storage: Option<(Arc<dyn PixelStore>, Persister)>) -> Self {
        let grid = Arc::new(GridStore::new(config.canvas.size));
        let hub = Arc::new(BroadcastHub::new(
            grid.clone(),
            config.observer_buffer,
            config.echo_policy,
        ));
        let mut service = PlacementService::new(&config.canvas, grid, hub);

        let store = match storage {
            Some((store, persister)) => {
                service = service.with_persister(persister);
                Some(store)
            }
            None => None,
        };

        Self {
            state: Arc::new(ServerState {
                config,
                service,
                stats: AtomicServerStats::default(),
            }),
            store,
        }
    }

    /// Load persisted pixels into the grid. Call before accepting traffic.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let service = &self.state.service;
        let restored = rehydrate(service.grid(), store.as_ref(), service.palette())?;
        log::info!("Recovery complete: {restored} pixels restored");
        Ok(restored)
    }

    /// Recover, bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.recover()?;

        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!(
            "Canvas server listening on {} ({}x{} canvas, {}s cooldown)",
            self.state.config.bind_addr,
            self.state.config.canvas.size,
            self.state.config.canvas.size,
            self.state.config.canvas.cooldown.as_secs()
        );

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
    ) -> Result<(), BoxError> {
        let mut forwarded_for: Option<String> = None;
        let capture_headers =
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                forwarded_for = request
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(response)
            };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_headers).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = state.stats.active_connections.fetch_add(1, Ordering::SeqCst);
        if active >= state.config.max_observers as u64 {
            state.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
            state.stats.refused_connections.fetch_add(1, Ordering::Relaxed);
            log::warn!("Refusing {addr}: {active} observers connected");
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "server full".into(),
            };
            ws_sender.send(Message::Close(Some(frame))).await?;
            return Ok(());
        }

        let identity: Arc<str> = client_identity(
            addr,
            forwarded_for.as_deref(),
            state.config.trust_forwarded_for,
        )
        .into();
        // Subscribing clones the whole grid under every row lock.
        let hub = state.service.hub().clone();
        let mut observer = match tokio::task::spawn_blocking(move || hub.subscribe()).await {
            Ok(observer) => observer,
            Err(e) => {
                state.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        log::info!("Observer {} connected from {addr} as {identity}", observer.id());

        let result = Self::serve_observer(
            &mut ws_sender,
            &mut ws_receiver,
            &mut observer,
            &identity,
            &state,
        )
        .await;

        state.service.hub().unsubscribe(&observer.id());
        state.stats.active_connections.fetch_sub(1, Ordering::SeqCst);
        log::info!("Observer {} disconnected ({addr})", observer.id());

        result
    }

    async fn serve_observer(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        observer: &mut ObserverHandle,
        identity: &Arc<str>,
        state: &ServerState,
    ) -> Result<(), BoxError> {
        let service = &state.service;
        let palette = service.palette().clone();
        let cooldown_secs = service.cooldown().as_secs();

        let limit = state.config.join_backlog;
        let mut backlog: VecDeque<CanvasEvent> = VecDeque::new();

        // The snapshot is queued during subscribe; send it before any reply.
        let snapshot = match observer.recv().await {
            Some(event) => event,
            None => {
                Self::close_lagging(ws_sender, observer).await;
                return Ok(());
            }
        };
        let encode = {
            let palette = palette.clone();
            tokio::task::spawn_blocking(move || {
                ServerMessage::from_event(&snapshot, &palette, cooldown_secs)
                    .map(|msg| msg.encode())
                    .transpose()
            })
        };
        let frame = match buffer_while(encode, observer, &mut backlog, limit).await {
            Some(encoded) => encoded??,
            None => {
                Self::close_lagging(ws_sender, observer).await;
                return Ok(());
            }
        };
        if let Some(frame) = frame {
            if !Self::send_buffered(ws_sender, observer, &mut backlog, limit, frame).await? {
                Self::close_lagging(ws_sender, observer).await;
                return Ok(());
            }
        }

        // Deltas committed while the snapshot was in flight, oldest first.
        while let Some(event) = backlog.pop_front() {
            if let Some(msg) = ServerMessage::from_event(&event, &palette, cooldown_secs) {
                let frame = msg.encode()?;
                if !Self::send_buffered(ws_sender, observer, &mut backlog, limit, frame).await? {
                    Self::close_lagging(ws_sender, observer).await;
                    return Ok(());
                }
            }
        }

        let period = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            state.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            state.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            let reply = match ClientMessage::decode(&data) {
                                Ok(ClientMessage::Place { x, y, color }) => {
                                    let request = PlacementRequest::new(x, y, color, identity.clone())
                                        .from_observer(observer.id());
                                    ServerMessage::from(service.place(request))
                                }
                                Ok(ClientMessage::Ping) => ServerMessage::Pong,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {identity}: {e}");
                                    ServerMessage::Invalid { reason: e.to_string() }
                                }
                            };
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed by {identity}");
                            break;
                        }

                        Some(Ok(Message::Text(_))) => {
                            state.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            let reply = ServerMessage::Invalid {
                                reason: "Text frames are not supported, send binary frames".into(),
                            };
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {identity}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing canvas event
                event = observer.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(msg) = ServerMessage::from_event(&event, &palette, cooldown_secs) {
                                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                            }
                        }
                        None => {
                            // The hub dropped this observer for lagging.
                            Self::close_lagging(ws_sender, observer).await;
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Write one binary frame while moving hub events into `backlog`.
    ///
    /// Returns `false` when the backlog overflowed or the hub dropped the
    /// observer before the write finished.
    async fn send_buffered(
        ws_sender: &mut WsSender,
        observer: &mut ObserverHandle,
        backlog: &mut VecDeque<CanvasEvent>,
        limit: usize,
        frame: Vec<u8>,
    ) -> Result<bool, BoxError> {
        let send = ws_sender.send(Message::Binary(frame.into()));
        match buffer_while(send, observer, backlog, limit).await {
            Some(sent) => {
                sent?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close_lagging(ws_sender: &mut WsSender, observer: &ObserverHandle) {
        log::warn!("Observer {} fell behind, closing connection", observer.id());
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: "lagging, reconnect for a fresh snapshot".into(),
        };
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let stats = &self.state.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::SeqCst),
            refused_connections: stats.refused_connections.load(Ordering::Relaxed),
            total_messages: stats.total_messages.load(Ordering::Relaxed),
            total_bytes: stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    /// Placement pipeline, also usable without a network connection.
    pub fn service(&self) -> &PlacementService {
        &self.state.service
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<dyn PixelStore>> {
        self.store.as_ref()
    }

    /// Wait for queued pixel writes to reach the store.
    pub async fn flush(&self) {
        if let Some(persister) = self.state.service.persister() {
            persister.flush().await;
        }
    }
}

/// Drive `fut` to completion while draining `observer` into `backlog`.
///
/// Returns `None` once the backlog would exceed `limit` or the hub has
/// dropped the observer.
async fn buffer_while<F: Future>(
    fut: F,
    observer: &mut ObserverHandle,
    backlog: &mut VecDeque<CanvasEvent>,
    limit: usize,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            output = &mut fut => return Some(output),
            event = observer.recv() => match event {
                Some(event) if backlog.len() < limit => backlog.push_back(event),
                _ => return None,
            },
        }
    }
}

/// Identity used for the cooldown.
///
/// The peer IP, or with `trust_forwarded_for` the first `X-Forwarded-For`
/// entry when one is present.
pub fn client_identity(addr: SocketAddr, forwarded_for: Option<&str>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let first = forwarded_for
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = first {
            return ip.to_string();
        }
    }
    addr.ip().to_string()
}
