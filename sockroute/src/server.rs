//! WebSocket server: accept loop, connection handshake, per-connection dispatch.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                    ┌── Router ── handlers ── Response ──┐
//!          ├── accept ── reader ┤                                    │
//! Peer B ──┘                    └── META /connection (handshake)     ▼
//!                                                                   Hub ── Distributor ── other servers
//!          ◄────────────── writer task ◄── Connection (mpsc) ◄──────┘
//! ```
//!
//! Each connection gets one reader loop, which dispatches frames strictly in
//! arrival order, and one writer task draining the connection's queue. The
//! first frame is expected to be the handshake; it mints or resumes the
//! connection id before any application route runs.
//!
//! The distributor is initialized and every channel listener is in place
//! before [`ServerEvent::Ready`] fires and before the first accept.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::distributor::{Distributor, DistributorError, InMemoryDistributor};
use crate::hub::{Hub, HubError};
use crate::protocol::{ClientFrame, Method, ServerFrame, WireFormat, HANDSHAKE_PATH, MAX_ENVELOPE_TARGET};
use crate::registry::{Connection, Outbound};
use crate::router::Router;

pub use crate::hub::ServerStats;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Wire format for every connection of this server
    pub wire_format: WireFormat,
    /// Cluster-unique id; a random one is generated when `None`
    pub server_id: Option<String>,
    /// Lifecycle event buffer per subscriber
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            wire_format: WireFormat::Binary,
            server_id: None,
            event_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on localhost.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            event_capacity: 64,
            ..Self::default()
        }
    }
}

/// Lifecycle events observable by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Distributor initialized and channel listeners established.
    Ready { server_id: String },
    /// Handshake completed.
    Connected {
        connection_id: String,
        resumed: bool,
        restored_groups: usize,
    },
    Closed { connection_id: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("distributor startup failed: {0}")]
    Distributor(#[from] DistributorError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// The routing server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    hub: Arc<Hub>,
    events: broadcast::Sender<ServerEvent>,
    started: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig, router: Router, distributor: Arc<dyn Distributor>) -> Self {
        let server_id = config
            .server_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let hub = Hub::new(server_id, config.wire_format, distributor);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            router: Arc::new(router),
            hub,
            events,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Single-process server with its own in-memory distributor.
    pub fn with_memory(config: ServerConfig, router: Router) -> Self {
        Self::new(config, router, Arc::new(InMemoryDistributor::new()))
    }

    pub fn server_id(&self) -> &str {
        self.hub.server_id()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn stats(&self) -> ServerStats {
        self.hub.stats()
    }

    /// Subscribe to lifecycle events. Subscribe before [`start`](Self::start)
    /// to observe `Ready`.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Initialize the distributor and its channel listeners, then emit `Ready`.
    ///
    /// Failure is fatal: the server must not accept connections.
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.hub.start().await?;
        self.started.store(true, Ordering::Release);
        log::info!("Server {} ready", self.server_id());
        let _ = self.events.send(ServerEvent::Ready {
            server_id: self.server_id().to_string(),
        });
        Ok(())
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Start (if needed), bind the configured address and serve forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.start().await?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        self.start().await?;
        log::info!(
            "Server {} listening on {} ({:?} frames)",
            self.server_id(),
            listener.local_addr()?,
            self.config.wire_format
        );
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let router = self.router.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, router, events).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .field("router", &self.router)
            .finish()
    }
}

/// Resume token carried by a handshake frame, if usable.
fn resume_token(frame: &ClientFrame) -> Option<String> {
    let token = frame.body.as_ref()?.as_text()?.trim();
    if token.is_empty() || token.len() > MAX_ENVELOPE_TARGET {
        return None;
    }
    Some(token.to_string())
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
    router: Arc<Router>,
    events: broadcast::Sender<ServerEvent>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    let wire = hub.wire();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(bytes) => {
                    if let Err(e) = ws_sender.send(wire.to_message(bytes)).await {
                        log::debug!("write to {addr} failed: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let counters = hub.counters();
    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut connection: Option<Arc<Connection>> = None;
    let read_loop = AssertUnwindSafe(async {
        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!("read from {addr} failed: {e}");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Some(payload) = WireFormat::payload(&msg) else {
                continue;
            };
            counters.frames_received.fetch_add(1, Ordering::Relaxed);
            let Some(frame) = wire.decode_client(payload) else {
                counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("malformed frame ({} bytes) from {addr}, ignored", payload.len());
                continue;
            };
            log::trace!("{} {} from {addr}", frame.method, frame.url);

            match &connection {
                Some(conn) => {
                    router.dispatch(frame, conn.clone(), &hub).await;
                }
                None => {
                    let is_handshake = frame.is_handshake();
                    let conn = establish(&frame, &tx, &hub, &events).await?;
                    connection = Some(conn.clone());
                    if !is_handshake {
                        router.dispatch(frame, conn, &hub).await;
                    }
                }
            }
        }
        Ok::<(), ServerError>(())
    });
    // Cleanup below runs however the read loop ends.
    let result = read_loop.catch_unwind().await.unwrap_or_else(|_| {
        log::error!("connection task for {addr} panicked");
        Ok(())
    });

    if let Some(conn) = connection.take() {
        if let Err(e) = hub.unregister(&conn).await {
            log::error!("cleanup of {} failed: {e}", conn.id());
        }
        log::info!("Connection {} closed", conn.id());
        let _ = events.send(ServerEvent::Closed {
            connection_id: conn.id().to_string(),
        });
    }
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    drop(tx);
    let _ = writer.await;
    result
}

/// Mint or resume the connection id and answer the handshake.
async fn establish(
    frame: &ClientFrame,
    tx: &mpsc::UnboundedSender<Outbound>,
    hub: &Arc<Hub>,
    events: &broadcast::Sender<ServerEvent>,
) -> Result<Arc<Connection>, ServerError> {
    let token = if frame.is_handshake() {
        resume_token(frame)
    } else {
        log::debug!("first frame {} {} is not a handshake", frame.method, frame.url);
        None
    };
    let resumed = token.is_some();
    let id = token.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let conn = Arc::new(Connection::new(id, tx.clone()));

    hub.register(conn.clone()).await?;
    let restored = if resumed {
        hub.restore_groups(&conn).await?
    } else {
        Vec::new()
    };

    let reply = ServerFrame::new(Method::Meta, HANDSHAKE_PATH, 200)
        .with_reply_to(frame.request_id.filter(|_| frame.is_handshake()))
        .with_body(conn.id());
    hub.send_local(&conn, reply)?;

    log::info!(
        "Connection {} {}",
        conn.id(),
        if resumed { "resumed" } else { "established" }
    );
    let _ = events.send(ServerEvent::Connected {
        connection_id: conn.id().to_string(),
        resumed,
        restored_groups: restored.len(),
    });
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;

    #[test]
    fn test_resume_token() {
        assert_eq!(resume_token(&ClientFrame::handshake(None)), None);
        assert_eq!(
            resume_token(&ClientFrame::handshake(Some("abc"))).as_deref(),
            Some("abc")
        );
        let long = "x".repeat(256);
        assert_eq!(resume_token(&ClientFrame::handshake(Some(&long))), None);
        let binary = ClientFrame::handshake(None).with_body(Body::binary(vec![1u8]));
        assert_eq!(resume_token(&binary), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.wire_format, WireFormat::Binary);
        assert!(config.server_id.is_none());
        assert_eq!(ServerConfig::for_testing().bind_addr, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_start_emits_ready_once() {
        let config = ServerConfig {
            server_id: Some("node-1".into()),
            ..ServerConfig::for_testing()
        };
        let server = Server::with_memory(config, Router::new());
        let mut events = server.subscribe();
        server.start().await.unwrap();
        server.start().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::Ready { server_id: "node-1".into() }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_generated_server_ids_differ() {
        let a = Server::with_memory(ServerConfig::for_testing(), Router::new());
        let b = Server::with_memory(ServerConfig::for_testing(), Router::new());
        assert_ne!(a.server_id(), b.server_id());
    }
}
