//! Reconnecting peer-side transport.
//!
//! ```text
//!            ┌────────────┐  socket open   ┌─────────────┐ handshake reply ┌────────┐
//!   ───────► │ Connecting │ ─────────────► │ Handshaking │ ──────────────► │ Active │
//!            └────────────┘                └─────────────┘                 └────────┘
//!                  ▲                            │ abnormal                     │
//!                  │        backoff delay       ▼                              │
//!                  └────────────────────────────┴──────────── abnormal ────────┤
//!                                                                              │ clean
//!                                                                        ┌────────┐
//!                                                                        │ Closed │
//!                                                                        └────────┘
//! ```
//!
//! Frames sent while not `Active` wait in a pending queue and are flushed in
//! order right after the handshake completes. On an abnormal close, frames
//! that were handed to the writer but not written go back to the front of
//! the queue.
//!
//! Close is clean when the server sends a WebSocket Close frame or
//! [`Transport::close`] is called; anything else reconnects with
//! exponential backoff, forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::client::ClientError;
use crate::protocol::{ClientFrame, ServerFrame, WireFormat};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Delay before the first reconnect attempt
    pub first_reconnect_delay: Duration,
    /// Cap for the doubling delay
    pub max_reconnect_delay: Duration,
    /// Give up on a handshake that takes longer than this
    pub handshake_timeout: Duration,
    pub wire_format: WireFormat,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            first_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            wire_format: WireFormat::Binary,
        }
    }
}

impl TransportConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            first_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(2),
            wire_format: WireFormat::Binary,
        }
    }
}

/// Exponential backoff: `initial, 2·initial, 4·initial, … max, max, …`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket opened; handshake in flight.
    Open,
    /// Handshake completed; pending frames have been flushed.
    Ready { connection_id: String, resumed: bool },
    /// A server frame other than the handshake reply.
    Frame(ServerFrame),
    /// The socket closed. `clean: false` is followed by `Reconnecting`.
    Closed { clean: bool },
    Reconnecting { attempt: u32, delay: Duration },
}

struct Shared {
    state: TransportState,
    pending: VecDeque<Bytes>,
    /// Writer queue of the live session; `Some` only while `Active`.
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    connection_id: Option<String>,
}

/// A self-healing connection to one server url.
pub struct Transport {
    config: TransportConfig,
    shared: Arc<Mutex<Shared>>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    close_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Start connecting to `url` in the background. Must be called within a
    /// tokio runtime.
    pub fn connect(url: impl Into<String>, config: TransportConfig) -> Self {
        let url = url.into();
        let shared = Arc::new(Mutex::new(Shared {
            state: TransportState::Connecting,
            pending: VecDeque::new(),
            outgoing: None,
            connection_id: None,
        }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            url,
            config.clone(),
            shared.clone(),
            event_tx,
            close_rx,
        ));
        Self {
            config,
            shared,
            event_rx: Some(event_rx),
            close_tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn wire_format(&self) -> WireFormat {
        self.config.wire_format
    }

    /// Transmit now if active, otherwise queue for the next handshake.
    pub async fn send(&self, bytes: Bytes) -> Result<(), ClientError> {
        let mut shared = self.shared.lock().await;
        if shared.state == TransportState::Closed {
            return Err(ClientError::Closed);
        }
        let bytes = match &shared.outgoing {
            Some(tx) => match tx.send(bytes) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(bytes)) => bytes,
            },
            None => bytes,
        };
        shared.pending.push_back(bytes);
        Ok(())
    }

    pub async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let bytes = self.config.wire_format.encode_client(frame)?;
        self.send(bytes).await
    }

    pub async fn state(&self) -> TransportState {
        self.shared.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == TransportState::Active
    }

    /// Authoritative id from the last completed handshake.
    pub async fn connection_id(&self) -> Option<String> {
        self.shared.lock().await.connection_id.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    /// Close cleanly and wait for the background task to finish.
    pub async fn close(&self) {
        let _ = self.close_tx.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn set_state(shared: &Mutex<Shared>, state: TransportState) {
    shared.lock().await.state = state;
}

async fn run(
    url: String,
    config: TransportConfig,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.first_reconnect_delay, config.max_reconnect_delay);
    let mut attempt = 0u32;

    loop {
        if *close_rx.borrow() {
            break;
        }
        set_state(&shared, TransportState::Connecting).await;

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = close_rx.changed() => break,
        };
        let clean = match connected {
            Ok((ws_stream, _)) => {
                log::debug!("connected to {url}");
                let _ = events.send(TransportEvent::Open);
                let end = session(ws_stream, &config, &shared, &events, &mut close_rx, &mut backoff).await;
                if end.established {
                    attempt = 0;
                }
                end.clean
            }
            Err(e) => {
                log::debug!("connect to {url} failed: {e}");
                false
            }
        };

        let _ = events.send(TransportEvent::Closed { clean });
        if clean {
            log::info!("connection to {url} closed cleanly");
            break;
        }

        attempt += 1;
        let delay = backoff.next_delay();
        log::warn!("connection to {url} lost, reconnecting in {delay:?} (attempt {attempt})");
        let _ = events.send(TransportEvent::Reconnecting { attempt, delay });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = close_rx.changed() => break,
        }
    }

    let mut shared = shared.lock().await;
    shared.state = TransportState::Closed;
    shared.outgoing = None;
}

struct SessionEnd {
    clean: bool,
    /// The handshake completed during this session.
    established: bool,
}

impl SessionEnd {
    fn before_handshake(clean: bool) -> Self {
        Self {
            clean,
            established: false,
        }
    }
}

/// One socket lifetime.
async fn session(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    config: &TransportConfig,
    shared: &Arc<Mutex<Shared>>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    close_rx: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> SessionEnd {
    let wire = config.wire_format;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Handshake
    let previous_id = {
        let mut shared = shared.lock().await;
        shared.state = TransportState::Handshaking;
        shared.connection_id.clone()
    };
    let hello = match wire.encode_client(&ClientFrame::handshake(previous_id.as_deref())) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("cannot encode handshake: {e}");
            return SessionEnd::before_handshake(false);
        }
    };
    if let Err(e) = ws_sender.send(wire.to_message(hello)).await {
        log::debug!("handshake send failed: {e}");
        return SessionEnd::before_handshake(false);
    }

    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    let connection_id = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Close(_))) => return SessionEnd::before_handshake(true),
                Some(Ok(msg)) => {
                    let Some(frame) = WireFormat::payload(&msg).and_then(|p| wire.decode_server(p)) else {
                        continue;
                    };
                    if frame.is_handshake() {
                        match frame.body.as_ref().and_then(|b| b.as_text()) {
                            Some(id) if !id.is_empty() => break id.to_string(),
                            _ => {
                                log::warn!("handshake reply without connection id");
                                return SessionEnd::before_handshake(false);
                            }
                        }
                    }
                    let _ = events.send(TransportEvent::Frame(frame));
                }
                Some(Err(e)) => {
                    log::debug!("read during handshake failed: {e}");
                    return SessionEnd::before_handshake(false);
                }
                None => return SessionEnd::before_handshake(false),
            },
            _ = &mut deadline => {
                log::warn!("handshake timed out after {:?}", config.handshake_timeout);
                return SessionEnd::before_handshake(false);
            }
            _ = close_rx.changed() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                let _ = ws_sender.close().await;
                return SessionEnd::before_handshake(true);
            }
        }
    };

    backoff.reset();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let flushed = {
        let mut shared = shared.lock().await;
        let flushed = shared.pending.len();
        for bytes in shared.pending.drain(..) {
            let _ = out_tx.send(bytes);
        }
        shared.outgoing = Some(out_tx);
        shared.state = TransportState::Active;
        shared.connection_id = Some(connection_id.clone());
        flushed
    };
    let resumed = previous_id.as_deref() == Some(connection_id.as_str());
    log::info!(
        "connection {} {} ({} queued frame(s) flushed)",
        connection_id,
        if resumed { "resumed" } else { "established" },
        flushed
    );
    let _ = events.send(TransportEvent::Ready {
        connection_id,
        resumed,
    });

    let mut unsent: Option<Bytes> = None;
    let clean = loop {
        tokio::select! {
            Some(bytes) = out_rx.recv() => {
                if let Err(e) = ws_sender.send(wire.to_message(bytes.clone())).await {
                    log::debug!("write failed: {e}");
                    unsent = Some(bytes);
                    break false;
                }
            }
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Close(_))) => break true,
                Some(Ok(msg)) => {
                    let Some(payload) = WireFormat::payload(&msg) else { continue };
                    match wire.decode_server(payload) {
                        Some(frame) => {
                            let _ = events.send(TransportEvent::Frame(frame));
                        }
                        None => log::warn!("malformed server frame ({} bytes) ignored", payload.len()),
                    }
                }
                Some(Err(e)) => {
                    log::debug!("read failed: {e}");
                    break false;
                }
                None => break false,
            },
            _ = close_rx.changed() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                let _ = ws_sender.close().await;
                break true;
            }
        }
    };

    // Requeue everything the writer never got to, ahead of newer frames.
    let mut shared = shared.lock().await;
    shared.outgoing = None;
    let mut requeue: Vec<Bytes> = unsent.into_iter().collect();
    while let Ok(bytes) = out_rx.try_recv() {
        requeue.push(bytes);
    }
    if !requeue.is_empty() {
        log::debug!("requeued {} unsent frame(s)", requeue.len());
    }
    for bytes in requeue.into_iter().rev() {
        shared.pending.push_front(bytes);
    }
    shared.state = if clean {
        TransportState::Closed
    } else {
        TransportState::Connecting
    };
    SessionEnd {
        clean,
        established: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_initial_above_max() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.first_reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_frames_queue_while_not_active() {
        // Nothing listens on port 1; the transport keeps retrying.
        let transport = Transport::connect("ws://127.0.0.1:1", TransportConfig::for_testing());
        transport
            .send_frame(&ClientFrame::new(crate::protocol::Method::Post, "/a"))
            .await
            .unwrap();
        transport.send(Bytes::from_static(b"raw")).await.unwrap();
        assert_eq!(transport.pending_len().await, 2);
        assert!(!transport.is_active().await);

        transport.close().await;
        assert_eq!(transport.state().await, TransportState::Closed);
        assert!(matches!(
            transport.send(Bytes::new()).await,
            Err(ClientError::Closed)
        ));
    }
}
