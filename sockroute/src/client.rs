//! Peer-side client: request correlation and push listeners over a [`Transport`].
//!
//! ```text
//! Client::get("/x") ──► Correlator::register ─► id ─► Transport::send_frame
//!                                                         │
//! TransportEvent::Frame ──► Correlator::settle (reply_to = id) ──► Ok(frame) | Err(Rejected)
//!                      └──► Receiver::matching (method + path listeners, run unlocked)
//!                      └──► application events (frames that settled nothing)
//! ```
//!
//! Requests wait until a reply arrives; there is no built-in timeout, wrap
//! calls in `tokio::time::timeout` where one is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::path::{Params, PathPattern};
use crate::protocol::{ClientFrame, Headers, IntoBody, Method, ProtocolError, ServerFrame, MAX_U16_FIELD};
use crate::transport::{Transport, TransportConfig, TransportEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Reply status was 300 or above.
    #[error("request rejected with status {status}")]
    Rejected { status: u16, frame: Box<ServerFrame> },
    #[error("transport closed")]
    Closed,
    #[error("all request ids are in use")]
    IdsExhausted,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type Settle = oneshot::Sender<Result<ServerFrame, ClientError>>;

/// Pending-request table keyed by request id.
///
/// Ids start at 1, increase by one and wrap back to 1 after 65 279,
/// skipping ids still in flight.
#[derive(Debug, Default)]
pub struct Correlator {
    last_id: u16,
    pending: HashMap<u16, Settle>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free id and the receiver its reply settles.
    pub fn register(&mut self) -> Result<(u16, oneshot::Receiver<Result<ServerFrame, ClientError>>), ClientError> {
        let max = MAX_U16_FIELD as u16;
        if self.pending.len() >= max as usize {
            return Err(ClientError::IdsExhausted);
        }
        let mut id = self.last_id;
        loop {
            id = if id >= max { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                break;
            }
        }
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Settle the request `frame` replies to. Returns false if none is pending.
    pub fn settle(&mut self, frame: &ServerFrame) -> bool {
        let Some(id) = frame.reply_to else {
            return false;
        };
        let Some(tx) = self.pending.remove(&id) else {
            log::trace!("reply {} matches no pending request", id);
            return false;
        };
        let result = if frame.is_success() {
            Ok(frame.clone())
        } else {
            Err(ClientError::Rejected {
                status: frame.status,
                frame: Box::new(frame.clone()),
            })
        };
        let _ = tx.send(result);
        true
    }

    /// Drop a pending entry without settling it.
    pub fn forget(&mut self, id: u16) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fail every pending request with [`ClientError::Closed`].
    pub fn close_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(ClientError::Closed));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Listener for server frames matching a method and path pattern.
pub type Listener = Arc<dyn Fn(&ServerFrame, &Params) + Send + Sync>;

/// Push listener table, the peer-side mirror of the server router.
#[derive(Default)]
pub struct Receiver {
    listeners: HashMap<Method, Vec<(PathPattern, Listener)>>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, method: Method, pattern: impl Into<PathPattern>, listener: Listener) {
        self.listeners
            .entry(method)
            .or_default()
            .push((pattern.into(), listener));
    }

    fn listen<F>(mut self, method: Method, pattern: &str, listener: F) -> Self
    where
        F: Fn(&ServerFrame, &Params) + Send + Sync + 'static,
    {
        self.on(method, pattern, Arc::new(listener));
        self
    }

    pub fn get<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Get, pattern, f)
    }

    pub fn post<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Post, pattern, f)
    }

    pub fn put<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Put, pattern, f)
    }

    pub fn patch<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Patch, pattern, f)
    }

    pub fn delete<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Delete, pattern, f)
    }

    pub fn meta<F: Fn(&ServerFrame, &Params) + Send + Sync + 'static>(self, pattern: &str, f: F) -> Self {
        self.listen(Method::Meta, pattern, f)
    }

    /// Listeners matching `frame`, in registration order, with their bound params.
    pub fn matching(&self, frame: &ServerFrame) -> Vec<(Listener, Params)> {
        let Some(listeners) = self.listeners.get(&frame.method) else {
            return Vec::new();
        };
        listeners
            .iter()
            .filter_map(|(pattern, listener)| {
                pattern
                    .matches(&frame.url)
                    .map(|params| (listener.clone(), params))
            })
            .collect()
    }

    /// Invoke every matching listener in registration order; returns how many ran.
    pub fn dispatch(&self, frame: &ServerFrame) -> usize {
        run_listeners(self.matching(frame), frame)
    }
}

fn run_listeners(matched: Vec<(Listener, Params)>, frame: &ServerFrame) -> usize {
    let ran = matched.len();
    for (listener, params) in matched {
        listener(frame, &params);
    }
    ran
}

/// Dispatch with the table unlocked while listeners run, so a listener may
/// register further listeners.
fn notify_listeners(receiver: &Mutex<Receiver>, frame: &ServerFrame) -> usize {
    let matched = lock(receiver).matching(frame);
    run_listeners(matched, frame)
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self.listeners.values().map(Vec::len).sum();
        f.debug_struct("Receiver").field("listeners", &count).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request/response client with push listeners.
pub struct Client {
    transport: Transport,
    correlator: Arc<Mutex<Correlator>>,
    receiver: Arc<Mutex<Receiver>>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl Client {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`). Reconnects in the background.
    pub fn connect(url: impl Into<String>, config: TransportConfig) -> Self {
        Self::connect_with(url, config, Receiver::new())
    }

    /// Connect with push listeners registered up front.
    pub fn connect_with(url: impl Into<String>, config: TransportConfig, receiver: Receiver) -> Self {
        let mut transport = Transport::connect(url, config);
        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let receiver = Arc::new(Mutex::new(receiver));
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        if let Some(mut transport_rx) = transport.take_event_rx() {
            let correlator = correlator.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                while let Some(event) = transport_rx.recv().await {
                    match &event {
                        TransportEvent::Frame(frame) => {
                            notify_listeners(&receiver, frame);
                            if lock(&correlator).settle(frame) {
                                continue;
                            }
                        }
                        TransportEvent::Closed { clean: true } => {
                            let failed = lock(&correlator).close_all();
                            if failed > 0 {
                                log::debug!("{} pending request(s) failed on close", failed);
                            }
                        }
                        _ => {}
                    }
                    let _ = app_tx.send(event);
                }
            });
        }

        Self {
            transport,
            correlator,
            receiver,
            event_rx: Some(app_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Carries lifecycle events and every frame that did not settle a request.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.transport.connection_id().await
    }

    pub async fn is_active(&self) -> bool {
        self.transport.is_active().await
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.correlator).pending_len()
    }

    /// Register a push listener.
    pub fn on<F>(&self, method: Method, pattern: &str, listener: F)
    where
        F: Fn(&ServerFrame, &Params) + Send + Sync + 'static,
    {
        lock(&self.receiver).on(method, pattern, Arc::new(listener));
    }

    /// Send `frame` with a fresh request id and wait for its reply.
    ///
    /// Statuses below 300 resolve; anything else is [`ClientError::Rejected`].
    pub async fn request(&self, mut frame: ClientFrame) -> Result<ServerFrame, ClientError> {
        let (id, rx) = lock(&self.correlator).register()?;
        frame.request_id = Some(id);
        if let Err(e) = self.transport.send_frame(&frame).await {
            lock(&self.correlator).forget(id);
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Send without a request id. No reply is expected or tracked.
    pub async fn notify(&self, method: Method, url: &str, body: impl IntoBody) -> Result<(), ClientError> {
        let frame = ClientFrame::new(method, url).with_body(body);
        self.transport.send_frame(&frame).await
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: Option<Headers>,
        body: impl IntoBody,
    ) -> Result<ServerFrame, ClientError> {
        let mut frame = ClientFrame::new(method, url).with_body(body);
        frame.headers = headers;
        self.request(frame).await
    }

    pub async fn get(&self, url: &str) -> Result<ServerFrame, ClientError> {
        self.send(Method::Get, url, None, ()).await
    }

    pub async fn post(&self, url: &str, body: impl IntoBody) -> Result<ServerFrame, ClientError> {
        self.send(Method::Post, url, None, body).await
    }

    pub async fn put(&self, url: &str, body: impl IntoBody) -> Result<ServerFrame, ClientError> {
        self.send(Method::Put, url, None, body).await
    }

    pub async fn patch(&self, url: &str, body: impl IntoBody) -> Result<ServerFrame, ClientError> {
        self.send(Method::Patch, url, None, body).await
    }

    pub async fn delete(&self, url: &str) -> Result<ServerFrame, ClientError> {
        self.send(Method::Delete, url, None, ()).await
    }

    pub async fn meta(&self, url: &str, body: impl IntoBody) -> Result<ServerFrame, ClientError> {
        self.send(Method::Meta, url, None, body).await
    }

    /// Close the transport cleanly; pending requests fail with [`ClientError::Closed`].
    pub async fn close(&self) {
        self.transport.close().await;
        lock(&self.correlator).close_all();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Body;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(id: u16, status: u16) -> ServerFrame {
        ServerFrame::new(Method::Get, "/r", status).with_reply_to(Some(id))
    }

    #[test]
    fn test_ids_increase_from_one() {
        let mut c = Correlator::new();
        let (a, _ra) = c.register().unwrap();
        let (b, _rb) = c.register().unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(c.pending_len(), 2);
    }

    #[test]
    fn test_ids_wrap_and_skip_pending() {
        let mut c = Correlator::new();
        let (first, _r1) = c.register().unwrap();
        assert_eq!(first, 1);
        c.last_id = MAX_U16_FIELD as u16 - 1;
        let (top, _r2) = c.register().unwrap();
        assert_eq!(u32::from(top), MAX_U16_FIELD);
        // 1 is still pending
        let (wrapped, _r3) = c.register().unwrap();
        assert_eq!(wrapped, 2);
    }

    #[tokio::test]
    async fn test_settle_resolves_and_rejects() {
        let mut c = Correlator::new();
        let (ok_id, ok_rx) = c.register().unwrap();
        let (err_id, err_rx) = c.register().unwrap();

        assert!(c.settle(&reply(ok_id, 200).with_body(Body::text("fine"))));
        assert!(c.settle(&reply(err_id, 404)));
        assert_eq!(c.pending_len(), 0);

        let frame = ok_rx.await.unwrap().unwrap();
        assert_eq!(frame.body.unwrap().as_text(), Some("fine"));
        match err_rx.await.unwrap() {
            Err(ClientError::Rejected { status, .. }) => assert_eq!(status, 404),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_settle_boundary_statuses() {
        let mut c = Correlator::new();
        let (id, mut rx) = c.register().unwrap();
        c.settle(&reply(id, 299));
        assert!(rx.try_recv().unwrap().is_ok());
        let (id, mut rx) = c.register().unwrap();
        c.settle(&reply(id, 300));
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_unknown_and_push_frames_are_dropped() {
        let mut c = Correlator::new();
        assert!(!c.settle(&reply(77, 200)));
        assert!(!c.settle(&ServerFrame::new(Method::Post, "/push", 200)));
    }

    #[tokio::test]
    async fn test_close_all_rejects_pending() {
        let mut c = Correlator::new();
        let (_, rx) = c.register().unwrap();
        assert_eq!(c.close_all(), 1);
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Closed)));
    }

    #[test]
    fn test_receiver_matches_method_and_path() {
        let mut r = Receiver::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        r.on(
            Method::Post,
            "/rooms/:room/messages",
            Arc::new(move |_frame: &ServerFrame, params: &Params| {
                assert_eq!(params["room"], "lobby");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(r.dispatch(&ServerFrame::new(Method::Post, "/rooms/lobby/messages", 200)), 1);
        assert_eq!(r.dispatch(&ServerFrame::new(Method::Get, "/rooms/lobby/messages", 200)), 0);
        assert_eq!(r.dispatch(&ServerFrame::new(Method::Post, "/rooms/lobby", 200)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_register_listeners() {
        let receiver = Arc::new(Mutex::new(Receiver::new()));
        let table = receiver.clone();
        lock(&receiver).on(
            Method::Post,
            "/rooms/:room",
            Arc::new(move |_frame: &ServerFrame, params: &Params| {
                let room = params["room"].clone();
                lock(&table).on(
                    Method::Get,
                    format!("/rooms/{room}/late").as_str(),
                    Arc::new(|_: &ServerFrame, _: &Params| {}),
                );
            }),
        );

        assert_eq!(notify_listeners(&receiver, &ServerFrame::new(Method::Post, "/rooms/a", 200)), 1);
        assert_eq!(notify_listeners(&receiver, &ServerFrame::new(Method::Get, "/rooms/a/late", 200)), 1);
    }

    #[test]
    fn test_receiver_builder_runs_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());
        let r = Receiver::new()
            .post("/chat/:room", move |_, params| first.lock().unwrap().push(params["room"].clone()))
            .post("/chat/*", move |_, _| second.lock().unwrap().push("any".to_string()))
            .delete("/chat/:room", |_, _| panic!("wrong method"));

        assert_eq!(r.dispatch(&ServerFrame::new(Method::Post, "/chat/general", 200)), 2);
        assert_eq!(*order.lock().unwrap(), vec!["general", "any"]);
    }
}
