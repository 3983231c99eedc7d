//! Method + path routing and the response builder handed to handlers.
//!
//! ```text
//! ClientFrame ──► routes[method] ──► for each route, in registration order:
//!                                      pattern matches? ──► handler 1 ─► handler 2 ─► …
//!                                                               │ Err
//!                                                               ▼
//!                                                        error reply, stop
//! ```
//!
//! Nothing matched and the frame expects a reply: `204`. Nothing matched
//! and no reply is expected: the frame is dropped silently.

use std::collections::HashMap;
use std::fmt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::distributor::DistributorError;
use crate::hub::{Hub, HubError};
use crate::path::{parse_query, split_query, Params, PathPattern};
use crate::protocol::{Body, ClientFrame, Headers, IntoBody, Method, ProtocolError, ServerFrame};
use crate::registry::{Connection, ConnectionId, GroupId};

pub type HandlerResult = Result<(), RouteError>;

/// An async route handler.
///
/// Implemented for every `Fn(Request, Response) -> impl Future<Output = HandlerResult>`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request, res: Response) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: Request, res: Response) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(req, res))
    }
}

/// Box a handler for [`Router::route`].
pub fn handler<H: Handler>(h: H) -> Arc<dyn Handler> {
    Arc::new(h)
}

#[derive(Clone)]
struct Route {
    pattern: PathPattern,
    handlers: Vec<Arc<dyn Handler>>,
}

/// Route table, built once at startup.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<Method, Arc<Vec<Route>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline of handlers for `method` + `pattern`.
    ///
    /// This is the multi-handler entry point: handlers run in order and the
    /// first error ends the pipeline. The per-method shorthands below take a
    /// single handler.
    ///
    /// ```ignore
    /// Router::new().route(Method::Post, "/rooms/:room", [handler(auth), handler(post_message)]);
    /// ```
    pub fn route(
        mut self,
        method: Method,
        pattern: impl Into<PathPattern>,
        handlers: impl IntoIterator<Item = Arc<dyn Handler>>,
    ) -> Self {
        let route = Route {
            pattern: pattern.into(),
            handlers: handlers.into_iter().collect(),
        };
        log::debug!("route {} {}", method, route.pattern.as_str());
        Arc::make_mut(self.routes.entry(method).or_default()).push(route);
        self
    }

    /// Single-handler shorthand for [`route`](Self::route) with `GET`.
    pub fn get(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Get, pattern, [handler(h)])
    }

    pub fn post(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Post, pattern, [handler(h)])
    }

    pub fn put(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Put, pattern, [handler(h)])
    }

    pub fn patch(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Patch, pattern, [handler(h)])
    }

    pub fn delete(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Delete, pattern, [handler(h)])
    }

    pub fn meta(self, pattern: impl Into<PathPattern>, h: impl Handler) -> Self {
        self.route(Method::Meta, pattern, [handler(h)])
    }

    /// Number of routes registered for `method`.
    pub fn route_count(&self, method: Method) -> usize {
        self.routes.get(&method).map_or(0, |r| r.len())
    }

    /// Run every matching route for `frame`, then answer unhandled or failed frames.
    pub async fn dispatch(&self, frame: ClientFrame, origin: Arc<Connection>, hub: &Arc<Hub>) -> DispatchOutcome {
        let (path, query) = split_query(&frame.url);
        let path = path.to_string();
        let query = parse_query(query);
        let res = Response::new(hub.clone(), origin.clone(), &frame);
        let routes = self.routes.get(&frame.method).cloned().unwrap_or_default();

        let mut matched = 0usize;
        for route in routes.iter() {
            let Some(params) = route.pattern.matches(&path) else {
                continue;
            };
            matched += 1;
            let req = Request {
                connection_id: origin.id().to_string(),
                method: frame.method,
                request_id: frame.request_id,
                url: frame.url.clone(),
                path: path.clone(),
                query: query.clone(),
                headers: frame.headers.clone().unwrap_or_default(),
                body: frame.body.clone(),
                params,
            };
            for h in &route.handlers {
                let call = AssertUnwindSafe(async { h.call(req.clone(), res.clone()).await });
                let result = call
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(RouteError::Panicked(panic_message(panic.as_ref()))));
                if let Err(err) = result {
                    let status = err.status();
                    log::warn!(
                        "{} {} from {} failed with {}: {}",
                        frame.method,
                        frame.url,
                        origin.id(),
                        status,
                        err
                    );
                    res.reply_error(&err).await;
                    return DispatchOutcome::Failed { status };
                }
            }
        }

        if matched > 0 {
            return DispatchOutcome::Handled { routes: matched };
        }
        if frame.request_id.is_some() {
            log::debug!("no route for {} {}, acknowledging with 204", frame.method, frame.url);
            let opts = SendOptions {
                status: Some(204),
                ..SendOptions::default()
            };
            if let Err(e) = res.send_with((), opts).await {
                log::warn!("204 reply to {} failed: {}", origin.id(), e);
            }
        } else {
            log::trace!("no route for {} {}, dropped", frame.method, frame.url);
        }
        DispatchOutcome::Unmatched
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for method in Method::ALL {
            if let Some(routes) = self.routes.get(&method) {
                let patterns: Vec<&str> = routes.iter().map(|r| r.pattern.as_str()).collect();
                map.entry(&method, &patterns);
            }
        }
        map.finish()
    }
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// At least one route ran to completion.
    Handled { routes: usize },
    /// No route matched.
    Unmatched,
    /// A handler failed and an error reply was produced.
    Failed { status: u16 },
}

/// Immutable view of an incoming frame, handed to each handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub connection_id: ConnectionId,
    pub method: Method,
    pub request_id: Option<u16>,
    /// Url as sent, including any query string
    pub url: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: Headers,
    pub body: Option<Body>,
    pub params: Params,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn expects_reply(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn text(&self) -> Option<&str> {
        self.body.as_ref().and_then(Body::as_text)
    }

    /// Decode a JSON body; missing or invalid bodies are a `400`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RouteError> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| RouteError::bad_request("missing body"))?;
        body.parse_json()
            .map_err(|e| RouteError::bad_request(e.to_string()))
    }
}

/// Per-send overrides.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub method: Option<Method>,
    pub url: Option<String>,
    pub headers: Option<Headers>,
    pub status: Option<u16>,
}

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<u16>,
    headers: Headers,
    sent: bool,
}

struct ResponseInner {
    hub: Arc<Hub>,
    origin: Arc<Connection>,
    method: Method,
    url: String,
    request_id: Option<u16>,
    state: Mutex<ResponseState>,
}

/// Response helper shared by every handler run for one frame.
#[derive(Clone)]
pub struct Response {
    inner: Arc<ResponseInner>,
}

impl Response {
    pub(crate) fn new(hub: Arc<Hub>, origin: Arc<Connection>, frame: &ClientFrame) -> Self {
        Self {
            inner: Arc::new(ResponseInner {
                hub,
                origin,
                method: frame.method,
                url: frame.url.clone(),
                request_id: frame.request_id,
                state: Mutex::new(ResponseState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ResponseState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_id(&self) -> &str {
        self.inner.origin.id()
    }

    /// Set the reply status. May be called once.
    pub fn status(&self, code: u16) -> Result<&Self, RouteError> {
        let mut state = self.state();
        if let Some(current) = state.status {
            return Err(RouteError::StatusAlreadySet {
                current,
                attempted: code,
            });
        }
        state.status = Some(code);
        Ok(self)
    }

    pub fn current_status(&self) -> Option<u16> {
        self.state().status
    }

    /// Add a header to every reply sent through this response.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        self.state().headers.insert(key.into(), value.into());
        self
    }

    pub fn is_sent(&self) -> bool {
        self.state().sent
    }

    /// Reply to the sender. A no-op when the frame expects no reply.
    pub async fn send(&self, body: impl IntoBody) -> HandlerResult {
        self.send_with(body, SendOptions::default()).await
    }

    pub async fn send_with(&self, body: impl IntoBody, opts: SendOptions) -> HandlerResult {
        let Some(request_id) = self.inner.request_id else {
            log::trace!("{} expects no reply, send skipped", self.inner.url);
            return Ok(());
        };
        let frame = {
            let mut state = self.state();
            state.sent = true;
            let headers = merge_headers(&state.headers, opts.headers);
            ServerFrame::new(
                opts.method.unwrap_or(self.inner.method),
                opts.url.unwrap_or_else(|| self.inner.url.clone()),
                opts.status.or(state.status).unwrap_or(200),
            )
            .with_reply_to(Some(request_id))
            .with_headers(headers)
            .with_body(body)
        };
        self.inner.hub.send_local(&self.inner.origin, frame)?;
        Ok(())
    }

    /// Address a single connection, local or remote.
    pub fn to(&self, connection_id: impl Into<ConnectionId>) -> Reply {
        self.reply(Target::Individual(connection_id.into()))
    }

    /// Address every member of a group, local and remote.
    pub fn group(&self, group: impl Into<GroupId>) -> Reply {
        self.reply(Target::Group(group.into()))
    }

    fn reply(&self, target: Target) -> Reply {
        Reply {
            hub: self.inner.hub.clone(),
            target,
            method: self.inner.method,
            url: self.inner.url.clone(),
            status: None,
            headers: self.state().headers.clone(),
        }
    }

    pub async fn join_group(&self, group: &str) -> HandlerResult {
        self.inner.hub.join(&self.inner.origin, group).await?;
        Ok(())
    }

    pub async fn join_groups<S: AsRef<str>>(&self, groups: &[S]) -> HandlerResult {
        for group in groups {
            self.inner.hub.join(&self.inner.origin, group.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn leave_group(&self, group: &str) -> HandlerResult {
        self.inner.hub.leave(self.connection_id(), group).await?;
        Ok(())
    }

    pub async fn leave_groups<S: AsRef<str>>(&self, groups: &[S]) -> HandlerResult {
        for group in groups {
            self.inner.hub.leave(self.connection_id(), group.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn leave_all_groups(&self) -> HandlerResult {
        self.inner.hub.leave_all(self.connection_id()).await?;
        Ok(())
    }

    /// Groups the sender belongs to on this server.
    pub fn groups(&self) -> Vec<GroupId> {
        self.inner.hub.groups().groups_of(self.connection_id())
    }

    /// Error reply for a failed handler, if the sender expects one.
    async fn reply_error(&self, err: &RouteError) {
        if self.inner.request_id.is_none() {
            return;
        }
        if self.is_sent() {
            log::debug!("reply to {} already sent, error not delivered", self.connection_id());
            return;
        }
        let (status, body) = match err {
            RouteError::Api { status, message } => (*status, Some(Body::text(message.clone()))),
            _ => (500, None),
        };
        let opts = SendOptions {
            status: Some(status),
            ..SendOptions::default()
        };
        if let Err(e) = self.send_with(body, opts).await {
            log::warn!("error reply to {} failed: {}", self.connection_id(), e);
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("connection_id", &self.connection_id())
            .field("method", &self.inner.method)
            .field("url", &self.inner.url)
            .field("request_id", &self.inner.request_id)
            .finish()
    }
}

fn merge_headers(base: &Headers, extra: Option<Headers>) -> Option<Headers> {
    let mut merged = base.clone();
    if let Some(extra) = extra {
        merged.extend(extra);
    }
    (!merged.is_empty()).then_some(merged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Individual(ConnectionId),
    Group(GroupId),
}

/// A message addressed to a connection or group. Carries no reply id.
#[derive(Debug, Clone)]
pub struct Reply {
    hub: Arc<Hub>,
    target: Target,
    method: Method,
    url: String,
    status: Option<u16>,
    headers: Headers,
}

impl Reply {
    /// Set the status once; a second call fails.
    pub fn status(mut self, code: u16) -> Result<Self, RouteError> {
        if let Some(current) = self.status {
            return Err(RouteError::StatusAlreadySet {
                current,
                attempted: code,
            });
        }
        self.status = Some(code);
        Ok(self)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub async fn send(self, body: impl IntoBody) -> HandlerResult {
        self.send_with(body, SendOptions::default()).await
    }

    pub async fn send_with(self, body: impl IntoBody, opts: SendOptions) -> HandlerResult {
        let frame = ServerFrame::new(
            opts.method.unwrap_or(self.method),
            opts.url.unwrap_or(self.url),
            opts.status.or(self.status).unwrap_or(200),
        )
        .with_headers(merge_headers(&self.headers, opts.headers))
        .with_body(body);
        match self.target {
            Target::Individual(id) => {
                self.hub.send_to_individual(&id, frame).await?;
            }
            Target::Group(group) => {
                self.hub.send_to_group(&group, frame).await?;
            }
        }
        Ok(())
    }
}

/// Errors raised by handlers.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Replied with this status and the message as a text body.
    #[error("{status} {message}")]
    Api { status: u16, message: String },
    #[error("status already set to {current}, cannot change it to {attempted}")]
    StatusAlreadySet { current: u16, attempted: u16 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Distributor(#[from] DistributorError),
    #[error("{0}")]
    Other(String),
    /// A handler panicked; replied like any other unexpected error.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl RouteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::api(400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::api(404, message)
    }

    /// Status the error is replied with.
    pub fn status(&self) -> u16 {
        match self {
            Self::Api { status, .. } => *status,
            _ => 500,
        }
    }
}

impl From<HubError> for RouteError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Protocol(e) => Self::Protocol(e),
            HubError::Distributor(e) => Self::Distributor(e),
        }
    }
}
