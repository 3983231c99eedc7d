//! # sockroute — HTTP-style routing over WebSockets
//!
//! Peers exchange compact request/response frames (method, url, headers,
//! body) over a single WebSocket. Servers route frames to handlers by
//! method and path pattern, track connections and groups, and forward
//! deliveries to whichever server in the cluster owns the recipient.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │   Client    │ ◄─────────────────► │   Server    │
//! │ (Transport) │   binary or JSON    │  (Router)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │     Hub     │ individuals, groups
//!                                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │  Distributor  │ shared keys + channels
//!                                    │ (memory/redis)│
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Frame types and the binary/JSON wire codecs
//! - [`path`] — Path patterns with named parameters
//! - [`router`] — Route table, request/response handles
//! - [`registry`] — Local connection and group tables
//! - [`distributor`] — Cross-server key store and message channels
//! - [`hub`] — Delivery to individuals and groups across the cluster
//! - [`server`] — WebSocket accept loop and connection lifecycle
//! - [`transport`] — Reconnecting client transport with pending queue
//! - [`client`] — Request correlation and push listeners

pub mod protocol;
pub mod path;
pub mod router;
pub mod registry;
pub mod distributor;
pub mod hub;
pub mod server;
pub mod transport;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Body, BodyType, ClientFrame, Headers, IntoBody, Method, ProtocolError, ServerFrame, WireFormat,
};
pub use path::{Params, PathPattern};
pub use router::{handler, DispatchOutcome, HandlerResult, Reply, Request, Response, RouteError, Router, SendOptions};
pub use registry::{Connection, ConnectionId, GroupId};
pub use distributor::{Distributor, DistributorError, InMemoryDistributor};
#[cfg(feature = "redis")]
pub use distributor::{ChannelMode, RedisConfig, RedisDistributor};
pub use hub::{Delivery, GroupDelivery, Hub, HubError, ServerStats};
pub use server::{Server, ServerConfig, ServerError, ServerEvent};
pub use transport::{Backoff, Transport, TransportConfig, TransportEvent, TransportState};
pub use client::{Client, ClientError, Correlator, Receiver};
