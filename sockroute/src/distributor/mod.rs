//! Cross-process state and delivery.
//!
//! ```text
//!   server A                        distributor                       server B
//! ┌──────────┐  set / list ops   ┌──────────────────────┐          ┌──────────┐
//! │   Hub    │ ────────────────► │ individual:<id>      │ ◄─────── │   Hub    │
//! │          │                   │ group-servers:<g>    │          │          │
//! │          │                   │ my-groups:<id>       │          │          │
//! │          │  enqueue(ch, msg) ├──────────────────────┤  listen  │          │
//! │          │ ────────────────► │ server:<B>:group     │ ───────► │          │
//! └──────────┘                   │ server:<B>:individual│          └──────────┘
//!                                └──────────────────────┘
//! ```
//!
//! Two backends ship with the crate: [`InMemoryDistributor`] for a single
//! process (or several servers sharing one instance in tests) and
//! `RedisDistributor` behind the `redis` feature.
//!
//! Every server must be listening on its channels before any message for it
//! is enqueued. [`Distributor::listen`] therefore returns only once the
//! listener is established, and servers call it before announcing ready.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use memory::InMemoryDistributor;
#[cfg(feature = "redis")]
pub use self::redis::{ChannelMode, RedisConfig, RedisDistributor};

/// Callback invoked with each raw message arriving on a channel.
pub type ChannelCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Cross-process key/value, set membership and channel delivery.
#[async_trait]
pub trait Distributor: Send + Sync {
    /// Prepare the backend for `server_id`. Must complete before any other call.
    async fn initialize(&self, server_id: &str) -> Result<(), DistributorError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), DistributorError>;

    async fn get(&self, key: &str) -> Result<Option<String>, DistributorError>;

    async fn remove(&self, key: &str) -> Result<(), DistributorError>;

    /// Delete `key` only while it still holds `expected`, as one atomic step.
    /// Returns whether it was deleted.
    async fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool, DistributorError>;

    async fn add_list_item(&self, list: &str, item: &str) -> Result<(), DistributorError> {
        self.add_list_items(list, &[item.to_string()]).await
    }

    async fn add_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError>;

    async fn remove_list_item(&self, list: &str, item: &str) -> Result<(), DistributorError> {
        self.remove_list_items(list, &[item.to_string()]).await
    }

    async fn remove_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError>;

    /// Members of `list`, sorted. Empty if the list does not exist.
    async fn get_list_items(&self, list: &str) -> Result<Vec<String>, DistributorError>;

    /// Deliver `message` to whoever listens on `channel`.
    async fn enqueue(&self, channel: &str, message: Bytes) -> Result<(), DistributorError>;

    /// Start delivering `channel` messages to `callback`.
    ///
    /// Returns once the listener is in place; delivery continues in the
    /// background for the life of the distributor.
    async fn listen(&self, channel: &str, callback: ChannelCallback) -> Result<(), DistributorError>;
}

/// Key recording which server owns a connection.
pub fn individual_key(connection_id: &str) -> String {
    format!("individual:{connection_id}")
}

/// List of servers with at least one local member of `group`.
pub fn group_servers_key(group: &str) -> String {
    format!("group-servers:{group}")
}

/// List of groups a connection belongs to, kept across reconnects.
pub fn my_groups_key(connection_id: &str) -> String {
    format!("my-groups:{connection_id}")
}

/// Channel carrying individually addressed frames for `server_id`.
pub fn individual_channel(server_id: &str) -> String {
    format!("server:{server_id}:individual")
}

/// Channel carrying group broadcasts for `server_id`.
pub fn group_channel(server_id: &str) -> String {
    format!("server:{server_id}:group")
}

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error("distributor used before initialize()")]
    NotInitialized,
    #[error("backend error: {0}")]
    Backend(String),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(individual_key("abc"), "individual:abc");
        assert_eq!(group_servers_key("all"), "group-servers:all");
        assert_eq!(my_groups_key("abc"), "my-groups:abc");
        assert_eq!(individual_channel("s1"), "server:s1:individual");
        assert_eq!(group_channel("s1"), "server:s1:group");
    }
}
