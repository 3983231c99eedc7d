//! Redis-backed distributor.
//!
//! Keys map onto plain strings (`SET`/`GET`/`DEL`) and lists onto Redis sets
//! (`SADD`/`SREM`/`SMEMBERS`). The channel primitive is chosen per deployment:
//!
//! | Mode | Enqueue | Listen | Survives listener absence |
//! |------|---------|--------|---------------------------|
//! | [`ChannelMode::Queue`]  | `RPUSH`   | `BLPOP` loop on a dedicated connection | yes |
//! | [`ChannelMode::PubSub`] | `PUBLISH` | `SUBSCRIBE` before `listen` returns     | no  |
//!
//! Listener loops never exit: read failures are logged and the loop
//! reconnects after [`RECONNECT_DELAY`].

use std::str::FromStr;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::OnceCell;

use super::{ChannelCallback, Distributor, DistributorError};

/// Pause before a failed listener loop reconnects.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// `BLPOP` timeout in seconds; bounds how long a dead socket goes unnoticed.
const BLPOP_TIMEOUT_SECS: u64 = 5;

/// `DEL key` only when `GET key == ARGV[1]`.
const COMPARE_AND_DELETE: &str =
    "if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('DEL', KEYS[1]) else return 0 end";

/// Delivery primitive used for server channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMode {
    /// Durable list: `RPUSH` / `BLPOP`
    #[default]
    Queue,
    /// Volatile `PUBLISH` / `SUBSCRIBE`
    PubSub,
}

impl FromStr for ChannelMode {
    type Err = DistributorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "pubsub" | "pub-sub" => Ok(Self::PubSub),
            other => Err(DistributorError::Backend(format!(
                "unknown channel mode: {other}"
            ))),
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    pub channel_mode: ChannelMode,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            channel_mode: ChannelMode::Queue,
        }
    }
}

pub struct RedisDistributor {
    config: RedisConfig,
    client: Client,
    conn: OnceCell<MultiplexedConnection>,
}

impl RedisDistributor {
    /// Parse the URL. No connection is made until [`Distributor::initialize`].
    pub fn new(config: RedisConfig) -> Result<Self, DistributorError> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            config,
            client,
            conn: OnceCell::new(),
        })
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.config.channel_mode
    }

    fn conn(&self) -> Result<MultiplexedConnection, DistributorError> {
        self.conn
            .get()
            .cloned()
            .ok_or(DistributorError::NotInitialized)
    }

    async fn listen_queue(&self, channel: &str, callback: ChannelCallback) -> Result<(), DistributorError> {
        // BLPOP blocks its connection, so each listener owns one.
        let conn = self.client.get_multiplexed_async_connection().await?;
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut conn = Some(conn);
            loop {
                let mut active = match conn.take() {
                    Some(c) => c,
                    None => match client.get_multiplexed_async_connection().await {
                        Ok(c) => c,
                        Err(e) => {
                            log::error!("redis reconnect for {} failed: {}", channel, e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    },
                };
                let popped: Result<Option<(String, Vec<u8>)>, _> = ::redis::cmd("BLPOP")
                    .arg(&channel)
                    .arg(BLPOP_TIMEOUT_SECS)
                    .query_async(&mut active)
                    .await;
                match popped {
                    Ok(Some((_, message))) => {
                        callback(Bytes::from(message));
                        conn = Some(active);
                    }
                    Ok(None) => conn = Some(active),
                    Err(e) => {
                        log::error!("BLPOP on {} failed: {}; retrying", channel, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn listen_pubsub(&self, channel: &str, callback: ChannelCallback) -> Result<(), DistributorError> {
        // Subscribe before returning so nothing published after ready is missed.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            loop {
                let active = match pubsub.take() {
                    Some(p) => p,
                    None => {
                        let resubscribed = async {
                            let mut p = client.get_async_pubsub().await?;
                            p.subscribe(&channel).await?;
                            Ok::<_, ::redis::RedisError>(p)
                        };
                        match resubscribed.await {
                            Ok(p) => {
                                log::info!("resubscribed to {}", channel);
                                p
                            }
                            Err(e) => {
                                log::error!("resubscribe to {} failed: {}", channel, e);
                                tokio::time::sleep(RECONNECT_DELAY).await;
                                continue;
                            }
                        }
                    }
                };
                let mut messages = active.into_on_message();
                while let Some(msg) = messages.next().await {
                    callback(Bytes::copy_from_slice(msg.get_payload_bytes()));
                }
                log::warn!("subscription to {} ended; reconnecting", channel);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for RedisDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDistributor")
            .field("config", &self.config)
            .field("initialized", &self.conn.initialized())
            .finish()
    }
}

#[async_trait]
impl Distributor for RedisDistributor {
    async fn initialize(&self, server_id: &str) -> Result<(), DistributorError> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        let mut conn = conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        log::info!(
            "redis distributor ready for server {} ({:?} channels)",
            server_id,
            self.config.channel_mode
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), DistributorError> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DistributorError> {
        let mut conn = self.conn()?;
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn remove(&self, key: &str) -> Result<(), DistributorError> {
        let mut conn = self.conn()?;
        let _: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool, DistributorError> {
        let mut conn = self.conn()?;
        let deleted: i64 = ::redis::cmd("EVAL")
            .arg(COMPARE_AND_DELETE)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn add_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let _: i64 = ::redis::cmd("SADD").arg(list).arg(items).query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let _: i64 = ::redis::cmd("SREM").arg(list).arg(items).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_list_items(&self, list: &str) -> Result<Vec<String>, DistributorError> {
        let mut conn = self.conn()?;
        let mut items: Vec<String> = ::redis::cmd("SMEMBERS").arg(list).query_async(&mut conn).await?;
        items.sort();
        Ok(items)
    }

    async fn enqueue(&self, channel: &str, message: Bytes) -> Result<(), DistributorError> {
        let mut conn = self.conn()?;
        let command = match self.config.channel_mode {
            ChannelMode::Queue => "RPUSH",
            ChannelMode::PubSub => "PUBLISH",
        };
        let _: i64 = ::redis::cmd(command)
            .arg(channel)
            .arg(message.as_ref())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn listen(&self, channel: &str, callback: ChannelCallback) -> Result<(), DistributorError> {
        if !self.conn.initialized() {
            return Err(DistributorError::NotInitialized);
        }
        match self.config.channel_mode {
            ChannelMode::Queue => self.listen_queue(channel, callback).await?,
            ChannelMode::PubSub => self.listen_pubsub(channel, callback).await?,
        }
        log::debug!("listening on {} ({:?})", channel, self.config.channel_mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_url() -> Option<String> {
        std::env::var("SOCKROUTE_TEST_REDIS_URL").ok()
    }

    #[test]
    fn test_channel_mode_from_str() {
        assert_eq!("queue".parse::<ChannelMode>().unwrap(), ChannelMode::Queue);
        assert_eq!("PubSub".parse::<ChannelMode>().unwrap(), ChannelMode::PubSub);
        assert!("kafka".parse::<ChannelMode>().is_err());
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let d = RedisDistributor::new(RedisConfig::default()).unwrap();
        assert!(matches!(d.get("k").await, Err(DistributorError::NotInitialized)));
    }

    #[test]
    fn test_rejects_bad_url() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..RedisConfig::default()
        };
        assert!(RedisDistributor::new(config).is_err());
    }

    async fn roundtrip(mode: ChannelMode) {
        let Some(url) = test_url() else { return };
        let d = RedisDistributor::new(RedisConfig {
            url,
            channel_mode: mode,
        })
        .unwrap();
        d.initialize("redis-test").await.unwrap();

        let key = format!("sockroute-test:{}", uuid::Uuid::new_v4().simple());
        d.set(&key, "s1").await.unwrap();
        assert_eq!(d.get(&key).await.unwrap().as_deref(), Some("s1"));
        d.remove(&key).await.unwrap();
        assert_eq!(d.get(&key).await.unwrap(), None);

        d.set(&key, "s2").await.unwrap();
        assert!(!d.remove_if_equals(&key, "s1").await.unwrap());
        assert_eq!(d.get(&key).await.unwrap().as_deref(), Some("s2"));
        assert!(d.remove_if_equals(&key, "s2").await.unwrap());
        assert_eq!(d.get(&key).await.unwrap(), None);

        d.add_list_items(&key, &["b".into(), "a".into()]).await.unwrap();
        assert_eq!(d.get_list_items(&key).await.unwrap(), vec!["a", "b"]);
        d.remove_list_item(&key, "a").await.unwrap();
        assert_eq!(d.get_list_items(&key).await.unwrap(), vec!["b"]);
        d.remove(&key).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let channel = format!("{key}:channel");
        d.listen(&channel, Arc::new(move |msg| {
            let _ = tx.send(msg);
        }))
        .await
        .unwrap();
        d.enqueue(&channel, Bytes::from_static(b"payload")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    #[ignore = "needs SOCKROUTE_TEST_REDIS_URL"]
    async fn test_queue_mode_against_redis() {
        roundtrip(ChannelMode::Queue).await;
    }

    #[tokio::test]
    #[ignore = "needs SOCKROUTE_TEST_REDIS_URL"]
    async fn test_pubsub_mode_against_redis() {
        roundtrip(ChannelMode::PubSub).await;
    }
}
