//! In-process distributor: local maps plus a callback bus.
//!
//! `enqueue` invokes every callback listening on the channel synchronously,
//! before it returns. A message with no listener is dropped. One instance
//! may be shared by several servers in the same process to simulate a
//! cluster.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use super::{ChannelCallback, Distributor, DistributorError};

#[derive(Default)]
struct State {
    values: HashMap<String, String>,
    lists: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
pub struct InMemoryDistributor {
    initialized: AtomicBool,
    state: Mutex<State>,
    listeners: Mutex<HashMap<String, Vec<ChannelCallback>>>,
}

impl InMemoryDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DistributorError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DistributorError::NotInitialized);
        }
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of callbacks registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for InMemoryDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDistributor")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Distributor for InMemoryDistributor {
    async fn initialize(&self, server_id: &str) -> Result<(), DistributorError> {
        self.initialized.store(true, Ordering::Release);
        log::debug!("in-memory distributor initialized for server {}", server_id);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), DistributorError> {
        self.state()?.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DistributorError> {
        Ok(self.state()?.values.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), DistributorError> {
        let mut state = self.state()?;
        state.values.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool, DistributorError> {
        let mut state = self.state()?;
        if state.values.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        state.values.remove(key);
        Ok(true)
    }

    async fn add_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError> {
        if items.is_empty() {
            return Ok(());
        }
        self.state()?
            .lists
            .entry(list.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn remove_list_items(&self, list: &str, items: &[String]) -> Result<(), DistributorError> {
        let mut state = self.state()?;
        if let Some(set) = state.lists.get_mut(list) {
            for item in items {
                set.remove(item);
            }
            if set.is_empty() {
                state.lists.remove(list);
            }
        }
        Ok(())
    }

    async fn get_list_items(&self, list: &str) -> Result<Vec<String>, DistributorError> {
        Ok(self
            .state()?
            .lists
            .get(list)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn enqueue(&self, channel: &str, message: Bytes) -> Result<(), DistributorError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DistributorError::NotInitialized);
        }
        // Clone out so callbacks may re-enter the distributor.
        let callbacks: Vec<ChannelCallback> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            log::trace!("no listener on {}, message dropped", channel);
        }
        for callback in callbacks {
            callback(message.clone());
        }
        Ok(())
    }

    async fn listen(&self, channel: &str, callback: ChannelCallback) -> Result<(), DistributorError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(DistributorError::NotInitialized);
        }
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push(callback);
        log::debug!("listening on {}", channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn ready() -> InMemoryDistributor {
        let d = InMemoryDistributor::new();
        d.initialize("test").await.unwrap();
        d
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let d = InMemoryDistributor::new();
        assert!(matches!(
            d.get("k").await,
            Err(DistributorError::NotInitialized)
        ));
        d.initialize("s").await.unwrap();
        assert_eq!(d.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_value() {
        let d = ready().await;
        d.set("individual:a", "s1").await.unwrap();
        assert_eq!(d.get("individual:a").await.unwrap().as_deref(), Some("s1"));
        d.set("individual:a", "s2").await.unwrap();
        assert_eq!(d.get("individual:a").await.unwrap().as_deref(), Some("s2"));
        d.remove("individual:a").await.unwrap();
        assert_eq!(d.get("individual:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_if_equals_only_deletes_matching_value() {
        let d = ready().await;
        d.set("individual:a", "s2").await.unwrap();
        assert!(!d.remove_if_equals("individual:a", "s1").await.unwrap());
        assert_eq!(d.get("individual:a").await.unwrap().as_deref(), Some("s2"));
        assert!(d.remove_if_equals("individual:a", "s2").await.unwrap());
        assert_eq!(d.get("individual:a").await.unwrap(), None);
        assert!(!d.remove_if_equals("individual:a", "s2").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_items_are_sets() {
        let d = ready().await;
        d.add_list_item("group-servers:g", "s1").await.unwrap();
        d.add_list_item("group-servers:g", "s1").await.unwrap();
        d.add_list_items("group-servers:g", &["s2".into(), "s3".into()])
            .await
            .unwrap();
        assert_eq!(
            d.get_list_items("group-servers:g").await.unwrap(),
            vec!["s1", "s2", "s3"]
        );
        d.remove_list_items("group-servers:g", &["s1".into(), "s3".into()])
            .await
            .unwrap();
        assert_eq!(d.get_list_items("group-servers:g").await.unwrap(), vec!["s2"]);
        d.remove_list_item("group-servers:g", "s2").await.unwrap();
        assert!(d.get_list_items("group-servers:g").await.unwrap().is_empty());
        assert!(d.get_list_items("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_reaches_every_listener() {
        let d = ready().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for tag in ["first", "second"] {
            let tx = tx.clone();
            d.listen(
                "server:s1:group",
                Arc::new(move |msg: Bytes| {
                    let _ = tx.send((tag, msg));
                }),
            )
            .await
            .unwrap();
        }
        assert_eq!(d.listener_count("server:s1:group"), 2);

        d.enqueue("server:s1:group", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        // delivered synchronously, before enqueue returned
        assert_eq!(rx.try_recv().unwrap(), ("first", Bytes::from_static(b"hi")));
        assert_eq!(rx.try_recv().unwrap(), ("second", Bytes::from_static(b"hi")));

        d.enqueue("server:s2:group", Bytes::from_static(b"lost"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
