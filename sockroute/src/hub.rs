//! Delivery engine shared by the server and every response helper.
//!
//! ```text
//!              send_to_individual(id)                 send_to_group(g)
//!                       │                                    │
//!           local? ─────┤                         local members ──► Connection::send
//!            yes │      │ no                                 │
//!   Connection::send    ▼                                    ▼
//!          distributor.get(individual:<id>)     distributor.get_list_items(group-servers:<g>)
//!                       │                                    │ (other servers)
//!                       ▼                                    ▼
//!       enqueue(server:<owner>:individual, env)   enqueue(server:<s>:group, env)
//! ```
//!
//! `env` is the channel envelope: target id + already encoded frame. The
//! receiving hub demultiplexes on the id without decoding the frame, so all
//! servers of one cluster must share a wire format.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use thiserror::Error;

use crate::distributor::{
    group_channel, group_servers_key, individual_channel, individual_key, my_groups_key,
    Distributor, DistributorError,
};
use crate::protocol::{
    decode_envelope, encode_envelope, ProtocolError, ServerFrame, WireFormat, CORRELATION_SPACE,
};
use crate::registry::{Connection, GroupId, GroupStore, IndividualRegistry};

/// Where an individually addressed frame went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to a connection on this server.
    Local,
    /// Enqueued on the owning server's channel.
    Forwarded { server_id: String },
    /// No server owns the connection id.
    Unknown,
}

/// Fan-out counts of one group send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupDelivery {
    pub local: usize,
    pub remote_servers: usize,
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub frames_delivered: u64,
    pub frames_forwarded: u64,
    pub local_connections: usize,
    pub local_groups: usize,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub frames_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_forwarded: AtomicU64,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Distributor(#[from] DistributorError),
}

/// Local registries plus the distributor, for one server.
pub struct Hub {
    server_id: String,
    wire: WireFormat,
    individuals: IndividualRegistry,
    groups: GroupStore,
    distributor: Arc<dyn Distributor>,
    next_correlation: AtomicU32,
    counters: Counters,
}

impl Hub {
    pub fn new(server_id: impl Into<String>, wire: WireFormat, distributor: Arc<dyn Distributor>) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            wire,
            individuals: IndividualRegistry::new(),
            groups: GroupStore::new(),
            distributor,
            next_correlation: AtomicU32::new(0),
            counters: Counters::default(),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn wire(&self) -> WireFormat {
        self.wire
    }

    pub fn individuals(&self) -> &IndividualRegistry {
        &self.individuals
    }

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn distributor(&self) -> &Arc<dyn Distributor> {
        &self.distributor
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Initialize the distributor and start listening on this server's channels.
    ///
    /// Channel callbacks hold a weak reference; they go quiet once the hub drops.
    pub async fn start(self: &Arc<Self>) -> Result<(), DistributorError> {
        self.distributor.initialize(&self.server_id).await?;

        let weak: Weak<Hub> = Arc::downgrade(self);
        self.distributor
            .listen(
                &individual_channel(&self.server_id),
                Arc::new(move |message: Bytes| {
                    if let Some(hub) = weak.upgrade() {
                        hub.deliver_individual_envelope(&message);
                    }
                }),
            )
            .await?;

        let weak: Weak<Hub> = Arc::downgrade(self);
        self.distributor
            .listen(
                &group_channel(&self.server_id),
                Arc::new(move |message: Bytes| {
                    if let Some(hub) = weak.upgrade() {
                        hub.deliver_group_envelope(&message);
                    }
                }),
            )
            .await?;
        Ok(())
    }

    fn next_correlation_id(&self) -> u32 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed) % CORRELATION_SPACE
    }

    /// Stamp a fresh correlation id and encode.
    pub fn encode(&self, mut frame: ServerFrame) -> Result<Bytes, ProtocolError> {
        frame.correlation_id = self.next_correlation_id();
        self.wire.encode_server(&frame)
    }

    /// Encode and write `frame` to a local connection.
    pub fn send_local(&self, connection: &Connection, frame: ServerFrame) -> Result<bool, HubError> {
        let bytes = self.encode(frame)?;
        Ok(self.write(connection, bytes))
    }

    fn write(&self, connection: &Connection, bytes: Bytes) -> bool {
        let sent = connection.send(bytes);
        if sent {
            self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            log::debug!("connection {} closed, frame dropped", connection.id());
        }
        sent
    }

    /// Make `connection` reachable by id from every server.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        let id = connection.id().to_string();
        if self.individuals.add(connection).is_some() {
            log::debug!("connection {} replaced an older local entry", id);
        }
        self.distributor
            .set(&individual_key(&id), &self.server_id)
            .await?;
        Ok(())
    }

    /// Forget a closed connection.
    ///
    /// Leaves its local groups (dropping this server from `group-servers` lists
    /// it no longer serves) and releases `individual:<id>` if it still names
    /// this server. `my-groups:<id>` is kept for a later resume.
    pub async fn unregister(&self, connection: &Arc<Connection>) -> Result<(), HubError> {
        connection.mark_closed();
        if !self.individuals.remove_if(connection) {
            log::debug!("connection {} already resumed elsewhere on this server", connection.id());
            return Ok(());
        }
        let id = connection.id();
        for (group, remaining) in self.groups.remove_connection(id) {
            if remaining == 0 {
                self.distributor
                    .remove_list_item(&group_servers_key(&group), &self.server_id)
                    .await?;
            }
        }
        // A resume on another server may already own the key.
        self.distributor
            .remove_if_equals(&individual_key(id), &self.server_id)
            .await?;
        Ok(())
    }

    /// Add `connection` to `group` here and in the distributor.
    pub async fn join(&self, connection: &Arc<Connection>, group: &str) -> Result<bool, HubError> {
        let added = self.groups.add(group, connection.clone());
        self.distributor
            .add_list_item(&group_servers_key(group), &self.server_id)
            .await?;
        self.distributor
            .add_list_item(&my_groups_key(connection.id()), group)
            .await?;
        log::debug!("{} joined {}", connection.id(), group);
        Ok(added)
    }

    pub async fn leave(&self, connection_id: &str, group: &str) -> Result<bool, HubError> {
        let (removed, remaining) = self.groups.remove(group, connection_id);
        if removed && remaining == 0 {
            self.distributor
                .remove_list_item(&group_servers_key(group), &self.server_id)
                .await?;
        }
        self.distributor
            .remove_list_item(&my_groups_key(connection_id), group)
            .await?;
        log::debug!("{} left {}", connection_id, group);
        Ok(removed)
    }

    /// Leave every group, locally and in the resume record.
    pub async fn leave_all(&self, connection_id: &str) -> Result<Vec<GroupId>, HubError> {
        let left = self.groups.remove_connection(connection_id);
        for (group, remaining) in &left {
            if *remaining == 0 {
                self.distributor
                    .remove_list_item(&group_servers_key(group), &self.server_id)
                    .await?;
            }
        }
        self.distributor.remove(&my_groups_key(connection_id)).await?;
        Ok(left.into_iter().map(|(group, _)| group).collect())
    }

    /// Rejoin the groups recorded for a resumed connection id.
    pub async fn restore_groups(&self, connection: &Arc<Connection>) -> Result<Vec<GroupId>, HubError> {
        let groups = self
            .distributor
            .get_list_items(&my_groups_key(connection.id()))
            .await?;
        for group in &groups {
            self.groups.add(group, connection.clone());
            self.distributor
                .add_list_item(&group_servers_key(group), &self.server_id)
                .await?;
        }
        if !groups.is_empty() {
            log::info!("{} rejoined {} group(s)", connection.id(), groups.len());
        }
        Ok(groups)
    }

    /// Deliver to one connection wherever it lives.
    pub async fn send_to_individual(&self, connection_id: &str, frame: ServerFrame) -> Result<Delivery, HubError> {
        if let Some(connection) = self.individuals.find(connection_id) {
            self.send_local(&connection, frame)?;
            return Ok(Delivery::Local);
        }
        let owner = self.distributor.get(&individual_key(connection_id)).await?;
        match owner {
            Some(server_id) if server_id != self.server_id => {
                let bytes = self.encode(frame)?;
                let envelope = encode_envelope(connection_id, &bytes)?;
                self.distributor
                    .enqueue(&individual_channel(&server_id), envelope)
                    .await?;
                self.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery::Forwarded { server_id })
            }
            _ => {
                log::debug!("no live owner for {}, frame dropped", connection_id);
                Ok(Delivery::Unknown)
            }
        }
    }

    /// Deliver to local members, then to every other server hosting the group.
    pub async fn send_to_group(&self, group: &str, frame: ServerFrame) -> Result<GroupDelivery, HubError> {
        let bytes = self.encode(frame)?;
        let mut delivery = GroupDelivery::default();
        for member in self.groups.find(group) {
            if self.write(&member, bytes.clone()) {
                delivery.local += 1;
            }
        }

        let servers = self.distributor.get_list_items(&group_servers_key(group)).await?;
        let remote: Vec<&String> = servers.iter().filter(|s| **s != self.server_id).collect();
        if !remote.is_empty() {
            let envelope = encode_envelope(group, &bytes)?;
            for server_id in remote {
                self.distributor
                    .enqueue(&group_channel(server_id), envelope.clone())
                    .await?;
                self.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                delivery.remote_servers += 1;
            }
        }
        log::trace!(
            "group {}: {} local, {} remote server(s)",
            group,
            delivery.local,
            delivery.remote_servers
        );
        Ok(delivery)
    }

    fn deliver_individual_envelope(&self, message: &Bytes) {
        let Some((id, frame)) = decode_envelope(message) else {
            log::warn!("malformed individual envelope ({} bytes)", message.len());
            return;
        };
        match self.individuals.find(&id) {
            Some(connection) => {
                self.write(&connection, frame);
            }
            None => log::debug!("forwarded frame for {} arrived after it left", id),
        }
    }

    fn deliver_group_envelope(&self, message: &Bytes) {
        let Some((group, frame)) = decode_envelope(message) else {
            log::warn!("malformed group envelope ({} bytes)", message.len());
            return;
        };
        for member in self.groups.find(&group) {
            self.write(&member, frame.clone());
        }
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            frames_forwarded: c.frames_forwarded.load(Ordering::Relaxed),
            local_connections: self.individuals.len(),
            local_groups: self.groups.group_count(),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("server_id", &self.server_id)
            .field("wire", &self.wire)
            .field("connections", &self.individuals.len())
            .field("groups", &self.groups.group_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::InMemoryDistributor;
    use crate::protocol::Method;
    use crate::registry::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn cluster(n: usize) -> (Arc<InMemoryDistributor>, Vec<Arc<Hub>>) {
        let distributor = Arc::new(InMemoryDistributor::new());
        let mut hubs = Vec::new();
        for i in 0..n {
            let hub = Hub::new(format!("s{i}"), WireFormat::Binary, distributor.clone());
            hub.start().await.unwrap();
            hubs.push(hub);
        }
        (distributor, hubs)
    }

    fn body_of(rx: &mut UnboundedReceiver<Outbound>) -> Option<String> {
        match rx.try_recv().ok()? {
            Outbound::Frame(bytes) => {
                let frame = WireFormat::Binary.decode_server(&bytes)?;
                frame.body?.as_text().map(str::to_owned)
            }
            Outbound::Close => None,
        }
    }

    fn push(text: &str) -> ServerFrame {
        ServerFrame::new(Method::Post, "/push", 200).with_body(text)
    }

    #[tokio::test]
    async fn test_register_records_owner() {
        let (d, hubs) = cluster(1).await;
        let (conn, _rx) = Connection::detached("c1");
        hubs[0].register(conn.clone()).await.unwrap();
        assert_eq!(d.get("individual:c1").await.unwrap().as_deref(), Some("s0"));

        hubs[0].unregister(&conn).await.unwrap();
        assert_eq!(d.get("individual:c1").await.unwrap(), None);
        assert!(hubs[0].individuals().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_keeps_foreign_owner() {
        let (d, hubs) = cluster(1).await;
        let (conn, _rx) = Connection::detached("c1");
        hubs[0].register(conn.clone()).await.unwrap();
        // resumed on another server in the meantime
        d.set("individual:c1", "s9").await.unwrap();
        hubs[0].unregister(&conn).await.unwrap();
        assert_eq!(d.get("individual:c1").await.unwrap().as_deref(), Some("s9"));
    }

    #[tokio::test]
    async fn test_individual_forwarded_across_servers() {
        let (_d, hubs) = cluster(2).await;
        let (conn, mut rx) = Connection::detached("far");
        hubs[1].register(conn).await.unwrap();

        let delivery = hubs[0].send_to_individual("far", push("hello")).await.unwrap();
        assert_eq!(delivery, Delivery::Forwarded { server_id: "s1".into() });
        assert_eq!(body_of(&mut rx).as_deref(), Some("hello"));
        assert_eq!(hubs[0].stats().frames_forwarded, 1);
        assert_eq!(hubs[1].stats().frames_delivered, 1);

        let local = hubs[1].send_to_individual("far", push("again")).await.unwrap();
        assert_eq!(local, Delivery::Local);
        assert_eq!(body_of(&mut rx).as_deref(), Some("again"));

        let unknown = hubs[0].send_to_individual("nobody", push("x")).await.unwrap();
        assert_eq!(unknown, Delivery::Unknown);
    }

    #[tokio::test]
    async fn test_group_fan_out_across_servers() {
        let (d, hubs) = cluster(3).await;
        let (a, mut ra) = Connection::detached("a");
        let (b, mut rb) = Connection::detached("b");
        let (c, mut rc) = Connection::detached("c");
        hubs[0].join(&a, "all").await.unwrap();
        hubs[1].join(&b, "all").await.unwrap();
        hubs[1].join(&c, "other").await.unwrap();

        assert_eq!(d.get_list_items("group-servers:all").await.unwrap(), vec!["s0", "s1"]);

        let delivery = hubs[0].send_to_group("all", push("hi all")).await.unwrap();
        assert_eq!(delivery, GroupDelivery { local: 1, remote_servers: 1 });
        assert_eq!(body_of(&mut ra).as_deref(), Some("hi all"));
        assert_eq!(body_of(&mut rb).as_deref(), Some("hi all"));
        assert!(body_of(&mut rc).is_none());

        // hub 2 hosts no member and receives nothing
        assert_eq!(hubs[2].stats().frames_delivered, 0);
    }

    #[tokio::test]
    async fn test_leave_updates_group_servers() {
        let (d, hubs) = cluster(1).await;
        let (a, _ra) = Connection::detached("a");
        let (b, _rb) = Connection::detached("b");
        hubs[0].join(&a, "g").await.unwrap();
        hubs[0].join(&b, "g").await.unwrap();

        assert!(hubs[0].leave("a", "g").await.unwrap());
        assert_eq!(d.get_list_items("group-servers:g").await.unwrap(), vec!["s0"]);
        assert!(d.get_list_items("my-groups:a").await.unwrap().is_empty());

        assert!(hubs[0].leave("b", "g").await.unwrap());
        assert!(d.get_list_items("group-servers:g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_resume_record() {
        let (d, hubs) = cluster(2).await;
        let (old, _r1) = Connection::detached("peer");
        hubs[0].register(old.clone()).await.unwrap();
        hubs[0].join(&old, "room").await.unwrap();
        hubs[0].join(&old, "lobby").await.unwrap();

        hubs[0].unregister(&old).await.unwrap();
        assert!(d.get_list_items("group-servers:room").await.unwrap().is_empty());
        assert_eq!(d.get_list_items("my-groups:peer").await.unwrap(), vec!["lobby", "room"]);

        // resume on the second server
        let (new, mut rx) = Connection::detached("peer");
        hubs[1].register(new.clone()).await.unwrap();
        let restored = hubs[1].restore_groups(&new).await.unwrap();
        assert_eq!(restored, vec!["lobby", "room"]);
        assert_eq!(d.get_list_items("group-servers:room").await.unwrap(), vec!["s1"]);

        hubs[0].send_to_group("room", push("welcome back")).await.unwrap();
        assert_eq!(body_of(&mut rx).as_deref(), Some("welcome back"));
    }

    #[tokio::test]
    async fn test_leave_all_clears_resume_record() {
        let (d, hubs) = cluster(1).await;
        let (a, _ra) = Connection::detached("a");
        hubs[0].join(&a, "x").await.unwrap();
        hubs[0].join(&a, "y").await.unwrap();
        let left = hubs[0].leave_all("a").await.unwrap();
        assert_eq!(left, vec!["x", "y"]);
        assert!(d.get_list_items("my-groups:a").await.unwrap().is_empty());
        assert!(hubs[0].groups().groups_of("a").is_empty());
    }

    #[tokio::test]
    async fn test_correlation_ids_increase() {
        let (_d, hubs) = cluster(1).await;
        let first = hubs[0].encode(push("1")).unwrap();
        let second = hubs[0].encode(push("2")).unwrap();
        let a = WireFormat::Binary.decode_server(&first).unwrap();
        let b = WireFormat::Binary.decode_server(&second).unwrap();
        assert_eq!(b.correlation_id, a.correlation_id + 1);
    }
}
