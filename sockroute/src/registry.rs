//! Local registries of live connections.
//!
//! [`IndividualRegistry`] maps connection ids to connections;
//! [`GroupStore`] tracks group membership in both directions:
//!
//! ```text
//!   groups:      group id ──► { connection id ──► Connection }
//!   memberships: connection id ──► { group id }
//! ```
//!
//! Both maps sit behind one lock so they can never disagree.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

pub type ConnectionId = String;
pub type GroupId = String;

/// Item queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Bytes),
    Close,
}

/// Server-side handle to one live WebSocket connection.
///
/// Cloned freely as `Arc<Connection>`; writes go through an unbounded queue
/// drained by the connection's writer task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl Connection {
    pub fn new(id: impl Into<ConnectionId>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: id.into(),
            outbound,
            open: AtomicBool::new(true),
        }
    }

    /// Connection with no socket behind it; frames land in the returned receiver.
    pub fn detached(id: impl Into<ConnectionId>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(id, tx)), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queue encoded frame bytes. Returns false if the connection is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        self.is_open() && self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Connection id → live connection.
#[derive(Debug, Default)]
pub struct IndividualRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl IndividualRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection`, replacing any previous entry with the same id.
    pub fn add(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        write(&self.connections).insert(connection.id().to_string(), connection)
    }

    pub fn find(&self, id: &str) -> Option<Arc<Connection>> {
        read(&self.connections).get(id).cloned()
    }

    /// Remove `id` only if it still maps to `connection`.
    ///
    /// A resumed connection may already have replaced the entry.
    pub fn remove_if(&self, connection: &Arc<Connection>) -> bool {
        let mut map = write(&self.connections);
        match map.get(connection.id()) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                map.remove(connection.id());
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        write(&self.connections).remove(id)
    }

    pub fn len(&self) -> usize {
        read(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        read(&self.connections).keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Membership {
    groups: HashMap<GroupId, HashMap<ConnectionId, Arc<Connection>>>,
    memberships: HashMap<ConnectionId, HashSet<GroupId>>,
}

/// Bidirectional group membership for connections on this server.
#[derive(Debug, Default)]
pub struct GroupStore {
    inner: RwLock<Membership>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `group`. Returns false if it was already a member.
    pub fn add(&self, group: &str, connection: Arc<Connection>) -> bool {
        let mut inner = write(&self.inner);
        let id = connection.id().to_string();
        let inserted = inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(id.clone(), connection)
            .is_none();
        inner
            .memberships
            .entry(id)
            .or_default()
            .insert(group.to_string());
        inserted
    }

    /// Remove `connection_id` from `group`.
    ///
    /// Returns `(removed, remaining)` where `remaining` is the number of local
    /// members left in the group. An emptied group keeps its record until
    /// [`prune_empty`](Self::prune_empty).
    pub fn remove(&self, group: &str, connection_id: &str) -> (bool, usize) {
        let mut inner = write(&self.inner);
        let Membership {
            groups,
            memberships,
        } = &mut *inner;

        let (removed, remaining) = match groups.get_mut(group) {
            Some(members) => {
                let removed = members.remove(connection_id).is_some();
                (removed, members.len())
            }
            None => (false, 0),
        };
        if let Some(set) = memberships.get_mut(connection_id) {
            set.remove(group);
            if set.is_empty() {
                memberships.remove(connection_id);
            }
        }
        (removed, remaining)
    }

    /// Snapshot of the local members of `group`.
    pub fn find(&self, group: &str) -> Vec<Arc<Connection>> {
        read(&self.inner)
            .groups
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_group(&self, group: &str) -> bool {
        read(&self.inner).groups.contains_key(group)
    }

    pub fn is_member(&self, group: &str, connection_id: &str) -> bool {
        read(&self.inner)
            .groups
            .get(group)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Groups `connection_id` belongs to on this server.
    pub fn groups_of(&self, connection_id: &str) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = read(&self.inner)
            .memberships
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Drop `connection_id` from every group.
    ///
    /// Returns each group it left with the number of local members remaining.
    pub fn remove_connection(&self, connection_id: &str) -> Vec<(GroupId, usize)> {
        let mut inner = write(&self.inner);
        let Membership {
            groups,
            memberships,
        } = &mut *inner;

        let Some(left) = memberships.remove(connection_id) else {
            return Vec::new();
        };
        let mut result: Vec<(GroupId, usize)> = left
            .into_iter()
            .map(|group| {
                let remaining = match groups.get_mut(&group) {
                    Some(members) => {
                        members.remove(connection_id);
                        members.len()
                    }
                    None => 0,
                };
                (group, remaining)
            })
            .collect();
        result.sort();
        result
    }

    /// Drop members whose connection has closed, then empty group records.
    ///
    /// Returns the ids of groups that became empty.
    pub fn prune_empty(&self) -> Vec<GroupId> {
        let mut inner = write(&self.inner);
        let Membership {
            groups,
            memberships,
        } = &mut *inner;

        let mut emptied = Vec::new();
        groups.retain(|group, members| {
            members.retain(|id, connection| {
                let keep = connection.is_open();
                if !keep {
                    if let Some(set) = memberships.get_mut(id) {
                        set.remove(group);
                    }
                }
                keep
            });
            if members.is_empty() {
                emptied.push(group.clone());
                false
            } else {
                true
            }
        });
        memberships.retain(|_, set| !set.is_empty());
        emptied.sort();
        emptied
    }

    pub fn group_count(&self) -> usize {
        read(&self.inner).groups.len()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
