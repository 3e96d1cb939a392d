//! Connection index by id and by owning user.
//!
//! Plain data structure with no locking of its own: the hub coordinator task
//! is its only owner.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tracing::{debug, warn};

use kapi_core::UserId;

use crate::connection::{Connection, ConnectionState};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Connections dropped because their queue was full or already closed.
    pub evicted: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    by_user: HashMap<UserId, Vec<Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Ids are unique per process, so re-registering the
    /// same id is not expected.
    pub fn register(&mut self, conn: Arc<Connection>) {
        conn.advance(ConnectionState::Active);
        debug!(conn_id = %conn.id(), user_id = %conn.user_id(), "Connection registered");
        self.by_user
            .entry(conn.user_id())
            .or_default()
            .push(Arc::clone(&conn));
        self.connections.insert(conn.id().to_string(), conn);
    }

    /// Forget a connection and close its queue. Unknown ids are ignored.
    pub fn unregister(&mut self, conn_id: &str) -> bool {
        let Some(conn) = self.connections.remove(conn_id) else {
            return false;
        };
        if let Entry::Occupied(mut entry) = self.by_user.entry(conn.user_id()) {
            entry.get_mut().retain(|c| c.id() != conn_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        conn.close();
        debug!(conn_id, user_id = %conn.user_id(), "Connection unregistered");
        true
    }

    pub fn broadcast_to_user(&mut self, user_id: UserId, frame: Arc<str>) -> Delivery {
        self.deliver(user_id, frame, None)
    }

    /// Broadcast to every connection of `user_id` except the one whose id is
    /// `origin`. An empty or unknown origin excludes nobody.
    pub fn broadcast_to_user_except(
        &mut self,
        user_id: UserId,
        frame: Arc<str>,
        origin: Option<&str>,
    ) -> Delivery {
        let excluded = origin
            .filter(|id| !id.is_empty())
            .filter(|id| self.connections.contains_key(*id));
        if origin.is_some_and(|id| !id.is_empty()) && excluded.is_none() {
            debug!(%user_id, "Origin client is not connected, broadcasting to all");
        }
        self.deliver(user_id, frame, excluded)
    }

    fn deliver(&mut self, user_id: UserId, frame: Arc<str>, excluded: Option<&str>) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(targets) = self.by_user.get(&user_id).cloned() else {
            return delivery;
        };

        for conn in targets {
            if excluded == Some(conn.id()) {
                continue;
            }
            match conn.try_enqueue(Arc::clone(&frame)) {
                Ok(()) => delivery.delivered += 1,
                Err(reason) => {
                    warn!(conn_id = %conn.id(), %user_id, %reason, "Evicting connection");
                    self.unregister(conn.id());
                    delivery.evicted.push(conn.id().to_string());
                }
            }
        }
        delivery
    }

    /// Close every queue and forget everything.
    pub fn clear(&mut self) -> usize {
        let count = self.connections.len();
        for conn in self.connections.values() {
            conn.close();
        }
        self.connections.clear();
        self.by_user.clear();
        count
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.connections.contains_key(conn_id)
    }

    /// Ids of a user's connections in registration order.
    pub fn user_connection_ids(&self, user_id: UserId) -> Vec<String> {
        self.by_user
            .get(&user_id)
            .map(|conns| conns.iter().map(|c| c.id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Both indexes agree and no user key maps to an empty list.
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.by_user.values().map(Vec::len).sum();
        indexed == self.connections.len()
            && self.by_user.iter().all(|(user, conns)| {
                !conns.is_empty()
                    && conns.iter().all(|c| {
                        c.user_id() == *user
                            && self
                                .connections
                                .get(c.id())
                                .is_some_and(|known| Arc::ptr_eq(known, c))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connect(registry: &mut Registry, user: i64) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (conn, rx) = Connection::new(UserId(user));
        registry.register(Arc::clone(&conn));
        (conn, rx)
    }

    #[test]
    fn test_register_unregister_keeps_indexes_in_sync() {
        let mut registry = Registry::new();
        let (a, _ra) = connect(&mut registry, 1);
        let (b, _rb) = connect(&mut registry, 1);
        let (c, _rc) = connect(&mut registry, 2);
        assert!(registry.is_consistent());
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.user_count(), 2);
        assert_eq!(a.state(), ConnectionState::Active);

        assert!(registry.unregister(a.id()));
        assert!(registry.is_consistent());
        assert_eq!(registry.user_connection_ids(UserId(1)), vec![b.id().to_string()]);

        assert!(registry.unregister(c.id()));
        assert!(registry.is_consistent());
        assert_eq!(registry.user_count(), 1);
        assert!(registry.user_connection_ids(UserId(2)).is_empty());
    }

    #[test]
    fn test_double_unregister_is_harmless() {
        let mut registry = Registry::new();
        let (a, _ra) = connect(&mut registry, 1);
        let (b, _rb) = connect(&mut registry, 1);

        assert!(registry.unregister(a.id()));
        assert!(!registry.unregister(a.id()));
        assert!(registry.contains(b.id()));
        assert!(!b.is_closed());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_user_connections() {
        let mut registry = Registry::new();
        let (_a, mut ra) = connect(&mut registry, 1);
        let (_b, mut rb) = connect(&mut registry, 1);
        let (_c, mut rc) = connect(&mut registry, 2);

        let delivery = registry.broadcast_to_user(UserId(1), "hello".into());
        assert_eq!(delivery.delivered, 2);
        assert_eq!(ra.recv().await.as_deref(), Some("hello"));
        assert_eq!(rb.recv().await.as_deref(), Some("hello"));
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn test_except_skips_only_the_origin() {
        let mut registry = Registry::new();
        let (a, mut ra) = connect(&mut registry, 1);
        let (_b, mut rb) = connect(&mut registry, 1);
        let (_c, mut rc) = connect(&mut registry, 1);

        let delivery = registry.broadcast_to_user_except(UserId(1), "x".into(), Some(a.id()));
        assert_eq!(delivery.delivered, 2);
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
        assert!(rc.try_recv().is_ok());
    }

    #[test]
    fn test_except_with_unknown_or_empty_origin_reaches_everyone() {
        let mut registry = Registry::new();
        let (_a, _ra) = connect(&mut registry, 1);
        let (_b, _rb) = connect(&mut registry, 1);

        for origin in [None, Some(""), Some("gone")] {
            let delivery = registry.broadcast_to_user_except(UserId(1), "x".into(), origin);
            assert_eq!(delivery.delivered, 2, "origin {origin:?}");
        }
    }

    #[test]
    fn test_origin_owned_by_other_user_excludes_nobody() {
        let mut registry = Registry::new();
        let (_a, _ra) = connect(&mut registry, 1);
        let (other, _ro) = connect(&mut registry, 2);

        let delivery = registry.broadcast_to_user_except(UserId(1), "x".into(), Some(other.id()));
        assert_eq!(delivery.delivered, 1);
    }

    #[test]
    fn test_full_queue_evicts_from_both_indexes() {
        let mut registry = Registry::new();
        let (slow, _rs) = Connection::with_capacity(UserId(1), 1);
        registry.register(Arc::clone(&slow));
        let (_fast, mut rf) = connect(&mut registry, 1);

        registry.broadcast_to_user(UserId(1), "first".into());
        let delivery = registry.broadcast_to_user(UserId(1), "second".into());

        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.evicted, vec![slow.id().to_string()]);
        assert!(slow.is_closed());
        assert!(!registry.contains(slow.id()));
        assert!(registry.is_consistent());
        assert_eq!(rf.try_recv().ok().as_deref(), Some("first"));
        assert_eq!(rf.try_recv().ok().as_deref(), Some("second"));
    }

    #[test]
    fn test_last_eviction_removes_user_key() {
        let mut registry = Registry::new();
        let (conn, rx) = connect(&mut registry, 7);
        drop(rx);

        let delivery = registry.broadcast_to_user(UserId(7), "x".into());
        assert_eq!(delivery.evicted, vec![conn.id().to_string()]);
        assert_eq!(registry.user_count(), 0);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_clear_closes_everything() {
        let mut registry = Registry::new();
        let (a, _ra) = connect(&mut registry, 1);
        let (b, _rb) = connect(&mut registry, 2);

        assert_eq!(registry.clear(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_random_sequences_stay_consistent() {
        let mut registry = Registry::new();
        let mut live: Vec<(Arc<Connection>, mpsc::Receiver<Arc<str>>)> = Vec::new();
        // Deterministic interleaving of registers, unregisters and duplicate unregisters.
        for step in 0u64..200 {
            let roll = step.wrapping_mul(2_654_435_761) % 7;
            if roll < 4 || live.is_empty() {
                live.push(connect(&mut registry, (step % 5) as i64));
            } else {
                let idx = (step as usize) % live.len();
                let (conn, _rx) = live.remove(idx);
                registry.unregister(conn.id());
                registry.unregister(conn.id());
            }
            assert!(registry.is_consistent(), "inconsistent after step {step}");
        }
        assert_eq!(registry.connection_count(), live.len());
    }
}
