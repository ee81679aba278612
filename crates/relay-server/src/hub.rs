//! Process-wide registry of live connections.
//!
//! Every operation takes the table lock for the duration of the walk or
//! mutation only. Enqueueing never blocks: a full buffer evicts the peer.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::ConnectionId;
use tracing::{debug, warn};

use crate::connection::{Connection, Enqueue};

/// Outcome of a fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Outcome of a direct send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Evicted,
    NotRegistered,
}

#[derive(Default)]
pub struct Hub {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Returns `false` if its id is already registered;
    /// the existing entry is kept.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let mut table = self.connections.lock();
        if table.contains_key(conn.id()) {
            return false;
        }
        let _ = table.insert(conn.id().clone(), conn);
        counter!("relay_connections_registered_total").increment(1);
        gauge!("relay_connections_active").set(table.len() as f64);
        true
    }

    /// Remove a connection and close its buffer. No-op if already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let mut table = self.connections.lock();
        match table.remove(id) {
            Some(conn) => {
                let _ = conn.close();
                gauge!("relay_connections_active").set(table.len() as f64);
                true
            }
            None => false,
        }
    }

    /// Enqueue `payload` to every connection matching `predicate`.
    ///
    /// Connections whose buffer is full or closed are evicted in the same
    /// critical section and are never seen by a later broadcast.
    pub fn broadcast(&self, payload: Arc<String>, predicate: impl Fn(&Connection) -> bool) -> Delivery {
        let mut table = self.connections.lock();
        let mut delivery = Delivery::default();

        for conn in table.values() {
            if !predicate(conn) {
                continue;
            }
            match conn.try_enqueue(Arc::clone(&payload)) {
                Enqueue::Queued => delivery.delivered += 1,
                Enqueue::Full | Enqueue::Closed => delivery.evicted.push(conn.id().clone()),
            }
        }

        for id in &delivery.evicted {
            if let Some(conn) = table.remove(id) {
                let _ = conn.close();
                warn!(connection_id = %id, "outbound buffer full, evicting connection");
            }
        }

        counter!("relay_broadcast_deliveries_total").increment(delivery.delivered as u64);
        if !delivery.evicted.is_empty() {
            counter!("relay_evictions_total").increment(delivery.evicted.len() as u64);
            gauge!("relay_connections_active").set(table.len() as f64);
        }
        debug!(
            delivered = delivery.delivered,
            evicted = delivery.evicted.len(),
            "broadcast"
        );
        delivery
    }

    /// Enqueue `payload` to one connection, evicting it if its buffer is full.
    pub fn send_to(&self, id: &ConnectionId, payload: Arc<String>) -> SendOutcome {
        let mut table = self.connections.lock();
        let Some(conn) = table.get(id) else {
            return SendOutcome::NotRegistered;
        };
        match conn.try_enqueue(payload) {
            Enqueue::Queued => SendOutcome::Delivered,
            Enqueue::Full | Enqueue::Closed => {
                if let Some(conn) = table.remove(id) {
                    let _ = conn.close();
                }
                counter!("relay_evictions_total").increment(1);
                gauge!("relay_connections_active").set(table.len() as f64);
                warn!(connection_id = %id, "outbound buffer full, evicting connection");
                SendOutcome::Evicted
            }
        }
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Role, SessionId};
    use tokio::sync::mpsc;

    fn payload(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    fn registered(hub: &Hub, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (conn, rx) = Connection::new(capacity);
        assert!(hub.register(Arc::clone(&conn)));
        (conn, rx)
    }

    #[test]
    fn register_and_unregister() {
        let hub = Hub::new();
        let (a, _ra) = registered(&hub, 4);
        let (b, _rb) = registered(&hub, 4);
        assert_eq!(hub.count(), 2);
        assert!(hub.contains(a.id()));

        assert!(hub.unregister(a.id()));
        assert!(!hub.unregister(a.id()));
        assert!(a.is_closed());
        assert!(!hub.contains(a.id()));
        assert!(hub.contains(b.id()));
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn duplicate_register_keeps_original() {
        let hub = Hub::new();
        let (a, _ra) = registered(&hub, 4);
        assert!(!hub.register(Arc::clone(&a)));
        assert_eq!(hub.count(), 1);
    }

    #[test]
    fn broadcast_respects_predicate() {
        let hub = Hub::new();
        let (a, mut ra) = registered(&hub, 4);
        let (_b, mut rb) = registered(&hub, 4);
        a.bind(SessionId::from_raw("sess_1"), Role::Visitor).unwrap();

        let delivery = hub.broadcast(payload("hello"), |c| c.session_id().is_some());
        assert_eq!(delivery.delivered, 1);
        assert!(delivery.evicted.is_empty());
        assert_eq!(ra.try_recv().unwrap().as_str(), "hello");
        assert!(rb.try_recv().is_err());
    }

    #[test]
    fn full_buffer_is_evicted_once() {
        let hub = Hub::new();
        let (slow, _slow_rx) = registered(&hub, 1);
        let (_fast, mut fast_rx) = registered(&hub, 8);

        let first = hub.broadcast(payload("1"), |_| true);
        assert_eq!(first.delivered, 2);

        let second = hub.broadcast(payload("2"), |_| true);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, vec![slow.id().clone()]);
        assert!(slow.is_closed());
        assert!(!hub.contains(slow.id()));

        let third = hub.broadcast(payload("3"), |_| true);
        assert_eq!(third.delivered, 1);
        assert!(third.evicted.is_empty());

        let got: Vec<String> = std::iter::from_fn(|| fast_rx.try_recv().ok())
            .map(|p| p.to_string())
            .collect();
        assert_eq!(got, vec!["1", "2", "3"]);
    }

    #[test]
    fn send_to_targets_one_connection() {
        let hub = Hub::new();
        let (a, mut ra) = registered(&hub, 1);
        let (_b, mut rb) = registered(&hub, 1);

        assert_eq!(hub.send_to(a.id(), payload("x")), SendOutcome::Delivered);
        assert_eq!(ra.try_recv().unwrap().as_str(), "x");
        assert!(rb.try_recv().is_err());

        assert_eq!(
            hub.send_to(&ConnectionId::from_raw("conn_missing"), payload("x")),
            SendOutcome::NotRegistered
        );
    }

    #[test]
    fn send_to_full_buffer_evicts() {
        let hub = Hub::new();
        let (a, _ra) = registered(&hub, 1);
        assert_eq!(hub.send_to(a.id(), payload("1")), SendOutcome::Delivered);
        assert_eq!(hub.send_to(a.id(), payload("2")), SendOutcome::Evicted);
        assert_eq!(hub.count(), 0);
        assert!(a.is_closed());
    }

    #[test]
    fn live_set_tracks_register_unregister_and_evict() {
        let hub = Hub::new();
        let mut live = std::collections::HashSet::new();
        let mut keep = Vec::new();

        for i in 0..20 {
            let capacity = if i % 5 == 0 { 1 } else { 16 };
            let (conn, rx) = registered(&hub, capacity);
            live.insert(conn.id().clone());
            keep.push((conn, rx));
        }
        for (conn, _) in keep.iter().skip(1).step_by(3) {
            hub.unregister(conn.id());
            live.remove(conn.id());
        }
        hub.broadcast(payload("a"), |_| true);
        let delivery = hub.broadcast(payload("b"), |_| true);
        for id in &delivery.evicted {
            live.remove(id);
        }

        assert_eq!(hub.count(), live.len());
        for id in &live {
            assert!(hub.contains(id));
        }
    }

    #[test]
    fn concurrent_register_unregister() {
        let hub = Arc::new(Hub::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (conn, _rx) = Connection::new(4);
                        hub.register(Arc::clone(&conn));
                        hub.broadcast(Arc::new("tick".into()), |_| true);
                        hub.unregister(conn.id());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hub.count(), 0);
    }
}
