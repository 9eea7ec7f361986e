//! Registry of live dashboard connections and their topic subscriptions.
//!
//! Every mutation and the point-in-time read used for fan-out go through one
//! mutex, so a connection is never seen twice and never with a torn
//! subscription value.

use crate::state::Subscription;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub type ConnectionId = u64;

/// Bounded per-connection queue of serialized payloads.
pub type ConnectionSender = mpsc::Sender<String>;

#[derive(Debug)]
struct Entry {
    sender: ConnectionSender,
    subscription: Subscription,
}

#[derive(Debug, Clone)]
pub struct ConnectionView {
    pub id: ConnectionId,
    pub sender: ConnectionSender,
    pub subscription: Subscription,
}

#[derive(Debug)]
pub struct Registry {
    connections: Mutex<BTreeMap<ConnectionId, Entry>>,
    next_conn_id: AtomicU64,
    buffer_size: usize,
}

impl Registry {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(BTreeMap::new()),
            next_conn_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        })
    }

    /// Adds a connection subscribed to all topics and returns the receiving
    /// end of its outbound queue.
    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);

        let active = {
            let mut connections = self.connections.lock().await;
            connections.insert(
                id,
                Entry {
                    sender: tx,
                    subscription: Subscription::All,
                },
            );
            connections.len()
        };
        debug!(connection_id = id, active, "connection registered");

        (id, rx)
    }

    /// Removes a connection. Returns false when it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let (removed, active) = {
            let mut connections = self.connections.lock().await;
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            debug!(connection_id = id, active, "connection unregistered");
        }
        removed
    }

    /// Updates the subscription of a live connection; a no-op for unknown ids.
    pub async fn set_subscription(&self, id: ConnectionId, subscription: Subscription) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.get_mut(&id) {
            Some(entry) => {
                debug!(connection_id = id, subscription = %subscription, "subscription changed");
                entry.subscription = subscription;
                true
            }
            None => false,
        }
    }

    /// Consistent view of all live connections, ordered by id.
    pub async fn connections(&self) -> Vec<ConnectionView> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .map(|(id, entry)| ConnectionView {
                id: *id,
                sender: entry.sender.clone(),
                subscription: entry.subscription.clone(),
            })
            .collect()
    }

    pub async fn active_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    #[cfg(test)]
    pub async fn subscription(&self, id: ConnectionId) -> Option<Subscription> {
        let connections = self.connections.lock().await;
        connections.get(&id).map(|entry| entry.subscription.clone())
    }
}
