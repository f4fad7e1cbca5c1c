use super::SipConnection;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Live connections keyed by address string
///
/// Lookups share the lock, insertion and removal take it exclusively. There
/// is no capacity or eviction: an entry lives until its connection's read
/// loop ends and removes it.
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, SipConnection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, addr: &str) -> Option<SipConnection> {
        self.connections.read().await.get(addr).cloned()
    }

    pub async fn add(&self, addr: String, connection: SipConnection) {
        self.connections.write().await.insert(addr, connection);
    }

    /// Insert `connection` unless `addr` is already taken, and return the
    /// entry that ends up in the pool.
    pub async fn add_if_absent(&self, addr: String, connection: SipConnection) -> SipConnection {
        self.connections
            .write()
            .await
            .entry(addr)
            .or_insert(connection)
            .clone()
    }

    pub async fn remove(&self, addr: &str) -> Option<SipConnection> {
        self.connections.write().await.remove(addr)
    }

    /// Remove the entry for `addr` only while it still holds `connection`.
    pub async fn remove_if_same(&self, addr: &str, connection: &SipConnection) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(addr) == Some(connection) {
            connections.remove(addr);
            return true;
        }
        false
    }

    pub async fn size(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn drain(&self) -> Vec<(String, SipConnection)> {
        self.connections.write().await.drain().collect()
    }
}
