use depthlink_protocol::PeerId;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Signalling sockets and the peer ids bound to them
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from peer ID to the connection it last sent from
    peer_connections: RwLock<HashMap<PeerId, Uuid>>,
    /// Map from connection ID to every peer ID bound to it
    connection_peers: RwLock<HashMap<Uuid, HashSet<PeerId>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            peer_connections: RwLock::new(HashMap::new()),
            connection_peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Signalling connection {} opened", connection_id);
    }

    /// Remove a connection, returning the peers that were bound to it
    pub async fn remove_connection(&self, connection_id: Uuid) -> Vec<PeerId> {
        self.senders.write().await.remove(&connection_id);

        let peers = self
            .connection_peers
            .write()
            .await
            .remove(&connection_id)
            .unwrap_or_default();

        let mut peer_connections = self.peer_connections.write().await;
        let mut orphaned = Vec::new();
        for peer in peers {
            // A peer that reconnected on another socket stays bound there
            if peer_connections.get(&peer) == Some(&connection_id) {
                peer_connections.remove(&peer);
                orphaned.push(peer);
            }
        }
        orphaned.sort();

        tracing::debug!(
            "Signalling connection {} closed ({} peers)",
            connection_id,
            orphaned.len()
        );
        orphaned
    }

    /// Bind `peer` to the connection it sent from
    pub async fn bind_peer(&self, connection_id: Uuid, peer: &PeerId) {
        let previous = self
            .peer_connections
            .write()
            .await
            .insert(peer.clone(), connection_id);

        if previous == Some(connection_id) {
            return;
        }
        let mut connection_peers = self.connection_peers.write().await;
        if let Some(previous) = previous {
            if let Some(peers) = connection_peers.get_mut(&previous) {
                peers.remove(peer);
            }
        }
        connection_peers
            .entry(connection_id)
            .or_default()
            .insert(peer.clone());
        tracing::debug!("Peer {} bound to connection {}", peer, connection_id);
    }

    pub async fn unbind_peer(&self, peer: &PeerId) {
        if let Some(connection_id) = self.peer_connections.write().await.remove(peer) {
            if let Some(peers) = self.connection_peers.write().await.get_mut(&connection_id) {
                peers.remove(peer);
            }
        }
    }

    pub async fn connection_of(&self, peer: &PeerId) -> Option<Uuid> {
        self.peer_connections.read().await.get(peer).copied()
    }

    /// Deliver to the socket bound to `peer`. Returns false if there is none.
    pub async fn send_to_peer(&self, peer: &PeerId, message: &str) -> bool {
        let Some(connection_id) = self.connection_of(peer).await else {
            return false;
        };
        self.send_to_connection(connection_id, message).await
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &str) -> bool {
        let senders = self.senders.read().await;

        match senders.get(&connection_id) {
            Some(sender) => match sender.send(message.to_string()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("Failed to send message to {}: {}", connection_id, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Send to every connection except `except`
    pub async fn broadcast_except(&self, except: Option<Uuid>, message: &str) {
        let senders = self.senders.read().await;
        for (connection_id, sender) in senders.iter() {
            if Some(*connection_id) == except {
                continue;
            }
            if let Err(e) = sender.send(message.to_string()) {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_route() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        manager.add_connection(conn, tx).await;

        let peer = PeerId::from("p1");
        assert!(!manager.send_to_peer(&peer, "hello").await);

        manager.bind_peer(conn, &peer).await;
        assert!(manager.send_to_peer(&peer, "hello").await);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        assert_eq!(manager.remove_connection(conn).await, vec![peer.clone()]);
        assert!(manager.connection_of(&peer).await.is_none());
    }

    #[tokio::test]
    async fn test_rebound_peer_survives_old_socket_close() {
        let manager = ConnectionManager::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        manager.add_connection(old, old_tx).await;
        manager.add_connection(new, new_tx).await;

        let peer = PeerId::from("c1");
        manager.bind_peer(old, &peer).await;
        manager.bind_peer(new, &peer).await;

        assert!(manager.remove_connection(old).await.is_empty());
        assert_eq!(manager.connection_of(&peer).await, Some(new));
    }
}
