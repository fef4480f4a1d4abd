use depthlink_protocol::{PeerId, Role};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Roles of every peer that has joined the network
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, Role>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Record or refresh a peer's role
    pub async fn join(&self, peer: PeerId, role: Role) {
        let previous = self.peers.write().await.insert(peer.clone(), role);
        if previous.is_none() {
            tracing::info!("{} {} joined the network", role, peer);
        }
    }

    pub async fn leave(&self, peer: &PeerId) -> Option<Role> {
        let role = self.peers.write().await.remove(peer);
        if let Some(role) = role {
            tracing::info!("{} {} left the network", role, peer);
        }
        role
    }

    pub async fn role_of(&self, peer: &PeerId) -> Option<Role> {
        self.peers.read().await.get(peer).copied()
    }

    pub async fn peers_with_role(&self, role: Role) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, r)| **r == role)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// All known providers and consumers, sorted
    pub async fn snapshot(&self) -> (Vec<PeerId>, Vec<PeerId>) {
        (
            self.peers_with_role(Role::Provider).await,
            self.peers_with_role(Role::Consumer).await,
        )
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_and_leave() {
        let directory = PeerDirectory::new();
        directory.join(PeerId::from("p1"), Role::Provider).await;
        directory.join(PeerId::from("c2"), Role::Consumer).await;
        directory.join(PeerId::from("c1"), Role::Consumer).await;

        let (providers, consumers) = directory.snapshot().await;
        assert_eq!(providers, vec![PeerId::from("p1")]);
        assert_eq!(consumers, vec![PeerId::from("c1"), PeerId::from("c2")]);

        assert_eq!(directory.leave(&PeerId::from("p1")).await, Some(Role::Provider));
        assert_eq!(directory.leave(&PeerId::from("p1")).await, None);
        assert!(directory.peers_with_role(Role::Provider).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_updates_role() {
        let directory = PeerDirectory::new();
        let peer = PeerId::from("x");
        directory.join(peer.clone(), Role::Consumer).await;
        directory.join(peer.clone(), Role::Provider).await;
        assert_eq!(directory.role_of(&peer).await, Some(Role::Provider));
        assert!(directory.peers_with_role(Role::Consumer).await.is_empty());
    }
}
