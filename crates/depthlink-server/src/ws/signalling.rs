use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use depthlink_protocol::{PeerId, Role, SignallingEnvelope, SignallingMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::connections::ConnectionManager;
use super::directory::PeerDirectory;

const JOIN_NETWORK: &str = "joinNetwork";
const LEAVE_NETWORK: &str = "leaveNetwork";

/// Forwards signalling messages between peers.
///
/// Messages are relayed verbatim. Addressed messages go to the socket bound
/// to `dest`; broadcast `joinNetwork` goes to every peer of the opposite role
/// and is acknowledged with `discoverPeers`.
pub struct SignallingRelay {
    connections: ConnectionManager,
    directory: Arc<PeerDirectory>,
}

impl SignallingRelay {
    pub fn new(directory: Arc<PeerDirectory>) -> Self {
        Self {
            connections: ConnectionManager::new(),
            directory,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub async fn connect(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.connections.add_connection(connection_id, sender).await;
    }

    /// Route one text message received on `connection_id`
    pub async fn handle_message(&self, connection_id: Uuid, text: &str) {
        let envelope = match SignallingEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping invalid signalling message: {}", e);
                return;
            }
        };

        self.connections.bind_peer(connection_id, &envelope.src).await;

        match (&envelope.dest, envelope.command.as_str()) {
            (Some(dest), command) => {
                if !self.connections.send_to_peer(dest, text).await {
                    tracing::debug!(
                        "No socket for {}, dropping {} from {}",
                        dest,
                        command,
                        envelope.src
                    );
                }
            }
            (None, JOIN_NETWORK) => match envelope.role {
                Some(role) => self.join(connection_id, &envelope.src, role, text).await,
                None => tracing::warn!("joinNetwork from {} without a role", envelope.src),
            },
            (None, LEAVE_NETWORK) => {
                self.directory.leave(&envelope.src).await;
                self.connections.unbind_peer(&envelope.src).await;
                self.connections
                    .broadcast_except(Some(connection_id), text)
                    .await;
            }
            (None, command) => {
                tracing::debug!("Dropping broadcast {} from {}", command, envelope.src);
            }
        }
    }

    async fn join(&self, connection_id: Uuid, src: &PeerId, role: Role, text: &str) {
        self.directory.join(src.clone(), role).await;

        for peer in self.directory.peers_with_role(role.opposite()).await {
            if &peer != src {
                self.connections.send_to_peer(&peer, text).await;
            }
        }

        let (providers, consumers) = self.directory.snapshot().await;
        let reply = SignallingMessage::discover(src.clone(), providers, consumers);
        match reply.to_json() {
            Ok(json) => {
                self.connections.send_to_connection(connection_id, &json).await;
            }
            Err(e) => tracing::error!("Failed to serialize discoverPeers: {}", e),
        }
    }

    /// Forget a closed socket and announce its peers as gone
    pub async fn disconnect(&self, connection_id: Uuid) {
        for peer in self.connections.remove_connection(connection_id).await {
            self.directory.leave(&peer).await;
            match SignallingMessage::leave(peer.clone(), None).to_json() {
                Ok(json) => self.connections.broadcast_except(None, &json).await,
                Err(e) => tracing::error!("Failed to serialize leaveNetwork: {}", e),
            }
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();
    let relay = state.signalling.clone();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    relay.connect(connection_id, tx).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => relay.handle_message(connection_id, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                tracing::warn!("Ignoring binary message on signalling connection {}", connection_id);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error on signalling connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    relay.disconnect(connection_id).await;
    send_task.abort();
}
