//! Server-side frame fan-out
//!
//! Providers push frames on `/colorProvider`, `/depthProvider` and
//! `/matrixProvider`; consumers registered on `/color`, `/depth` and `/matrix`
//! receive `[peer byte][payload]`. A consumer whose socket has too many bytes
//! in flight skips frames until it catches up.

use crate::recording::RecorderHandle;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use depthlink_media::{pose_to_bytes, relative_pose};
use depthlink_protocol::{with_peer_prefix, Matrices};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPool {
    Color,
    Depth,
    Matrix,
}

impl StreamPool {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamPool::Color => "color",
            StreamPool::Depth => "depth",
            StreamPool::Matrix => "matrix",
        }
    }
}

struct PoolMember {
    sender: mpsc::UnboundedSender<Bytes>,
    /// Bytes queued for this socket but not yet written
    in_flight: Arc<AtomicUsize>,
}

/// Handle given to an egress socket to drain its queue
pub struct PoolSubscription {
    pub id: Uuid,
    pub frames: mpsc::UnboundedReceiver<Bytes>,
    pub in_flight: Arc<AtomicUsize>,
}

pub struct StreamRouter {
    pools: RwLock<HashMap<StreamPool, HashMap<Uuid, PoolMember>>>,
    backpressure_bytes: usize,
    recorder: Option<RecorderHandle>,
}

impl StreamRouter {
    pub fn new(backpressure_bytes: usize, recorder: Option<RecorderHandle>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            backpressure_bytes,
            recorder,
        }
    }

    pub async fn subscribe(&self, pool: StreamPool) -> PoolSubscription {
        let (sender, frames) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();

        self.pools.write().await.entry(pool).or_default().insert(
            id,
            PoolMember {
                sender,
                in_flight: in_flight.clone(),
            },
        );
        tracing::debug!("Consumer {} joined {} pool", id, pool.as_str());

        PoolSubscription {
            id,
            frames,
            in_flight,
        }
    }

    pub async fn unsubscribe(&self, pool: StreamPool, id: Uuid) {
        if let Some(members) = self.pools.write().await.get_mut(&pool) {
            members.remove(&id);
        }
    }

    pub async fn member_count(&self, pool: StreamPool) -> usize {
        self.pools
            .read()
            .await
            .get(&pool)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Prefix `payload` with `peer` and queue it for every member that is
    /// not over the backpressure threshold. Returns the number of recipients.
    pub async fn broadcast(&self, pool: StreamPool, peer: u8, payload: &[u8]) -> usize {
        let frame = with_peer_prefix(peer, payload);
        let mut closed = Vec::new();
        let mut delivered = 0;

        {
            let pools = self.pools.read().await;
            let Some(members) = pools.get(&pool) else {
                return 0;
            };
            for (id, member) in members {
                if member.in_flight.load(Ordering::Acquire) > self.backpressure_bytes {
                    continue;
                }
                member.in_flight.fetch_add(frame.len(), Ordering::AcqRel);
                if member.sender.send(frame.clone()).is_err() {
                    closed.push(*id);
                } else {
                    delivered += 1;
                }
            }
        }

        if !closed.is_empty() {
            let mut pools = self.pools.write().await;
            if let Some(members) = pools.get_mut(&pool) {
                for id in closed {
                    members.remove(&id);
                }
            }
        }

        delivered
    }

    /// Provider ingress: fan out and feed the recorder
    pub async fn ingest(&self, pool: StreamPool, peer: u8, device_id: &str, payload: Bytes) {
        match pool {
            StreamPool::Color | StreamPool::Depth => {
                self.broadcast(pool, peer, &payload).await;
                if let Some(recorder) = &self.recorder {
                    if pool == StreamPool::Color {
                        recorder.on_frame(device_id, Some(payload), None, None);
                    } else {
                        recorder.on_frame(device_id, None, Some(payload), None);
                    }
                }
            }
            StreamPool::Matrix => {
                let matrices = match Matrices::from_json(&payload) {
                    Ok(matrices) => matrices,
                    Err(e) => {
                        tracing::warn!("Dropping invalid matrices from peer {}: {}", peer, e);
                        return;
                    }
                };
                let Some(pose) = relative_pose(&matrices) else {
                    tracing::warn!("Dropping matrices with singular groundplane from peer {}", peer);
                    return;
                };
                self.broadcast(pool, peer, &pose_to_bytes(&pose)).await;
                if let Some(recorder) = &self.recorder {
                    recorder.on_frame(device_id, None, None, Some(pose));
                }
            }
        }
    }
}

/// Last IPv4 octet, or last byte of an IPv6 address
pub fn peer_byte(addr: &SocketAddr) -> u8 {
    match addr.ip() {
        IpAddr::V4(ip) => ip.octets()[3],
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.octets()[3],
            None => ip.octets()[15],
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct ProviderParams {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

pub async fn color_provider(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ProviderParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| provider_socket(socket, state, StreamPool::Color, addr, params))
}

pub async fn depth_provider(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ProviderParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| provider_socket(socket, state, StreamPool::Depth, addr, params))
}

pub async fn matrix_provider(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ProviderParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| provider_socket(socket, state, StreamPool::Matrix, addr, params))
}

pub async fn color_consumer(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| consumer_socket(socket, state, StreamPool::Color))
}

pub async fn depth_consumer(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| consumer_socket(socket, state, StreamPool::Depth))
}

pub async fn matrix_consumer(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| consumer_socket(socket, state, StreamPool::Matrix))
}

async fn provider_socket(
    mut socket: WebSocket,
    state: AppState,
    pool: StreamPool,
    addr: SocketAddr,
    params: ProviderParams,
) {
    let peer = peer_byte(&addr);
    let device_id = params.device_id.unwrap_or_else(|| peer.to_string());
    tracing::info!(
        "Provider {} ({}) streaming {}",
        device_id,
        addr,
        pool.as_str()
    );

    while let Some(msg) = socket.recv().await {
        let payload = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error from provider {}: {}", device_id, e);
                break;
            }
            _ => continue,
        };
        state.streams.ingest(pool, peer, &device_id, payload).await;
    }

    tracing::info!("Provider {} stopped streaming {}", device_id, pool.as_str());
}

async fn consumer_socket(socket: WebSocket, state: AppState, pool: StreamPool) {
    let (mut sender, mut receiver) = socket.split();
    let PoolSubscription {
        id,
        mut frames,
        in_flight,
    } = state.streams.subscribe(pool).await;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let len = frame.len();
            let result = sender.send(Message::Binary(frame)).await;
            in_flight.fetch_sub(len, Ordering::AcqRel);
            if result.is_err() {
                break;
            }
        }
    });

    // Egress sockets only listen; reading detects the close
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.streams.unsubscribe(pool, id).await;
    send_task.abort();
    tracing::debug!("Consumer {} left {} pool", id, pool.as_str());
}
