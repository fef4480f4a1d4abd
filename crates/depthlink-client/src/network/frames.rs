use anyhow::Result;
use depthlink_protocol::{split_peer_prefix, Frame, FrameKind, PeerId};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Router egress path for a frame kind
pub fn egress_path(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::Color => "/color",
        FrameKind::Depth => "/depth",
        FrameKind::Matrices => "/matrix",
    }
}

/// Decode one egress message: `[peer byte][payload]`
pub fn parse_routed(kind: FrameKind, message: &[u8]) -> Result<Frame> {
    let (peer, payload) = split_peer_prefix(message)?;
    Ok(Frame::new(
        kind,
        PeerId::new(peer.to_string()),
        bytes::Bytes::copy_from_slice(payload),
    ))
}

/// Join the server's stream pool for `kind`.
///
/// `base_url` is the server's websocket origin, e.g. `ws://127.0.0.1:8080`.
pub async fn subscribe(base_url: &str, kind: FrameKind) -> Result<mpsc::UnboundedReceiver<Frame>> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), egress_path(kind));
    let (ws_stream, _) = connect_async(&url).await?;
    tracing::info!("Subscribed to {}", url);

    let (_write, mut read) = ws_stream.split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(result) = read.next().await {
            match result {
                Ok(Message::Binary(data)) => match parse_routed(kind, &data) {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping routed frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::error!("Stream pool WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        tracing::info!("Left {} pool", egress_path(kind));
    });

    Ok(rx)
}
