use anyhow::Result;
use depthlink_protocol::SignallingMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Connection to the `/signalling` relay.
///
/// Outbound messages are queued on an unbounded channel; inbound messages are
/// parsed and delivered in receipt order on the receiver returned by
/// [`SignallingClient::connect`].
pub struct SignallingClient {
    sender: mpsc::UnboundedSender<SignallingMessage>,
}

impl SignallingClient {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<SignallingMessage>)> {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("Connected to signalling relay at {}", url);

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<SignallingMessage>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SignallingMessage>();

        // Spawn task to handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match msg.to_json() {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize signalling message: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send signalling message");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Spawn task to handle incoming messages
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match SignallingMessage::parse(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping invalid signalling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signalling relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signalling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok((Self { sender: tx }, incoming_rx))
    }

    /// Handle for queueing outbound messages
    pub fn sender(&self) -> mpsc::UnboundedSender<SignallingMessage> {
        self.sender.clone()
    }
}
