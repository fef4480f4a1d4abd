use anyhow::Result;
use depthlink_client::events::ViewerEvent;
use depthlink_client::network::{frames, SignallingClient};
use depthlink_client::rtc::{MicrophoneSource, NoMicrophone, PcmFileMicrophone, RtcLinkFactory};
use depthlink_client::{ClientConfig, Coordinator, EventBus};
use depthlink_protocol::FrameKind;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depthlink_client=debug,depthlink_viewer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::load()?;
    tracing::info!(
        "Starting Depthlink viewer as {} {}",
        config.role,
        config.peer_id
    );

    let (signalling, incoming) = SignallingClient::connect(&config.signalling_url).await?;

    let microphone: Arc<dyn MicrophoneSource> = match &config.microphone_pcm {
        Some(path) => Arc::new(PcmFileMicrophone::new(path)),
        None => Arc::new(NoMicrophone),
    };
    let factory = Arc::new(RtcLinkFactory::new(&config.stun_servers)?);
    let events = EventBus::default();
    let mut rx = events.subscribe();

    if let Some(stream_url) = &config.stream_url {
        for kind in [FrameKind::Color, FrameKind::Depth, FrameKind::Matrices] {
            let mut pool = frames::subscribe(stream_url, kind).await?;
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(frame) = pool.recv().await {
                    for event in ViewerEvent::from_routed(frame) {
                        events.emit(event);
                    }
                }
            });
        }
    }

    let coordinator = Arc::new(Coordinator::new(
        &config,
        signalling.sender(),
        factory,
        microphone,
        events,
    ));
    let mut run = tokio::spawn(coordinator.clone().run(incoming));

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Viewer fell behind, skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
            _ = &mut run => {
                tracing::info!("Signalling connection closed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                coordinator.disconnect_all().await;
                break;
            }
        }
    }

    Ok(())
}

fn log_event(event: &ViewerEvent) {
    match event {
        ViewerEvent::PeerConnected(peer) => tracing::info!("Connected to {}", peer),
        ViewerEvent::PeerDisconnected(peer) => tracing::info!("Disconnected from {}", peer),
        ViewerEvent::Track { peer, track } => tracing::info!("{} sent {:?}", peer, track),
        ViewerEvent::Color { peer, jpeg } => {
            tracing::debug!("Color frame from {}: {} bytes", peer, jpeg.len())
        }
        ViewerEvent::Depth { peer, depth } => {
            tracing::debug!("Depth frame from {}: {}x{}", peer, depth.width, depth.height)
        }
        ViewerEvent::Pose { peer, pose } => {
            tracing::debug!(
                "Pose from {}: translation ({:.3}, {:.3}, {:.3})",
                peer,
                pose[3],
                pose[7],
                pose[11]
            )
        }
        ViewerEvent::Notice(notice) => {
            tracing::warn!("{:?}: {} ({:?})", notice.kind, notice.message, notice.duration)
        }
    }
}
