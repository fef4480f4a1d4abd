use async_trait::async_trait;
use bytes::Bytes;
use depthlink_media::demultiplex;
use depthlink_protocol::{IceCandidate, PeerId, SdpType, SessionDescription, SignallingMessage};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::RtcError;
use crate::events::{EventBus, NoticeKind, RemoteTrack, ViewerEvent};

/// Label of the data channel every connection opens
pub const DATA_CHANNEL_LABEL: &str = "sendChannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl From<RTCDataChannelState> for ChannelState {
    fn from(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Connecting => ChannelState::Connecting,
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            RTCDataChannelState::Unspecified => ChannelState::New,
        }
    }
}

/// One negotiated connection to a remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// True when this side sent the initial offer
    fn offered(&self) -> bool;

    /// State of the locally created data channel
    fn channel_state(&self) -> ChannelState;

    async fn has_remote_description(&self) -> bool;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Apply a remote offer and return the installed answer
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, RtcError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Write to every open data channel; false when none is open
    async fn send(&self, payload: &Bytes) -> Result<bool, RtcError>;

    async fn close(&self);
}

/// Everything a new connection needs to report back
#[derive(Clone)]
pub struct LinkContext {
    pub local: PeerId,
    pub remote: PeerId,
    pub signalling: mpsc::UnboundedSender<SignallingMessage>,
    pub events: EventBus,
    pub voice: Option<Arc<TrackLocalStaticSample>>,
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self, ctx: LinkContext, offered: bool) -> Result<Arc<dyn PeerLink>, RtcError>;
}

/// Builds webrtc-rs peer connections
pub struct RtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcLinkFactory {
    pub fn new(stun_servers: &[String]) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create(&self, ctx: LinkContext, offered: bool) -> Result<Arc<dyn PeerLink>, RtcError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        // Providers send video; this side only receives it
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        if let Some(voice) = &ctx.voice {
            let sender = pc
                .add_track(Arc::clone(voice) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be read for interceptors to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;

        let link = Arc::new(RtcLink {
            pc: pc.clone(),
            offered,
            remote: ctx.remote.clone(),
            channels: Mutex::new(Vec::new()),
        });
        link.watch_channel(channel, &ctx);

        // Channels announced by the remote side are read too
        let weak: Weak<RtcLink> = Arc::downgrade(&link);
        let channel_ctx = ctx.clone();
        pc.on_data_channel(Box::new(move |channel| {
            let weak = weak.clone();
            let ctx = channel_ctx.clone();
            Box::pin(async move {
                tracing::debug!("{} opened data channel '{}'", ctx.remote, channel.label());
                if let Some(link) = weak.upgrade() {
                    link.watch_channel(channel, &ctx);
                }
            })
        }));

        let ice_ctx = ctx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let ctx = ice_ctx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let msg = SignallingMessage::ice_candidate(
                            ctx.local.clone(),
                            ctx.remote.clone(),
                            candidate,
                        );
                        if ctx.signalling.send(msg).is_err() {
                            tracing::debug!(
                                "Signalling closed, dropping ICE candidate for {}",
                                ctx.remote
                            );
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let track_ctx = ctx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let ctx = track_ctx.clone();
            Box::pin(async move {
                tracing::info!(
                    "Track {} ({:?}) from {}",
                    track.id(),
                    track.kind(),
                    ctx.remote
                );
                ctx.events.emit(ViewerEvent::Track {
                    peer: ctx.remote.clone(),
                    track: RemoteTrack(track),
                });
            })
        }));

        let state_ctx = ctx;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let ctx = state_ctx.clone();
            Box::pin(async move {
                tracing::debug!("Connection to {} is {}", ctx.remote, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        ctx.events.emit(ViewerEvent::PeerConnected(ctx.remote.clone()));
                    }
                    RTCPeerConnectionState::Failed => {
                        tracing::warn!("Connection to {} failed", ctx.remote);
                        ctx.events.notice(
                            NoticeKind::WebRtcIssue,
                            format!("Connection to {} failed", ctx.remote),
                        );
                    }
                    _ => {}
                }
            })
        }));

        Ok(link)
    }
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    offered: bool,
    remote: PeerId,
    /// Local channel first, then any announced by the remote side
    channels: Mutex<Vec<Arc<RTCDataChannel>>>,
}

impl RtcLink {
    fn channels(&self) -> Vec<Arc<RTCDataChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn watch_channel(&self, channel: Arc<RTCDataChannel>, ctx: &LinkContext) {
        let peer = ctx.remote.clone();
        let events = ctx.events.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                match demultiplex(msg.data) {
                    Ok(Some(frame)) => {
                        for event in ViewerEvent::from_frame(&peer, frame) {
                            events.emit(event);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Dropping frame from {}: {}", peer, e),
                }
            })
        }));

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }
}

fn remote_description(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    match description.sdp_type {
        SdpType::Offer => Ok(RTCSessionDescription::offer(description.sdp)?),
        SdpType::Answer => Ok(RTCSessionDescription::answer(description.sdp)?),
        other => Err(RtcError::Negotiation(format!(
            "unsupported description type {:?}",
            other
        ))),
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    fn offered(&self) -> bool {
        self.offered
    }

    fn channel_state(&self) -> ChannelState {
        self.channels()
            .first()
            .map(|c| c.ready_state().into())
            .unwrap_or(ChannelState::New)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        tracing::debug!("Created offer for {}", self.remote);
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: offer.sdp,
        })
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, RtcError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(RtcError::Negotiation(format!(
                "expected an offer from {}, got {:?}",
                self.remote, offer.sdp_type
            )));
        }
        self.pc.set_remote_description(remote_description(offer)?).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        tracing::debug!("Answered offer from {}", self.remote);
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: answer.sdp,
        })
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), RtcError> {
        if self.pc.signaling_state() == RTCSignalingState::Stable {
            return Err(RtcError::StaleDescription);
        }
        self.pc.set_remote_description(remote_description(answer)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn send(&self, payload: &Bytes) -> Result<bool, RtcError> {
        let mut sent = false;
        for channel in self.channels() {
            if channel.ready_state() == RTCDataChannelState::Open {
                channel.send(payload).await?;
                sent = true;
            }
        }
        Ok(sent)
    }

    async fn close(&self) {
        for channel in self.channels() {
            let _ = channel.close().await;
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Error closing connection to {}: {}", self.remote, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(voice: Option<Arc<TrackLocalStaticSample>>) -> (LinkContext, mpsc::UnboundedReceiver<SignallingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = LinkContext {
            local: PeerId::from("c1"),
            remote: PeerId::from("p1"),
            signalling: tx,
            events: EventBus::default(),
            voice,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_offer_carries_recvonly_video_and_data_channel() {
        let factory = RtcLinkFactory::new(&[]).unwrap();
        let (ctx, _rx) = context(None);

        let link = factory.create(ctx, true).await.unwrap();
        assert!(link.offered());
        assert_eq!(link.channel_state(), ChannelState::Connecting);
        assert!(!link.has_remote_description().await);

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        assert!(offer.sdp.contains("m=application"));

        link.close().await;
    }

    #[tokio::test]
    async fn test_two_links_negotiate() {
        let factory = RtcLinkFactory::new(&[]).unwrap();
        let (offer_ctx, _offer_rx) = context(None);
        let (answer_ctx, _answer_rx) = context(None);

        let offerer = factory.create(offer_ctx, true).await.unwrap();
        let answerer = factory.create(answer_ctx, false).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.accept_offer(offer).await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answerer.has_remote_description().await);

        offerer.accept_answer(answer.clone()).await.unwrap();
        assert!(offerer.has_remote_description().await);

        // A repeated answer finds the connection already stable
        assert!(matches!(
            offerer.accept_answer(answer).await,
            Err(RtcError::StaleDescription)
        ));

        offerer.close().await;
        answerer.close().await;
    }

    #[tokio::test]
    async fn test_nothing_sent_before_channel_opens() {
        let factory = RtcLinkFactory::new(&[]).unwrap();
        let (ctx, _rx) = context(None);
        let link = factory.create(ctx, true).await.unwrap();
        assert!(!link.send(&Bytes::from_static(b"frame")).await.unwrap());
        link.close().await;
    }
}
