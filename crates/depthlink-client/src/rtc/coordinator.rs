use bytes::Bytes;
use depthlink_protocol::{
    Command, IceCandidate, PeerId, Role, SdpType, SessionDescription, SignallingMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{ChannelState, LinkContext, LinkFactory, MicrophoneSource, PeerLink, RtcError, VoiceTrack};
use crate::config::ClientConfig;
use crate::events::{EventBus, NoticeKind, ViewerEvent};

enum Announce {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    /// Candidates received before the remote description was set
    pending: Vec<IceCandidate>,
}

impl PeerEntry {
    fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            link,
            pending: Vec::new(),
        }
    }
}

/// Runs the join protocol and owns one connection per remote peer.
///
/// Signalling messages must be fed in receipt order, one at a time; [`run`]
/// does that for a signalling receiver.
///
/// [`run`]: Coordinator::run
pub struct Coordinator {
    local: PeerId,
    role: Role,
    join_interval: Duration,
    signalling: mpsc::UnboundedSender<SignallingMessage>,
    factory: Arc<dyn LinkFactory>,
    microphone: Arc<dyn MicrophoneSource>,
    events: EventBus,
    voice: OnceCell<Option<VoiceTrack>>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    roles: Mutex<HashMap<PeerId, Role>>,
    announce: std::sync::Mutex<Announce>,
}

impl Coordinator {
    pub fn new(
        config: &ClientConfig,
        signalling: mpsc::UnboundedSender<SignallingMessage>,
        factory: Arc<dyn LinkFactory>,
        microphone: Arc<dyn MicrophoneSource>,
        events: EventBus,
    ) -> Self {
        Self {
            local: config.peer_id.clone(),
            role: config.role,
            join_interval: config.join_interval,
            signalling,
            factory,
            microphone,
            events,
            voice: OnceCell::new(),
            peers: Mutex::new(HashMap::new()),
            roles: Mutex::new(HashMap::new()),
            announce: std::sync::Mutex::new(Announce::Idle),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.local
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Announce on the network and process signalling until the relay goes away
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<SignallingMessage>) {
        self.start_announcing();
        while let Some(msg) = incoming.recv().await {
            self.on_signalling_message(msg).await;
        }
        self.stop_announcing();
        tracing::info!("Signalling stream ended");
    }

    /// Broadcast `joinNetwork` now and on every join interval until discovered
    pub fn start_announcing(&self) {
        let mut announce = self.announce.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*announce, Announce::Idle) {
            return;
        }

        let join = SignallingMessage::join(self.local.clone(), self.role);
        let signalling = self.signalling.clone();
        let every = self.join_interval;
        tracing::info!("Joining network as {} {}", self.role, self.local);

        *announce = Announce::Running(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if signalling.send(join.clone()).is_err() {
                    break;
                }
            }
        }));
    }

    /// Cancel announcing for good; true only for the call that stopped it
    pub fn stop_announcing(&self) -> bool {
        let mut announce = self.announce.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *announce, Announce::Stopped) {
            Announce::Running(task) => {
                task.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_announcing(&self) -> bool {
        matches!(
            *self.announce.lock().unwrap_or_else(PoisonError::into_inner),
            Announce::Running(_)
        )
    }

    pub async fn on_signalling_message(&self, msg: SignallingMessage) {
        if msg.src == self.local {
            return;
        }
        if let Some(dest) = &msg.dest {
            if dest != &self.local {
                tracing::debug!(
                    "Discarding {} from {} addressed to {}",
                    msg.command.name(),
                    msg.src,
                    dest
                );
                return;
            }
        }

        let src = msg.src;
        let broadcast = msg.dest.is_none();
        match msg.command {
            Command::JoinNetwork { role } if broadcast => self.on_join(src, role).await,
            Command::DiscoverPeers {
                providers,
                consumers,
            } if !broadcast => self.on_discover(providers, consumers).await,
            Command::NewDescription { description } if !broadcast => {
                self.on_description(src, description).await
            }
            Command::NewIceCandidate { candidate } if !broadcast => {
                self.on_ice_candidate(src, candidate).await
            }
            Command::LeaveNetwork => {
                tracing::info!("{} left the network", src);
                self.teardown(&src).await;
            }
            command => {
                tracing::debug!("Ignoring {} from {}", command.name(), src);
            }
        }
    }

    async fn on_join(&self, src: PeerId, role: Role) {
        self.roles.lock().await.insert(src.clone(), role);
        if role == self.role.opposite() {
            tracing::info!("{} {} joined", role, src);
            if let Err(e) = self.init_connection(&src).await {
                self.report(&src, e);
            }
        }
    }

    async fn on_discover(&self, providers: Vec<PeerId>, consumers: Vec<PeerId>) {
        if self.stop_announcing() {
            tracing::info!(
                "Discovered {} providers and {} consumers",
                providers.len(),
                consumers.len()
            );
        }

        {
            let mut roles = self.roles.lock().await;
            for peer in &providers {
                roles.insert(peer.clone(), Role::Provider);
            }
            for peer in &consumers {
                roles.insert(peer.clone(), Role::Consumer);
            }
        }

        // Providers wait for consumers to reach out
        if self.role == Role::Provider {
            return;
        }

        for peer in providers.into_iter().chain(consumers) {
            if peer == self.local {
                continue;
            }
            if let Err(e) = self.init_connection(&peer).await {
                self.report(&peer, e);
            }
        }
    }

    /// Offer a connection to `peer` unless a live or remotely initiated one exists
    pub async fn init_connection(&self, peer: &PeerId) -> Result<(), RtcError> {
        if peer == &self.local {
            return Ok(());
        }
        let voice = self.voice_track().await;

        let link = {
            let mut peers = self.peers.lock().await;
            if let Some(entry) = peers.get(peer) {
                if matches!(
                    entry.link.channel_state(),
                    ChannelState::Connecting | ChannelState::Open
                ) {
                    tracing::debug!("Connection to {} already in progress", peer);
                    return Ok(());
                }
                if !entry.link.offered() {
                    tracing::debug!("Connection to {} was initiated remotely", peer);
                    return Ok(());
                }
            }

            let link = self.factory.create(self.context(peer, voice), true).await?;
            if let Some(stale) = peers.insert(peer.clone(), PeerEntry::new(link.clone())) {
                stale.link.close().await;
            }
            link
        };

        let offer = link.create_offer().await?;
        self.send(SignallingMessage::description(
            self.local.clone(),
            peer.clone(),
            offer,
        ));
        tracing::info!("Sent offer to {}", peer);
        Ok(())
    }

    async fn on_description(&self, src: PeerId, description: SessionDescription) {
        let existing = self.link(&src).await;

        let result = match existing {
            Some(link) if link.offered() => {
                if description.sdp_type == SdpType::Offer {
                    if !self.is_polite(&src).await {
                        tracing::debug!("Ignoring colliding offer from {}", src);
                        return;
                    }
                    tracing::debug!("Offer collision with {}, answering instead", src);
                    self.drop_link(&src).await;
                    self.answer(&src, description).await
                } else {
                    match link.accept_answer(description).await {
                        Ok(()) => {
                            self.flush_candidates(&src, &link).await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
            }
            _ => self.answer(&src, description).await,
        };

        if let Err(e) = result {
            self.report(&src, e);
        }
    }

    async fn answer(&self, src: &PeerId, offer: SessionDescription) -> Result<(), RtcError> {
        let link = self.answering_link(src).await?;
        let answer = link.accept_offer(offer).await?;
        self.flush_candidates(src, &link).await;
        self.send(SignallingMessage::description(
            self.local.clone(),
            src.clone(),
            answer,
        ));
        tracing::info!("Sent answer to {}", src);
        Ok(())
    }

    async fn on_ice_candidate(&self, src: PeerId, candidate: IceCandidate) {
        let link = match self.link(&src).await {
            Some(link) => link,
            None => match self.answering_link(&src).await {
                Ok(link) => link,
                Err(e) => return self.report(&src, e),
            },
        };

        if !link.has_remote_description().await {
            if let Some(entry) = self.peers.lock().await.get_mut(&src) {
                entry.pending.push(candidate);
            }
            return;
        }

        if let Err(e) = link.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate from {}: {}", src, e);
        }
    }

    async fn flush_candidates(&self, src: &PeerId, link: &Arc<dyn PeerLink>) {
        let pending = match self.peers.lock().await.get_mut(src) {
            Some(entry) if Arc::ptr_eq(&entry.link, link) => std::mem::take(&mut entry.pending),
            _ => return,
        };
        for candidate in pending {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add queued ICE candidate from {}: {}", src, e);
            }
        }
    }

    /// Existing remotely initiated link, or a fresh one
    async fn answering_link(&self, src: &PeerId) -> Result<Arc<dyn PeerLink>, RtcError> {
        if let Some(link) = self.link(src).await {
            if !link.offered() {
                return Ok(link);
            }
        }
        let voice = self.voice_track().await;

        let mut peers = self.peers.lock().await;
        let link = self.factory.create(self.context(src, voice), false).await?;
        if let Some(stale) = peers.insert(src.clone(), PeerEntry::new(link.clone())) {
            stale.link.close().await;
        }
        Ok(link)
    }

    /// Leave `peer` and release its connection
    pub async fn disconnect(&self, peer: &PeerId) {
        self.send(SignallingMessage::leave(
            self.local.clone(),
            Some(peer.clone()),
        ));
        self.teardown(peer).await;
    }

    /// Leave every connected peer
    pub async fn disconnect_all(&self) {
        for peer in self.peers().await {
            self.disconnect(&peer).await;
        }
    }

    async fn teardown(&self, peer: &PeerId) {
        if self.drop_link(peer).await {
            self.events.emit(ViewerEvent::PeerDisconnected(peer.clone()));
        }
    }

    async fn drop_link(&self, peer: &PeerId) -> bool {
        let entry = self.peers.lock().await.remove(peer);
        match entry {
            Some(entry) => {
                entry.link.close().await;
                true
            }
            None => false,
        }
    }

    /// Write a frame to every open data channel
    pub async fn send_frame(&self, payload: Bytes) -> usize {
        let links: Vec<(PeerId, Arc<dyn PeerLink>)> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(peer, entry)| (peer.clone(), entry.link.clone()))
            .collect();

        let mut sent = 0;
        for (peer, link) in links {
            match link.send(&payload).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => tracing::debug!("Frame not sent to {}: {}", peer, e),
            }
        }
        sent
    }

    pub fn mute(&self) {
        if let Some(Some(voice)) = self.voice.get() {
            voice.set_muted(true);
        }
    }

    pub fn unmute(&self) {
        match self.voice.get() {
            Some(Some(voice)) => voice.set_muted(false),
            _ => tracing::debug!("No microphone to unmute"),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.voice
            .get()
            .and_then(Option::as_ref)
            .is_none_or(VoiceTrack::is_muted)
    }

    /// Peers with a connection, sorted
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn link(&self, peer: &PeerId) -> Option<Arc<dyn PeerLink>> {
        self.peers.lock().await.get(peer).map(|e| e.link.clone())
    }

    /// Consumers yield to providers; otherwise the smaller id yields
    async fn is_polite(&self, remote: &PeerId) -> bool {
        let remote_role = self.roles.lock().await.get(remote).copied();
        match (self.role, remote_role) {
            (Role::Consumer, Some(Role::Provider)) => true,
            (Role::Provider, Some(Role::Consumer)) => false,
            _ => self.local < *remote,
        }
    }

    /// Wait for the microphone on first use; failure is reported once
    async fn voice_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.voice
            .get_or_init(|| async {
                match VoiceTrack::start(self.microphone.as_ref()).await {
                    Ok(voice) => Some(voice),
                    Err(e) => {
                        tracing::warn!("Continuing video-only: {}", e);
                        self.events.notice(
                            NoticeKind::NoMicrophonePermission,
                            "Microphone unavailable, others will not hear you",
                        );
                        None
                    }
                }
            })
            .await
            .as_ref()
            .map(VoiceTrack::track)
    }

    fn context(&self, remote: &PeerId, voice: Option<Arc<TrackLocalStaticSample>>) -> LinkContext {
        LinkContext {
            local: self.local.clone(),
            remote: remote.clone(),
            signalling: self.signalling.clone(),
            events: self.events.clone(),
            voice,
        }
    }

    fn send(&self, msg: SignallingMessage) {
        if self.signalling.send(msg).is_err() {
            tracing::warn!("Signalling connection is gone, message dropped");
        }
    }

    fn report(&self, peer: &PeerId, error: RtcError) {
        if error.is_benign() {
            tracing::debug!("Ignoring stale negotiation with {}: {}", peer, error);
            return;
        }
        tracing::warn!("WebRTC issue with {}: {}", peer, error);
        self.events.notice(
            NoticeKind::WebRtcIssue,
            format!("Connection problem with {}: {}", peer, error),
        );
    }
}
