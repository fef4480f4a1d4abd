use bytes::Bytes;
use depthlink_media::{demultiplex, pose_from_bytes, relative_pose, Demuxed, DepthImage, Mat4};
use depthlink_protocol::{Frame, FrameKind, Matrices, PeerId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    WebRtcIssue,
    NoMicrophonePermission,
}

impl NoticeKind {
    /// How long the notice stays on screen
    pub fn duration(self) -> Duration {
        match self {
            NoticeKind::WebRtcIssue => Duration::from_secs(5),
            NoticeKind::NoMicrophonePermission => Duration::from_secs(10),
        }
    }
}

/// User-facing message about a degraded connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub duration: Duration,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            duration: kind.duration(),
        }
    }
}

/// Inbound media track handed to the application
#[derive(Clone)]
pub struct RemoteTrack(pub Arc<TrackRemote>);

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.0.id())
            .field("kind", &self.0.kind())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum ViewerEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Track { peer: PeerId, track: RemoteTrack },
    /// JPEG color frame, undecoded
    Color { peer: PeerId, jpeg: Bytes },
    Depth { peer: PeerId, depth: Arc<DepthImage> },
    Pose { peer: PeerId, pose: Mat4 },
    Notice(Notice),
}

impl ViewerEvent {
    /// Events carried by one demultiplexed data channel payload
    pub fn from_frame(peer: &PeerId, frame: Demuxed) -> Vec<ViewerEvent> {
        let depth = |depth: DepthImage| ViewerEvent::Depth {
            peer: peer.clone(),
            depth: Arc::new(depth),
        };
        let pose = |matrices: Matrices| {
            let pose = relative_pose(&matrices);
            if pose.is_none() {
                tracing::warn!("Dropping pose from {}: groundplane is singular", peer);
            }
            pose.map(|pose| ViewerEvent::Pose {
                peer: peer.clone(),
                pose,
            })
        };

        match frame {
            Demuxed::Color(jpeg) => vec![ViewerEvent::Color {
                peer: peer.clone(),
                jpeg,
            }],
            Demuxed::DepthPng(image) => vec![depth(image)],
            Demuxed::Matrices(matrices) => pose(matrices).into_iter().collect(),
            Demuxed::Packed {
                depth: image,
                matrices,
            } => image
                .map(depth)
                .into_iter()
                .chain(matrices.and_then(pose))
                .collect(),
        }
    }

    /// Events carried by a frame from the server's stream pools.
    ///
    /// Matrix pool frames already hold the composed pose as 16 LE floats.
    pub fn from_routed(frame: Frame) -> Vec<ViewerEvent> {
        let peer = frame.provider_id;
        match frame.kind {
            FrameKind::Color => vec![ViewerEvent::Color {
                peer,
                jpeg: frame.payload,
            }],
            FrameKind::Depth => match demultiplex(frame.payload) {
                Ok(Some(demuxed)) => Self::from_frame(&peer, demuxed),
                Ok(None) => vec![],
                Err(e) => {
                    tracing::warn!("Dropping depth frame from {}: {}", peer, e);
                    vec![]
                }
            },
            FrameKind::Matrices => match pose_from_bytes(&frame.payload) {
                Some(pose) => vec![ViewerEvent::Pose { peer, pose }],
                None => {
                    tracing::warn!(
                        "Dropping pose from {}: {} bytes",
                        peer,
                        frame.payload.len()
                    );
                    vec![]
                }
            },
        }
    }
}

/// Fan-out of client events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ViewerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ViewerEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, kind: NoticeKind, message: impl Into<String>) {
        self.emit(ViewerEvent::Notice(Notice::new(kind, message)));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthlink_media::IDENTITY;

    fn matrices(groundplane: Mat4) -> Matrices {
        Matrices {
            camera: IDENTITY,
            groundplane,
        }
    }

    #[test]
    fn test_notice_durations() {
        let notice = Notice::new(NoticeKind::NoMicrophonePermission, "denied");
        assert_eq!(notice.duration, Duration::from_secs(10));
        assert_eq!(NoticeKind::WebRtcIssue.duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_packed_frame_yields_depth_and_pose() {
        let peer = PeerId::from("p1");
        let frame = Demuxed::Packed {
            depth: Some(DepthImage {
                width: 1,
                height: 1,
                data: vec![42],
            }),
            matrices: Some(matrices(IDENTITY)),
        };

        let events = ViewerEvent::from_frame(&peer, frame);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ViewerEvent::Depth { depth, .. } if depth.data == vec![42]));
        assert!(matches!(&events[1], ViewerEvent::Pose { peer: p, .. } if p == &peer));
    }

    #[test]
    fn test_singular_groundplane_drops_pose() {
        let peer = PeerId::from("p1");
        let frame = Demuxed::Packed {
            depth: None,
            matrices: Some(matrices([0.0; 16])),
        };
        assert!(ViewerEvent::from_frame(&peer, frame).is_empty());
    }

    #[test]
    fn test_routed_pose_frame() {
        let bytes = depthlink_media::pose_to_bytes(&IDENTITY);
        let frame = Frame::new(FrameKind::Matrices, PeerId::from("3"), Bytes::from(bytes));
        let events = ViewerEvent::from_routed(frame);
        assert!(matches!(&events[..], [ViewerEvent::Pose { pose, .. }] if *pose == IDENTITY));

        let short = Frame::new(FrameKind::Matrices, PeerId::from("3"), Bytes::from_static(&[0; 10]));
        assert!(ViewerEvent::from_routed(short).is_empty());
    }

    #[tokio::test]
    async fn test_bus_delivers_to_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.notice(NoticeKind::WebRtcIssue, "ice failed");

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                ViewerEvent::Notice(notice) => assert_eq!(notice.kind, NoticeKind::WebRtcIssue),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
