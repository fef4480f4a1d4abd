//! WebRTC side of the client: per-peer connections and the join protocol

mod audio;
mod connection;
mod coordinator;

pub use audio::{MicrophoneSource, NoMicrophone, PcmFileMicrophone, VoiceTrack};
pub use connection::{ChannelState, LinkContext, LinkFactory, PeerLink, RtcLinkFactory};
pub use coordinator::Coordinator;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtcError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// An answer arrived after the connection already settled
    #[error("Remote description arrived in stable signalling state")]
    StaleDescription,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Microphone unavailable: {0}")]
    Microphone(String),
}

impl RtcError {
    /// Races that resolve themselves and are not worth a notice
    pub fn is_benign(&self) -> bool {
        matches!(self, RtcError::StaleDescription)
    }
}
