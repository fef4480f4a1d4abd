use serde::{Deserialize, Serialize};

use crate::types::{PeerId, Role};
use crate::ProtocolError;

/// Peer id the server uses as `src` for messages it originates
pub const SERVER_PEER_ID: &str = "server";

/// Control message exchanged over the `/signalling` socket.
///
/// Messages without `dest` are broadcasts (registration); addressed messages
/// must only be processed by the peer whose id equals `dest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignallingMessage {
    pub src: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<PeerId>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    /// Announce presence on the network
    JoinNetwork { role: Role },

    /// Directory acknowledgement listing every known peer
    DiscoverPeers {
        #[serde(default)]
        providers: Vec<PeerId>,
        #[serde(default)]
        consumers: Vec<PeerId>,
    },

    /// SDP offer or answer
    NewDescription { description: SessionDescription },

    /// Trickled ICE candidate
    NewIceCandidate { candidate: IceCandidate },

    /// Peer is going away
    LeaveNetwork,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinNetwork { .. } => "joinNetwork",
            Command::DiscoverPeers { .. } => "discoverPeers",
            Command::NewDescription { .. } => "newDescription",
            Command::NewIceCandidate { .. } => "newIceCandidate",
            Command::LeaveNetwork => "leaveNetwork",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser JSON shape `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// ICE candidate in the browser `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl SignallingMessage {
    pub fn join(src: PeerId, role: Role) -> Self {
        Self {
            src,
            dest: None,
            command: Command::JoinNetwork { role },
        }
    }

    pub fn discover(dest: PeerId, providers: Vec<PeerId>, consumers: Vec<PeerId>) -> Self {
        Self {
            src: PeerId::from(SERVER_PEER_ID),
            dest: Some(dest),
            command: Command::DiscoverPeers {
                providers,
                consumers,
            },
        }
    }

    pub fn description(src: PeerId, dest: PeerId, description: SessionDescription) -> Self {
        Self {
            src,
            dest: Some(dest),
            command: Command::NewDescription { description },
        }
    }

    pub fn ice_candidate(src: PeerId, dest: PeerId, candidate: IceCandidate) -> Self {
        Self {
            src,
            dest: Some(dest),
            command: Command::NewIceCandidate { candidate },
        }
    }

    pub fn leave(src: PeerId, dest: Option<PeerId>) -> Self {
        Self {
            src,
            dest,
            command: Command::LeaveNetwork,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest.is_none()
    }

    /// True when the message names `peer` as its destination
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.dest.as_ref() == Some(peer)
    }
}

/// Routing view of a signalling message.
///
/// The relay forwards messages verbatim, so it only decodes the fields needed
/// to pick destinations and leaves the payload untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct SignallingEnvelope {
    pub src: PeerId,
    #[serde(default)]
    pub dest: Option<PeerId>,
    pub command: String,
    #[serde(default)]
    pub role: Option<Role>,
}

impl SignallingEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_network_wire_format() {
        let msg = SignallingMessage::join(PeerId::from("c1"), Role::Consumer);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"src": "c1", "command": "joinNetwork", "role": "consumer"})
        );
    }

    #[test]
    fn test_parse_browser_description() {
        let text = json!({
            "src": "p1",
            "dest": "c1",
            "command": "newDescription",
            "description": {"type": "offer", "sdp": "v=0\r\n"},
        })
        .to_string();

        let msg = SignallingMessage::parse(&text).unwrap();
        assert!(msg.is_addressed_to(&PeerId::from("c1")));
        assert!(!msg.is_addressed_to(&PeerId::from("c2")));
        match msg.command {
            Command::NewDescription { description } => {
                assert_eq!(description.sdp_type, SdpType::Offer);
                assert_eq!(description.sdp, "v=0\r\n");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_browser_candidate() {
        let text = json!({
            "src": "p1",
            "dest": "c1",
            "command": "newIceCandidate",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            },
        })
        .to_string();

        let msg = SignallingMessage::parse(&text).unwrap();
        let Command::NewIceCandidate { candidate } = msg.command else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_leave_network_has_no_payload() {
        let msg = SignallingMessage::leave(PeerId::from("c1"), Some(PeerId::from("p1")));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"src": "c1", "dest": "p1", "command": "leaveNetwork"}));
        assert_eq!(SignallingMessage::parse(&value.to_string()).unwrap(), msg);
    }

    #[test]
    fn test_discover_peers_defaults_missing_lists() {
        let text = r#"{"src":"server","dest":"c1","command":"discoverPeers","providers":["p1"]}"#;
        let msg = SignallingMessage::parse(text).unwrap();
        assert_eq!(
            msg.command,
            Command::DiscoverPeers {
                providers: vec![PeerId::from("p1")],
                consumers: vec![],
            }
        );
    }

    #[test]
    fn test_unknown_command_is_rejected_but_envelope_parses() {
        let text = r#"{"src":"p1","dest":"c1","command":"customThing","x":1}"#;
        assert!(SignallingMessage::parse(text).is_err());

        let envelope = SignallingEnvelope::parse(text).unwrap();
        assert_eq!(envelope.command, "customThing");
        assert_eq!(envelope.dest, Some(PeerId::from("c1")));
        assert!(envelope.role.is_none());
    }
}
