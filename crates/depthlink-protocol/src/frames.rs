use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PeerId;
use crate::ProtocolError;

/// What a frame payload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    /// JPEG color image
    Color,
    /// PNG or packed RVL depth
    Depth,
    /// JSON camera/groundplane matrices
    Matrices,
}

/// A frame as received from a provider
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub provider_id: PeerId,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(kind: FrameKind, provider_id: PeerId, payload: Bytes) -> Self {
        Self {
            kind,
            provider_id,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Prefix a payload with the 1-byte peer id used on frame sockets
pub fn with_peer_prefix(peer: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(peer);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a frame socket message into its peer id and payload
pub fn split_peer_prefix(message: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    match message.split_first() {
        Some((peer, payload)) => Ok((*peer, payload)),
        None => Err(ProtocolError::MissingPeerPrefix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_prefix() {
        let framed = with_peer_prefix(42, b"\xff\xd8abc");
        assert_eq!(framed.len(), 6);
        assert_eq!(framed[0], 42);

        let (peer, payload) = split_peer_prefix(&framed).unwrap();
        assert_eq!(peer, 42);
        assert_eq!(payload, b"\xff\xd8abc");
    }

    #[test]
    fn test_empty_message_has_no_prefix() {
        assert!(matches!(
            split_peer_prefix(&[]),
            Err(ProtocolError::MissingPeerPrefix)
        ));
        let (peer, payload) = split_peer_prefix(&[7]).unwrap();
        assert_eq!(peer, 7);
        assert!(payload.is_empty());
    }
}
