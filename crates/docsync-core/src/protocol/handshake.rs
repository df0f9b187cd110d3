//! Join/peer handshake.
//!
//! The connecting side sends `join` immediately after the WebSocket opens;
//! the accepting side answers with `peer`, after which both sides exchange
//! [`RepoMessage`](super::RepoMessage)s.

use super::ProtocolError;
use crate::RepoId;
use serde::{Deserialize, Serialize};

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandshakeMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        sender_id: RepoId,
        supported_protocol_versions: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Peer {
        sender_id: RepoId,
        selected_protocol_version: String,
        target_id: RepoId,
    },
    /// Sent before closing when the handshake cannot complete.
    Error { message: String },
}

impl HandshakeMessage {
    pub fn join(sender_id: RepoId) -> Self {
        Self::Join {
            sender_id,
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
        }
    }

    pub fn peer(sender_id: RepoId, target_id: RepoId) -> Self {
        Self::Peer {
            sender_id,
            selected_protocol_version: PROTOCOL_VERSION.to_string(),
            target_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn sender_id(&self) -> Option<RepoId> {
        match self {
            Self::Join { sender_id, .. } | Self::Peer { sender_id, .. } => Some(*sender_id),
            Self::Error { .. } => None,
        }
    }

    /// Check a `join` offers our protocol version.
    pub fn is_compatible(&self) -> bool {
        match self {
            Self::Join {
                supported_protocol_versions,
                ..
            } => supported_protocol_versions
                .iter()
                .any(|v| v == PROTOCOL_VERSION),
            Self::Peer {
                selected_protocol_version,
                ..
            } => selected_protocol_version == PROTOCOL_VERSION,
            Self::Error { .. } => false,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or any other message type.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_id() -> RepoId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn server_id() -> RepoId {
        "1234567890abcdef".parse().unwrap()
    }

    // ==================== Wire format ====================

    #[test]
    fn test_join_wire_format() {
        let json = String::from_utf8(HandshakeMessage::join(client_id()).to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"type":"join","senderId":"a1b2c3d4e5f67890","supportedProtocolVersions":["1"]}"#
        );
    }

    #[test]
    fn test_peer_wire_format() {
        let json = String::from_utf8(
            HandshakeMessage::peer(server_id(), client_id())
                .to_json()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"peer","senderId":"1234567890abcdef","selectedProtocolVersion":"1","targetId":"a1b2c3d4e5f67890"}"#
        );
    }

    #[test]
    fn test_roundtrip() {
        let join = HandshakeMessage::join(client_id());
        assert_eq!(HandshakeMessage::from_json(&join.to_json().unwrap()), Some(join));
    }

    // ==================== Parsing ====================

    #[test]
    fn test_foreign_sender_id_is_mapped() {
        let json = br#"{"type":"join","senderId":"peer-abc","supportedProtocolVersions":["1"]}"#;
        let msg = HandshakeMessage::from_json(json).unwrap();
        assert_eq!(msg.sender_id(), Some("peer-abc".parse().unwrap()));
    }

    #[test]
    fn test_rejects_other_types() {
        assert!(HandshakeMessage::from_json(b"not json").is_none());
        assert!(HandshakeMessage::from_json(b"{}").is_none());
        let sync = br#"{"type":"sync","senderId":"a1b2c3d4e5f67890","targetId":"1234567890abcdef","documentId":"d","message":[]}"#;
        assert!(HandshakeMessage::from_json(sync).is_none());
    }

    // ==================== Version compatibility ====================

    #[test]
    fn test_version_negotiation() {
        assert!(HandshakeMessage::join(client_id()).is_compatible());

        let json = br#"{"type":"join","senderId":"a1b2c3d4e5f67890","supportedProtocolVersions":["2","3"]}"#;
        assert!(!HandshakeMessage::from_json(json).unwrap().is_compatible());
        assert!(!HandshakeMessage::error("nope").is_compatible());
    }
}
