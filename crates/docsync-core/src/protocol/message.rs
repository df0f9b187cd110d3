//! Repo message envelope and sync bodies.
//!
//! Wire format (JSON):
//! `{"type":"sync","senderId":..,"targetId":..,"documentId":..,"message":[..]}`
//!
//! The `message` field is a `Vec<u8>` serialized as a JSON number array. For
//! `sync` and `request` it carries a bincode-encoded [`SyncBody`]; for
//! `ephemeral` it carries application data; `doc-unavailable` leaves it empty.

use super::handshake::HandshakeMessage;
use super::ProtocolError;
use crate::{DocumentId, RepoId};
use loro::VersionVector;
use serde::{Deserialize, Serialize};

/// Maximum accepted frame size (50 MiB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Sync,
    Request,
    DocUnavailable,
    Ephemeral,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Request => "request",
            Self::DocUnavailable => "doc-unavailable",
            Self::Ephemeral => "ephemeral",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: RepoId,
    pub target_id: RepoId,
    pub document_id: DocumentId,
    #[serde(default)]
    pub message: Vec<u8>,
}

impl RepoMessage {
    pub fn new(
        kind: MessageKind,
        sender_id: RepoId,
        target_id: RepoId,
        document_id: DocumentId,
        message: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            sender_id,
            target_id,
            document_id,
            message,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes. Unknown `type` values are decode errors.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode the sync body of a `sync` or `request` message.
    pub fn sync_body(&self) -> Result<SyncBody, ProtocolError> {
        SyncBody::decode(&self.message)
    }
}

/// Payload of `sync` and `request`: what the sender has, plus what it offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBody {
    /// Sender's encoded version vector.
    pub version: Vec<u8>,
    /// Loro updates; empty when the sender only states its version.
    pub updates: Vec<u8>,
}

impl SyncBody {
    pub fn new(version: &VersionVector, updates: Vec<u8>) -> Self {
        Self {
            version: version.encode(),
            updates,
        }
    }

    pub fn version_vector(&self) -> Result<VersionVector, ProtocolError> {
        if self.version.is_empty() {
            return Ok(VersionVector::default());
        }
        VersionVector::decode(&self.version).map_err(|e| ProtocolError::InvalidVersion(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Bincode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(data).map_err(|e| ProtocolError::Bincode(e.to_string()))
    }
}

/// Any frame a connection can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(HandshakeMessage),
    Repo(RepoMessage),
}

impl Frame {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        if let Some(handshake) = HandshakeMessage::from_json(data) {
            return Ok(Frame::Handshake(handshake));
        }
        RepoMessage::from_json(data).map(Frame::Repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn sender() -> RepoId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn target() -> RepoId {
        "1234567890abcdef".parse().unwrap()
    }

    fn doc_id() -> DocumentId {
        "doc-1".parse().unwrap()
    }

    // ==================== RepoMessage ====================

    #[test]
    fn test_wire_format() {
        let msg = RepoMessage::new(MessageKind::DocUnavailable, sender(), target(), doc_id(), vec![]);
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"type":"doc-unavailable","senderId":"a1b2c3d4e5f67890","targetId":"1234567890abcdef","documentId":"doc-1","message":[]}"#
        );
    }

    #[test]
    fn test_message_as_byte_array() {
        let msg = RepoMessage::new(MessageKind::Ephemeral, sender(), target(), doc_id(), vec![0, 127, 255]);
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(json.contains("\"message\":[0,127,255]"));
        assert_eq!(RepoMessage::from_json(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_missing_message_defaults_empty() {
        let json = br#"{"type":"request","senderId":"a1b2c3d4e5f67890","targetId":"1234567890abcdef","documentId":"doc-1"}"#;
        let msg = RepoMessage::from_json(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert!(msg.message.is_empty());
    }

    #[test]
    fn test_unknown_type_is_error() {
        let json = br#"{"type":"gossip","senderId":"a1b2c3d4e5f67890","targetId":"1234567890abcdef","documentId":"doc-1"}"#;
        assert!(matches!(RepoMessage::from_json(json), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_invalid_document_id_is_error() {
        let json = br#"{"type":"sync","senderId":"a1b2c3d4e5f67890","targetId":"1234567890abcdef","documentId":""}"#;
        assert!(RepoMessage::from_json(json).is_err());
    }

    // ==================== SyncBody ====================

    #[test]
    fn test_sync_body_carries_version_and_updates() {
        let doc = Document::new();
        doc.change(|d| d.set("counter", 1i64)).unwrap();
        let updates = doc.export_updates(&VersionVector::default()).unwrap();

        let body = SyncBody::new(&doc.version(), updates.clone());
        let decoded = SyncBody::decode(&body.encode().unwrap()).unwrap();

        assert_eq!(decoded.updates, updates);
        assert_eq!(decoded.version_vector().unwrap(), doc.version());
    }

    #[test]
    fn test_empty_sync_body() {
        let body = SyncBody::decode(&[]).unwrap();
        assert!(body.updates.is_empty());
        assert_eq!(body.version_vector().unwrap(), VersionVector::default());
    }

    #[test]
    fn test_garbage_sync_body() {
        assert!(matches!(SyncBody::decode(&[0xFF]), Err(ProtocolError::Bincode(_))));
    }

    // ==================== Frame ====================

    #[test]
    fn test_frame_dispatch() {
        let join = HandshakeMessage::join(sender());
        assert_eq!(
            Frame::decode(&join.to_json().unwrap()).unwrap(),
            Frame::Handshake(join)
        );

        let msg = RepoMessage::new(MessageKind::Request, sender(), target(), doc_id(), vec![]);
        assert_eq!(Frame::decode(&msg.to_json().unwrap()).unwrap(), Frame::Repo(msg));

        assert!(Frame::decode(b"not json").is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let big = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(Frame::decode(&big), Err(ProtocolError::TooLarge(_))));
    }
}
