//! Wire envelope for collaboration and sync traffic.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Collaboration events travel as JSON inside the payload because edit
//! values are arbitrary JSON, which bincode cannot describe. Queue
//! mutations are plain bincode.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{CollaborationEvent, EventKind};
use crate::queue::SyncQueueItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Join = 1,
    Leave = 2,
    Edit = 3,
    Comment = 4,
    Cursor = 5,
    /// Durable mutation pushed by the sync queue.
    Mutation = 6,
    Ping = 7,
    Pong = 8,
}

impl From<EventKind> for MessageType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Join => MessageType::Join,
            EventKind::Leave => MessageType::Leave,
            EventKind::Edit => MessageType::Edit,
            EventKind::Comment => MessageType::Comment,
            EventKind::Cursor => MessageType::Cursor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender's emission counter
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Wrap a collaboration event for the given document.
    pub fn event(doc_id: Uuid, event: &CollaborationEvent) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: event.kind().into(),
            peer_id: event.user.id,
            doc_id,
            clock: event.seq,
            payload,
        })
    }

    /// Wrap a queued durable mutation.
    pub fn mutation(peer_id: Uuid, item: &SyncQueueItem) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Mutation,
            peer_id,
            doc_id: item.record_id,
            clock: item.seq,
            payload,
        })
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            ..Self::ping(peer_id)
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Join
                | MessageType::Leave
                | MessageType::Edit
                | MessageType::Comment
                | MessageType::Cursor
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the collaboration event payload.
    pub fn to_event(&self) -> Result<CollaborationEvent, ProtocolError> {
        if !self.is_event() {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse the mutation payload.
    pub fn to_mutation(&self) -> Result<SyncQueueItem, ProtocolError> {
        if self.msg_type != MessageType::Mutation {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (item, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(item)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CollaborationUser, EventData};
    use crate::queue::{SyncAction, SyncPayload};
    use flowdoc_core::{CommentDraft, WorkflowSubmission};

    #[test]
    fn test_edit_event_roundtrip() {
        let user = CollaborationUser::new("Alice", None);
        let doc = Uuid::new_v4();
        let event = CollaborationEvent::new(
            user.clone(),
            EventData::Edit {
                path: "questions.q1.answer".into(),
                value: serde_json::json!({"nested": [1, 2, 3]}),
                base_version: 4,
            },
            9,
        );

        let msg = SyncMessage::event(doc, &event).unwrap();
        assert_eq!(msg.msg_type, MessageType::Edit);
        assert_eq!(msg.peer_id, user.id);
        assert_eq!(msg.clock, 9);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.to_event().unwrap(), event);
    }

    #[test]
    fn test_comment_event_type() {
        let user = CollaborationUser::new("Bob", None);
        let comment = CommentDraft::new("looks good").into_comment(user.as_author());
        let event = CollaborationEvent::new(user, EventData::Comment(comment), 1);

        let msg = SyncMessage::event(Uuid::new_v4(), &event).unwrap();
        assert_eq!(msg.msg_type, MessageType::Comment);
        assert!(msg.to_mutation().is_err());
    }

    #[test]
    fn test_mutation_roundtrip() {
        let submission = WorkflowSubmission::new("Invoices", "Acme", "Finance");
        let item = SyncQueueItem::new(
            submission.id,
            SyncAction::Create,
            SyncPayload::Submission(Box::new(submission.clone())),
            3,
        );

        let msg = SyncMessage::mutation(Uuid::new_v4(), &item).unwrap();
        assert_eq!(msg.doc_id, submission.id);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let parsed = decoded.to_mutation().unwrap();
        assert_eq!(parsed.id, item.id);
        assert_eq!(parsed.action, SyncAction::Create);
        assert!(matches!(parsed.payload, SyncPayload::Submission(ref s) if s.name == "Invoices"));
        assert!(decoded.to_event().is_err());
    }

    #[test]
    fn test_ping_pong() {
        let peer = Uuid::new_v4();
        let ping = SyncMessage::decode(&SyncMessage::ping(peer).encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong(peer).encode().unwrap()).unwrap();
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert!(!pong.is_event());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            SyncMessage::decode(&[0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
