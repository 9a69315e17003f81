//! Collaboration events exchanged between participants of a document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowdoc_core::{Comment, CommentAuthor, Position};

use crate::presence::color_for;

/// Ephemeral identity of a participant, generated fresh per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationUser {
    pub id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
    /// Hex color, e.g. `#33FF57`.
    pub color: String,
}

impl CollaborationUser {
    pub fn new(name: impl Into<String>, avatar: Option<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name, avatar)
    }

    /// Create with an explicit id (tests, replays).
    pub fn with_id(id: Uuid, name: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar,
            color: color_for(id).to_string(),
        }
    }

    pub fn as_author(&self) -> CommentAuthor {
        CommentAuthor {
            id: self.id,
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            color: self.color.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Join,
    Leave,
    Edit,
    Comment,
    Cursor,
}

/// Listener channel: one event kind, or every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    All,
    Kind(EventKind),
}

impl From<EventKind> for EventChannel {
    fn from(kind: EventKind) -> Self {
        EventChannel::Kind(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventData {
    Join,
    Leave,
    /// A field change. `base_version` is the document version the sender
    /// was editing; receivers drop edits older than their local version.
    Edit {
        path: String,
        value: serde_json::Value,
        base_version: u64,
    },
    Comment(Comment),
    Cursor(Position),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub user: CollaborationUser,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
    /// Per-sender emission counter; monotonic within one session.
    pub seq: u64,
}

impl CollaborationEvent {
    pub fn new(user: CollaborationUser, data: EventData, seq: u64) -> Self {
        Self {
            user,
            data,
            timestamp: Utc::now(),
            seq,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.data {
            EventData::Join => EventKind::Join,
            EventData::Leave => EventKind::Leave,
            EventData::Edit { .. } => EventKind::Edit,
            EventData::Comment(_) => EventKind::Comment,
            EventData::Cursor(_) => EventKind::Cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_data() {
        let user = CollaborationUser::new("Ada", None);
        let edit = CollaborationEvent::new(
            user.clone(),
            EventData::Edit {
                path: "businessName".into(),
                value: serde_json::json!("Acme"),
                base_version: 1,
            },
            1,
        );
        assert_eq!(edit.kind(), EventKind::Edit);

        let cursor = CollaborationEvent::new(user, EventData::Cursor(Position::new(1.0, 2.0)), 2);
        assert_eq!(cursor.kind(), EventKind::Cursor);
    }

    #[test]
    fn test_user_color_is_stable() {
        let id = Uuid::new_v4();
        let a = CollaborationUser::with_id(id, "A", None);
        let b = CollaborationUser::with_id(id, "B", None);
        assert_eq!(a.color, b.color);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_channel_from_kind() {
        assert_eq!(EventChannel::from(EventKind::Comment), EventChannel::Kind(EventKind::Comment));
        assert_ne!(EventChannel::All, EventChannel::Kind(EventKind::Join));
    }
}
