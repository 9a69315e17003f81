//! In-app notification feed.
//!
//! A capped, newest-first list shared through an `Arc` by everything that
//! reports user-visible outcomes (store actions, the sync queue). All
//! operations are synchronous; the internal lock is never held across calls
//! into other components.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Oldest entries are evicted beyond this many.
pub const MAX_NOTIFICATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
    Warning,
}

/// Follow-up the UI can offer next to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationAction {
    /// Re-run the last failed submit.
    RetrySubmit,
    /// Open a saved submission.
    ViewSubmission(Uuid),
}

impl NotificationAction {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationAction::RetrySubmit => "Try Again",
            NotificationAction::ViewSubmission(_) => "View",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub action: Option<NotificationAction>,
}

#[derive(Debug, Default)]
pub struct NotificationCenter {
    entries: Mutex<Vec<NotificationMessage>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<NotificationMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a notification and return a copy of it.
    pub fn add(
        &self,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        action: Option<NotificationAction>,
    ) -> NotificationMessage {
        let notification = NotificationMessage {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
            action,
        };

        let mut entries = self.entries();
        entries.insert(0, notification.clone());
        entries.truncate(MAX_NOTIFICATIONS);
        log::debug!("notification [{:?}] {}", notification.kind, notification.title);
        notification
    }

    /// Returns `false` if the id is unknown.
    pub fn mark_read(&self, id: Uuid) -> bool {
        match self.entries().iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) {
        for n in self.entries().iter_mut() {
            n.read = true;
        }
    }

    /// Returns `false` if the id is unknown.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|n| n.id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn unread_count(&self) -> usize {
        self.entries().iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<NotificationMessage> {
        self.entries().clone()
    }

    /// Newest notification of the given kind, if any.
    pub fn latest(&self, kind: NotificationKind) -> Option<NotificationMessage> {
        self.entries().iter().find(|n| n.kind == kind).cloned()
    }
}
