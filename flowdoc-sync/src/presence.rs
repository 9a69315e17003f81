//! Presence roster for a collaboration session.
//!
//! Tracks who is currently in the document from `join` / `leave` events,
//! in join order, and assigns each participant a stable display color.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::event::{CollaborationEvent, CollaborationUser, EventData};

/// Participant colors, picked by user id.
pub const PALETTE: [&str; 6] = ["#FF5733", "#33FF57", "#3357FF", "#F033FF", "#FF33A8", "#33FFF6"];

/// Stable palette color for a user id.
pub fn color_for(id: Uuid) -> &'static str {
    PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    user: CollaborationUser,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct PresenceRoster {
    entries: Vec<PresenceEntry>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a participant. Returns `true` if newly joined.
    pub fn join(&mut self, user: CollaborationUser) -> bool {
        let now = Instant::now();
        match self.entries.iter_mut().find(|e| e.user.id == user.id) {
            Some(entry) => {
                entry.user = user;
                entry.last_seen = now;
                false
            }
            None => {
                self.entries.push(PresenceEntry { user, last_seen: now });
                true
            }
        }
    }

    pub fn leave(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.user.id != id);
        self.entries.len() != before
    }

    /// Update the roster from any event: joins add, leaves remove, and
    /// everything else counts as activity from a (possibly unseen) peer.
    pub fn observe(&mut self, event: &CollaborationEvent) {
        match event.data {
            EventData::Leave => {
                self.leave(event.user.id);
            }
            _ => {
                self.join(event.user.clone());
            }
        }
    }

    /// Remove participants not heard from within `timeout`.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut pruned = Vec::new();
        self.entries.retain(|e| {
            let keep = now.duration_since(e.last_seen) < timeout;
            if !keep {
                pruned.push(e.user.id);
            }
            keep
        });
        pruned
    }

    /// Participants in join order.
    pub fn active_users(&self) -> Vec<CollaborationUser> {
        self.entries.iter().map(|e| e.user.clone()).collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.user.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_in_palette() {
        for _ in 0..20 {
            assert!(PALETTE.contains(&color_for(Uuid::new_v4())));
        }
    }

    #[test]
    fn test_join_leave() {
        let mut roster = PresenceRoster::new();
        let alice = CollaborationUser::new("Alice", None);
        let bob = CollaborationUser::new("Bob", None);

        assert!(roster.join(alice.clone()));
        assert!(!roster.join(alice.clone()));
        assert!(roster.join(bob.clone()));
        assert_eq!(roster.active_users(), vec![alice.clone(), bob.clone()]);

        assert!(roster.leave(alice.id));
        assert!(!roster.leave(alice.id));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_observe_events() {
        let mut roster = PresenceRoster::new();
        let carol = CollaborationUser::new("Carol", None);

        roster.observe(&CollaborationEvent::new(carol.clone(), EventData::Join, 0));
        assert!(roster.contains(carol.id));

        roster.observe(&CollaborationEvent::new(carol.clone(), EventData::Leave, 1));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_prune_idle() {
        let mut roster = PresenceRoster::new();
        let dan = CollaborationUser::new("Dan", None);
        roster.join(dan.clone());

        assert!(roster.prune_idle(Duration::from_secs(60)).is_empty());
        assert_eq!(roster.prune_idle(Duration::ZERO), vec![dan.id]);
        assert!(roster.is_empty());
    }
}
