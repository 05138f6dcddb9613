//! Presence tracking for a single match

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A participant identity bound to one client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub session_id: Uuid,
    pub username: String,
}

impl Presence {
    pub fn new(user_id: impl Into<String>, session_id: Uuid) -> Self {
        let user_id = user_id.into();
        let username = format!("Player_{}", user_id.chars().take(8).collect::<String>());
        Self {
            user_id,
            session_id,
            username,
        }
    }
}

/// Where a user stands with respect to a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    /// Joined and receiving broadcasts
    Connected(Presence),
    /// Admitted, handshake not yet complete
    Reserved,
    /// Was here and left; kept so a later attempt counts as a rejoin
    Left,
}

/// User id -> presence state. Absent means the user never interacted with the match.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    entries: HashMap<String, PresenceState>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceState> {
        self.entries.get(user_id)
    }

    pub fn reserve(&mut self, user_id: &str) {
        self.entries
            .insert(user_id.to_string(), PresenceState::Reserved);
    }

    pub fn connect(&mut self, presence: Presence) -> Option<PresenceState> {
        self.entries
            .insert(presence.user_id.clone(), PresenceState::Connected(presence))
    }

    /// Tombstone the user, returning the previous state
    pub fn mark_left(&mut self, user_id: &str) -> Option<PresenceState> {
        self.entries.insert(user_id.to_string(), PresenceState::Left)
    }

    /// Put back a state captured earlier; `None` forgets the user entirely
    pub fn restore(&mut self, user_id: &str, previous: Option<PresenceState>) {
        match previous {
            Some(state) => {
                self.entries.insert(user_id.to_string(), state);
            }
            None => {
                self.entries.remove(user_id);
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    pub fn connected(&self) -> impl Iterator<Item = &Presence> {
        self.entries.values().filter_map(|state| match state {
            PresenceState::Connected(presence) => Some(presence),
            _ => None,
        })
    }
}
