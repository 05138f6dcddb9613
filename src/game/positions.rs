//! Player positions on the board

use crate::ws::protocol::{Coord, PlayerPosition, PlayerPositionList};

/// Half-width of the board; spawn coordinates stay within `-MAP_EXTENT..=MAP_EXTENT`
pub const MAP_EXTENT: i32 = 100;

/// Player id -> coordinate, kept in join order so broadcasts are stable
#[derive(Debug, Clone, Default)]
pub struct PositionRegistry {
    entries: Vec<PlayerPosition>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, player_id: &str) -> Option<Coord> {
        self.entries
            .iter()
            .find(|p| p.player_id == player_id)
            .map(|p| p.position)
    }

    /// Overwrite the player's coordinate, appending a new entry if absent
    pub fn upsert(&mut self, player_id: &str, position: Coord) {
        match self.entries.iter_mut().find(|p| p.player_id == player_id) {
            Some(entry) => entry.position = position,
            None => self.entries.push(PlayerPosition {
                player_id: player_id.to_string(),
                position,
            }),
        }
    }

    /// Overwrite an existing entry only. Returns false if the player has no position.
    pub fn update(&mut self, player_id: &str, position: Coord) -> bool {
        match self.entries.iter_mut().find(|p| p.player_id == player_id) {
            Some(entry) => {
                entry.position = position;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, player_id: &str) -> Option<Coord> {
        let idx = self.entries.iter().position(|p| p.player_id == player_id)?;
        Some(self.entries.remove(idx).position)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form of the full list
    pub fn snapshot(&self) -> PlayerPositionList {
        PlayerPositionList {
            player_ids: self.entries.clone(),
        }
    }
}
