//! Registry of all active matches

use std::sync::Arc;

use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MatchConfig;

use super::label::{LabelQuery, MatchLabel};
use super::r#match::GameMatch;
use super::runner::{MatchHandle, MatchRunner};
use super::MatchError;

/// Out-of-band notice a match receives before a host-initiated terminate
const SHUTDOWN_SIGNAL: &str = "shutdown";

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// One row of a match listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchListing {
    pub match_id: String,
    pub label: MatchLabel,
    /// Connected plus joining participants
    pub size: usize,
}

/// Creates match tasks and keeps their handles until they end
pub struct MatchRegistry {
    matches: Arc<DashMap<String, MatchHandle>>,
    config: MatchConfig,
}

impl MatchRegistry {
    pub fn new(config: MatchConfig) -> Self {
        Self {
            matches: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Start a new match task. Must be called from within a tokio runtime.
    pub fn create(&self, fast: bool) -> MatchHandle {
        let match_id = Uuid::new_v4().to_string();
        let seed = rand::random::<u64>();
        let label = MatchLabel::new(fast);

        let game = GameMatch::new(match_id.clone(), seed, self.config, label);
        let (runner, handle) = MatchRunner::new(game, self.config.tick_interval());
        self.matches.insert(match_id.clone(), handle.clone());

        info!(match_id = %match_id, fast, seed, "Created new match");

        let matches = self.matches.clone();
        tokio::spawn(async move {
            let exit = runner.run().await;
            matches.remove(&match_id);
            info!(match_id = %match_id, ?exit, "Match removed from registry");
        });

        handle
    }

    pub fn get(&self, id: &str) -> Result<MatchHandle, MatchError> {
        self.matches
            .get(id)
            .map(|m| m.value().clone())
            .ok_or_else(|| MatchError::NotFound(id.to_string()))
    }

    /// Up to `limit` live matches whose label satisfies `query`,
    /// optionally only those with at most `max_size` participants
    pub fn list(
        &self,
        limit: usize,
        max_size: Option<usize>,
        query: &str,
    ) -> Result<Vec<MatchListing>, MatchError> {
        let query: LabelQuery = query.parse()?;

        Ok(self
            .matches
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed() && query.matches(&handle.label))
            .map(|handle| MatchListing {
                size: handle.occupancy(),
                match_id: handle.id,
                label: handle.label,
            })
            .filter(|listing| max_size.map_or(true, |max| listing.size <= max))
            .take(limit)
            .collect())
    }

    /// Host shutdown: notify every live match, then terminate it with the
    /// given grace period. Returns how many matches accepted the request.
    pub async fn terminate_all(&self, grace_secs: u32) -> usize {
        let handles: Vec<MatchHandle> = self.matches.iter().map(|m| m.value().clone()).collect();

        let mut terminated = 0;
        for handle in handles {
            if let Err(e) = handle.signal(SHUTDOWN_SIGNAL).await {
                debug!(match_id = %handle.id, error = %e, "Match gone before shutdown signal");
                continue;
            }
            match handle.terminate(grace_secs).await {
                Ok(()) => terminated += 1,
                Err(e) => debug!(match_id = %handle.id, error = %e, "Match gone before terminate"),
            }
        }

        info!(terminated, grace_secs, "Terminating all matches");
        terminated
    }

    /// Resolves once every match task has exited and been removed
    pub async fn drained(&self) {
        while !self.matches.is_empty() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.iter().map(|m| m.value().occupancy()).sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new(MatchConfig::default())
    }
}
