//! Matchmaking service - find an open match or create one

use std::sync::Arc;

use tracing::{error, info};

use crate::config::MatchmakingConfig;
use crate::game::{LabelQuery, MatchError, MatchListing, MatchRegistry};
use crate::ws::protocol::{FindMatchRequest, FindMatchResponse};

/// Where matches are listed and created
pub trait MatchDirectory: Send + Sync {
    fn list_matches(
        &self,
        limit: usize,
        max_size: Option<usize>,
        query: &str,
    ) -> Result<Vec<MatchListing>, MatchError>;

    /// Create a match and return its id
    fn create_match(&self, fast: bool) -> Result<String, MatchError>;
}

impl MatchDirectory for MatchRegistry {
    fn list_matches(
        &self,
        limit: usize,
        max_size: Option<usize>,
        query: &str,
    ) -> Result<Vec<MatchListing>, MatchError> {
        self.list(limit, max_size, query)
    }

    fn create_match(&self, fast: bool) -> Result<String, MatchError> {
        Ok(self.create(fast).id)
    }
}

/// Find-match RPC failures
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("no user id in context")]
    Unauthenticated,

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("match directory unavailable: {0}")]
    Unavailable(#[source] MatchError),
}

/// Stateless apart from the directory it queries
pub struct MatchmakingService {
    directory: Arc<dyn MatchDirectory>,
    config: MatchmakingConfig,
}

impl MatchmakingService {
    pub fn new(directory: Arc<dyn MatchDirectory>, config: MatchmakingConfig) -> Self {
        Self { directory, config }
    }

    /// Decode the RPC body and find or create a match for it
    pub fn find_match_rpc(
        &self,
        requester_id: &str,
        payload: Option<&str>,
    ) -> Result<FindMatchResponse, MatchmakingError> {
        if requester_id.is_empty() {
            return Err(MatchmakingError::Unauthenticated);
        }

        let payload = payload
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| MatchmakingError::InvalidArgument("expects payload".to_string()))?;

        let request: FindMatchRequest = serde_json::from_str(payload).map_err(|e| {
            error!(user_id = %requester_id, error = %e, "Error parsing find match request");
            MatchmakingError::InvalidArgument(e.to_string())
        })?;

        let match_ids = self.find_or_create_match(requester_id, request)?;
        Ok(FindMatchResponse { match_ids })
    }

    /// Open matches of the requested speed, or a freshly created one.
    /// Two callers racing on an empty directory may each create a match.
    pub fn find_or_create_match(
        &self,
        requester_id: &str,
        request: FindMatchRequest,
    ) -> Result<Vec<String>, MatchmakingError> {
        if requester_id.is_empty() {
            return Err(MatchmakingError::Unauthenticated);
        }

        let query = LabelQuery::open_matches(request.fast).to_string();
        let matches = self
            .directory
            .list_matches(self.config.list_limit, self.config.max_size, &query)
            .map_err(|e| {
                error!(error = %e, query = %query, "Error listing matches");
                MatchmakingError::Unavailable(e)
            })?;

        if !matches.is_empty() {
            info!(
                user_id = %requester_id,
                found = matches.len(),
                fast = request.fast,
                "Found open matches"
            );
            return Ok(matches.into_iter().map(|m| m.match_id).collect());
        }

        let match_id = self.directory.create_match(request.fast).map_err(|e| {
            error!(error = %e, "Error creating match");
            MatchmakingError::Unavailable(e)
        })?;

        info!(
            user_id = %requester_id,
            match_id = %match_id,
            fast = request.fast,
            "No open match, created one"
        );
        Ok(vec![match_id])
    }
}
