//! Game simulation modules

pub mod dispatch;
pub mod label;
pub mod r#match;
pub mod positions;
pub mod presence;
pub mod registry;
pub mod runner;

pub use dispatch::OutboundMessage;
pub use label::LabelQuery;
pub use presence::Presence;
pub use r#match::JoinDecision;
pub use registry::{MatchListing, MatchRegistry};
pub use runner::MatchHandle;

/// Data message received from a client, queued until the next tick
#[derive(Debug, Clone)]
pub struct MatchMessage {
    pub sender: Presence,
    pub op_code: i64,
    pub data: Vec<u8>,
}

/// Errors talking to a match or the registry
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("match not found: {0}")]
    NotFound(String),

    #[error("match closed: {0}")]
    Closed(String),

    #[error(transparent)]
    InvalidQuery(#[from] label::QueryError),
}
