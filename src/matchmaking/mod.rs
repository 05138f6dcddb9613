//! Matchmaking entry point

pub mod service;

pub use service::{MatchmakingError, MatchmakingService};
