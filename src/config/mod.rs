//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,

    /// Per-match rules
    pub game: MatchConfig,
    /// Find-match RPC tuning
    pub matchmaking: MatchmakingConfig,
    /// Grace period handed to each match when the server shuts down
    pub shutdown_grace_secs: u32,
}

/// How a user who left and comes back is admitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RejoinPolicy {
    /// Capacity-checked and accepted like a fresh join
    #[default]
    Accept,
    /// Slot is counted as joining but the attempt itself is refused without a reason
    Legacy,
}

impl FromStr for RejoinPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "legacy" => Ok(Self::Legacy),
            _ => Err(()),
        }
    }
}

/// Immutable rules a match is created with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchConfig {
    /// Connected plus joining participants allowed at once
    pub capacity: usize,
    /// Ticks per second
    pub tick_rate: u32,
    /// Seconds of zero occupancy before the match closes itself
    pub max_empty_secs: u32,
    pub rejoin_policy: RejoinPolicy,
}

impl MatchConfig {
    /// Consecutive empty ticks that end the match
    pub fn max_empty_ticks(&self) -> u64 {
        self.max_empty_secs as u64 * self.tick_rate as u64
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            tick_rate: 5,
            max_empty_secs: 30,
            rejoin_policy: RejoinPolicy::Accept,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchmakingConfig {
    /// Most match ids returned by one find-match call
    pub list_limit: usize,
    /// Only list matches with at most this many occupied slots
    pub max_size: Option<usize>,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            list_limit: 10,
            max_size: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = MatchConfig::default();
        let game = MatchConfig {
            capacity: parse_var("MATCH_CAPACITY", defaults.capacity)?,
            tick_rate: parse_var("MATCH_TICK_RATE", defaults.tick_rate)?,
            max_empty_secs: parse_var("MATCH_MAX_EMPTY_SECS", defaults.max_empty_secs)?,
            rejoin_policy: parse_var("MATCH_REJOIN_POLICY", defaults.rejoin_policy)?,
        };
        if game.capacity == 0 {
            return Err(ConfigError::Invalid("MATCH_CAPACITY"));
        }
        if game.tick_rate == 0 {
            return Err(ConfigError::Invalid("MATCH_TICK_RATE"));
        }

        let matchmaking = MatchmakingConfig {
            list_limit: parse_var("MATCHMAKING_LIST_LIMIT", 10)?,
            max_size: match env::var("MATCHMAKING_MAX_SIZE") {
                Ok(raw) => Some(
                    raw.parse()
                        .map_err(|_| ConfigError::Invalid("MATCHMAKING_MAX_SIZE"))?,
                ),
                Err(_) => None,
            },
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            jwt_secret: env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?,
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_default(),

            game,
            matchmaking,
            shutdown_grace_secs: parse_var("SHUTDOWN_GRACE_SECS", 5)?,
        })
    }
}

/// Read an optional variable, falling back to `default` when unset
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
