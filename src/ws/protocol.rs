//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The complete set of opcodes carried by match data messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum OpCode {
    /// New game round starting
    Start = 1,
    /// Update to the state of an ongoing round
    Update = 2,
    /// Move was rejected
    Rejected = 4,
    /// A move the player wishes to make (client to server only)
    Move = 101,
}

impl OpCode {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for OpCode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Start),
            2 => Ok(Self::Update),
            4 => Ok(Self::Rejected),
            101 => Ok(Self::Move),
            other => Err(other),
        }
    }
}

/// Board coordinate, `[x, y]`
pub type Coord = [i32; 2];

/// One player's place on the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPosition {
    pub player_id: String,
    /// Map coordinates, nominally within -100..=100 on each axis
    pub position: Coord,
}

/// Ordered list of every positioned player
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPositionList {
    pub player_ids: Vec<PlayerPosition>,
}

/// Sent by the server when a new round starts
#[allow(dead_code)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMessage {
    pub player_positions: PlayerPositionList,
}

/// Board state broadcast by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub player_positions: PlayerPositionList,
}

/// A player intends to move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveMessage {
    pub position: Coord,
}

/// Find-match RPC request body
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FindMatchRequest {
    /// Fast or normal speed match, normal when omitted
    #[serde(default)]
    pub fast: bool,
}

/// Find-match RPC response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindMatchResponse {
    /// One or more matches that fit the request
    pub match_ids: Vec<String>,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Ask to join a match returned by the find-match RPC
    JoinMatch { match_id: String },

    /// Opcode-tagged payload for the current match
    MatchData {
        op_code: i64,
        /// JSON payload as text
        #[serde(default)]
        data: String,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave current match
    LeaveMatch,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        user_id: String,
        session_id: Uuid,
        server_time: u64,
    },

    /// Admission accepted and the join completed
    MatchJoined { match_id: String },

    /// Admission refused
    JoinRejected {
        match_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Opcode-tagged payload from the match
    MatchData {
        match_id: String,
        op_code: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
