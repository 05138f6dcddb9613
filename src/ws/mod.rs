//! Real-time match channel over WebSocket

pub mod handler;
pub mod protocol;
