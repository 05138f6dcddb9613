//! Outbound message dispatch from a match to its clients

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ws::protocol::OpCode;

use super::presence::Presence;

/// Sink for everything a match sends to its clients
pub trait MatchDispatcher: Send + Sync {
    /// Send to every connected presence
    fn broadcast(&self, op_code: OpCode, data: Option<String>);

    /// Send to the given presences only
    fn send(&self, presences: &[Presence], op_code: OpCode, data: Option<String>);
}

/// A message leaving a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub op_code: OpCode,
    pub data: Option<String>,
    /// Target sessions, `None` for everyone
    pub recipients: Option<Vec<Uuid>>,
}

impl OutboundMessage {
    pub fn is_for(&self, session_id: Uuid) -> bool {
        self.recipients
            .as_ref()
            .map_or(true, |targets| targets.contains(&session_id))
    }
}

/// Dispatcher backed by the match's broadcast channel.
/// Sessions subscribe and filter on `OutboundMessage::is_for`.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: broadcast::Sender<OutboundMessage>,
}

impl ChannelDispatcher {
    pub fn new(tx: broadcast::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    fn publish(&self, msg: OutboundMessage) {
        // No subscribers is fine
        let _ = self.tx.send(msg);
    }
}

impl MatchDispatcher for ChannelDispatcher {
    fn broadcast(&self, op_code: OpCode, data: Option<String>) {
        self.publish(OutboundMessage {
            op_code,
            data,
            recipients: None,
        });
    }

    fn send(&self, presences: &[Presence], op_code: OpCode, data: Option<String>) {
        self.publish(OutboundMessage {
            op_code,
            data,
            recipients: Some(presences.iter().map(|p| p.session_id).collect()),
        });
    }
}

/// Captures dispatched messages for assertions
#[cfg(test)]
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: std::sync::Mutex<Vec<OutboundMessage>>,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn count(&self, op_code: OpCode) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.op_code == op_code)
            .count()
    }
}

#[cfg(test)]
impl MatchDispatcher for RecordingDispatcher {
    fn broadcast(&self, op_code: OpCode, data: Option<String>) {
        self.sent.lock().unwrap().push(OutboundMessage {
            op_code,
            data,
            recipients: None,
        });
    }

    fn send(&self, presences: &[Presence], op_code: OpCode, data: Option<String>) {
        self.sent.lock().unwrap().push(OutboundMessage {
            op_code,
            data,
            recipients: Some(presences.iter().map(|p| p.session_id).collect()),
        });
    }
}
