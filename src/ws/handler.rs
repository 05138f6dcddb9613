//! WebSocket upgrade handler and per-connection match session

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{JoinDecision, MatchHandle, MatchMessage, MatchRegistry, Presence};
use crate::http::middleware::verify_jwt;
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Outbound queue depth per connection
const OUTBOX_CAPACITY: usize = 128;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.jwt_secret) {
        Ok(claims) => {
            info!(user_id = %claims.sub, "WebSocket upgrade for authenticated user");
            ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state))
        }
        Err(e) => {
            error!(error = %e, "WebSocket auth failed");
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let session_id = Uuid::new_v4();
    info!(user_id = %user_id, session_id = %session_id, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMsg>(OUTBOX_CAPACITY);

    // Spawn writer task: outbox -> WebSocket
    let writer_user_id = user_id.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                debug!(user_id = %writer_user_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    let welcome = ServerMsg::Welcome {
        user_id: user_id.clone(),
        session_id,
        server_time: unix_millis(),
    };
    if outbox_tx.send(welcome).await.is_err() {
        error!(user_id = %user_id, "Failed to send welcome");
        return;
    }

    let presence = Presence::new(user_id.clone(), session_id);
    let mut session = MatchSession::new(presence, state.match_registry.clone(), outbox_tx);

    // Reader loop: WebSocket -> match
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMsg>(&text) {
                Ok(client_msg) => session.handle(client_msg).await,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to parse client message");
                    session
                        .reply(ServerMsg::error("bad_message", e.to_string()))
                        .await;
                }
            },
            Ok(Message::Binary(_)) => {
                warn!(user_id = %user_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Disconnect counts as leaving the match
    session.leave_current().await;
    drop(session);
    writer_handle.abort();

    info!(user_id = %user_id, session_id = %session_id, "WebSocket connection closed");
}

/// Match the session is currently in
struct JoinedMatch {
    handle: MatchHandle,
    forwarder: JoinHandle<()>,
}

/// One connection's view of matchmaking: at most one joined match at a time
pub struct MatchSession {
    presence: Presence,
    registry: Arc<MatchRegistry>,
    outbox: mpsc::Sender<ServerMsg>,
    rate_limiter: SessionRateLimiter,
    current: Option<JoinedMatch>,
}

impl MatchSession {
    pub fn new(
        presence: Presence,
        registry: Arc<MatchRegistry>,
        outbox: mpsc::Sender<ServerMsg>,
    ) -> Self {
        Self {
            presence,
            registry,
            outbox,
            rate_limiter: SessionRateLimiter::new(),
            current: None,
        }
    }

    pub async fn handle(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::JoinMatch { match_id } => self.join(match_id).await,
            ClientMsg::MatchData { op_code, data } => self.send_data(op_code, data).await,
            ClientMsg::Ping { t } => self.reply(ServerMsg::Pong { t }).await,
            ClientMsg::LeaveMatch => self.leave_current().await,
        }
    }

    async fn join(&mut self, match_id: String) {
        self.leave_current().await;

        let handle = match self.registry.get(&match_id) {
            Ok(handle) => handle,
            Err(e) => {
                self.reply(ServerMsg::error("match_not_found", e.to_string()))
                    .await;
                return;
            }
        };

        match handle.join_attempt(self.presence.clone()).await {
            Ok(JoinDecision::Accepted) => {}
            Ok(JoinDecision::Rejected { reason }) => {
                debug!(
                    user_id = %self.presence.user_id,
                    match_id = %match_id,
                    ?reason,
                    "Join rejected"
                );
                self.reply(ServerMsg::JoinRejected {
                    match_id,
                    reason: reason.map(|r| r.to_string()),
                })
                .await;
                return;
            }
            Err(e) => {
                self.reply(ServerMsg::error("match_closed", e.to_string()))
                    .await;
                return;
            }
        }

        // Subscribe before joining so the join broadcast is not missed
        let rx = match handle.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                self.reply(ServerMsg::error("match_closed", e.to_string()))
                    .await;
                return;
            }
        };
        if let Err(e) = handle.join(vec![self.presence.clone()]).await {
            self.reply(ServerMsg::error("match_closed", e.to_string()))
                .await;
            return;
        }

        self.reply(ServerMsg::MatchJoined {
            match_id: match_id.clone(),
        })
        .await;

        let forwarder = tokio::spawn(forward_match_data(
            match_id,
            self.presence.session_id,
            rx,
            self.outbox.clone(),
        ));
        self.current = Some(JoinedMatch { handle, forwarder });
    }

    async fn send_data(&mut self, op_code: i64, data: String) {
        let Some(joined) = &self.current else {
            self.reply(ServerMsg::error("not_in_match", "join a match first"))
                .await;
            return;
        };

        if !self.rate_limiter.check_data() {
            warn!(user_id = %self.presence.user_id, "Rate limited match data");
            return;
        }

        let message = MatchMessage {
            sender: self.presence.clone(),
            op_code,
            data: data.into_bytes(),
        };

        if let Err(e) = joined.handle.send_data(message).await {
            debug!(user_id = %self.presence.user_id, error = %e, "Match gone while sending data");
            if let Some(joined) = self.current.take() {
                joined.forwarder.abort();
            }
            self.reply(ServerMsg::error("match_closed", e.to_string()))
                .await;
        }
    }

    /// Leave the current match, if any
    pub async fn leave_current(&mut self) {
        let Some(joined) = self.current.take() else {
            return;
        };
        joined.forwarder.abort();
        if let Err(e) = joined.handle.leave(vec![self.presence.clone()]).await {
            debug!(user_id = %self.presence.user_id, error = %e, "Match already closed on leave");
        }
    }

    pub async fn reply(&self, msg: ServerMsg) {
        if self.outbox.send(msg).await.is_err() {
            debug!(user_id = %self.presence.user_id, "Outbox closed");
        }
    }
}

/// Relay a match's outbound messages addressed to this session
async fn forward_match_data(
    match_id: String,
    session_id: Uuid,
    mut rx: broadcast::Receiver<crate::game::OutboundMessage>,
    outbox: mpsc::Sender<ServerMsg>,
) {
    loop {
        match rx.recv().await {
            Ok(msg) if msg.is_for(session_id) => {
                let out = ServerMsg::MatchData {
                    match_id: match_id.clone(),
                    op_code: msg.op_code.as_i64(),
                    data: msg.data,
                };
                if outbox.send(out).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Don't disconnect for lag; the next update carries full state
                warn!(match_id = %match_id, lagged_count = n, "Session lagged behind match");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(match_id = %match_id, "Match channel closed");
                let _ = outbox
                    .send(ServerMsg::error("match_ended", match_id.clone()))
                    .await;
                break;
            }
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::ws::protocol::{OpCode, UpdateMessage};

    fn session(
        user_id: &str,
        registry: &Arc<MatchRegistry>,
    ) -> (MatchSession, mpsc::Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(64);
        let presence = Presence::new(user_id, Uuid::new_v4());
        (MatchSession::new(presence, registry.clone(), tx), rx)
    }

    async fn next_update(rx: &mut mpsc::Receiver<ServerMsg>) -> UpdateMessage {
        loop {
            if let Some(ServerMsg::MatchData {
                op_code,
                data: Some(data),
                ..
            }) = rx.recv().await
            {
                if op_code == OpCode::Update.as_i64() {
                    return serde_json::from_str(&data).unwrap();
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_then_move_is_broadcast() {
        let registry = Arc::new(MatchRegistry::default());
        let handle = registry.create(false);
        let (mut a, mut rx) = session("A", &registry);

        a.handle(ClientMsg::JoinMatch {
            match_id: handle.id.clone(),
        })
        .await;
        assert!(matches!(rx.recv().await, Some(ServerMsg::MatchJoined { .. })));
        assert_eq!(next_update(&mut rx).await.player_positions.player_ids.len(), 1);

        a.handle(ClientMsg::MatchData {
            op_code: OpCode::Move.as_i64(),
            data: r#"{"position":[5,5]}"#.to_string(),
        })
        .await;

        let mut moved = false;
        for _ in 0..3 {
            let update = next_update(&mut rx).await;
            if update.player_positions.player_ids[0].position == [5, 5] {
                moved = true;
                break;
            }
        }
        assert!(moved);

        a.handle(ClientMsg::LeaveMatch).await;
        handle.signal("sync").await.unwrap();
        assert_eq!(handle.occupancy(), 0);
    }

    #[tokio::test]
    async fn full_match_rejects_with_reason() {
        let registry = Arc::new(MatchRegistry::new(MatchConfig {
            capacity: 1,
            ..MatchConfig::default()
        }));
        let handle = registry.create(true);
        let (mut a, mut rx_a) = session("A", &registry);
        let (mut b, mut rx_b) = session("B", &registry);

        a.handle(ClientMsg::JoinMatch {
            match_id: handle.id.clone(),
        })
        .await;
        assert!(matches!(rx_a.recv().await, Some(ServerMsg::MatchJoined { .. })));

        b.handle(ClientMsg::JoinMatch {
            match_id: handle.id.clone(),
        })
        .await;
        match rx_b.recv().await {
            Some(ServerMsg::JoinRejected { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some("match full"))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_hears_when_its_match_ends() {
        let registry = Arc::new(MatchRegistry::default());
        let handle = registry.create(false);
        let (mut a, mut rx) = session("A", &registry);

        a.handle(ClientMsg::JoinMatch {
            match_id: handle.id.clone(),
        })
        .await;
        assert!(matches!(rx.recv().await, Some(ServerMsg::MatchJoined { .. })));

        handle.terminate(0).await.unwrap();

        loop {
            match rx.recv().await {
                Some(ServerMsg::Error { code, message }) => {
                    assert_eq!(code, "match_ended");
                    assert_eq!(message, handle.id);
                    break;
                }
                Some(ServerMsg::MatchData { .. }) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn unknown_match_and_data_without_match_are_errors() {
        let registry = Arc::new(MatchRegistry::default());
        let (mut a, mut rx) = session("A", &registry);

        a.handle(ClientMsg::JoinMatch {
            match_id: "missing".to_string(),
        })
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMsg::Error { code, .. }) if code == "match_not_found"
        ));

        a.handle(ClientMsg::MatchData {
            op_code: OpCode::Move.as_i64(),
            data: "{}".to_string(),
        })
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerMsg::Error { code, .. }) if code == "not_in_match"
        ));

        a.handle(ClientMsg::Ping { t: 42 }).await;
        assert!(matches!(rx.recv().await, Some(ServerMsg::Pong { t: 42 })));
    }
}
