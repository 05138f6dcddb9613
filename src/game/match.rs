//! Match state and the authoritative lifecycle callbacks

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, trace, warn};

use crate::config::{MatchConfig, RejoinPolicy};
use crate::ws::protocol::{Coord, MoveMessage, OpCode, UpdateMessage};

use super::dispatch::MatchDispatcher;
use super::label::MatchLabel;
use super::positions::{PositionRegistry, MAP_EXTENT};
use super::presence::{Presence, PresenceState, PresenceTable};
use super::MatchMessage;

/// Why an admission attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("match full")]
    MatchFull,

    /// Same user already connected or joining, e.g. from a second device
    #[error("already joined")]
    AlreadyJoined,
}

/// Outcome of `GameMatch::on_join_attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Accepted,
    Rejected { reason: Option<RejectReason> },
}

impl JoinDecision {
    fn reject(reason: RejectReason) -> Self {
        Self::Rejected {
            reason: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// What the host should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// No further ticks; tear the match down
    Terminate,
}

/// Match state (owned by the match task)
#[derive(Debug, Clone)]
pub struct MatchState {
    pub positions: PositionRegistry,
    pub presences: PresenceTable,
    /// Admitted connections that have not completed their join
    pub joins_in_progress: usize,
    /// Consecutive ticks with nobody connected or joining
    pub empty_ticks: u64,
    pub label: MatchLabel,
}

impl MatchState {
    pub fn new(label: MatchLabel) -> Self {
        Self {
            positions: PositionRegistry::new(),
            presences: PresenceTable::new(),
            joins_in_progress: 0,
            empty_ticks: 0,
            label,
        }
    }

    /// Connected plus joining participants
    pub fn occupancy(&self) -> usize {
        self.presences.connected_count() + self.joins_in_progress
    }
}

/// The authoritative match. Every callback is invoked sequentially by the host.
pub struct GameMatch {
    id: String,
    config: MatchConfig,
    state: MatchState,
    rng: ChaCha8Rng,
}

impl GameMatch {
    pub fn new(id: impl Into<String>, seed: u64, config: MatchConfig, label: MatchLabel) -> Self {
        Self {
            id: id.into(),
            config,
            state: MatchState::new(label),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn label(&self) -> MatchLabel {
        self.state.label
    }

    /// Admission control for one prospective connection
    pub fn on_join_attempt(&mut self, presence: &Presence) -> JoinDecision {
        let user_id = presence.user_id.as_str();

        let decision = match self.state.presences.get(user_id) {
            Some(PresenceState::Left) => self.admit_rejoin(user_id),
            Some(PresenceState::Connected(_)) | Some(PresenceState::Reserved) => {
                JoinDecision::reject(RejectReason::AlreadyJoined)
            }
            None => {
                if self.is_full() {
                    JoinDecision::reject(RejectReason::MatchFull)
                } else {
                    self.state.joins_in_progress += 1;
                    self.state.presences.reserve(user_id);
                    JoinDecision::Accepted
                }
            }
        };

        debug!(
            match_id = %self.id,
            user_id = %user_id,
            ?decision,
            joins_in_progress = self.state.joins_in_progress,
            "Join attempt"
        );

        decision
    }

    fn admit_rejoin(&mut self, user_id: &str) -> JoinDecision {
        if self.is_full() {
            return JoinDecision::reject(RejectReason::MatchFull);
        }

        self.state.joins_in_progress += 1;
        match self.config.rejoin_policy {
            RejoinPolicy::Accept => {
                self.state.presences.reserve(user_id);
                JoinDecision::Accepted
            }
            RejoinPolicy::Legacy => JoinDecision::Rejected { reason: None },
        }
    }

    fn is_full(&self) -> bool {
        self.state.occupancy() >= self.config.capacity
    }

    /// Presences that completed the handshake after being accepted
    pub fn on_join(&mut self, presences: &[Presence], dispatcher: &dyn MatchDispatcher) {
        for presence in presences {
            self.state.empty_ticks = 0;
            self.state.presences.connect(presence.clone());
            self.state.joins_in_progress = self.state.joins_in_progress.saturating_sub(1);

            let spawn = self.random_position();
            self.state.positions.upsert(&presence.user_id, spawn);

            info!(
                match_id = %self.id,
                user_id = %presence.user_id,
                x = spawn[0],
                y = spawn[1],
                "Player joined match"
            );

            self.broadcast_update(dispatcher);
        }
    }

    /// Undo an accepted admission that was never delivered, putting back
    /// whatever the user had before the attempt
    pub fn cancel_reservation(&mut self, user_id: &str, previous: Option<PresenceState>) {
        if self.state.presences.get(user_id) != Some(&PresenceState::Reserved) {
            return;
        }
        self.state.presences.restore(user_id, previous);
        self.state.joins_in_progress = self.state.joins_in_progress.saturating_sub(1);

        debug!(match_id = %self.id, user_id = %user_id, "Reservation cancelled");
    }

    pub fn on_leave(&mut self, presences: &[Presence]) {
        for presence in presences {
            let user_id = presence.user_id.as_str();
            let previous = self.state.presences.mark_left(user_id);
            if previous == Some(PresenceState::Reserved) {
                self.state.joins_in_progress = self.state.joins_in_progress.saturating_sub(1);
            }
            self.state.positions.remove(user_id);

            info!(match_id = %self.id, user_id = %user_id, "Player left match");
        }
    }

    /// One authoritative step over the messages received since the last tick
    pub fn on_tick(
        &mut self,
        tick: u64,
        messages: Vec<MatchMessage>,
        dispatcher: &dyn MatchDispatcher,
    ) -> TickOutcome {
        trace!(match_id = %self.id, tick, messages = messages.len(), "Running match loop");

        if self.state.occupancy() == 0 {
            self.state.empty_ticks += 1;
            if self.state.empty_ticks >= self.config.max_empty_ticks() {
                info!(match_id = %self.id, tick, "Closing idle match");
                return TickOutcome::Terminate;
            }
        } else {
            self.state.empty_ticks = 0;
        }

        for message in messages {
            match OpCode::try_from(message.op_code) {
                Ok(OpCode::Move) => self.handle_move(message, dispatcher),
                Ok(op_code) => {
                    warn!(match_id = %self.id, ?op_code, "Server-only opcode received from client");
                }
                Err(op_code) => {
                    debug!(match_id = %self.id, op_code, "Unknown opcode");
                }
            }
        }

        self.broadcast_update(dispatcher);
        TickOutcome::Continue
    }

    fn handle_move(&mut self, message: MatchMessage, dispatcher: &dyn MatchDispatcher) {
        let sender = &message.sender;
        let msg: MoveMessage = match serde_json::from_slice(&message.data) {
            Ok(msg) => msg,
            Err(e) => {
                // Only the sender hears about its bad data
                dispatcher.send(std::slice::from_ref(sender), OpCode::Rejected, None);
                debug!(match_id = %self.id, user_id = %sender.user_id, error = %e, "Bad move data");
                return;
            }
        };

        // Coordinates are taken as sent; no bounds check yet
        if !self.state.positions.update(&sender.user_id, msg.position) {
            debug!(
                match_id = %self.id,
                user_id = %sender.user_id,
                "Move from player without a position"
            );
        }
    }

    pub fn on_terminate(&mut self, grace_secs: u32) {
        info!(
            match_id = %self.id,
            grace_secs,
            players = self.state.presences.connected_count(),
            "Match terminating"
        );
    }

    /// Host signals are accepted and ignored
    pub fn on_signal(&mut self, data: &str) -> Option<String> {
        debug!(match_id = %self.id, len = data.len(), "Match signal");
        None
    }

    fn random_position(&mut self) -> Coord {
        [
            self.rng.gen_range(-MAP_EXTENT..=MAP_EXTENT),
            self.rng.gen_range(-MAP_EXTENT..=MAP_EXTENT),
        ]
    }

    fn broadcast_update(&self, dispatcher: &dyn MatchDispatcher) {
        let update = UpdateMessage {
            player_positions: self.state.positions.snapshot(),
        };
        match serde_json::to_string(&update) {
            Ok(json) => dispatcher.broadcast(OpCode::Update, Some(json)),
            Err(e) => warn!(match_id = %self.id, error = %e, "Failed to encode update"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::dispatch::RecordingDispatcher;
    use crate::ws::protocol::PlayerPosition;
    use uuid::Uuid;

    fn new_match() -> GameMatch {
        new_match_with(MatchConfig::default())
    }

    fn new_match_with(config: MatchConfig) -> GameMatch {
        GameMatch::new("match-test", 42, config, MatchLabel::new(false))
    }

    fn presence(user_id: &str) -> Presence {
        Presence::new(user_id, Uuid::new_v4())
    }

    fn join(m: &mut GameMatch, p: &Presence, dispatcher: &RecordingDispatcher) {
        assert_eq!(m.on_join_attempt(p), JoinDecision::Accepted);
        m.on_join(std::slice::from_ref(p), dispatcher);
    }

    fn move_message(sender: &Presence, data: &str) -> MatchMessage {
        MatchMessage {
            sender: sender.clone(),
            op_code: OpCode::Move.as_i64(),
            data: data.as_bytes().to_vec(),
        }
    }

    fn decode_update(data: &Option<String>) -> Vec<PlayerPosition> {
        let update: UpdateMessage = serde_json::from_str(data.as_deref().unwrap()).unwrap();
        update.player_positions.player_ids
    }

    #[test]
    fn fresh_join_attempt_reserves_a_slot() {
        let mut m = new_match();
        let a = presence("a");

        assert_eq!(m.on_join_attempt(&a), JoinDecision::Accepted);
        assert_eq!(m.state().joins_in_progress, 1);
        assert_eq!(m.state().presences.get("a"), Some(&PresenceState::Reserved));
    }

    #[test]
    fn admission_never_exceeds_capacity() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();

        for i in 0..25 {
            let p = presence(&format!("user-{}", i));
            let decision = m.on_join_attempt(&p);
            // Confirm every other admitted player so both counters are exercised
            if decision.is_accepted() && i % 2 == 0 {
                m.on_join(std::slice::from_ref(&p), &dispatcher);
            }
            assert!(m.state().occupancy() <= 10);
        }

        assert_eq!(m.state().occupancy(), 10);
    }

    #[test]
    fn full_match_rejects_newcomers() {
        let mut m = new_match();
        for i in 0..10 {
            assert!(m.on_join_attempt(&presence(&format!("user-{}", i))).is_accepted());
        }

        let before = m.state().joins_in_progress;
        assert_eq!(
            m.on_join_attempt(&presence("late")),
            JoinDecision::Rejected {
                reason: Some(RejectReason::MatchFull)
            }
        );
        assert_eq!(m.state().joins_in_progress, before);
        assert_eq!(m.state().presences.get("late"), None);
    }

    #[test]
    fn connected_user_is_rejected_as_already_joined() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);

        let second_device = presence("a");
        let decision = m.on_join_attempt(&second_device);
        assert_eq!(
            decision,
            JoinDecision::Rejected {
                reason: Some(RejectReason::AlreadyJoined)
            }
        );
        assert_eq!(RejectReason::AlreadyJoined.to_string(), "already joined");
        assert_eq!(RejectReason::MatchFull.to_string(), "match full");
        assert_eq!(m.state().joins_in_progress, 0);
    }

    #[test]
    fn join_assigns_position_and_broadcasts_once_per_player() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        let b = presence("b");

        m.on_join_attempt(&a);
        m.on_join_attempt(&b);
        m.on_join(&[a.clone(), b.clone()], &dispatcher);

        let sent = dispatcher.take();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|msg| msg.op_code == OpCode::Update && msg.recipients.is_none()));
        // First broadcast carries only the first joiner, second carries both
        assert_eq!(decode_update(&sent[0].data).len(), 1);
        assert_eq!(decode_update(&sent[1].data).len(), 2);

        for id in ["a", "b"] {
            let [x, y] = m.state().positions.get(id).unwrap();
            assert!((-100..=100).contains(&x));
            assert!((-100..=100).contains(&y));
        }
        assert_eq!(m.state().joins_in_progress, 0);
        assert_eq!(m.state().presences.connected_count(), 2);
    }

    #[test]
    fn spawn_positions_stay_on_the_board() {
        let mut m = new_match();
        for _ in 0..500 {
            let [x, y] = m.random_position();
            assert!((-MAP_EXTENT..=MAP_EXTENT).contains(&x));
            assert!((-MAP_EXTENT..=MAP_EXTENT).contains(&y));
        }
    }

    #[test]
    fn leave_removes_position_and_leaves_tombstone() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);

        m.on_leave(&[a.clone()]);

        assert!(m.state().positions.is_empty());
        assert_eq!(m.state().presences.get("a"), Some(&PresenceState::Left));
        assert_eq!(m.state().presences.connected_count(), 0);
    }

    #[test]
    fn leaving_while_reserved_releases_the_slot() {
        let mut m = new_match();
        let a = presence("a");
        m.on_join_attempt(&a);
        assert_eq!(m.state().joins_in_progress, 1);

        m.on_leave(&[a]);
        assert_eq!(m.state().joins_in_progress, 0);
    }

    #[test]
    fn cancelled_reservation_restores_prior_state() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();

        let fresh = presence("fresh");
        m.on_join_attempt(&fresh);
        m.cancel_reservation("fresh", None);
        assert_eq!(m.state().presences.get("fresh"), None);
        assert_eq!(m.state().joins_in_progress, 0);

        let a = presence("a");
        join(&mut m, &a, &dispatcher);
        m.on_leave(&[a.clone()]);
        m.on_join_attempt(&a);
        m.cancel_reservation("a", Some(PresenceState::Left));
        assert_eq!(m.state().presences.get("a"), Some(&PresenceState::Left));
        assert_eq!(m.state().joins_in_progress, 0);

        // Only a pending reservation is undone
        let b = presence("b");
        join(&mut m, &b, &dispatcher);
        m.cancel_reservation("b", None);
        assert!(matches!(
            m.state().presences.get("b"),
            Some(PresenceState::Connected(_))
        ));
    }

    #[test]
    fn rejoin_is_accepted_under_default_policy() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);
        m.on_leave(&[a]);

        let back = presence("a");
        assert_eq!(m.on_join_attempt(&back), JoinDecision::Accepted);
        assert_eq!(m.state().joins_in_progress, 1);

        m.on_join(std::slice::from_ref(&back), &dispatcher);
        assert_eq!(m.state().positions.len(), 1);
        assert_eq!(m.state().joins_in_progress, 0);
    }

    #[test]
    fn legacy_rejoin_counts_slot_but_refuses_without_reason() {
        let config = MatchConfig {
            rejoin_policy: RejoinPolicy::Legacy,
            ..MatchConfig::default()
        };
        let mut m = new_match_with(config);
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);
        m.on_leave(&[a.clone()]);

        assert_eq!(
            m.on_join_attempt(&a),
            JoinDecision::Rejected { reason: None }
        );
        assert_eq!(m.state().joins_in_progress, 1);
        assert_eq!(m.state().presences.get("a"), Some(&PresenceState::Left));
    }

    #[test]
    fn rejoin_respects_capacity() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);
        m.on_leave(&[a.clone()]);

        for i in 0..10 {
            assert!(m.on_join_attempt(&presence(&format!("user-{}", i))).is_accepted());
        }

        assert_eq!(
            m.on_join_attempt(&a),
            JoinDecision::Rejected {
                reason: Some(RejectReason::MatchFull)
            }
        );
    }

    #[test]
    fn idle_match_terminates_on_150th_empty_tick() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();

        for tick in 1..150 {
            assert_eq!(m.on_tick(tick, Vec::new(), &dispatcher), TickOutcome::Continue);
        }
        assert_eq!(m.state().empty_ticks, 149);
        assert_eq!(m.on_tick(150, Vec::new(), &dispatcher), TickOutcome::Terminate);
    }

    #[test]
    fn occupied_tick_resets_empty_counter() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();

        for tick in 1..=100 {
            m.on_tick(tick, Vec::new(), &dispatcher);
        }
        assert_eq!(m.state().empty_ticks, 100);

        // A pending join counts as occupied
        let a = presence("a");
        m.on_join_attempt(&a);
        m.on_tick(101, Vec::new(), &dispatcher);
        assert_eq!(m.state().empty_ticks, 0);
    }

    #[test]
    fn tick_broadcasts_update_even_without_messages() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();

        m.on_tick(1, Vec::new(), &dispatcher);
        m.on_tick(2, Vec::new(), &dispatcher);

        assert_eq!(dispatcher.count(OpCode::Update), 2);
    }

    #[test]
    fn malformed_move_is_rejected_to_sender_only() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        let b = presence("b");
        join(&mut m, &a, &dispatcher);
        join(&mut m, &b, &dispatcher);
        let before_a = m.state().positions.get("a");
        dispatcher.take();

        let messages = vec![
            move_message(&a, "{not json"),
            move_message(&b, r#"{"position":[7,-3]}"#),
        ];
        assert_eq!(m.on_tick(1, messages, &dispatcher), TickOutcome::Continue);

        let sent = dispatcher.take();
        let rejected: Vec<_> = sent.iter().filter(|msg| msg.op_code == OpCode::Rejected).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].recipients, Some(vec![a.session_id]));
        assert_eq!(rejected[0].data, None);

        assert_eq!(m.state().positions.get("a"), before_a);
        assert_eq!(m.state().positions.get("b"), Some([7, -3]));
        // End-of-tick update still goes out
        assert_eq!(sent.last().map(|msg| msg.op_code), Some(OpCode::Update));
    }

    #[test]
    fn valid_move_updates_only_the_sender() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        let b = presence("b");
        join(&mut m, &a, &dispatcher);
        join(&mut m, &b, &dispatcher);
        let before_b = m.state().positions.get("b");

        m.on_tick(1, vec![move_message(&a, r#"{"position":[250,-400]}"#)], &dispatcher);

        // Out-of-board values are stored as sent
        assert_eq!(m.state().positions.get("a"), Some([250, -400]));
        assert_eq!(m.state().positions.get("b"), before_b);
        assert_eq!(dispatcher.count(OpCode::Rejected), 0);
    }

    #[test]
    fn unknown_opcodes_are_skipped() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("a");
        join(&mut m, &a, &dispatcher);
        let before = m.state().positions.get("a");
        dispatcher.take();

        let msg = MatchMessage {
            sender: a.clone(),
            op_code: 77,
            data: br#"{"position":[1,1]}"#.to_vec(),
        };
        m.on_tick(1, vec![msg], &dispatcher);

        assert_eq!(m.state().positions.get("a"), before);
        assert_eq!(dispatcher.take().len(), 1);
    }

    #[test]
    fn same_seed_spawns_identically() {
        let dispatcher = RecordingDispatcher::new();
        let mut first = new_match();
        let mut second = new_match();
        let a = presence("a");

        join(&mut first, &a, &dispatcher);
        join(&mut second, &a, &dispatcher);

        assert_eq!(first.state().positions.get("a"), second.state().positions.get("a"));
    }

    #[test]
    fn full_lifecycle_scenario() {
        let mut m = new_match();
        let dispatcher = RecordingDispatcher::new();
        let a = presence("A");

        join(&mut m, &a, &dispatcher);
        assert_eq!(m.state().positions.len(), 1);
        dispatcher.take();

        m.on_tick(1, vec![move_message(&a, r#"{"position":[5,5]}"#)], &dispatcher);
        let sent = dispatcher.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            decode_update(&sent[0].data),
            vec![PlayerPosition {
                player_id: "A".to_string(),
                position: [5, 5],
            }]
        );

        m.on_leave(&[a]);
        assert!(m.state().positions.is_empty());

        let mut outcome = TickOutcome::Continue;
        let mut ticks = 0;
        while outcome == TickOutcome::Continue {
            ticks += 1;
            outcome = m.on_tick(1 + ticks, Vec::new(), &dispatcher);
        }
        assert_eq!(ticks, 150);
    }

    #[test]
    fn signal_is_a_passthrough() {
        let mut m = new_match();
        assert_eq!(m.on_signal("anything"), None);
        m.on_terminate(5);
        assert_eq!(m.state().occupancy(), 0);
    }
}
