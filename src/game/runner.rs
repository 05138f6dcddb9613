//! Per-match task that drives a `GameMatch` at its tick rate

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::dispatch::{ChannelDispatcher, OutboundMessage};
use super::label::MatchLabel;
use super::presence::Presence;
use super::r#match::{GameMatch, JoinDecision, TickOutcome};
use super::{MatchError, MatchMessage};

/// Inputs a match task serializes into its state machine
#[derive(Debug)]
pub enum MatchCommand {
    JoinAttempt {
        presence: Presence,
        reply: oneshot::Sender<JoinDecision>,
    },
    Join(Vec<Presence>),
    Leave(Vec<Presence>),
    Data(MatchMessage),
    /// Receiver for everything the match dispatches from now on
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<OutboundMessage>>,
    },
    Signal {
        data: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Terminate {
        grace_secs: u32,
    },
}

/// Handle to a running match. Holds no outbound sender, so subscribers
/// see the channel close once the match task is gone.
#[derive(Clone, Debug)]
pub struct MatchHandle {
    pub id: String,
    pub label: MatchLabel,
    cmd_tx: mpsc::Sender<MatchCommand>,
    occupancy: Arc<AtomicUsize>,
}

impl MatchHandle {
    /// Connected plus joining participants as of the last processed input
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }

    /// Queued behind earlier commands, so a subscribe sent before `join`
    /// sees the join broadcast
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<OutboundMessage>, MatchError> {
        let (reply, rx) = oneshot::channel();
        self.command(MatchCommand::Subscribe { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub async fn join_attempt(&self, presence: Presence) -> Result<JoinDecision, MatchError> {
        let (reply, rx) = oneshot::channel();
        self.command(MatchCommand::JoinAttempt { presence, reply })
            .await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn join(&self, presences: Vec<Presence>) -> Result<(), MatchError> {
        self.command(MatchCommand::Join(presences)).await
    }

    pub async fn leave(&self, presences: Vec<Presence>) -> Result<(), MatchError> {
        self.command(MatchCommand::Leave(presences)).await
    }

    pub async fn send_data(&self, message: MatchMessage) -> Result<(), MatchError> {
        self.command(MatchCommand::Data(message)).await
    }

    pub async fn signal(&self, data: impl Into<String>) -> Result<Option<String>, MatchError> {
        let (reply, rx) = oneshot::channel();
        self.command(MatchCommand::Signal {
            data: data.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn terminate(&self, grace_secs: u32) -> Result<(), MatchError> {
        self.command(MatchCommand::Terminate { grace_secs }).await
    }

    async fn command(&self, cmd: MatchCommand) -> Result<(), MatchError> {
        self.cmd_tx.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> MatchError {
        MatchError::Closed(self.id.clone())
    }
}

/// Why a match task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchExit {
    /// The match asked for no further ticks
    Idle,
    /// The host terminated it
    Terminated,
}

/// Owns the state machine; the only place its callbacks are invoked
pub struct MatchRunner {
    game: GameMatch,
    cmd_rx: mpsc::Receiver<MatchCommand>,
    dispatcher: ChannelDispatcher,
    occupancy: Arc<AtomicUsize>,
    tick_duration: Duration,
    tick: u64,
    /// Data messages waiting for the next tick, in arrival order
    pending: Vec<MatchMessage>,
}

impl MatchRunner {
    pub fn new(game: GameMatch, tick_duration: Duration) -> (Self, MatchHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (outbound_tx, _) = broadcast::channel(64);
        let occupancy = Arc::new(AtomicUsize::new(0));

        let handle = MatchHandle {
            id: game.id().to_string(),
            label: game.label(),
            cmd_tx,
            occupancy: occupancy.clone(),
        };

        let runner = Self {
            game,
            cmd_rx,
            dispatcher: ChannelDispatcher::new(outbound_tx),
            occupancy,
            tick_duration,
            tick: 0,
            pending: Vec::new(),
        };

        (runner, handle)
    }

    /// Run the authoritative tick loop until the match ends
    pub async fn run(mut self) -> MatchExit {
        info!(match_id = %self.game.id(), label = %self.game.label().to_json(), "Match started");

        let mut tick_interval =
            interval_at(Instant::now() + self.tick_duration, self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick += 1;
                    let messages = std::mem::take(&mut self.pending);
                    let outcome = self.game.on_tick(self.tick, messages, &self.dispatcher);
                    if outcome == TickOutcome::Terminate {
                        break MatchExit::Idle;
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(exit) = self.apply(cmd) {
                            break exit;
                        }
                    }
                    None => {
                        debug!(match_id = %self.game.id(), "All match handles dropped");
                        self.game.on_terminate(0);
                        break MatchExit::Terminated;
                    }
                },
            }

            self.occupancy
                .store(self.game.state().occupancy(), Ordering::Relaxed);
        };

        self.occupancy.store(0, Ordering::Relaxed);
        info!(match_id = %self.game.id(), ticks = self.tick, ?exit, "Match ended");
        exit
    }

    fn apply(&mut self, cmd: MatchCommand) -> Option<MatchExit> {
        match cmd {
            MatchCommand::JoinAttempt { presence, reply } => {
                let user_id = presence.user_id.as_str();
                let previous = self.game.state().presences.get(user_id).cloned();
                let decision = self.game.on_join_attempt(&presence);
                if reply.send(decision).is_err() && decision.is_accepted() {
                    // Caller went away before hearing the answer; free the slot
                    self.game.cancel_reservation(user_id, previous);
                }
            }
            MatchCommand::Join(presences) => self.game.on_join(&presences, &self.dispatcher),
            MatchCommand::Leave(presences) => {
                self.pending
                    .retain(|m| presences.iter().all(|p| p.session_id != m.sender.session_id));
                self.game.on_leave(&presences);
            }
            MatchCommand::Data(message) => self.pending.push(message),
            MatchCommand::Subscribe { reply } => {
                let _ = reply.send(self.dispatcher.subscribe());
            }
            MatchCommand::Signal { data, reply } => {
                let _ = reply.send(self.game.on_signal(&data));
            }
            MatchCommand::Terminate { grace_secs } => {
                self.game.on_terminate(grace_secs);
                return Some(MatchExit::Terminated);
            }
        }
        None
    }
}
