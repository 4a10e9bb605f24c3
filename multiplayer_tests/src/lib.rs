// Test-only game and client for multiplayer integration tests.
//
// Wraps the real `GameClient` (from `gamesync_relay::game_client`) around a
// tiny bidding game, `TallyRules`, to exercise the full pipeline:
// relay room → start → seed agreement → input rounds → end → result report.
//
// `TallyRules` agrees on a seed, then runs a number of all-mode `Bid`
// rounds. Every accepted bid scores its value plus a random bonus from the
// agreed generator; the highest total wins. Each peer writes what it saw into
// a history so tests can compare peers line by line.
//
// `BidResolver` stands in for the player: it bids a fixed amount, never
// answers, or pauses at a chosen round until the test releases it.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gamesync_core::{
    Game, GameConfig, GameError, GameOutcome, InputError, InputRequest, InputResolver, Inputlet,
    Rules,
};
use gamesync_protocol::{GameDetail, GameId, PlayerId, ServerMessage};
use gamesync_relay::GameClient;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::debug;

/// Default timeout for waiting on relay notices.
pub const NOTICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bids above this are clamped.
pub const MAX_BID: u64 = 20;

#[derive(Default)]
pub struct TallyRules {
    history: Mutex<Vec<String>>,
}

impl TallyRules {
    fn note(&self, line: String) {
        debug!(%line, "tally");
        self.history.lock().unwrap().push(line);
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }
}

pub struct Play {
    pub rounds: u32,
}

#[async_trait]
impl Rules for TallyRules {
    type Event = Play;
    type Params = u32;

    fn bootstrap(&self, _game: &Game<Self>, rounds: u32) -> Play {
        Play { rounds }
    }

    async fn apply_action(&self, game: &Game<Self>, action: &mut Play) -> Result<bool, GameError> {
        let seed = game.agree_seed().await?;
        self.note(format!("seed {seed}"));

        let seats = game.player_ids();
        let mut scores: BTreeMap<PlayerId, u64> = seats.iter().map(|id| (*id, 0)).collect();
        for round in 1..=action.rounds {
            let bids = game.ask_all(&seats, Bid, game.config().input_timeout()).await?;
            for (player, bid) in bids {
                let Some(bid) = bid else {
                    self.note(format!("round {round}: {player} silent"));
                    continue;
                };
                let bonus = game.with_rng(|rng| rng.range_u64(0, 3))?;
                *scores.entry(player).or_default() += bid + bonus;
                self.note(format!("round {round}: {player} bid {bid} +{bonus}"));
            }
        }

        let best = scores.values().copied().max().unwrap_or(0);
        let winners: Vec<PlayerId> = scores
            .into_iter()
            .filter(|(_, score)| *score == best)
            .map(|(player, _)| player)
            .collect();
        self.note(format!("winners {winners:?}"));
        Err(game.end_game(winners))
    }
}

/// One bid per player per round.
pub struct Bid;

impl Inputlet for Bid {
    type Output = u64;

    fn op(&self) -> &str {
        "Bid"
    }

    fn parse(&self, actor: PlayerId, data: &Value) -> Result<Option<u64>, InputError> {
        match data {
            Value::Null => Ok(None),
            other => other.as_u64().map(Some).ok_or_else(|| InputError::Parse {
                op: "Bid".into(),
                actor,
                reason: format!("expected a number, got {other}"),
            }),
        }
    }

    fn metadata(&self, _actor: PlayerId) -> Value {
        json!({ "max": MAX_BID })
    }

    fn post_process(&self, _actor: PlayerId, result: Option<u64>) -> Option<u64> {
        result.map(|bid| bid.min(MAX_BID))
    }
}

enum Behavior {
    Fixed(u64),
    Silent,
}

struct Hold {
    at_call: usize,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

/// Scripted stand-in for a player.
pub struct BidResolver {
    behavior: Behavior,
    calls: AtomicUsize,
    hold: Option<Hold>,
}

impl BidResolver {
    /// Bid `base` plus a small amount that depends on the round.
    pub fn fixed(base: u64) -> Self {
        Self {
            behavior: Behavior::Fixed(base),
            calls: AtomicUsize::new(0),
            hold: None,
        }
    }

    /// Never answer.
    pub fn silent() -> Self {
        Self {
            behavior: Behavior::Silent,
            calls: AtomicUsize::new(0),
            hold: None,
        }
    }

    /// Pause on the `at_call`-th request (1-based). `reached` is notified
    /// when the pause begins; notifying `release` lets the answer go.
    pub fn holding(mut self, at_call: usize) -> (Self, Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.hold = Some(Hold {
            at_call,
            reached: Arc::clone(&reached),
            release: Arc::clone(&release),
        });
        (self, reached, release)
    }
}

#[async_trait]
impl InputResolver for BidResolver {
    async fn resolve(&self, request: InputRequest) -> Value {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hold) = self.hold.as_ref().filter(|h| h.at_call == call) {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        match self.behavior {
            Behavior::Fixed(base) => json!(base + request.sync.0 % 5),
            Behavior::Silent => std::future::pending().await,
        }
    }
}

/// A connected player running `TallyRules`.
pub struct TestGameClient {
    pub client: GameClient<TallyRules>,
}

impl TestGameClient {
    pub async fn connect(
        addr: SocketAddr,
        id: u32,
        resolver: BidResolver,
        input_timeout: Duration,
    ) -> Self {
        let config = GameConfig {
            input_timeout_ms: input_timeout.as_millis() as u64,
            ..GameConfig::default()
        };
        let factory = Box::new(|detail: &GameDetail| {
            let rounds = detail.params["rounds"].as_u64().unwrap_or(3) as u32;
            (TallyRules::default(), rounds)
        });
        let client = GameClient::connect(
            addr,
            PlayerId(id),
            &format!("player-{id}"),
            factory,
            Arc::new(resolver),
            config,
        )
        .await
        .expect("TestGameClient::connect failed");
        Self { client }
    }

    /// Open a room for `capacity` players and return its id.
    pub async fn host(&mut self, capacity: u32, rounds: u32) -> GameId {
        self.client
            .create_game("tally", "tally", capacity, json!({ "rounds": rounds }))
            .expect("create_game failed");
        self.client
            .wait_for(NOTICE_TIMEOUT, |m| match m {
                ServerMessage::GameJoined { game } => Some(game.gid),
                _ => None,
            })
            .await
            .expect("timed out waiting for GameJoined")
    }

    pub async fn join(&mut self, gid: GameId) {
        self.client.join_game(gid).expect("join_game failed");
        self.client
            .wait_for(NOTICE_TIMEOUT, |m| {
                matches!(m, ServerMessage::GameJoined { game } if game.gid == gid).then_some(())
            })
            .await
            .expect("timed out waiting for GameJoined");
    }

    /// Host only: wait until `count` players are in the room, then start.
    pub async fn start_when_full(&mut self, gid: GameId, count: usize) {
        self.client
            .wait_for(NOTICE_TIMEOUT, |m| match m {
                ServerMessage::RoomUsers { users, .. } => (users.len() == count).then_some(()),
                _ => None,
            })
            .await
            .expect("room never filled");
        self.client.start_game(gid).expect("start_game failed");
    }

    /// Wait for the local game to start and return it.
    pub async fn started(&mut self, gid: GameId) -> Arc<Game<TallyRules>> {
        self.client
            .wait_for(NOTICE_TIMEOUT, |m| {
                matches!(m, ServerMessage::GameStarted { game } if game.gid == gid).then_some(())
            })
            .await
            .expect("timed out waiting for GameStarted");
        self.client.game(gid).expect("game not running after GameStarted")
    }

    pub async fn outcome(&self, gid: GameId) -> GameOutcome {
        tokio::time::timeout(Duration::from_secs(60), self.client.outcome(gid))
            .await
            .expect("game did not conclude")
            .expect("no such game")
    }

    /// Wait for the relay's announcement of the final result.
    pub async fn ended(&mut self, gid: GameId) -> Vec<PlayerId> {
        self.client
            .wait_for(NOTICE_TIMEOUT, |m| match m {
                ServerMessage::GameEnded { gid: g, winners } if *g == gid => Some(winners.clone()),
                _ => None,
            })
            .await
            .expect("timed out waiting for GameEnded")
    }
}
