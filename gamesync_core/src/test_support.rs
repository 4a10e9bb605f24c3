// In-process stand-ins for the relay and for players, shared by the unit
// tests of this crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gamesync_protocol::{DataTag, GameId, PlayerId};
use serde_json::Value;

use crate::dispatch::{EventHandler, HandlerRef};
use crate::error::{GameError, InputError};
use crate::event_bus::Flow;
use crate::game::{ACTION_APPLY, Game};
use crate::input::{InputRequest, InputResolver, Inputlet};
use crate::link::Link;
use crate::player::Player;
use crate::rules::Rules;
use crate::sync_log::{Packet, SyncLog};

/// Plays the relay: every request written through it is echoed, as a
/// response, into each attached log in one shared order. Like the relay,
/// only the first packet for a tag goes out.
#[derive(Default)]
pub(crate) struct EchoLink {
    logs: Mutex<Vec<Arc<SyncLog>>>,
    serial: AtomicU64,
    writes: Mutex<Vec<Packet>>,
    delivered: Mutex<HashSet<String>>,
}

impl EchoLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn attach(&self, log: Arc<SyncLog>) {
        self.logs.lock().unwrap().push(log);
    }

    /// Deliver a packet to every attached log as if the relay sent it.
    pub(crate) fn inject(&self, tag: &str, data: Value) {
        if !self.delivered.lock().unwrap().insert(tag.to_string()) {
            return;
        }
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        for log in self.logs.lock().unwrap().iter() {
            log.record(serial, tag, data.clone());
        }
    }

    pub(crate) fn writes(&self) -> Vec<Packet> {
        self.writes.lock().unwrap().clone()
    }
}

impl Link for EchoLink {
    fn write(&self, _gid: GameId, packet: Packet) {
        self.writes.lock().unwrap().push(packet.clone());
        if let Some(response) = packet
            .tag
            .parse::<DataTag>()
            .ok()
            .and_then(|t| t.to_response())
        {
            self.inject(&response.to_string(), packet.data);
        }
    }
}

/// Answers from a fixed table; questions not in the table are never
/// answered.
#[derive(Default)]
pub(crate) struct ScriptedResolver {
    answers: HashMap<(PlayerId, String), Value>,
    delay: Duration,
}

impl ScriptedResolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn answer(mut self, player: u32, op: &str, value: Value) -> Self {
        self.answers.insert((PlayerId(player), op.to_string()), value);
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl InputResolver for ScriptedResolver {
    async fn resolve(&self, request: InputRequest) -> Value {
        let Some(value) = self.answers.get(&(request.actor, request.op.clone())).cloned() else {
            return std::future::pending().await;
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        value
    }
}

/// Answers are plain numbers; `null` declines.
pub(crate) struct Pick;

impl Inputlet for Pick {
    type Output = u64;

    fn op(&self) -> &str {
        "Pick"
    }

    fn parse(&self, actor: PlayerId, data: &Value) -> Result<Option<u64>, InputError> {
        match data {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(n.as_u64()),
            other => Err(InputError::Parse {
                op: "Pick".into(),
                actor,
                reason: format!("expected number, got {other}"),
            }),
        }
    }
}

/// Seating with `me` as the local seat.
pub(crate) fn seats(me: u32, all: &[u32]) -> Vec<Player> {
    all.iter()
        .map(|&id| {
            if id == me {
                Player::Me(PlayerId(id))
            } else {
                Player::Peer(PlayerId(id))
            }
        })
        .collect()
}

#[derive(Debug)]
pub(crate) struct Act {
    pub name: &'static str,
    pub cancelled: bool,
}

impl Act {
    pub(crate) fn named(name: &'static str) -> Self {
        Self {
            name,
            cancelled: false,
        }
    }
}

/// What `TestRules::apply_action` does with the opening action.
pub(crate) enum Script {
    Record,
    /// Apply a nested "child" action from inside the opening one.
    Nested,
    EndWith(Vec<PlayerId>),
    Fail,
    /// Block on an `All` round nobody answers.
    WaitForInput,
    Panic,
}

pub(crate) struct TestRules {
    script: Script,
    trace: Mutex<Vec<String>>,
}

impl TestRules {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            trace: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, entry: String) {
        self.trace.lock().unwrap().push(entry);
    }

    pub(crate) fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rules for TestRules {
    type Event = Act;
    type Params = ();

    fn bootstrap(&self, _game: &Game<Self>, _params: ()) -> Act {
        Act::named("opening")
    }

    async fn apply_action(&self, game: &Game<Self>, action: &mut Act) -> Result<bool, GameError> {
        self.push(format!("apply:{}", action.name));
        match &self.script {
            Script::Record => Ok(true),
            Script::Nested if action.name == "opening" => {
                game.process_action(Act::named("child")).await
            }
            Script::Nested => Ok(true),
            Script::EndWith(winners) => Err(game.end_game(winners.clone())),
            Script::Fail => Err(GameError::rules("table flipped")),
            Script::WaitForInput => {
                let everyone = game.player_ids();
                game.ask_all(&everyone, Pick, Duration::from_secs(3600)).await?;
                Ok(true)
            }
            Script::Panic => panic!("rules bug"),
        }
    }

    fn is_cancelled(&self, action: &Act) -> bool {
        action.cancelled
    }
}

/// Handler that records `name@kind` into the rules' trace.
pub(crate) struct Tracer {
    name: &'static str,
    kinds: Vec<&'static str>,
    before: Vec<&'static str>,
    after: Vec<&'static str>,
    cancel: bool,
}

pub(crate) fn tracer(name: &'static str) -> Tracer {
    Tracer {
        name,
        kinds: vec![ACTION_APPLY],
        before: Vec::new(),
        after: Vec::new(),
        cancel: false,
    }
}

impl Tracer {
    pub(crate) fn kinds(mut self, kinds: &[&'static str]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub(crate) fn before(mut self, name: &'static str) -> Self {
        self.before.push(name);
        self
    }

    pub(crate) fn after(mut self, name: &'static str) -> Self {
        self.after.push(name);
        self
    }

    pub(crate) fn cancelling(mut self) -> Self {
        self.cancel = true;
        self
    }

    pub(crate) fn arc(self) -> HandlerRef<Game<TestRules>, Act> {
        Arc::new(self)
    }
}

#[async_trait]
impl EventHandler<Game<TestRules>, Act> for Tracer {
    fn name(&self) -> &str {
        self.name
    }

    fn interested(&self) -> &[&str] {
        &self.kinds
    }

    fn execute_before(&self) -> &[&str] {
        &self.before
    }

    fn execute_after(&self) -> &[&str] {
        &self.after
    }

    async fn handle(
        &self,
        game: &Game<TestRules>,
        kind: &str,
        mut event: Act,
    ) -> Result<Flow<Act>, GameError> {
        game.rules().push(format!("{}@{kind}", self.name));
        if self.cancel {
            event.cancelled = true;
        }
        Ok(Flow::Continue(event))
    }
}
