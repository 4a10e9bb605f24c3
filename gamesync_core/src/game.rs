// One peer's view of a running game.
//
// `Game` ties the synchronization pieces together for the rules engine:
// seating (`Player::Me` / `Player::Peer`), the sync log, the outbound link,
// the local input resolver, lifecycle events, the ordered dispatcher with its
// per-player capability lists, presence, and the game's seeded random source.
//
// Rules code only ever sees `&Game`. Everything it can call (`emit_event`,
// `process_action`, `user_input` and friends, `reveal`, `get_synctag`,
// `pause`, `with_rng`) keeps every peer's sync tag counter in step as long as
// every peer makes the same calls in the same order. The game task itself
// lives in `runner.rs`.
//
// Dispatch order is rebuilt from scratch whenever the handler set changes:
// game-level handlers first, then each seat's capability list in seating
// order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use gamesync_prng::{GameRng, derive_seed};
use gamesync_protocol::{GameId, InputMode, PlayerId, PresenceEntry, SyncTag};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, trace};

use crate::dispatch::{HandlerRef, OrderedDispatcher};
use crate::error::{DispatchError, GameError, InputError};
use crate::events::{GameEvents, GameOutcome};
use crate::input::{
    InputContext, InputOutcome, InputResolver, InputTransaction, Inputlet, PassResolver, collect,
};
use crate::link::{Link, NullLink};
use crate::player::{self, Player, Syncable};
use crate::rules::Rules;
use crate::sync_log::SyncLog;
use crate::{lock, read, write};

pub const ACTION_BEFORE: &str = "action_before";
pub const ACTION_APPLY: &str = "action_apply";
pub const ACTION_AFTER: &str = "action_after";

/// Operation name of the seed agreement round.
pub const SEED_OP: &str = "Seed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Default time a player gets to answer a decision.
    pub input_timeout_ms: u64,
    /// Propagate undecodable answers as errors instead of treating them as
    /// declines.
    pub debug: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            input_timeout_ms: 25_000,
            debug: false,
        }
    }
}

impl GameConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GamePhase {
    Created,
    Running,
    Ended,
}

pub type GameHandler<R> = HandlerRef<Game<R>, <R as Rules>::Event>;

struct Lifecycle {
    phase: GamePhase,
    winners: Vec<PlayerId>,
}

pub struct Game<R: Rules> {
    id: GameId,
    rules: R,
    players: RwLock<Vec<Player>>,
    me: Option<PlayerId>,
    observe: bool,
    config: GameConfig,
    sync: Arc<SyncLog>,
    link: Arc<dyn Link>,
    resolver: Arc<dyn InputResolver>,
    events: GameEvents,
    handlers: Vec<GameHandler<R>>,
    capabilities: Mutex<BTreeMap<PlayerId, Vec<GameHandler<R>>>>,
    dispatcher: RwLock<Arc<OrderedDispatcher<Game<R>, R::Event>>>,
    presence: Mutex<BTreeMap<PlayerId, bool>>,
    rng: Mutex<Option<GameRng>>,
    lifecycle: Mutex<Lifecycle>,
}

pub struct GameBuilder<R: Rules> {
    id: GameId,
    rules: R,
    players: Vec<Player>,
    observe: bool,
    config: GameConfig,
    sync: Option<Arc<SyncLog>>,
    link: Arc<dyn Link>,
    resolver: Arc<dyn InputResolver>,
    handlers: Vec<GameHandler<R>>,
}

impl<R: Rules> GameBuilder<R> {
    /// Seating order. At most one seat should be `Player::Me`.
    pub fn players(mut self, players: Vec<Player>) -> Self {
        self.players = players;
        self
    }

    pub fn observe(mut self, observe: bool) -> Self {
        self.observe = observe;
        self
    }

    pub fn config(mut self, config: GameConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from an existing log, e.g. a recorded one for replay.
    pub fn sync_log(mut self, log: Arc<SyncLog>) -> Self {
        self.sync = Some(log);
        self
    }

    pub fn link(mut self, link: Arc<dyn Link>) -> Self {
        self.link = link;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register a game-level handler (not tied to any seat).
    pub fn handler(mut self, handler: GameHandler<R>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Arc<Game<R>>, GameError> {
        let dispatcher = OrderedDispatcher::build(self.handlers.clone())?;
        let me = self.players.iter().find(|p| p.is_me()).map(Player::id);
        let presence = self.players.iter().map(|p| (p.id(), true)).collect();
        Ok(Arc::new(Game {
            id: self.id,
            rules: self.rules,
            players: RwLock::new(self.players),
            me,
            observe: self.observe,
            config: self.config,
            sync: self.sync.unwrap_or_default(),
            link: self.link,
            resolver: self.resolver,
            events: GameEvents::default(),
            handlers: self.handlers,
            capabilities: Mutex::new(BTreeMap::new()),
            dispatcher: RwLock::new(Arc::new(dispatcher)),
            presence: Mutex::new(presence),
            rng: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                phase: GamePhase::Created,
                winners: Vec::new(),
            }),
        }))
    }
}

impl<R: Rules> Game<R> {
    pub fn builder(id: GameId, rules: R) -> GameBuilder<R> {
        GameBuilder {
            id,
            rules,
            players: Vec::new(),
            observe: false,
            config: GameConfig::default(),
            sync: None,
            link: Arc::new(NullLink),
            resolver: Arc::new(PassResolver),
            handlers: Vec::new(),
        }
    }

    pub fn id(&self) -> GameId {
        self.id
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn me(&self) -> Option<PlayerId> {
        self.me
    }

    pub fn is_observer(&self) -> bool {
        self.observe
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn sync_log(&self) -> &Arc<SyncLog> {
        &self.sync
    }

    pub fn events(&self) -> &GameEvents {
        &self.events
    }

    pub fn players(&self) -> Vec<Player> {
        read(&self.players).clone()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        read(&self.players).iter().map(Player::id).collect()
    }

    pub fn player(&self, id: PlayerId) -> Option<Player> {
        read(&self.players).iter().copied().find(|p| p.id() == id)
    }

    pub fn phase(&self) -> GamePhase {
        lock(&self.lifecycle).phase
    }

    pub fn is_ended(&self) -> bool {
        self.phase() == GamePhase::Ended
    }

    pub fn winners(&self) -> Vec<PlayerId> {
        lock(&self.lifecycle).winners.clone()
    }

    /// Allocate the next sync tag.
    pub fn get_synctag(&self) -> SyncTag {
        self.sync.next_tag()
    }

    /// Record the winners and return the error that unwinds to the runner.
    pub fn end_game(&self, winners: Vec<PlayerId>) -> GameError {
        lock(&self.lifecycle).winners = winners.clone();
        GameError::Ended { winners }
    }

    pub async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run `kind` through the current dispatcher.
    pub async fn emit_event(&self, kind: &str, event: R::Event) -> Result<R::Event, GameError> {
        let dispatcher = Arc::clone(&*read(&self.dispatcher));
        dispatcher.dispatch(self, kind, event).await
    }

    /// Run an action through `action_before`, `action_apply`, the rules'
    /// `apply_action`, and `action_after`. Returns `false` if a handler
    /// cancelled it.
    pub async fn process_action(&self, action: R::Event) -> Result<bool, GameError> {
        let action = self.emit_event(ACTION_BEFORE, action).await?;
        if self.rules.is_cancelled(&action) {
            trace!(gid = %self.id, "action cancelled before apply");
            return Ok(false);
        }
        let mut action = self.emit_event(ACTION_APPLY, action).await?;
        if self.rules.is_cancelled(&action) {
            trace!(gid = %self.id, "action cancelled at apply");
            return Ok(false);
        }
        let applied = self.rules.apply_action(self, &mut action).await?;
        self.emit_event(ACTION_AFTER, action).await?;
        Ok(applied)
    }

    /// Replace a seat's capability handlers (e.g. after a character switch)
    /// and rebuild the dispatch order. On a constraint cycle the previous
    /// list and order stay in force.
    pub fn set_capabilities(
        &self,
        player: PlayerId,
        handlers: Vec<GameHandler<R>>,
    ) -> Result<(), DispatchError> {
        let mut caps = lock(&self.capabilities);
        let previous = caps.insert(player, handlers);
        match self.build_dispatcher(&caps) {
            Ok(dispatcher) => {
                *write(&self.dispatcher) = Arc::new(dispatcher);
                Ok(())
            }
            Err(err) => {
                match previous {
                    Some(list) => caps.insert(player, list),
                    None => caps.remove(&player),
                };
                Err(err)
            }
        }
    }

    /// Rebuild the dispatch order from the current handler set.
    pub fn refresh_dispatcher(&self) -> Result<(), DispatchError> {
        let caps = lock(&self.capabilities);
        let dispatcher = self.build_dispatcher(&caps)?;
        *write(&self.dispatcher) = Arc::new(dispatcher);
        Ok(())
    }

    /// Handler names in dispatch order for `kind`.
    pub fn dispatch_order(&self, kind: &str) -> Vec<String> {
        read(&self.dispatcher)
            .order_for(kind)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn build_dispatcher(
        &self,
        caps: &BTreeMap<PlayerId, Vec<GameHandler<R>>>,
    ) -> Result<OrderedDispatcher<Game<R>, R::Event>, DispatchError> {
        let mut all = self.handlers.clone();
        for id in self.player_ids() {
            if let Some(list) = caps.get(&id) {
                all.extend(list.iter().cloned());
            }
        }
        OrderedDispatcher::build(all)
    }

    // -----------------------------------------------------------------------
    // Input and reveal
    // -----------------------------------------------------------------------

    pub fn input_context(&self) -> InputContext<'_> {
        InputContext {
            gid: self.id,
            log: &self.sync,
            events: &self.events,
            link: &self.link,
            resolver: &self.resolver,
            me: self.me,
            observe: self.observe,
            debug: self.config.debug,
        }
    }

    /// Open a transaction grouping several input rounds.
    pub fn transaction(
        &self,
        name: impl Into<String>,
        players: Vec<PlayerId>,
        mapping: Value,
    ) -> InputTransaction<'_> {
        InputTransaction::open(&self.events, name, players, mapping)
    }

    /// Ask `players` for a decision. Every target must be seated.
    pub async fn user_input<I: Inputlet>(
        &self,
        players: &[PlayerId],
        inputlet: I,
        timeout: Duration,
        mode: InputMode,
        trans: Option<&InputTransaction<'_>>,
    ) -> Result<InputOutcome<I::Output>, GameError> {
        if let Some(stranger) = players.iter().find(|id| self.player(**id).is_none()) {
            return Err(InputError::NotSeated(*stranger).into());
        }
        collect(self.input_context(), players, inputlet, timeout, mode, trans).await
    }

    pub async fn ask_single<I: Inputlet>(
        &self,
        player: PlayerId,
        inputlet: I,
        timeout: Duration,
    ) -> Result<Option<I::Output>, GameError> {
        self.user_input(&[player], inputlet, timeout, InputMode::Single, None)
            .await
            .map(InputOutcome::into_single)
    }

    pub async fn ask_any<I: Inputlet>(
        &self,
        players: &[PlayerId],
        inputlet: I,
        timeout: Duration,
    ) -> Result<Option<(PlayerId, I::Output)>, GameError> {
        self.user_input(players, inputlet, timeout, InputMode::Any, None)
            .await
            .map(InputOutcome::into_any)
    }

    pub async fn ask_all<I: Inputlet>(
        &self,
        players: &[PlayerId],
        inputlet: I,
        timeout: Duration,
    ) -> Result<Vec<(PlayerId, Option<I::Output>)>, GameError> {
        self.user_input(players, inputlet, timeout, InputMode::All, None)
            .await
            .map(InputOutcome::into_all)
    }

    /// Reveal `obj` to the seated player `to`.
    pub async fn reveal<T: Syncable + Send>(&self, to: PlayerId, obj: &mut T) -> Result<(), GameError> {
        let seat = self.player(to).ok_or(InputError::NotSeated(to))?;
        seat.reveal(&self.sync, obj).await
    }

    /// Reveal `obj` to every seat in order.
    pub async fn reveal_to_all<T: Syncable + Send>(&self, obj: &mut T) -> Result<(), GameError> {
        let seats = self.players();
        player::reveal_to(&seats, &self.sync, obj).await
    }

    // -----------------------------------------------------------------------
    // Randomness
    // -----------------------------------------------------------------------

    /// Agree on a seed with every seat and install the game's generator.
    ///
    /// Each seat contributes through an `All` round; seats that do not answer
    /// contribute zero.
    pub async fn agree_seed(&self) -> Result<u64, GameError> {
        let seats = self.player_ids();
        let contributions: Vec<u64> = self
            .ask_all(&seats, SeedContribution, self.config.input_timeout())
            .await?
            .into_iter()
            .map(|(_, c)| c.unwrap_or(0))
            .collect();
        let seed = derive_seed(&contributions);
        *lock(&self.rng) = Some(GameRng::new(seed));
        info!(gid = %self.id, seed, "seed agreed");
        Ok(seed)
    }

    /// Draw from the agreed generator.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut GameRng) -> T) -> Result<T, GameError> {
        let mut guard = lock(&self.rng);
        let rng = guard.as_mut().ok_or(GameError::RngNotSeeded)?;
        Ok(f(rng))
    }

    /// Shuffle the seating order with the agreed generator.
    pub fn reseat(&self) -> Result<(), GameError> {
        let mut seats = self.players();
        self.with_rng(|rng| rng.shuffle(&mut seats))?;
        *write(&self.players) = seats;
        self.refresh_dispatcher()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    pub fn set_presence(&self, entries: Vec<PresenceEntry>) {
        {
            let mut presence = lock(&self.presence);
            for entry in &entries {
                presence.insert(entry.player_id, entry.present);
            }
        }
        self.events.presence.emit(entries);
    }

    /// Unknown players count as dropped.
    pub fn is_dropped(&self, id: PlayerId) -> bool {
        !lock(&self.presence).get(&id).copied().unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Lifecycle (driven by the runner)
    // -----------------------------------------------------------------------

    /// `Created -> Running`. Returns `false` if the game already ran.
    pub(crate) fn begin(&self) -> bool {
        {
            let mut lc = lock(&self.lifecycle);
            if lc.phase != GamePhase::Created {
                return false;
            }
            lc.phase = GamePhase::Running;
        }
        info!(gid = %self.id, players = ?self.player_ids(), "game started");
        self.events.started.emit(self.id);
        true
    }

    /// Finish the game: record the outcome, close the sync log and fire
    /// `ended` or `crashed`. Only the first call has any effect.
    pub(crate) fn conclude(&self, outcome: &GameOutcome) -> bool {
        {
            let mut lc = lock(&self.lifecycle);
            if lc.phase == GamePhase::Ended {
                return false;
            }
            lc.phase = GamePhase::Ended;
            if let GameOutcome::Finished { winners } = outcome {
                lc.winners = winners.clone();
            }
        }
        self.sync.close();
        match outcome {
            GameOutcome::Crashed { reason } => {
                error!(gid = %self.id, %reason, "game crashed");
                self.events.crashed.emit(outcome.clone());
            }
            _ => {
                info!(gid = %self.id, ?outcome, "game ended");
                self.events.ended.emit(outcome.clone());
            }
        }
        true
    }
}

/// Each seat answers the seed round with fresh local entropy.
struct SeedContribution;

impl Inputlet for SeedContribution {
    type Output = u64;

    fn op(&self) -> &str {
        SEED_OP
    }

    fn parse(&self, actor: PlayerId, data: &Value) -> Result<Option<u64>, InputError> {
        match data {
            Value::Null => Ok(None),
            other => other.as_u64().map(Some).ok_or_else(|| InputError::Parse {
                op: SEED_OP.to_string(),
                actor,
                reason: format!("expected u64, got {other}"),
            }),
        }
    }

    fn resolve_locally(&self, _actor: PlayerId) -> Option<Value> {
        Some(json!(fastrand::u64(..)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EchoLink, Script, TestRules, seats, tracer};

    fn game(script: Script, me: u32, all: &[u32]) -> Arc<Game<TestRules>> {
        Game::builder(GameId(1), TestRules::new(script))
            .players(seats(me, all))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn process_action_runs_phases_in_dispatch_order() {
        let g = Game::builder(GameId(1), TestRules::new(Script::Record))
            .players(seats(1, &[1, 2]))
            .handler(tracer("Late").kinds(&[ACTION_APPLY]).after("Early").arc())
            .handler(tracer("Early").kinds(&[ACTION_BEFORE, ACTION_APPLY]).arc())
            .build()
            .unwrap();

        let applied = g.process_action(crate::test_support::Act::named("strike")).await.unwrap();
        assert!(applied);
        assert_eq!(
            g.rules().trace(),
            vec![
                "Early@action_before",
                "Early@action_apply",
                "Late@action_apply",
                "apply:strike"
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_action_is_not_applied() {
        let g = Game::builder(GameId(1), TestRules::new(Script::Record))
            .players(seats(1, &[1]))
            .handler(tracer("Guard").kinds(&[ACTION_BEFORE]).cancelling().arc())
            .build()
            .unwrap();
        let applied = g.process_action(crate::test_support::Act::named("strike")).await.unwrap();
        assert!(!applied);
        assert_eq!(g.rules().trace(), vec!["Guard@action_before"]);
    }

    #[tokio::test]
    async fn capability_switch_recomputes_order() {
        let g = game(Script::Record, 1, &[1, 2]);
        g.set_capabilities(PlayerId(1), vec![tracer("A").arc(), tracer("B").after("A").arc()])
            .unwrap();
        assert_eq!(g.dispatch_order(ACTION_APPLY), vec!["A", "B"]);

        // Player 2 takes a character whose handler must precede A.
        g.set_capabilities(PlayerId(2), vec![tracer("C").before("A").arc()])
            .unwrap();
        assert_eq!(g.dispatch_order(ACTION_APPLY), vec!["C", "A", "B"]);

        // And switches away again.
        g.set_capabilities(PlayerId(2), Vec::new()).unwrap();
        assert_eq!(g.dispatch_order(ACTION_APPLY), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn cyclic_capabilities_are_rejected_and_rolled_back() {
        let g = game(Script::Record, 1, &[1, 2]);
        g.set_capabilities(PlayerId(1), vec![tracer("A").before("B").arc()])
            .unwrap();
        let err = g
            .set_capabilities(PlayerId(2), vec![tracer("B").before("A").arc()])
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cycle { .. }));
        assert_eq!(g.dispatch_order(ACTION_APPLY), vec!["A"]);
    }

    #[tokio::test]
    async fn input_for_unseated_player_is_rejected() {
        let g = game(Script::Record, 1, &[1, 2]);
        let err = g
            .ask_single(PlayerId(9), crate::test_support::Pick, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Input(InputError::NotSeated(PlayerId(9)))));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_agree_on_the_same_seed() {
        let echo = EchoLink::new();
        let build = |me: u32| {
            let g = Game::builder(GameId(4), TestRules::new(Script::Record))
                .players(seats(me, &[1, 2, 3]))
                .link(echo.clone())
                .build()
                .unwrap();
            echo.attach(Arc::clone(g.sync_log()));
            g
        };
        let views = [build(1), build(2), build(3)];

        let (a, b, c) = tokio::join!(
            views[0].agree_seed(),
            views[1].agree_seed(),
            views[2].agree_seed()
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(a, b);
        assert_eq!(b, c);

        let draws: Vec<u64> = views
            .iter()
            .map(|g| g.with_rng(|rng| rng.next_u64()).unwrap())
            .collect();
        assert!(draws.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(views[0].sync_log().current_tag(), SyncTag(3));
    }

    #[tokio::test(start_paused = true)]
    async fn reseat_is_identical_across_peers() {
        let echo = EchoLink::new();
        let build = |me: u32| {
            let g = Game::builder(GameId(4), TestRules::new(Script::Record))
                .players(seats(me, &[1, 2, 3, 4, 5]))
                .link(echo.clone())
                .build()
                .unwrap();
            echo.attach(Arc::clone(g.sync_log()));
            g
        };
        let (one, two) = (build(1), build(2));
        // Seats 3..5 belong to nobody here and time out, contributing zero.
        let (x, y) = tokio::join!(one.agree_seed(), two.agree_seed());
        assert_eq!(x.unwrap(), y.unwrap());
        one.reseat().unwrap();
        two.reseat().unwrap();
        assert_eq!(one.player_ids(), two.player_ids());
    }

    #[test]
    fn rng_requires_agreement() {
        let g = game(Script::Record, 1, &[1]);
        assert!(matches!(g.with_rng(|r| r.next_u64()), Err(GameError::RngNotSeeded)));
    }

    #[test]
    fn presence_defaults_and_updates() {
        let g = game(Script::Record, 1, &[1, 2]);
        assert!(!g.is_dropped(PlayerId(2)));
        assert!(g.is_dropped(PlayerId(7)));

        let seen: Arc<Mutex<Vec<PresenceEntry>>> = Arc::default();
        let sink = Arc::clone(&seen);
        g.events()
            .presence
            .listen(move |entries| sink.lock().unwrap().extend(entries.iter().copied()));
        g.set_presence(vec![PresenceEntry {
            player_id: PlayerId(2),
            present: false,
        }]);
        assert!(g.is_dropped(PlayerId(2)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: GameConfig = serde_json::from_str(r#"{"debug": true}"#).unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.input_timeout(), Duration::from_secs(25));
    }
}
