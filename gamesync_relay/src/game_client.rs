// A relay client that runs games.
//
// `GameClient` wraps a `NetClient` connection with the machinery that turns
// relay traffic into running games:
//
// - A pump task reads the inbox. `GameStarted` builds a `Game` (the local
//   player seated as `Player::Me`, everyone else as `Player::Peer`) from a
//   rules factory and starts it; `GameData` goes into that game's sync log;
//   `PlayerPresence` updates presence; `GameLeft` kills the game. Everything
//   else, plus copies of lobby and lifecycle messages, is forwarded to the
//   owner as a notice.
// - Games write their decision answers through a `ClientLink`, which sends
//   them on whatever connection is current.
// - When a game hosted by this client finishes, the result is reported to
//   the relay (`GameFinished`).
// - Each game's `ended` and `crashed` events feed a `watch` channel, which
//   is what `outcome` waits on.
//
// Reconnection: `reconnect` opens a new connection for the same player. The
// relay pivots it onto the player's old session, and for every running game
// the client asks for a replay after the last serial it recorded. Until the
// relay confirms the replay (`Resumed`), that game's packets are held back
// and then recorded in serial order, so the game sees the same order as
// every other peer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gamesync_core::{
    Game, GameConfig, GameHandle, GameOutcome, InputResolver, Link, Packet, Player, Rules,
};
use gamesync_protocol::{ClientMessage, GameDetail, GameId, PlayerId, ServerMessage, SyncTag};
use serde_json::Value;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ConnectionTasks, NetClient};
use crate::error::RelayError;

/// Builds the rules and their parameters for a started room.
pub type RulesFactory<R> = Box<dyn Fn(&GameDetail) -> (R, <R as Rules>::Params) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound path shared by all games of a client. The sender is swapped on
/// reconnect.
#[derive(Clone)]
struct ClientLink {
    out: Arc<Mutex<mpsc::UnboundedSender<ClientMessage>>>,
}

impl ClientLink {
    fn send(&self, msg: ClientMessage) -> Result<(), RelayError> {
        lock(&self.out)
            .send(msg)
            .map_err(|_| RelayError::Disconnected)
    }

    fn replace(&self, sender: mpsc::UnboundedSender<ClientMessage>) {
        *lock(&self.out) = sender;
    }
}

impl Link for ClientLink {
    fn write(&self, gid: GameId, packet: Packet) {
        let msg = ClientMessage::GameData {
            gid,
            serial: packet.serial,
            tag: packet.tag,
            data: packet.data,
        };
        if self.send(msg).is_err() {
            debug!(%gid, "not connected; answer dropped");
        }
    }
}

/// A started game and the channel its conclusion is published on.
struct Running<R: Rules> {
    handle: GameHandle<R>,
    done: watch::Receiver<Option<GameOutcome>>,
}

struct Shared<R: Rules> {
    me: PlayerId,
    link: ClientLink,
    factory: RulesFactory<R>,
    resolver: Arc<dyn InputResolver>,
    config: GameConfig,
    games: Mutex<BTreeMap<GameId, Running<R>>>,
    /// Packets held back per game until a replay completes.
    resuming: Mutex<BTreeMap<GameId, Vec<(u64, String, Value)>>>,
    notices: mpsc::UnboundedSender<ServerMessage>,
}

impl<R: Rules> Shared<R> {
    fn game(&self, gid: GameId) -> Option<Arc<Game<R>>> {
        lock(&self.games)
            .get(&gid)
            .map(|r| Arc::clone(r.handle.game()))
    }

    fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::GameData {
                gid,
                serial,
                tag,
                data,
            } => {
                if let Some(held) = lock(&self.resuming).get_mut(&gid) {
                    held.push((serial, tag, data));
                    return;
                }
                match self.game(gid) {
                    Some(game) => {
                        game.sync_log().record(serial, &tag, data);
                    }
                    None => debug!(%gid, %tag, "data for unknown game"),
                }
            }
            ServerMessage::Resumed { gid, through } => {
                self.flush_resumed(gid);
                debug!(%gid, through, "replay complete");
            }
            ServerMessage::GameStarted { game } => {
                self.start_game(&game);
                let _ = self.notices.send(ServerMessage::GameStarted { game });
            }
            ServerMessage::PlayerPresence { gid, presence } => {
                if let Some(game) = self.game(gid) {
                    game.set_presence(presence.clone());
                }
                let _ = self.notices.send(ServerMessage::PlayerPresence { gid, presence });
            }
            ServerMessage::GameLeft { gid } => {
                self.flush_resumed(gid);
                if let Some(running) = lock(&self.games).get_mut(&gid) {
                    running.handle.kill();
                }
                let _ = self.notices.send(ServerMessage::GameLeft { gid });
            }
            other => {
                let _ = self.notices.send(other);
            }
        }
    }

    /// Record held-back packets in serial order and stop holding.
    fn flush_resumed(&self, gid: GameId) {
        let Some(mut held) = lock(&self.resuming).remove(&gid) else {
            return;
        };
        let Some(game) = self.game(gid) else {
            return;
        };
        // Live packets that arrived during the replay appear twice.
        held.sort_by_key(|(serial, _, _)| *serial);
        held.dedup_by_key(|(serial, _, _)| *serial);
        let seen = game.sync_log().last_serial();
        for (serial, tag, data) in held.into_iter().filter(|(s, _, _)| *s > seen) {
            game.sync_log().record(serial, &tag, data);
        }
    }

    fn start_game(&self, detail: &GameDetail) {
        if !detail.users.iter().any(|u| u.id == self.me) {
            return;
        }
        let gid = detail.gid;
        let players = detail
            .users
            .iter()
            .map(|u| {
                if u.id == self.me {
                    Player::Me(u.id)
                } else {
                    Player::Peer(u.id)
                }
            })
            .collect();
        let (rules, params) = (self.factory)(detail);
        let game = match Game::builder(gid, rules)
            .players(players)
            .config(self.config.clone())
            .link(Arc::new(self.link.clone()))
            .resolver(Arc::clone(&self.resolver))
            .build()
        {
            Ok(game) => game,
            Err(err) => {
                warn!(%gid, %err, "cannot build game");
                return;
            }
        };

        if detail.host == self.me {
            let link = self.link.clone();
            game.events().ended.listen(move |outcome| {
                if let GameOutcome::Finished { winners } = outcome {
                    let report = ClientMessage::GameFinished {
                        gid,
                        winners: winners.clone(),
                    };
                    if link.send(report).is_err() {
                        warn!(%gid, "could not report result");
                    }
                }
            });
        }

        let (done_tx, done) = watch::channel(None);
        let done_tx = Arc::new(done_tx);
        for bus in [&game.events().ended, &game.events().crashed] {
            let tx = Arc::clone(&done_tx);
            bus.listen(move |outcome| {
                tx.send_replace(Some(outcome.clone()));
            });
        }

        info!(%gid, me = %self.me, "starting game");
        let handle = game.start(params);
        lock(&self.games).insert(gid, Running { handle, done });
    }
}

async fn pump<R: Rules>(shared: Arc<Shared<R>>, mut inbox: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(msg) = inbox.recv().await {
        shared.handle(msg);
    }
    debug!(me = %shared.me, "relay connection ended");
}

pub struct GameClient<R: Rules> {
    name: String,
    shared: Arc<Shared<R>>,
    notices: mpsc::UnboundedReceiver<ServerMessage>,
    pump: JoinHandle<()>,
    connection: ConnectionTasks,
}

impl<R: Rules> GameClient<R> {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        player_id: PlayerId,
        name: &str,
        factory: RulesFactory<R>,
        resolver: Arc<dyn InputResolver>,
        config: GameConfig,
    ) -> Result<Self, RelayError> {
        let client = NetClient::connect(addr, player_id, name).await?;
        let (out, inbox, connection) = client.into_parts();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            me: player_id,
            link: ClientLink {
                out: Arc::new(Mutex::new(out)),
            },
            factory,
            resolver,
            config,
            games: Mutex::new(BTreeMap::new()),
            resuming: Mutex::new(BTreeMap::new()),
            notices: notice_tx,
        });
        let pump = tokio::spawn(pump(Arc::clone(&shared), inbox));
        Ok(Self {
            name: name.to_string(),
            shared,
            notices,
            pump,
            connection,
        })
    }

    pub fn player_id(&self) -> PlayerId {
        self.shared.me
    }

    pub fn create_game(
        &self,
        name: &str,
        mode: &str,
        capacity: u32,
        params: Value,
    ) -> Result<(), RelayError> {
        self.shared.link.send(ClientMessage::CreateGame {
            name: name.to_string(),
            mode: mode.to_string(),
            capacity,
            params,
        })
    }

    pub fn join_game(&self, gid: GameId) -> Result<(), RelayError> {
        self.shared.link.send(ClientMessage::JoinGame { gid })
    }

    pub fn start_game(&self, gid: GameId) -> Result<(), RelayError> {
        self.shared.link.send(ClientMessage::StartGame { gid })
    }

    pub fn leave_game(&self, gid: GameId) -> Result<(), RelayError> {
        self.shared.link.send(ClientMessage::LeaveGame { gid })
    }

    /// Send hidden information to `to`, delivered to them as `Sync:<sync>`.
    pub fn reveal(
        &self,
        gid: GameId,
        to: Vec<PlayerId>,
        sync: SyncTag,
        data: Value,
    ) -> Result<(), RelayError> {
        self.shared
            .link
            .send(ClientMessage::Reveal { gid, to, sync, data })
    }

    /// Report the result of a hosted game. Games started by this client
    /// report on their own when they finish.
    pub fn finish(&self, gid: GameId, winners: Vec<PlayerId>) -> Result<(), RelayError> {
        self.shared
            .link
            .send(ClientMessage::GameFinished { gid, winners })
    }

    pub fn game(&self, gid: GameId) -> Option<Arc<Game<R>>> {
        self.shared.game(gid)
    }

    pub fn games(&self) -> Vec<GameId> {
        lock(&self.shared.games).keys().copied().collect()
    }

    /// Kill a running game locally.
    pub fn kill(&self, gid: GameId) {
        if let Some(running) = lock(&self.shared.games).get_mut(&gid) {
            running.handle.kill();
        }
    }

    /// Wait for a game to conclude and hand back its outcome. The game stays
    /// killable while this waits.
    pub async fn outcome(&self, gid: GameId) -> Option<GameOutcome> {
        let mut done = lock(&self.shared.games).get(&gid)?.done.clone();
        let outcome = done.wait_for(Option::is_some).await.ok()?.clone();
        lock(&self.shared.games).remove(&gid);
        outcome
    }

    /// Next message the pump did not consume on its own.
    pub async fn next_notice(&mut self) -> Option<ServerMessage> {
        self.notices.recv().await
    }

    /// Wait up to `timeout` for a notice `pick` accepts. Notices it declines
    /// are discarded.
    pub async fn wait_for<T>(
        &mut self,
        timeout: Duration,
        mut pick: impl FnMut(&ServerMessage) -> Option<T>,
    ) -> Option<T> {
        tokio::time::timeout(timeout, async {
            while let Some(msg) = self.notices.recv().await {
                if let Some(found) = pick(&msg) {
                    return Some(found);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Cut the connection without telling the relay, as a network failure
    /// would. Games keep running.
    pub fn drop_connection(&mut self) {
        self.connection.abort();
        self.pump.abort();
    }

    /// Open a fresh connection and resume every running game on it.
    ///
    /// Returns whether the relay resumed the old session.
    pub async fn reconnect(&mut self, addr: impl ToSocketAddrs) -> Result<bool, RelayError> {
        self.drop_connection();
        let client = NetClient::connect(addr, self.shared.me, &self.name).await?;
        let resumed = client.resumed();
        let (out, inbox, connection) = client.into_parts();
        self.shared.link.replace(out);
        self.connection = connection;

        let running: Vec<(GameId, u64)> = lock(&self.shared.games)
            .iter()
            .filter(|(_, r)| !r.handle.is_finished())
            .map(|(gid, r)| (*gid, r.handle.game().sync_log().last_serial()))
            .collect();
        {
            let mut resuming = lock(&self.shared.resuming);
            for (gid, _) in &running {
                resuming.insert(*gid, Vec::new());
            }
        }
        self.pump = tokio::spawn(pump(Arc::clone(&self.shared), inbox));
        for (gid, after) in running {
            info!(%gid, after, "resuming game");
            self.shared.link.send(ClientMessage::Resume { gid, after })?;
        }
        Ok(resumed)
    }

    /// Say goodbye and stop every game.
    pub async fn disconnect(self) {
        let _ = self.shared.link.send(ClientMessage::Goodbye);
        for running in lock(&self.shared.games).values_mut() {
            running.handle.kill();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.connection.abort();
        self.pump.abort();
    }
}
