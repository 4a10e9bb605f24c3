// TCP server and main event loop for the relay.
//
// Architecture: one tokio task per concern, funnelled into a single main
// loop that owns all relay state.
//
// - **Main loop** (`run_relay`): owns the `Relay` (sessions keyed by player,
//   the `Rooms` roster) and `select!`s over the listener, finished
//   handshakes, session events and the shutdown signal. Because it is the
//   only task that touches `Relay`, room serials are handed out in one
//   well-defined order.
// - **Handshake tasks** (one per accepted socket): wrap the socket in an
//   `Endpoint`, wait up to `HANDSHAKE_TIMEOUT` for `Hello`, and pass the
//   endpoint back to the main loop.
// - **Session receive loops** (see `session.rs`): forward decoded messages
//   tagged with their session id; report `Dropped` when the transport dies.
//
// Reconnection: a `Hello` for a player who still owns a session pivots the
// new connection onto that session (`Welcome { resumed: true }`), and the
// player's rooms see them present again. A player who drops out of a running
// game keeps their (detached) session for exactly that purpose, until none
// of their games is running any more; anyone else who drops is removed.
//
// Shutdown: `RelayHandle::stop` signals the main loop, which closes every
// session and returns.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gamesync_core::EventBus;
use gamesync_protocol::{ClientMessage, PROTOCOL_VERSION, PlayerId, ServerMessage, UserInfo};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, Inbound};
use crate::error::RelayError;
use crate::room::{Outbox, Rooms};
use crate::session::{PlayerSlot, Session, SessionEvent, SessionId, SessionState};

/// How long a new connection may take to say `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for starting a relay server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// A session with no inbound traffic for this long is dropped.
    pub idle_timeout_secs: u64,
    /// Upper bound on room capacity.
    pub max_players: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7878,
            idle_timeout_secs: 300,
            max_players: 8,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Connection lifecycle notifications, fired from the main loop.
#[derive(Default)]
pub struct RelayEvents {
    pub connected: EventBus<PlayerId>,
    pub dropped: EventBus<PlayerId>,
    pub pivoted: EventBus<PlayerId>,
    /// A detached session was discarded because its player has no running
    /// game left to come back to.
    pub retired: EventBus<PlayerId>,
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    events: Arc<RelayEvents>,
}

impl RelayHandle {
    pub fn events(&self) -> &Arc<RelayEvents> {
        &self.events
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Start the relay on a background task. Returns a handle for stopping it
/// and the bound address (useful with port 0).
pub async fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let events = Arc::new(RelayEvents::default());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_relay(listener, config, Arc::clone(&events), shutdown_rx));
    info!(%addr, "relay listening");
    Ok((
        RelayHandle {
            shutdown: Some(shutdown_tx),
            task,
            events,
        },
        addr,
    ))
}

/// A connection that completed its handshake.
struct Greeting {
    endpoint: Endpoint,
    protocol_version: u32,
    player_id: PlayerId,
    name: String,
}

async fn run_relay(
    listener: TcpListener,
    config: RelayConfig,
    events: Arc<RelayEvents>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (greet_tx, mut greet_rx) = mpsc::unbounded_channel::<Greeting>();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let mut relay = Relay::new(&config, session_tx, events);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    tokio::spawn(handshake(stream, greet_tx.clone()));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            Some(greeting) = greet_rx.recv() => relay.on_greeting(greeting).await,
            Some((sid, event)) = session_rx.recv() => relay.on_session_event(sid, event).await,
        }
    }

    relay.shutdown();
    info!("relay stopped");
}

/// Wait for `Hello` on a new connection.
async fn handshake(stream: TcpStream, greetings: mpsc::UnboundedSender<Greeting>) {
    let mut endpoint = match Endpoint::new(stream) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            debug!(%err, "connection lost before handshake");
            return;
        }
    };
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, endpoint.recv()).await;
    match first {
        Ok(Some(Inbound::Message(ClientMessage::Hello {
            protocol_version,
            player_id,
            name,
        }))) => {
            let _ = greetings.send(Greeting {
                endpoint,
                protocol_version,
                player_id,
                name,
            });
        }
        Ok(Some(_)) => {
            warn!(peer = %endpoint.peer(), "expected Hello as first message");
            endpoint.send(ServerMessage::Rejected {
                reason: "expected Hello".into(),
            });
        }
        Ok(None) => debug!(peer = %endpoint.peer(), "connection closed during handshake"),
        Err(_) => debug!(peer = %endpoint.peer(), "handshake timed out"),
    }
}

/// All relay state. Only the main loop touches it.
struct Relay {
    sessions: BTreeMap<PlayerId, Session>,
    rooms: Rooms,
    next_session: u64,
    idle_timeout: Duration,
    session_tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    events: Arc<RelayEvents>,
}

impl Relay {
    fn new(
        config: &RelayConfig,
        session_tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
        events: Arc<RelayEvents>,
    ) -> Self {
        Self {
            sessions: BTreeMap::new(),
            rooms: Rooms::new(config.max_players),
            next_session: 1,
            idle_timeout: config.idle_timeout(),
            session_tx,
            events,
        }
    }

    async fn on_greeting(&mut self, greeting: Greeting) {
        let Greeting {
            endpoint,
            protocol_version,
            player_id,
            name,
        } = greeting;

        if protocol_version != PROTOCOL_VERSION {
            let err = RelayError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: protocol_version,
            };
            warn!(peer = %endpoint.peer(), %player_id, %err, "rejecting client");
            endpoint.send(ServerMessage::Rejected {
                reason: err.to_string(),
            });
            return;
        }

        let sid = SessionId(self.next_session);
        self.next_session += 1;
        let slot = PlayerSlot {
            player_id,
            name: name.clone(),
        };
        let mut fresh = Session::new(sid, slot, endpoint, self.session_tx.clone(), self.idle_timeout);

        match self.sessions.get_mut(&player_id) {
            Some(existing) => {
                if let Err(err) = fresh.pivot_to(existing).await {
                    warn!(%player_id, %err, "pivot failed");
                    return;
                }
                existing.write(ServerMessage::Welcome {
                    player_id,
                    resumed: true,
                });
                info!(%player_id, session = %existing.id(), "player resumed");
                let outbox = self.rooms.set_presence(player_id, true);
                self.deliver(outbox);
                self.events.pivoted.emit(player_id);
            }
            None => {
                fresh.serve();
                fresh.write(ServerMessage::Welcome {
                    player_id,
                    resumed: false,
                });
                info!(%player_id, %name, session = %sid, "player connected");
                self.sessions.insert(player_id, fresh);
                self.events.connected.emit(player_id);
            }
        }
    }

    async fn on_session_event(&mut self, sid: SessionId, event: SessionEvent) {
        let Some(player) = self.owner(sid) else {
            debug!(session = %sid, ?event, "event from retired session");
            return;
        };
        match event {
            SessionEvent::Message(msg) => self.on_message(player, msg),
            SessionEvent::Dropped { generation } => {
                let current = self.sessions.get(&player).map(Session::generation);
                if current == Some(generation) {
                    self.on_dropped(player).await;
                } else {
                    debug!(%player, generation, "ignoring drop of a replaced connection");
                }
            }
        }
    }

    fn owner(&self, sid: SessionId) -> Option<PlayerId> {
        self.sessions
            .values()
            .find(|s| s.id() == sid)
            .map(Session::player_id)
    }

    async fn on_dropped(&mut self, player: PlayerId) {
        if self.rooms.in_running_game(player) {
            if let Some(session) = self.sessions.get_mut(&player) {
                session.detach().await;
            }
            info!(%player, "player dropped mid-game; keeping their session");
            let outbox = self.rooms.set_presence(player, false);
            self.deliver(outbox);
        } else {
            if let Some(mut session) = self.sessions.remove(&player) {
                session.close();
            }
            info!(%player, "player dropped");
            let outbox = self.rooms.leave_all(player);
            self.deliver(outbox);
        }
        self.events.dropped.emit(player);
    }

    fn on_message(&mut self, player: PlayerId, msg: ClientMessage) {
        let user = UserInfo {
            id: player,
            name: self
                .sessions
                .get(&player)
                .map(|s| s.slot().name.clone())
                .unwrap_or_default(),
        };
        let result: Result<Outbox, RelayError> = match msg {
            ClientMessage::CreateGame {
                name,
                mode,
                capacity,
                params,
            } => Ok(self.rooms.create(user, name, mode, capacity, params).1),
            ClientMessage::JoinGame { gid } => self.rooms.join(gid, user),
            ClientMessage::StartGame { gid } => self.rooms.start(gid, player),
            ClientMessage::GameData { gid, tag, data, .. } => {
                match self.rooms.echo(gid, player, &tag, data) {
                    Ok(outbox) => Ok(outbox),
                    Err(err) => {
                        warn!(%gid, %player, %tag, %err, "dropping game data");
                        Ok(Outbox::new())
                    }
                }
            }
            ClientMessage::Reveal { gid, to, sync, data } => {
                self.rooms.reveal(gid, player, &to, sync, data)
            }
            ClientMessage::Resume { gid, after } => match self.rooms.resume(gid, player, after) {
                Ok(outbox) => Ok(outbox),
                Err(err) => {
                    debug!(%gid, %player, %err, "nothing to resume");
                    Ok(vec![(player, ServerMessage::GameLeft { gid })])
                }
            },
            ClientMessage::GameFinished { gid, winners } => {
                self.rooms.finish(gid, player, winners)
            }
            ClientMessage::LeaveGame { gid } => self.rooms.leave(gid, player),
            ClientMessage::Goodbye => {
                info!(%player, "player said goodbye");
                if let Some(mut session) = self.sessions.remove(&player) {
                    session.close();
                }
                Ok(self.rooms.leave_all(player))
            }
            ClientMessage::Hello { .. } => {
                warn!(%player, "ignoring repeated Hello");
                Ok(Outbox::new())
            }
        };

        match result {
            Ok(outbox) => self.deliver(outbox),
            Err(err) => {
                debug!(%player, %err, "request rejected");
                self.send_to(
                    player,
                    ServerMessage::Rejected {
                        reason: err.to_string(),
                    },
                );
            }
        }
        self.retire_detached();
    }

    /// Close detached sessions whose player has no running game left.
    fn retire_detached(&mut self) {
        let stranded: Vec<PlayerId> = self
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Detached)
            .map(Session::player_id)
            .filter(|player| !self.rooms.in_running_game(*player))
            .collect();
        for player in stranded {
            if let Some(mut session) = self.sessions.remove(&player) {
                session.close();
            }
            info!(%player, "retiring detached session");
            self.events.retired.emit(player);
        }
    }

    fn send_to(&self, player: PlayerId, msg: ServerMessage) {
        if let Some(session) = self.sessions.get(&player) {
            if session.state() == SessionState::Serving {
                session.write(msg);
            }
        }
    }

    fn deliver(&self, outbox: Outbox) {
        for (player, msg) in outbox {
            self.send_to(player, msg);
        }
    }

    fn shutdown(&mut self) {
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
    }
}
