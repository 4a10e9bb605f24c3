// The relay's binding between a player slot and a live connection.
//
// A `Session` owns at most one `Endpoint` at a time. While serving, the
// endpoint lives inside the session's receive loop task, which forwards each
// decoded message to the relay loop as `SessionEvent::Message` (tagged with
// the session id) and skips malformed frames with a warning. The loop ends
// on transport EOF, transport failure or idle timeout, and then emits
// `SessionEvent::Dropped`.
//
// States:
//
//   Fresh ──serve──> Serving ──(loop ends)──> Detached ──close──> Closed
//     │                 │                        ▲
//     │                 └──pivot_to (donor)──────┘
//     └──────────────close──────────────────────────────────────> Closed
//
// The loop can be interrupted with one of two signals:
//
// - `Interrupt::Close` ends it as a drop: the endpoint is discarded and
//   `Dropped` is emitted once.
// - `Interrupt::Pivot` ends it quietly and hands the endpoint back to whoever
//   interrupted it. This is how `pivot_to` moves a transport from one session
//   to another: the donor's loop is stopped and joined before the recipient's
//   new loop starts, so no message is ever delivered through both sessions.
//
// A reconnecting player gets a fresh session for the new connection, which is
// immediately pivoted onto the session that still holds the player's place.

use std::time::Duration;

use gamesync_protocol::{ClientMessage, PlayerId, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, Inbound};
use crate::error::RelayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Serving,
    Detached,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    Pivot,
    Close,
}

#[derive(Debug)]
pub enum SessionEvent {
    Message(ClientMessage),
    /// The receive loop started as `generation` ended.
    Dropped { generation: u64 },
}

/// Who a session belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerSlot {
    pub player_id: PlayerId,
    pub name: String,
}

struct ServeTask {
    interrupt: oneshot::Sender<Interrupt>,
    handle: JoinHandle<Option<Endpoint>>,
}

pub struct Session {
    id: SessionId,
    slot: PlayerSlot,
    state: SessionState,
    /// Transport bound but not yet served.
    parked: Option<Endpoint>,
    /// Write side of the transport currently owned by the loop.
    outbound: Option<mpsc::UnboundedSender<ServerMessage>>,
    task: Option<ServeTask>,
    /// Bumped every time a receive loop starts.
    generation: u64,
    events: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    idle_timeout: Duration,
}

impl Session {
    pub fn new(
        id: SessionId,
        slot: PlayerSlot,
        endpoint: Endpoint,
        events: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id,
            slot,
            state: SessionState::Fresh,
            outbound: Some(endpoint.sender()),
            parked: Some(endpoint),
            task: None,
            generation: 0,
            events,
            idle_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn slot(&self) -> &PlayerSlot {
        &self.slot
    }

    pub fn player_id(&self) -> PlayerId {
        self.slot.player_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the current (or last) receive loop. A `Dropped` event
    /// from an older generation is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start the receive loop on the bound transport. No-op without one.
    pub fn serve(&mut self) {
        let Some(endpoint) = self.parked.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        self.outbound = Some(endpoint.sender());
        self.generation += 1;
        let handle = tokio::spawn(receive_loop(
            self.id,
            self.generation,
            endpoint,
            rx,
            self.events.clone(),
            self.idle_timeout,
        ));
        self.task = Some(ServeTask {
            interrupt: tx,
            handle,
        });
        self.state = SessionState::Serving;
    }

    /// Queue a message on the current transport. Returns `false` if there is
    /// none.
    pub fn write(&self, msg: ServerMessage) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Discard the transport and stop the receive loop. Calling it again has
    /// no effect.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.outbound = None;
        self.parked = None;
        if let Some(task) = self.task.take() {
            let _ = task.interrupt.send(Interrupt::Close);
        }
        debug!(session = %self.id, player = %self.slot.player_id, "session closed");
    }

    /// Record that the receive loop ended on its own. The session keeps its
    /// slot so a later connection can pivot onto it.
    pub async fn detach(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(task) = self.task.take() {
            let _ = task.interrupt.send(Interrupt::Close);
            let _ = task.handle.await;
        }
        self.outbound = None;
        self.parked = None;
        self.state = SessionState::Detached;
    }

    /// Move this session's transport to `other` and serve it there.
    ///
    /// If `other` was serving a different transport, that loop is stopped
    /// without a drop and its transport is closed.
    pub async fn pivot_to(&mut self, other: &mut Session) -> Result<(), RelayError> {
        let endpoint = self.take_endpoint().await.ok_or(RelayError::NoTransport)?;
        if self.state != SessionState::Closed {
            self.state = SessionState::Detached;
        }

        if let Some(previous) = other.take_endpoint().await {
            info!(
                session = %other.id,
                peer = %previous.peer(),
                "closing superseded transport"
            );
            drop(previous);
        }
        other.parked = Some(endpoint);
        other.serve();
        info!(from = %self.id, to = %other.id, player = %other.slot.player_id, "session pivoted");
        Ok(())
    }

    /// Reclaim the transport, stopping the receive loop with `Pivot`.
    async fn take_endpoint(&mut self) -> Option<Endpoint> {
        self.outbound = None;
        if let Some(endpoint) = self.parked.take() {
            return Some(endpoint);
        }
        let task = self.task.take()?;
        let _ = task.interrupt.send(Interrupt::Pivot);
        task.handle.await.ok().flatten()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }
}

/// Forward inbound messages until the transport goes away or an interrupt
/// arrives. Returns the endpoint only when interrupted with `Pivot`.
async fn receive_loop(
    id: SessionId,
    generation: u64,
    mut endpoint: Endpoint,
    mut interrupt: oneshot::Receiver<Interrupt>,
    events: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    idle_timeout: Duration,
) -> Option<Endpoint> {
    loop {
        tokio::select! {
            biased;
            signal = &mut interrupt => {
                if let Ok(Interrupt::Pivot) = signal {
                    debug!(session = %id, "receive loop handed off");
                    return Some(endpoint);
                }
                break;
            }
            inbound = tokio::time::timeout(idle_timeout, endpoint.recv()) => match inbound {
                Ok(Some(Inbound::Message(msg))) => {
                    if events.send((id, SessionEvent::Message(msg))).is_err() {
                        break;
                    }
                }
                Ok(Some(Inbound::Malformed(err))) => {
                    warn!(session = %id, peer = %endpoint.peer(), %err, "skipping malformed message");
                }
                Ok(None) => {
                    info!(session = %id, peer = %endpoint.peer(), "transport closed");
                    break;
                }
                Err(_) => {
                    info!(session = %id, peer = %endpoint.peer(), "idle timeout");
                    break;
                }
            },
        }
    }
    let _ = events.send((id, SessionEvent::Dropped { generation }));
    None
}

#[cfg(test)]
mod tests {
    use gamesync_protocol::{GameId, recv_json, send_json, write_message};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    type Events = mpsc::UnboundedReceiver<(SessionId, SessionEvent)>;

    /// A connected (client socket, relay-side endpoint) pair.
    async fn pair() -> (TcpStream, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, Endpoint::new(server).unwrap())
    }

    fn session(
        id: u64,
        endpoint: Endpoint,
        events: &mpsc::UnboundedSender<(SessionId, SessionEvent)>,
    ) -> Session {
        Session::new(
            SessionId(id),
            PlayerSlot {
                player_id: PlayerId(7),
                name: "Ada".into(),
            },
            endpoint,
            events.clone(),
            Duration::from_secs(30),
        )
    }

    fn leave(gid: u64) -> ClientMessage {
        ClientMessage::LeaveGame { gid: GameId(gid) }
    }

    async fn next(events: &mut Events) -> (SessionId, SessionEvent) {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no session event")
            .expect("event channel closed")
    }

    /// Nothing further arrives within a short window.
    async fn quiet(events: &mut Events) -> bool {
        tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn serve_forwards_messages_and_skips_malformed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut client, endpoint) = pair().await;
        let mut s = session(1, endpoint, &tx);
        assert_eq!(s.state(), SessionState::Fresh);
        s.serve();
        assert_eq!(s.state(), SessionState::Serving);

        write_message(&mut client, b"{not json").await.unwrap();
        send_json(&mut client, &leave(3)).await.unwrap();

        let (sid, event) = next(&mut rx).await;
        assert_eq!(sid, SessionId(1));
        assert!(matches!(event, SessionEvent::Message(ClientMessage::LeaveGame { gid: GameId(3) })));
    }

    #[tokio::test]
    async fn transport_loss_emits_dropped_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, endpoint) = pair().await;
        let mut s = session(1, endpoint, &tx);
        s.serve();
        drop(client);

        let (_, event) = next(&mut rx).await;
        assert!(matches!(event, SessionEvent::Dropped { .. }));
        s.detach().await;
        assert_eq!(s.state(), SessionState::Detached);
        assert!(!s.write(ServerMessage::GameLeft { gid: GameId(1) }));
        assert!(quiet(&mut rx).await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_client, endpoint) = pair().await;
        let mut s = session(1, endpoint, &tx);
        s.serve();

        s.close();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);

        let (_, event) = next(&mut rx).await;
        assert!(matches!(event, SessionEvent::Dropped { .. }));
        assert!(quiet(&mut rx).await);
    }

    #[tokio::test]
    async fn idle_session_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_client, endpoint) = pair().await;
        let mut s = Session::new(
            SessionId(4),
            PlayerSlot {
                player_id: PlayerId(1),
                name: "Idle".into(),
            },
            endpoint,
            tx,
            Duration::from_millis(100),
        );
        s.serve();
        let (sid, event) = next(&mut rx).await;
        assert_eq!(sid, SessionId(4));
        assert!(matches!(event, SessionEvent::Dropped { .. }));
    }

    #[tokio::test]
    async fn pivot_onto_detached_session_resumes_serving() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (old_client, old_endpoint) = pair().await;
        let mut owner = session(1, old_endpoint, &tx);
        owner.serve();
        drop(old_client);
        assert!(matches!(next(&mut rx).await.1, SessionEvent::Dropped { .. }));
        owner.detach().await;

        let (mut client, endpoint) = pair().await;
        let mut fresh = session(2, endpoint, &tx);
        fresh.pivot_to(&mut owner).await.unwrap();

        assert_eq!(owner.state(), SessionState::Serving);
        assert_eq!(fresh.state(), SessionState::Detached);
        assert!(!fresh.write(ServerMessage::GameLeft { gid: GameId(1) }));

        // Messages now arrive through the owner.
        send_json(&mut client, &leave(9)).await.unwrap();
        let (sid, event) = next(&mut rx).await;
        assert_eq!(sid, SessionId(1));
        assert!(matches!(event, SessionEvent::Message(_)));

        // And writes go out on the new transport.
        assert!(owner.write(ServerMessage::GameLeft { gid: GameId(5) }));
        let reply: ServerMessage = recv_json(&mut client).await.unwrap().unwrap();
        assert_eq!(reply, ServerMessage::GameLeft { gid: GameId(5) });
    }

    #[tokio::test]
    async fn pivot_onto_serving_session_replaces_its_transport_quietly() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut stale_client, stale_endpoint) = pair().await;
        let mut owner = session(1, stale_endpoint, &tx);
        owner.serve();

        let (mut client, endpoint) = pair().await;
        let mut donor = session(2, endpoint, &tx);
        donor.serve();

        donor.pivot_to(&mut owner).await.unwrap();
        assert_eq!(owner.state(), SessionState::Serving);

        // Neither interrupted loop reported a drop.
        assert!(quiet(&mut rx).await);

        // The superseded transport was closed.
        let closed = tokio::time::timeout(
            Duration::from_secs(5),
            recv_json::<_, ServerMessage>(&mut stale_client),
        )
        .await
        .expect("stale transport still open");
        assert!(closed.is_err());

        send_json(&mut client, &leave(2)).await.unwrap();
        let (sid, _) = next(&mut rx).await;
        assert_eq!(sid, SessionId(1));
    }

    #[tokio::test]
    async fn pivot_without_transport_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_c1, e1) = pair().await;
        let (_c2, e2) = pair().await;
        let mut a = session(1, e1, &tx);
        let mut b = session(2, e2, &tx);
        a.close();
        assert!(matches!(a.pivot_to(&mut b).await, Err(RelayError::NoTransport)));
        assert_eq!(b.state(), SessionState::Fresh);
    }
}
