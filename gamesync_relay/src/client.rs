// TCP client for connecting to the relay.
//
// `connect()` performs the TCP connect and the Hello/Welcome handshake, then
// splits the stream between two background tasks:
// - a reader task that decodes `ServerMessage` frames into an inbox channel
//   (the channel closes when the connection does);
// - a writer task that drains an outbound `ClientMessage` channel.
//
// Callers never block on the socket: `send` only queues, `recv` awaits the
// inbox and `poll` drains it without waiting. `GameClient` (see
// `game_client.rs`) builds on this to run games.

use std::time::Duration;

use gamesync_protocol::{
    ClientMessage, PROTOCOL_VERSION, PlayerId, ServerMessage, recv_json, send_json,
};
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RelayError;

/// How long `connect` waits for the relay's answer to `Hello`.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetClient {
    player_id: PlayerId,
    resumed: bool,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbox: mpsc::UnboundedReceiver<ServerMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl NetClient {
    /// Connect, say `Hello`, and wait for `Welcome`.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        player_id: PlayerId,
        name: &str,
    ) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_id,
            name: name.to_string(),
        };
        send_json(&mut writer, &hello).await?;

        let reply = tokio::time::timeout(WELCOME_TIMEOUT, recv_json::<_, ServerMessage>(&mut reader))
            .await
            .map_err(|_| RelayError::Handshake("no reply to Hello".into()))??
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        let resumed = match reply {
            ServerMessage::Welcome { resumed, .. } => resumed,
            ServerMessage::Rejected { reason } => return Err(RelayError::Rejected(reason)),
            other => return Err(RelayError::Handshake(format!("{other:?}"))),
        };

        let (in_tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                match recv_json::<_, ServerMessage>(&mut reader).await {
                    Ok(Ok(msg)) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Err(err)) => warn!(%err, "skipping malformed server message"),
                    Err(err) => {
                        debug!(%err, "relay connection closed");
                        break;
                    }
                }
            }
        });

        let (outbound, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = send_json(&mut writer, &msg).await {
                    debug!(%err, "relay write failed");
                    break;
                }
            }
        });

        Ok(Self {
            player_id,
            resumed,
            outbound,
            inbox,
            reader,
            writer,
        })
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Whether the relay pivoted this connection onto an existing session.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// A handle for queueing messages independently of this client.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), RelayError> {
        self.outbound.send(msg).map_err(|_| RelayError::Disconnected)
    }

    /// Next message from the relay, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbox.recv().await
    }

    /// Drain all queued server messages without waiting.
    pub fn poll(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Say `Goodbye` and wait for queued messages to go out.
    pub async fn disconnect(self) {
        let _ = self.outbound.send(ClientMessage::Goodbye);
        let Self {
            outbound,
            reader,
            writer,
            ..
        } = self;
        drop(outbound);
        let _ = writer.await;
        reader.abort();
    }

    /// Cut the connection without saying goodbye, as a network failure
    /// would.
    pub fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Split into the outbound sender and the inbox. The background tasks
    /// keep running until the connection closes.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
        ConnectionTasks,
    ) {
        (
            self.outbound,
            self.inbox,
            ConnectionTasks {
                reader: self.reader,
                writer: self.writer,
            },
        )
    }
}

/// The background tasks of a split `NetClient`.
pub struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionTasks {
    /// Cut the connection.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}
