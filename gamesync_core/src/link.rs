// Outbound seam between a game and whatever carries its packets.
//
// A game only ever writes decision answers. Writes are fire-and-forget: the
// answer becomes visible to the game itself when the relay's echo comes back
// through the sync log, exactly like everyone else's.

use gamesync_protocol::GameId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sync_log::Packet;

pub trait Link: Send + Sync + 'static {
    fn write(&self, gid: GameId, packet: Packet);
}

/// Drops every write. Used by observers and replays.
pub struct NullLink;

impl Link for NullLink {
    fn write(&self, gid: GameId, packet: Packet) {
        debug!(%gid, tag = %packet.tag, "no link; dropping outbound packet");
    }
}

/// Forwards writes into a channel drained by a connection task.
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<(GameId, Packet)>,
}

impl ChannelLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(GameId, Packet)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Link for ChannelLink {
    fn write(&self, gid: GameId, packet: Packet) {
        if self.tx.send((gid, packet)).is_err() {
            debug!(%gid, "link receiver gone; dropping outbound packet");
        }
    }
}
