use std::io;

use gamesync_protocol::{GameId, PlayerId, TagError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no game {0}")]
    NoSuchGame(GameId),
    #[error("player {player} is not in game {gid}")]
    NotMember { gid: GameId, player: PlayerId },
    #[error("only the host can do that")]
    NotHost,
    #[error("game {0} already started")]
    AlreadyStarted(GameId),
    #[error("game {0} has not started")]
    NotStarted(GameId),
    #[error("game {0} is full")]
    RoomFull(GameId),
    #[error("bad tag: {0}")]
    BadTag(#[from] TagError),
    #[error("tag {0} is not a request")]
    NotARequest(String),
    #[error("protocol version mismatch: relay speaks {ours}, client {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("session has no transport")]
    NoTransport,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unexpected handshake reply: {0}")]
    Handshake(String),
    #[error("connection closed")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}
