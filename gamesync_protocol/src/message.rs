// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by game clients to the relay.
// - `ServerMessage`: sent by the relay to game clients.
//
// Supporting structs (`GameDetail`, `UserInfo`, `PresenceEntry`) are shared by
// both directions. Everything derives `Serialize`/`Deserialize` for JSON
// framing (see `framing.rs`).
//
// Decision and reveal payloads are opaque `serde_json::Value`s. The relay only
// looks at a packet's tag (see `tag.rs`), never at its data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GameId, PlayerId, SyncTag};

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake. A Hello for a player that still owns a session resumes it.
    Hello {
        protocol_version: u32,
        player_id: PlayerId,
        name: String,
    },
    /// Open a new room; the sender becomes its host.
    CreateGame {
        name: String,
        mode: String,
        capacity: u32,
        params: Value,
    },
    JoinGame { gid: GameId },
    /// Host starts the match with the current roster.
    StartGame { gid: GameId },
    /// A decision answer (`I...` tag). Echoed to the room as an `R...` tag.
    GameData {
        gid: GameId,
        serial: u64,
        tag: String,
        data: Value,
    },
    /// Hidden information for specific players, delivered as `Sync:<sync>`.
    Reveal {
        gid: GameId,
        to: Vec<PlayerId>,
        sync: SyncTag,
        data: Value,
    },
    /// Replay room packets with a serial greater than `after`.
    Resume { gid: GameId, after: u64 },
    /// Host reports the final result.
    GameFinished { gid: GameId, winners: Vec<PlayerId> },
    LeaveGame { gid: GameId },
    /// Player is disconnecting gracefully.
    Goodbye,
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted. `resumed` is true when the connection was pivoted
    /// onto an existing session.
    Welcome { player_id: PlayerId, resumed: bool },
    /// Handshake or request rejected.
    Rejected { reason: String },
    GameJoined { game: GameDetail },
    RoomUsers { gid: GameId, users: Vec<UserInfo> },
    GameStarted { game: GameDetail },
    PlayerPresence {
        gid: GameId,
        presence: Vec<PresenceEntry>,
    },
    /// A packet in the room's arrival order.
    GameData {
        gid: GameId,
        serial: u64,
        tag: String,
        data: Value,
    },
    /// Everything up to `through` has been replayed after a `Resume`.
    Resumed { gid: GameId, through: u64 },
    GameLeft { gid: GameId },
    GameEnded { gid: GameId, winners: Vec<PlayerId> },
}

/// Public description of a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameDetail {
    pub gid: GameId,
    pub name: String,
    pub mode: String,
    pub host: PlayerId,
    /// Seating order once the game has started.
    pub users: Vec<UserInfo>,
    pub params: Value,
}

/// Public identity of a player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: PlayerId,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub player_id: PlayerId,
    pub present: bool,
}
