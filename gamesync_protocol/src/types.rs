// Core ID types for the gamesync protocol.
//
// Lightweight newtypes shared by the wire messages (`message.rs`), the tag
// grammar (`tag.rs`), the game core (`gamesync_core`) and the relay. They are
// compact integers so they stay cheap to copy and readable in JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a participant across reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

/// Relay-assigned identifier of a game room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId(pub u64);

/// Per-game monotonic synchronization tag. Allocated by every peer in the
/// same order, so equal tags name the same decision point everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncTag(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
