// Lifecycle and audit events a game publishes to its embedder.
//
// One `EventBus` per kind. UI layers, replay recorders and tests subscribe to
// these; rules handlers use the ordered dispatcher instead (`dispatch.rs`).

use gamesync_protocol::{GameId, PlayerId, PresenceEntry, SyncTag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_bus::EventBus;

/// Identity of an input transaction as seen by observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: u64,
    pub name: String,
    pub players: Vec<PlayerId>,
    /// Free-form description of the round (offered choices, prompt keys).
    pub mapping: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputStarted {
    pub trans: TransactionInfo,
    pub actor: PlayerId,
    pub sync: SyncTag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputFinished {
    pub trans: TransactionInfo,
    pub actor: PlayerId,
    pub sync: SyncTag,
    /// Raw payload as received.
    pub data: Value,
    /// Whether the payload parsed into a non-null result.
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionNotice {
    pub trans: TransactionInfo,
    pub event: String,
    pub payload: Value,
}

/// How a game task ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameOutcome {
    Finished { winners: Vec<PlayerId> },
    Crashed { reason: String },
    Killed,
}

#[derive(Default)]
pub struct GameEvents {
    pub started: EventBus<GameId>,
    /// Fires once for `Finished` and `Killed`.
    pub ended: EventBus<GameOutcome>,
    /// Fires once for `Crashed`, in place of `ended`.
    pub crashed: EventBus<GameOutcome>,
    pub presence: EventBus<Vec<PresenceEntry>>,
    pub input_started: EventBus<InputStarted>,
    pub input_waiting: EventBus<TransactionInfo>,
    pub input_finished: EventBus<InputFinished>,
    pub input_waited: EventBus<TransactionInfo>,
    pub transaction_begin: EventBus<TransactionInfo>,
    pub transaction_end: EventBus<TransactionInfo>,
    pub transaction_notice: EventBus<TransactionNotice>,
}
