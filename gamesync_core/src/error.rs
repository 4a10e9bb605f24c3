// Error types for the game core.
//
// `GameError` is what rules code, handlers and input rounds return. Two of its
// variants are control flow rather than failures: `Ended` unwinds the action
// stack when a rule decides the winners, and `Interrupted` abandons the
// current action chain. The runner (`runner.rs`) treats both as normal.

use gamesync_protocol::PlayerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("timed out waiting for {pattern}")]
    Timeout { pattern: String },
    #[error("sync log closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("single-mode input needs exactly one player, got {count}")]
    SingleRequiresOne { count: usize },
    #[error("player {0} is not seated in this game")]
    NotSeated(PlayerId),
    #[error("cannot parse {op} answer from {actor}: {reason}")]
    Parse {
        op: String,
        actor: PlayerId,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ordering cycle among {kind} handlers: {}", handlers.join(", "))]
    Cycle { kind: String, handlers: Vec<String> },
}

#[derive(Debug, Error)]
pub enum GameError {
    #[error("game ended")]
    Ended { winners: Vec<PlayerId> },
    #[error("action flow interrupted")]
    Interrupted,
    #[error("game rng used before seed agreement")]
    RngNotSeeded,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("rules error: {0}")]
    Rules(String),
}

impl GameError {
    pub fn rules(msg: impl Into<String>) -> Self {
        GameError::Rules(msg.into())
    }
}
