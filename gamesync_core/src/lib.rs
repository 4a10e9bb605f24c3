// Synchronization core for session-based multiplayer games.
//
// Every peer of a game runs the same rules code against the same stream of
// relay-ordered packets and therefore reaches the same state. This crate
// holds the pieces that make that work:
//
// - `sync_log`:    the per-game packet log, sync tag allocation, and
//                  blocking waits for tag patterns.
// - `input`:       decision rounds (`Single`/`Any`/`All`), transactions, and
//                  the local resolver task.
// - `event_bus`:   synchronous observer lists used for lifecycle and input
//                  notifications.
// - `dispatch`:    ordered handler dispatch with before/after constraints.
// - `player`:      `Me`/`Peer` seats and hidden-information reveals.
// - `game`:        one peer's view of a game: seating, dispatch, input,
//                  seed agreement, presence.
// - `runner`:      the game task, kill, and the exactly-once lifecycle.
// - `rules`:       the trait concrete games implement.
// - `link`:        the outbound seam to the relay.
//
// Nothing here knows about sockets. The relay crate connects a `Game` to a
// server through a `Link` for outbound packets and `SyncLog::record` for
// inbound ones.

pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod game;
pub mod input;
pub mod link;
pub mod player;
pub mod rules;
pub mod runner;
pub mod sync_log;

#[cfg(test)]
mod test_support;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use dispatch::{EventHandler, HandlerRef, OrderedDispatcher};
pub use error::{DispatchError, GameError, InputError, SyncError};
pub use event_bus::{EventBus, Flow, SubscriptionId};
pub use events::{GameEvents, GameOutcome, InputFinished, InputStarted, TransactionInfo};
pub use game::{Game, GameBuilder, GameConfig, GameHandler, GamePhase};
pub use input::{
    InputContext, InputOutcome, InputRequest, InputResolver, InputTransaction, Inputlet,
    PassResolver, collect,
};
pub use link::{ChannelLink, Link, NullLink};
pub use player::{Player, Revealed, Syncable};
pub use rules::Rules;
pub use runner::GameHandle;
pub use sync_log::{Packet, SyncLog};

// A panic while holding one of these locks leaves plain data behind (lists,
// maps, counters), never a half-applied invariant, so poisoning is ignored.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
