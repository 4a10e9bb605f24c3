// The seam between the synchronization core and concrete game rules.

use async_trait::async_trait;

use crate::error::GameError;
use crate::game::Game;

/// A game's rule content.
///
/// The core owns sequencing (sync tags, input rounds, dispatch order, the
/// game task); the rules own meaning. `Event` is the payload handlers see for
/// every dispatched event kind, actions included.
#[async_trait]
pub trait Rules: Send + Sync + Sized + 'static {
    type Event: Send + 'static;
    type Params: Send + 'static;

    /// Build the opening action from the room's parameters.
    fn bootstrap(&self, game: &Game<Self>, params: Self::Params) -> Self::Event;

    /// Carry out an action that survived `action_before` and `action_apply`.
    ///
    /// Nested actions go through `Game::process_action`. Return
    /// `Err(game.end_game(winners))` to finish the game.
    async fn apply_action(&self, game: &Game<Self>, action: &mut Self::Event) -> Result<bool, GameError>;

    /// Whether a handler cancelled this action.
    fn is_cancelled(&self, _action: &Self::Event) -> bool {
        false
    }
}
