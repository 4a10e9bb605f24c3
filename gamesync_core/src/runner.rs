// The game task and its lifecycle.
//
// `Game::start` moves a game from `Created` to `Running` and spawns a
// supervisor task. The supervisor runs the rules in a child task and waits
// for whichever comes first: the rules finishing, or a kill request through
// the `GameHandle`. Whatever happens, the supervisor concludes the game
// exactly once:
//
//   rules returned or `end_game`  -> ended(Finished { winners })
//   `GameError::Interrupted`      -> ended(Finished { winners recorded so far })
//   kill requested                -> ended(Killed)
//   rules error or panic          -> crashed(Crashed { reason })
//
// Concluding closes the sync log, which wakes any input round still waiting
// so nothing is left blocked on a dead game.

use std::sync::Arc;

use gamesync_protocol::PlayerId;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::GameError;
use crate::events::GameOutcome;
use crate::game::Game;
use crate::rules::Rules;

/// Owner's handle on a started game.
pub struct GameHandle<R: Rules> {
    game: Arc<Game<R>>,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<GameOutcome>,
}

impl<R: Rules> GameHandle<R> {
    pub fn game(&self) -> &Arc<Game<R>> {
        &self.game
    }

    /// Stop the game. Does nothing if it already ended.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the game to conclude.
    pub async fn join(self) -> GameOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => GameOutcome::Crashed {
                reason: format!("supervisor failed: {err}"),
            },
        }
    }
}

impl<R: Rules> Game<R> {
    /// Start the game task. Starting a game that already ran returns a
    /// handle whose outcome reports the misuse as a crash without touching
    /// the game's lifecycle.
    pub fn start(self: &Arc<Self>, params: R::Params) -> GameHandle<R> {
        let (kill_tx, kill_rx) = oneshot::channel();
        let game = Arc::clone(self);

        if !self.begin() {
            warn!(gid = %self.id(), "game started twice");
            let task = tokio::spawn(async {
                GameOutcome::Crashed {
                    reason: "game already started".to_string(),
                }
            });
            return GameHandle {
                game,
                kill: None,
                task,
            };
        }

        let task = tokio::spawn(supervise(Arc::clone(self), params, kill_rx));
        GameHandle {
            game,
            kill: Some(kill_tx),
            task,
        }
    }
}

async fn supervise<R: Rules>(
    game: Arc<Game<R>>,
    params: R::Params,
    mut kill_rx: oneshot::Receiver<()>,
) -> GameOutcome {
    let mut body = tokio::spawn(drive(Arc::clone(&game), params));

    let finished = tokio::select! {
        joined = &mut body => Some(joined),
        Ok(()) = &mut kill_rx => None,
    };

    let outcome = match finished {
        Some(Ok(Ok(winners))) => GameOutcome::Finished { winners },
        Some(Ok(Err(err))) => GameOutcome::Crashed {
            reason: err.to_string(),
        },
        Some(Err(join)) if join.is_panic() => GameOutcome::Crashed {
            reason: "rules panicked".to_string(),
        },
        Some(Err(join)) => GameOutcome::Crashed {
            reason: join.to_string(),
        },
        None => {
            body.abort();
            let _ = body.await;
            GameOutcome::Killed
        }
    };

    game.conclude(&outcome);
    outcome
}

async fn drive<R: Rules>(game: Arc<Game<R>>, params: R::Params) -> Result<Vec<PlayerId>, GameError> {
    let opening = game.rules().bootstrap(&game, params);
    match game.process_action(opening).await {
        Ok(_) => Ok(game.winners()),
        Err(GameError::Ended { winners }) => Ok(winners),
        Err(GameError::Interrupted) => Ok(game.winners()),
        Err(err) => Err(err),
    }
}
