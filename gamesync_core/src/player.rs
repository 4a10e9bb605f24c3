// Seated participants and hidden-information reveal.
//
// A peer's view of a game seats every participant as either `Me` (the player
// this process acts for) or `Peer` (everyone else). The distinction matters
// when hidden information is revealed: whoever owns the information sends
// the real value to its recipient as `Sync:<n>` and the recipient waits for
// it, while every other peer only spends the tag so that all counters stay
// in step.

use gamesync_protocol::{PlayerId, TagPattern};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::GameError;
use crate::sync_log::SyncLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Player {
    Me(PlayerId),
    Peer(PlayerId),
}

/// Something whose real value can be filled in from revealed data.
pub trait Syncable {
    fn sync(&mut self, data: Value) -> Result<(), GameError>;
}

/// A hidden value: `None` until revealed to this peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revealed<T> {
    pub value: Option<T>,
}

impl<T> Default for Revealed<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: DeserializeOwned> Syncable for Revealed<T> {
    fn sync(&mut self, data: Value) -> Result<(), GameError> {
        let value = serde_json::from_value(data)
            .map_err(|e| GameError::rules(format!("undecodable reveal: {e}")))?;
        self.value = Some(value);
        Ok(())
    }
}

impl Player {
    pub fn id(&self) -> PlayerId {
        match self {
            Player::Me(id) | Player::Peer(id) => *id,
        }
    }

    pub fn is_me(&self) -> bool {
        matches!(self, Player::Me(_))
    }

    /// Reveal `obj` to this player.
    ///
    /// Always allocates exactly one tag. Only `Me` waits for the data.
    pub async fn reveal<T: Syncable + Send>(&self, log: &SyncLog, obj: &mut T) -> Result<(), GameError> {
        let sync = log.next_tag();
        if let Player::Me(_) = self {
            let packet = log.expect(&TagPattern::reveal(sync), None).await?;
            obj.sync(packet.data)?;
        }
        Ok(())
    }

    /// Reveal a batch under one tag. The data is a JSON array matched to
    /// `objs` by position.
    pub async fn reveal_all<T: Syncable + Send>(
        &self,
        log: &SyncLog,
        objs: &mut [T],
    ) -> Result<(), GameError> {
        let sync = log.next_tag();
        if let Player::Me(_) = self {
            let packet = log.expect(&TagPattern::reveal(sync), None).await?;
            let Value::Array(items) = packet.data else {
                return Err(GameError::rules("batch reveal data is not an array"));
            };
            if items.len() != objs.len() {
                return Err(GameError::rules(format!(
                    "batch reveal carries {} items for {} objects",
                    items.len(),
                    objs.len()
                )));
            }
            for (obj, item) in objs.iter_mut().zip(items) {
                obj.sync(item)?;
            }
        }
        Ok(())
    }
}

/// Reveal `obj` to each listed player in order, one tag per player.
pub async fn reveal_to<T: Syncable + Send>(
    players: &[Player],
    log: &SyncLog,
    obj: &mut T,
) -> Result<(), GameError> {
    for player in players {
        player.reveal(log, obj).await?;
    }
    Ok(())
}

/// `players` rotated so that `first` leads; unchanged if absent.
pub fn rotate_to(players: &[Player], first: PlayerId) -> Vec<Player> {
    let mut out = players.to_vec();
    if let Some(pos) = out.iter().position(|p| p.id() == first) {
        out.rotate_left(pos);
    }
    out
}

pub fn exclude(players: &[Player], who: PlayerId) -> Vec<Player> {
    players.iter().copied().filter(|p| p.id() != who).collect()
}
