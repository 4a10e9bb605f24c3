// Game rooms and the per-room packet order.
//
// `Rooms` is the roster half of the relay: who is in which room, who hosts
// it, whether it has started, and which members are currently connected. All
// mutation happens from the relay's main loop, so there is no internal
// locking. Every operation returns an `Outbox` (messages addressed to
// players) instead of writing to sockets itself; the server delivers them
// through the players' sessions.
//
// Once a room has started it also owns the ordering authority:
//
// - `echo` turns a decision request (`I<mode><op>:<n>`) into its response
//   tag (`R<mode><op>:<n>`), stamps it with the room's next serial, appends it
//   to the room log, and addresses it to every member, the sender included.
//   The serial order is the single arrival order all peers consume. Only the
//   first request for a tag is echoed: an answer and a timeout claim for the
//   same decision race here, and whichever lands first is the decision.
// - `reveal` does the same for hidden information (`Sync:<n>`), addressed to
//   the listed players only.
// - `resume` replays the logged packets a member is allowed to see, after a
//   given serial, for a reconnecting client, and closes the replay with
//   `Resumed { through }` so the client knows its view is complete.
//
// Members of a started room are never removed: a member who leaves or drops
// is marked absent and everyone else is told through `PlayerPresence`. The
// game keeps going on timeouts until the host reports the result.

use std::collections::{BTreeMap, HashSet};

use gamesync_protocol::{
    DataTag, GameDetail, GameId, PlayerId, PresenceEntry, ServerMessage, SyncTag, UserInfo,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::RelayError;

/// Messages addressed to players, in delivery order.
pub type Outbox = Vec<(PlayerId, ServerMessage)>;

struct LoggedPacket {
    serial: u64,
    tag: String,
    data: Value,
    /// `None` for packets every member sees.
    audience: Option<Vec<PlayerId>>,
}

struct Room {
    gid: GameId,
    name: String,
    mode: String,
    capacity: u32,
    params: Value,
    host: PlayerId,
    members: Vec<UserInfo>,
    present: BTreeMap<PlayerId, bool>,
    started: bool,
    serial: u64,
    log: Vec<LoggedPacket>,
    /// Response tags already echoed.
    answered: HashSet<String>,
}

impl Room {
    fn detail(&self) -> GameDetail {
        GameDetail {
            gid: self.gid,
            name: self.name.clone(),
            mode: self.mode.clone(),
            host: self.host,
            users: self.members.clone(),
            params: self.params.clone(),
        }
    }

    fn is_member(&self, player: PlayerId) -> bool {
        self.members.iter().any(|u| u.id == player)
    }

    fn member_ids(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.members.iter().map(|u| u.id)
    }

    fn to_all(&self, msg: &ServerMessage, outbox: &mut Outbox) {
        for id in self.member_ids() {
            outbox.push((id, msg.clone()));
        }
    }

    fn users_message(&self) -> ServerMessage {
        ServerMessage::RoomUsers {
            gid: self.gid,
            users: self.members.clone(),
        }
    }

    fn presence_message(&self) -> ServerMessage {
        ServerMessage::PlayerPresence {
            gid: self.gid,
            presence: self
                .member_ids()
                .map(|id| PresenceEntry {
                    player_id: id,
                    present: self.present.get(&id).copied().unwrap_or(false),
                })
                .collect(),
        }
    }

    fn require_member(&self, player: PlayerId) -> Result<(), RelayError> {
        if self.is_member(player) {
            Ok(())
        } else {
            Err(RelayError::NotMember {
                gid: self.gid,
                player,
            })
        }
    }

    fn require_started(&self) -> Result<(), RelayError> {
        if self.started {
            Ok(())
        } else {
            Err(RelayError::NotStarted(self.gid))
        }
    }

    fn append(&mut self, tag: String, data: Value, audience: Option<Vec<PlayerId>>) -> u64 {
        self.serial += 1;
        self.log.push(LoggedPacket {
            serial: self.serial,
            tag,
            data,
            audience,
        });
        self.serial
    }
}

pub struct Rooms {
    rooms: BTreeMap<GameId, Room>,
    next_gid: u64,
    max_players: u32,
}

impl Rooms {
    pub fn new(max_players: u32) -> Self {
        Self {
            rooms: BTreeMap::new(),
            next_gid: 1,
            max_players,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn detail(&self, gid: GameId) -> Option<GameDetail> {
        self.rooms.get(&gid).map(Room::detail)
    }

    /// Open a room with `host` as its first member. Capacity is clamped to
    /// the relay's maximum.
    pub fn create(
        &mut self,
        host: UserInfo,
        name: String,
        mode: String,
        capacity: u32,
        params: Value,
    ) -> (GameId, Outbox) {
        let gid = GameId(self.next_gid);
        self.next_gid += 1;
        let host_id = host.id;
        let room = Room {
            gid,
            name,
            mode,
            capacity: capacity.clamp(1, self.max_players.max(1)),
            params,
            host: host_id,
            members: vec![host],
            present: BTreeMap::from([(host_id, true)]),
            started: false,
            serial: 0,
            log: Vec::new(),
            answered: HashSet::new(),
        };
        info!(%gid, host = %host_id, capacity = room.capacity, "room created");
        let outbox = vec![
            (host_id, ServerMessage::GameJoined { game: room.detail() }),
            (host_id, room.users_message()),
        ];
        self.rooms.insert(gid, room);
        (gid, outbox)
    }

    pub fn join(&mut self, gid: GameId, user: UserInfo) -> Result<Outbox, RelayError> {
        let room = self.rooms.get_mut(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        let player = user.id;
        if !room.is_member(player) {
            if room.started {
                return Err(RelayError::AlreadyStarted(gid));
            }
            if room.members.len() as u32 >= room.capacity {
                return Err(RelayError::RoomFull(gid));
            }
            room.members.push(user);
            room.present.insert(player, true);
            info!(%gid, %player, "player joined room");
        }
        let mut outbox = vec![(player, ServerMessage::GameJoined { game: room.detail() })];
        room.to_all(&room.users_message(), &mut outbox);
        Ok(outbox)
    }

    /// Start the room with its current roster. Host only.
    pub fn start(&mut self, gid: GameId, by: PlayerId) -> Result<Outbox, RelayError> {
        let room = self.rooms.get_mut(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        if room.host != by {
            return Err(RelayError::NotHost);
        }
        if room.started {
            return Err(RelayError::AlreadyStarted(gid));
        }
        room.started = true;
        info!(%gid, players = room.members.len(), "room started");
        let mut outbox = Outbox::new();
        room.to_all(&ServerMessage::GameStarted { game: room.detail() }, &mut outbox);
        Ok(outbox)
    }

    /// Leave a room. Before the start the member is removed (the host role
    /// passes on, an empty room is closed); after it the member is only marked
    /// absent.
    pub fn leave(&mut self, gid: GameId, who: PlayerId) -> Result<Outbox, RelayError> {
        let room = self.rooms.get_mut(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        room.require_member(who)?;
        let mut outbox = vec![(who, ServerMessage::GameLeft { gid })];

        if room.started {
            room.present.insert(who, false);
            let msg = room.presence_message();
            room.to_all(&msg, &mut outbox);
            if !room.present.values().any(|p| *p) {
                info!(%gid, "every member left; closing room");
                self.rooms.remove(&gid);
            }
            return Ok(outbox);
        }

        room.members.retain(|u| u.id != who);
        room.present.remove(&who);
        if room.members.is_empty() {
            debug!(%gid, "last member left; closing room");
            self.rooms.remove(&gid);
            return Ok(outbox);
        }
        if room.host == who {
            room.host = room.members[0].id;
        }
        room.to_all(&room.users_message(), &mut outbox);
        Ok(outbox)
    }

    /// Leave every room `who` is in.
    pub fn leave_all(&mut self, who: PlayerId) -> Outbox {
        let gids: Vec<GameId> = self
            .rooms
            .values()
            .filter(|r| r.is_member(who))
            .map(|r| r.gid)
            .collect();
        gids.into_iter()
            .filter_map(|gid| self.leave(gid, who).ok())
            .flatten()
            .collect()
    }

    /// Echo a decision request to the whole room as its response. Later
    /// requests for an already echoed tag are dropped.
    pub fn echo(
        &mut self,
        gid: GameId,
        from: PlayerId,
        tag: &str,
        data: Value,
    ) -> Result<Outbox, RelayError> {
        let room = self.rooms.get_mut(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        room.require_member(from)?;
        room.require_started()?;
        let response = tag
            .parse::<DataTag>()?
            .to_response()
            .ok_or_else(|| RelayError::NotARequest(tag.to_string()))?
            .to_string();
        if !room.answered.insert(response.clone()) {
            debug!(%gid, %from, tag = %response, "already decided, dropping");
            return Ok(Outbox::new());
        }
        let serial = room.append(response.clone(), data.clone(), None);
        debug!(%gid, %from, serial, tag = %response, "echo");
        let mut outbox = Outbox::new();
        room.to_all(
            &ServerMessage::GameData {
                gid,
                serial,
                tag: response,
                data,
            },
            &mut outbox,
        );
        Ok(outbox)
    }

    /// Deliver hidden information to the listed members only.
    pub fn reveal(
        &mut self,
        gid: GameId,
        from: PlayerId,
        to: &[PlayerId],
        sync: SyncTag,
        data: Value,
    ) -> Result<Outbox, RelayError> {
        let room = self.rooms.get_mut(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        room.require_member(from)?;
        room.require_started()?;
        let audience: Vec<PlayerId> = to.iter().copied().filter(|id| room.is_member(*id)).collect();
        let tag = DataTag::reveal(sync).to_string();
        let serial = room.append(tag.clone(), data.clone(), Some(audience.clone()));
        debug!(%gid, %from, serial, %tag, ?audience, "reveal");
        Ok(audience
            .into_iter()
            .map(|id| {
                (
                    id,
                    ServerMessage::GameData {
                        gid,
                        serial,
                        tag: tag.clone(),
                        data: data.clone(),
                    },
                )
            })
            .collect())
    }

    /// Logged packets after `after` that `who` may see, in serial order,
    /// followed by `Resumed`.
    pub fn resume(&self, gid: GameId, who: PlayerId, after: u64) -> Result<Outbox, RelayError> {
        let room = self.rooms.get(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        room.require_member(who)?;
        let mut outbox: Outbox = room
            .log
            .iter()
            .filter(|p| p.serial > after)
            .filter(|p| p.audience.as_ref().is_none_or(|a| a.contains(&who)))
            .map(|p| {
                (
                    who,
                    ServerMessage::GameData {
                        gid,
                        serial: p.serial,
                        tag: p.tag.clone(),
                        data: p.data.clone(),
                    },
                )
            })
            .collect();
        outbox.push((
            who,
            ServerMessage::Resumed {
                gid,
                through: room.serial,
            },
        ));
        Ok(outbox)
    }

    /// Host reports the result; the room is closed.
    pub fn finish(
        &mut self,
        gid: GameId,
        by: PlayerId,
        winners: Vec<PlayerId>,
    ) -> Result<Outbox, RelayError> {
        let room = self.rooms.get(&gid).ok_or(RelayError::NoSuchGame(gid))?;
        if room.host != by {
            return Err(RelayError::NotHost);
        }
        room.require_started()?;
        info!(%gid, ?winners, "game finished");
        let mut outbox = Outbox::new();
        room.to_all(&ServerMessage::GameEnded { gid, winners }, &mut outbox);
        self.rooms.remove(&gid);
        Ok(outbox)
    }

    /// Mark `player` present or absent in every started room they belong to.
    pub fn set_presence(&mut self, player: PlayerId, present: bool) -> Outbox {
        let mut outbox = Outbox::new();
        for room in self.rooms.values_mut() {
            if !room.started || !room.is_member(player) {
                continue;
            }
            room.present.insert(player, present);
            let msg = room.presence_message();
            room.to_all(&msg, &mut outbox);
        }
        outbox
    }

    /// Whether `player` has a seat in a started room.
    pub fn in_running_game(&self, player: PlayerId) -> bool {
        self.rooms
            .values()
            .any(|r| r.started && r.is_member(player))
    }
}
