// gamesync_relay: relay server and clients for synchronized games.
//
// The relay is a thin broker. It never runs rules: it keeps rooms, gives
// every decision packet a room serial so all peers see one arrival order,
// echoes requests (`I...`) back as responses (`R...`), and routes reveals to
// their audience. Games run on the clients (see `game_client.rs`).
//
// Module overview:
// - `endpoint.rs`:    One framed TCP connection split into reader and writer
//                     tasks behind channels.
// - `session.rs`:     A player's server-side connection state, with close and
//                     pivot (moving a fresh transport onto an old session).
// - `room.rs`:        Room roster, start, echo serials, reveal audiences and
//                     replay for `Resume`.
// - `server.rs`:      Listener, handshakes and the main event loop.
// - `client.rs`:      `NetClient`, a plain protocol client.
// - `game_client.rs`: `GameClient`, which turns relay traffic into running
//                     games and resumes them after a reconnect.
// - `error.rs`:       `RelayError`.
//
// The relay runs as a standalone binary (`main.rs`) or embedded through
// `start_relay`.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod game_client;
pub mod room;
pub mod server;
pub mod session;

pub use client::{ConnectionTasks, NetClient};
pub use error::RelayError;
pub use game_client::{GameClient, RulesFactory};
pub use server::{RelayConfig, RelayEvents, RelayHandle, start_relay};
