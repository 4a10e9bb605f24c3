// gamesync_protocol: wire protocol shared by the relay, clients and game core.
//
// Defines the id types, the envelope tag grammar, the message enums and the
// framing used between game clients and the relay (`gamesync_relay`) over TCP.
// It has no dependency on the game core, so the relay can route packets
// without knowing anything about rules.
//
// Module overview:
// - `types.rs`:    ID newtypes: `PlayerId`, `GameId`, `SyncTag`.
// - `tag.rs`:      `DataTag` (`<I|R><mode><op>:<sync>` and `Sync:<sync>`),
//                  `InputMode`, `TagPattern` matching for waiters.
// - `message.rs`:  Client-to-relay and relay-to-client message enums, plus
//                  supporting structs (`GameDetail`, `UserInfo`,
//                  `PresenceEntry`).
// - `framing.rs`:  Length-delimited framing over tokio `AsyncRead`/`AsyncWrite`:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization**, including decision payloads (`serde_json::Value`).
// - **Textual tags.** Tags stay human-readable in logs and replays, and the
//   relay only needs to swap the direction marker to echo a request.

pub mod framing;
pub mod message;
pub mod tag;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, recv_json, send_json, write_message};
pub use message::{ClientMessage, GameDetail, PresenceEntry, ServerMessage, UserInfo};
pub use tag::{DataTag, Direction, InputMode, TagError, TagPattern};
pub use types::{GameId, PlayerId, SyncTag};

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn client_roundtrip(msg: &ClientMessage) {
        let mut wire = Vec::new();
        send_json(&mut wire, msg).await.unwrap();
        let mut reader = wire.as_slice();
        let recovered: ClientMessage = recv_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(&recovered, msg);
    }

    async fn server_roundtrip(msg: &ServerMessage) {
        let mut wire = Vec::new();
        send_json(&mut wire, msg).await.unwrap();
        let mut reader = wire.as_slice();
        let recovered: ServerMessage = recv_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(&recovered, msg);
    }

    #[tokio::test]
    async fn roundtrip_hello() {
        client_roundtrip(&ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            player_id: PlayerId(7),
            name: "Reimu".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn roundtrip_game_data_with_structured_payload() {
        client_roundtrip(&ClientMessage::GameData {
            gid: GameId(3),
            serial: 19,
            tag: "I&ChooseCard:12".into(),
            data: json!({"cards": [4, 9], "target": null}),
        })
        .await;
    }

    #[tokio::test]
    async fn roundtrip_reveal() {
        client_roundtrip(&ClientMessage::Reveal {
            gid: GameId(3),
            to: vec![PlayerId(1), PlayerId(4)],
            sync: SyncTag(55),
            data: json!([{"suit": "spade", "rank": 12}]),
        })
        .await;
    }

    #[tokio::test]
    async fn roundtrip_presence() {
        server_roundtrip(&ServerMessage::PlayerPresence {
            gid: GameId(1),
            presence: vec![
                PresenceEntry {
                    player_id: PlayerId(1),
                    present: true,
                },
                PresenceEntry {
                    player_id: PlayerId(2),
                    present: false,
                },
            ],
        })
        .await;
    }

    #[tokio::test]
    async fn roundtrip_game_started() {
        server_roundtrip(&ServerMessage::GameStarted {
            game: GameDetail {
                gid: GameId(9),
                name: "evening table".into(),
                mode: "duel".into(),
                host: PlayerId(1),
                users: vec![
                    UserInfo {
                        id: PlayerId(1),
                        name: "a".into(),
                    },
                    UserInfo {
                        id: PlayerId(2),
                        name: "b".into(),
                    },
                ],
                params: json!({"rounds": 3}),
            },
        })
        .await;
    }

    #[tokio::test]
    async fn unit_variant_roundtrip() {
        client_roundtrip(&ClientMessage::Goodbye).await;
    }
}
