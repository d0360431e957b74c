// boardroom_protocol: wire protocol shared by the Boardroom server, its
// clients, and the admin console.
//
// This crate owns everything that crosses the socket: the one-byte tag that
// selects a handler, the envelope that pairs a tag with an opaque payload,
// the length-prefixed framing (blocking helpers plus incremental state
// machines for non-blocking sockets), and the JSON payload bodies for the
// reserved tags. It has no networking runtime of its own.
//
// Module overview:
// - `envelope.rs`: `Tag` (validated on decode) and `Envelope`.
// - `types.rs`:    Identity and authorization types: `ConnectionId`,
//                  `Status`, `User`, `RecipientFilter`, `DisconnectReason`.
// - `message.rs`:  Serde payloads for handshake, session, lobby and admin tags.
// - `framing.rs`:  `[i32 BE length][u8 tag][payload]` framing. `read_frame` /
//                  `write_frame` for blocking streams, `FrameReader` /
//                  `FrameWriter` for sockets that return `WouldBlock`.
// - `admin.rs`:    Admin command-line grammar.
//
// Design decisions:
// - **Payloads are `bytes::Bytes`.** A broadcast encodes once and every
//   recipient's writer slices the same buffer at its own offset.
// - **JSON above the framing layer.** Only the reserved tags have a schema;
//   collaborator payloads ride inside `SessionRequest::Command` untouched.

pub mod admin;
pub mod envelope;
pub mod framing;
pub mod message;
pub mod types;

pub use admin::{AdminCommand, AdminParseError};
pub use envelope::{Envelope, MAX_TAG, MIN_TAG, Tag};
pub use framing::{
    FrameError, FrameReader, FrameWriter, HEADER_LEN, MAX_MESSAGE_SIZE, ReadPhase, ReadProgress,
    WritePhase, WriteProgress, read_frame, write_frame,
};
pub use message::{
    AdminLogin, AdminLoginReply, HandshakeReply, Hello, LobbyEvent, Member, PROTOCOL_VERSION,
    SessionRequest,
};
pub use types::{ConnectionId, DisconnectReason, RecipientFilter, Status, Targets, User};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Wrap a payload in its tag, frame it, read it back, decode it.
    fn framed_roundtrip<T>(tag: Tag, value: &T) -> T
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let envelope = Envelope::json(tag, value).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &envelope).unwrap();
        let back = read_frame(&mut Cursor::new(wire), MAX_MESSAGE_SIZE as usize).unwrap();
        assert_eq!(back.tag(), tag);
        back.decode().unwrap()
    }

    #[test]
    fn hello_through_the_wire() {
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            username: "alice".into(),
            lobby: "planning".into(),
            lobby_password: Some("hunter2".into()),
            create: true,
        };
        let back = framed_roundtrip(Tag::Handshake, &hello);
        assert_eq!(back, hello);
    }

    #[test]
    fn welcome_through_the_wire() {
        let reply = HandshakeReply::Welcome {
            connection_id: ConnectionId(77),
            username: "bob(1)".into(),
            lobby: "planning".into(),
            status: Status::Common,
            members: vec![Member {
                id: ConnectionId(5),
                name: "alice".into(),
                status: Status::LobbyRoot,
            }],
        };
        match framed_roundtrip(Tag::HandshakeReply, &reply) {
            HandshakeReply::Welcome {
                username, members, ..
            } => {
                assert_eq!(username, "bob(1)");
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].status, Status::LobbyRoot);
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[test]
    fn opaque_command_payload_survives() {
        let payload: Vec<u8> = (0..=255).collect();
        let request = SessionRequest::Command {
            payload: payload.clone(),
        };
        match framed_roundtrip(Tag::Session, &request) {
            SessionRequest::Command { payload: back } => assert_eq!(back, payload),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn lobby_disconnect_event_keeps_reason() {
        let event = LobbyEvent::Disconnected {
            reason: DisconnectReason::Error("bad tag".into()),
        };
        let back = framed_roundtrip(Tag::Lobby, &event);
        assert_eq!(back, event);
    }
}
