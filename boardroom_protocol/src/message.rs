// Payload bodies for the reserved tags.
//
// Each type here is the JSON body of exactly one tag:
//
// | Tag              | Body                  | Direction          |
// |------------------|-----------------------|--------------------|
// | `Handshake`      | `Hello`               | client -> server   |
// | `HandshakeReply` | `HandshakeReply`      | server -> client   |
// | `Session`        | `SessionRequest`      | member -> lobby    |
// | `Lobby`          | `LobbyEvent`          | lobby -> members   |
// | `AdminLogin`     | `AdminLogin`          | console -> server  |
// | `AdminReply`     | `AdminLoginReply`     | server -> console  |
//
// `Admin` carries plain UTF-8 lines and `Goodbye` is empty, so neither has a
// type here. Command payloads are opaque bytes; the server relays them without
// looking inside.

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, DisconnectReason, Status};

/// Bumped whenever a payload shape changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub username: String,
    pub lobby: String,
    pub lobby_password: Option<String>,
    /// Create `lobby` instead of joining it. The creator becomes lobby root.
    pub create: bool,
}

/// Public roster entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: ConnectionId,
    pub name: String,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeReply {
    Welcome {
        connection_id: ConnectionId,
        /// Final name after collision resolution; may differ from the request.
        username: String,
        lobby: String,
        status: Status,
        members: Vec<Member>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRequest {
    /// Opaque collaborator command, relayed to the whole lobby.
    Command { payload: Vec<u8> },
    Chat { text: String },
    SetStatus { user: String, status: Status },
    Kick { user: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyEvent {
    MemberJoined {
        member: Member,
    },
    MemberLeft {
        member: Member,
        reason: DisconnectReason,
    },
    Command {
        from: Member,
        payload: Vec<u8>,
    },
    Chat {
        from: Member,
        text: String,
    },
    StatusChanged {
        user: String,
        status: Status,
    },
    Renamed {
        lobby: String,
    },
    /// Server notice to one member (e.g. a refused request).
    Notice {
        text: String,
    },
    /// Sent to a member right before the server closes its connection.
    Disconnected {
        reason: DisconnectReason,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminLogin {
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminLoginReply {
    Accepted,
    Denied { reason: String },
}
