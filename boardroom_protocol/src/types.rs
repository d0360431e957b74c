// Identity and authorization types shared across the protocol.
//
// `Status` is a totally ordered privilege level. Every permission check in
// the server is a single `at_least` comparison against it, so the variant
// order below is load-bearing. `RecipientFilter` is how a broadcast names its
// audience: a set of targets plus the minimum status a target must hold at
// delivery time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reactor-assigned connection identifier. Random, and unique among the live
/// connections of the reactor that owns the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Privilege level, ascending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    ReadOnly,
    Common,
    Moderator,
    LobbyRoot,
    Administrator,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::ReadOnly,
        Status::Common,
        Status::Moderator,
        Status::LobbyRoot,
        Status::Administrator,
    ];

    /// True if `self` grants at least the privileges of `required`.
    pub fn at_least(self, required: Status) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::ReadOnly => "read-only",
            Status::Common => "common",
            Status::Moderator => "moderator",
            Status::LobbyRoot => "lobby-root",
            Status::Administrator => "administrator",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub status: Status,
}

impl User {
    pub fn new(name: impl Into<String>, status: Status) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

/// Which connections a broadcast is addressed to, before the status check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Targets {
    All,
    Only(Vec<ConnectionId>),
    Except(Vec<ConnectionId>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientFilter {
    pub targets: Targets,
    pub minimum_status: Status,
}

impl RecipientFilter {
    pub fn all(minimum_status: Status) -> Self {
        Self {
            targets: Targets::All,
            minimum_status,
        }
    }

    pub fn only(ids: Vec<ConnectionId>, minimum_status: Status) -> Self {
        Self {
            targets: Targets::Only(ids),
            minimum_status,
        }
    }

    pub fn except(ids: Vec<ConnectionId>, minimum_status: Status) -> Self {
        Self {
            targets: Targets::Except(ids),
            minimum_status,
        }
    }

    /// Whether a connection with this id and current status receives the
    /// broadcast.
    pub fn admits(&self, id: ConnectionId, status: Status) -> bool {
        if !status.at_least(self.minimum_status) {
            return false;
        }
        match &self.targets {
            Targets::All => true,
            Targets::Only(ids) => ids.contains(&id),
            Targets::Except(ids) => !ids.contains(&id),
        }
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The user asked to leave (sent `Goodbye` or closed the client).
    ByUser,
    /// The server closed the connection without a more specific reason.
    ByServer,
    /// The peer closed its end of the socket without saying goodbye.
    PeerClosed,
    Kicked,
    Banned,
    LobbyClosed,
    /// Protocol violation, decode failure or I/O error.
    Error(String),
}

impl DisconnectReason {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, DisconnectReason::ByUser)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ByUser => f.write_str("disconnected by user"),
            DisconnectReason::ByServer => f.write_str("disconnected by server"),
            DisconnectReason::PeerClosed => f.write_str("peer closed the connection"),
            DisconnectReason::Kicked => f.write_str("kicked"),
            DisconnectReason::Banned => f.write_str("banned"),
            DisconnectReason::LobbyClosed => f.write_str("lobby closed"),
            DisconnectReason::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}
