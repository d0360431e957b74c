// Tagged, immutable message unit.
//
// An `Envelope` pairs a one-byte `Tag` with an opaque payload. The payload is
// a `bytes::Bytes`, so cloning an envelope for each broadcast recipient is a
// reference-count bump and every writer can slice from its own offset without
// disturbing the others. The optional label is for logs only and never goes
// on the wire.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::framing::FrameError;

pub const MIN_TAG: u8 = 1;
pub const MAX_TAG: u8 = 8;

/// Command-type discriminant carried in the fifth header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Client's first frame, carrying a `Hello`.
    Handshake = 1,
    /// Server's answer to the handshake: `Welcome` or `Rejected`.
    HandshakeReply = 2,
    /// Member request to its lobby.
    Session = 3,
    /// Lobby event fanned out to members.
    Lobby = 4,
    /// Admin command line (console to server) or admin reply text.
    Admin = 5,
    AdminLogin = 6,
    AdminReply = 7,
    /// Graceful leave notice. Empty payload.
    Goodbye = 8,
}

impl Tag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Tag::Handshake,
            2 => Tag::HandshakeReply,
            3 => Tag::Session,
            4 => Tag::Lobby,
            5 => Tag::Admin,
            6 => Tag::AdminLogin,
            7 => Tag::AdminReply,
            8 => Tag::Goodbye,
            other => return Err(FrameError::TagOutOfRange(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    tag: Tag,
    payload: Bytes,
    label: Option<String>,
}

impl Envelope {
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
            label: None,
        }
    }

    pub fn empty(tag: Tag) -> Self {
        Self::new(tag, Bytes::new())
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(tag: Tag, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(tag, serde_json::to_vec(value)?))
    }

    /// UTF-8 text payload (admin command lines and replies).
    pub fn text(tag: Tag, text: impl Into<String>) -> Self {
        Self::new(tag, text.into())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub fn as_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Payload length in bytes (the header's length field).
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
