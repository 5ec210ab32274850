//! Room, message and time primitives

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use super::topic::{self, Topic};
use crate::core_identity::IdentityName;

/// Kind of conversation. Only rooms carry a moderation manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomKind {
    PublicRoom,
    PrivateRoom,
    PrivateChat,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::PublicRoom => "publicRoom",
            RoomKind::PrivateRoom => "privateRoom",
            RoomKind::PrivateChat => "privateChat",
        }
    }

    pub fn has_manifest(&self) -> bool {
        match self {
            RoomKind::PublicRoom | RoomKind::PrivateRoom => true,
            RoomKind::PrivateChat => false,
        }
    }

    /// Private kinds are joined by invitation and carry a room seed
    pub fn is_private(&self) -> bool {
        match self {
            RoomKind::PublicRoom => false,
            RoomKind::PrivateRoom | RoomKind::PrivateChat => true,
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publicRoom" => Ok(RoomKind::PublicRoom),
            "privateRoom" => Ok(RoomKind::PrivateRoom),
            "privateChat" => Ok(RoomKind::PrivateChat),
            other => Err(format!("unknown room kind '{}'", other)),
        }
    }
}

/// A room or chat as addressed locally
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomRef {
    pub kind: RoomKind,
    pub name: String,
}

impl RoomRef {
    pub fn new(kind: RoomKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Everything a member needs to find a room's replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDescriptor {
    pub room_name: String,
    pub kind: RoomKind,
    pub creator: IdentityName,
    pub discovery_key: Topic,
    pub manifest_discovery_key: Option<Topic>,
}

impl RoomDescriptor {
    /// Public rooms rendezvous on `sha256(name)`; private rooms and chats on
    /// a random, transport-assigned key.
    pub fn new(kind: RoomKind, name: impl Into<String>, creator: IdentityName) -> Self {
        let room_name = name.into();
        let room = RoomRef::new(kind, room_name.clone());
        let discovery_key = match kind {
            RoomKind::PublicRoom => topic::public_room(&room_name),
            RoomKind::PrivateRoom | RoomKind::PrivateChat => Topic::random(),
        };
        Self {
            manifest_discovery_key: topic::manifest_for(&room),
            room_name,
            kind,
            creator,
            discovery_key,
        }
    }

    pub fn room(&self) -> RoomRef {
        RoomRef::new(self.kind, self.room_name.clone())
    }
}

/// Random 256-bit message identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl MessageId {
    pub fn generate() -> Self {
        let mut id = [0u8; 32];
        rand::rng().fill_bytes(&mut id);
        MessageId(id)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &hex::encode(self.0)[..12])
    }
}

/// Milliseconds since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Timestamp(millis)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}
