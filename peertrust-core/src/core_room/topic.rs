//! Rendezvous topics
//!
//! Fixed-length discovery keys peers meet on. All are SHA-256 digests except
//! device sync, which uses the raw device id.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::types::{RoomKind, RoomRef};
use crate::core_identity::{DeviceId, IdentityName};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl Topic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Topic(bytes)
    }

    /// Transport-assigned key for a private replica
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Topic(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", &hex::encode(self.0)[..12])
    }
}

fn digest(parts: &[&str]) -> Topic {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Topic(out)
}

pub fn public_room(name: &str) -> Topic {
    digest(&[name])
}

pub fn public_manifest(name: &str) -> Topic {
    digest(&[name, "manifest"])
}

pub fn private_manifest(name: &str) -> Topic {
    digest(&[name, "private", "/manifest"])
}

pub fn device_sync(device: &DeviceId) -> Topic {
    Topic(*device.as_bytes())
}

pub fn room_invite(identity: &IdentityName) -> Topic {
    digest(&[identity.as_str()])
}

/// Hashed like every other topic so it has a fixed length
pub fn moderator_invite(identity: &IdentityName) -> Topic {
    digest(&[identity.as_str(), "smap"])
}

pub fn identity_document(identity: &IdentityName) -> Topic {
    digest(&[identity.as_str(), "identity"])
}

/// Manifest topic for rooms, `None` for chats
pub fn manifest_for(room: &RoomRef) -> Option<Topic> {
    match room.kind {
        RoomKind::PublicRoom => Some(public_manifest(&room.name)),
        RoomKind::PrivateRoom => Some(private_manifest(&room.name)),
        RoomKind::PrivateChat => None,
    }
}
