//! Pending invite queue
//!
//! Invites waiting for their receiver to come online. Each entry is consumed
//! exactly once, by a completed or a verifiably refused session.

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::topic::{self, Topic};
use super::types::{RoomKind, RoomRef, Timestamp};
use crate::core_identity::{IdentityName, Keypair, Signature};

/// Which handshake delivers the invite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteProtocol {
    /// Room/chat membership and seed exchange
    Pcap,
    /// Manifest write access
    Smap,
}

/// Room invitation waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInvite {
    pub protocol: InviteProtocol,

    pub kind: RoomKind,

    /// Room or chat name, also the signed payload
    pub name: String,

    /// Who sends the invite
    pub creator: IdentityName,

    /// `sign(name)` by the creator
    pub signature: Signature,

    pub intended_receiver: IdentityName,

    /// Room replica key for PCAP, manifest key for SMAP
    pub discovery_key: Topic,

    pub created_at: Timestamp,
}

/// Identity of a queued invite
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InviteKey {
    pub protocol: InviteProtocol,
    pub name: String,
    pub intended_receiver: IdentityName,
}

impl fmt::Display for InviteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{} -> {}",
            self.protocol, self.name, self.intended_receiver
        )
    }
}

impl PendingInvite {
    /// Invite to a private room or chat
    pub fn new_pcap(
        keypair: &Keypair,
        creator: IdentityName,
        room: &RoomRef,
        discovery_key: Topic,
        intended_receiver: IdentityName,
    ) -> Result<Self, InviteError> {
        if !room.kind.is_private() {
            return Err(InviteError::UnsupportedKind(room.kind));
        }
        Ok(Self::signed(
            InviteProtocol::Pcap,
            keypair,
            creator,
            room,
            discovery_key,
            intended_receiver,
        ))
    }

    /// Moderator invite for a room with a manifest
    pub fn new_smap(
        keypair: &Keypair,
        creator: IdentityName,
        room: &RoomRef,
        intended_receiver: IdentityName,
    ) -> Result<Self, InviteError> {
        let discovery_key =
            topic::manifest_for(room).ok_or(InviteError::UnsupportedKind(room.kind))?;
        Ok(Self::signed(
            InviteProtocol::Smap,
            keypair,
            creator,
            room,
            discovery_key,
            intended_receiver,
        ))
    }

    fn signed(
        protocol: InviteProtocol,
        keypair: &Keypair,
        creator: IdentityName,
        room: &RoomRef,
        discovery_key: Topic,
        intended_receiver: IdentityName,
    ) -> Self {
        PendingInvite {
            protocol,
            kind: room.kind,
            name: room.name.clone(),
            creator,
            signature: keypair.sign(room.name.as_bytes()),
            intended_receiver,
            discovery_key,
            created_at: Timestamp::now(),
        }
    }

    pub fn key(&self) -> InviteKey {
        InviteKey {
            protocol: self.protocol,
            name: self.name.clone(),
            intended_receiver: self.intended_receiver.clone(),
        }
    }

    pub fn room(&self) -> RoomRef {
        RoomRef::new(self.kind, self.name.clone())
    }
}

/// Invite operation errors
#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("Invite not found: {0}")]
    InviteNotFound(InviteKey),

    #[error("Cannot invite to a {0}")]
    UnsupportedKind(RoomKind),
}

/// Insertion-ordered queue shared by the sessions of one peer
#[derive(Clone, Default)]
pub struct InviteQueue {
    entries: Arc<Mutex<LinkedHashMap<InviteKey, PendingInvite>>>,
}

impl InviteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an invite, replacing and returning any entry with the same key
    pub async fn enqueue(&self, invite: PendingInvite) -> Option<PendingInvite> {
        let mut entries = self.entries.lock().await;
        let key = invite.key();
        let previous = entries.remove(&key);
        entries.insert(key, invite);
        previous
    }

    pub async fn get(&self, key: &InviteKey) -> Option<PendingInvite> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Queued invites, oldest first, optionally for one protocol
    pub async fn list(&self, protocol: Option<InviteProtocol>) -> Vec<PendingInvite> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|i| protocol.map_or(true, |p| i.protocol == p))
            .cloned()
            .collect()
    }

    /// Invites waiting for `receiver`
    pub async fn for_receiver(&self, receiver: &IdentityName) -> Vec<PendingInvite> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|i| &i.intended_receiver == receiver)
            .cloned()
            .collect()
    }

    /// Consume an invite. Fails if it was already consumed.
    pub async fn take(&self, key: &InviteKey) -> Result<PendingInvite, InviteError> {
        self.entries
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| InviteError::InviteNotFound(key.clone()))
    }

    pub async fn remove(&self, key: &InviteKey) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
