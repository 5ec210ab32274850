//! Moderation overlay
//!
//! Each room carries a manifest listing its moderators, blocked users and
//! moderator-deleted messages. Reads are pure. Writes need two things: the
//! actor must be listed as a moderator, and this device must hold write
//! access to the manifest replica, which is only granted through a
//! moderator invitation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::replica::{ReplicaError, ReplicaId, ReplicaRegistry};
use super::topic;
use super::types::{MessageId, RoomKind, RoomRef};
use crate::core_identity::IdentityName;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("{actor} is not authorized to {action} in {room}")]
    NotAuthorized {
        actor: IdentityName,
        action: &'static str,
        room: RoomRef,
    },

    #[error("Cannot remove the last moderator of {0}")]
    LastModerator(RoomRef),

    #[error("No manifest for {0}")]
    RoomNotFound(RoomRef),

    #[error("{0} rooms have no manifest")]
    NoManifest(RoomKind),

    #[error("Manifest for {0} already exists")]
    AlreadyExists(RoomRef),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub room: RoomRef,
    pub moderators: BTreeSet<IdentityName>,
    pub blocked: BTreeSet<IdentityName>,
    pub deleted: BTreeSet<MessageId>,
    /// Room description, avatar reference and similar opaque entries
    pub room_meta: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(room: RoomRef, creator: IdentityName) -> Self {
        let mut moderators = BTreeSet::new();
        moderators.insert(creator);
        Self {
            room,
            moderators,
            blocked: BTreeSet::new(),
            deleted: BTreeSet::new(),
            room_meta: BTreeMap::new(),
        }
    }
}

/// Manifests held by this device, gated by replica write access
#[derive(Clone)]
pub struct ModerationOverlay {
    replicas: Arc<dyn ReplicaRegistry>,
    manifests: Arc<RwLock<HashMap<RoomRef, Manifest>>>,
}

impl ModerationOverlay {
    pub fn new(replicas: Arc<dyn ReplicaRegistry>) -> Self {
        Self {
            replicas,
            manifests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create the manifest of a new room with `creator` as its only moderator
    pub async fn create_manifest(
        &self,
        room: &RoomRef,
        creator: &IdentityName,
    ) -> Result<(), ModerationError> {
        let discovery_key =
            topic::manifest_for(room).ok_or(ModerationError::NoManifest(room.kind))?;

        let mut manifests = self.manifests.write().await;
        if manifests.contains_key(room) {
            return Err(ModerationError::AlreadyExists(room.clone()));
        }
        self.replicas
            .create(ReplicaId::Manifest(room.clone()), discovery_key)
            .await?;
        manifests.insert(room.clone(), Manifest::new(room.clone(), creator.clone()));

        info!(%room, %creator, "Created room manifest");
        Ok(())
    }

    /// Adopt a manifest delivered by replication
    pub async fn import_manifest(&self, manifest: Manifest) -> Result<(), ModerationError> {
        if !manifest.room.kind.has_manifest() {
            return Err(ModerationError::NoManifest(manifest.room.kind));
        }
        debug!(room = %manifest.room, "Imported manifest");
        self.manifests
            .write()
            .await
            .insert(manifest.room.clone(), manifest);
        Ok(())
    }

    /// Forget a room's manifest, on leave
    pub async fn drop_manifest(&self, room: &RoomRef) -> Option<Manifest> {
        self.manifests.write().await.remove(room)
    }

    pub async fn manifest(&self, room: &RoomRef) -> Option<Manifest> {
        self.manifests.read().await.get(room).cloned()
    }

    pub async fn is_moderator(&self, actor: &IdentityName, room: &RoomRef) -> bool {
        self.manifests
            .read()
            .await
            .get(room)
            .is_some_and(|m| m.moderators.contains(actor))
    }

    pub async fn is_blocked(&self, user: &IdentityName, room: &RoomRef) -> bool {
        self.manifests
            .read()
            .await
            .get(room)
            .is_some_and(|m| m.blocked.contains(user))
    }

    pub async fn is_deleted(&self, room: &RoomRef, message_id: &MessageId) -> bool {
        self.manifests
            .read()
            .await
            .get(room)
            .is_some_and(|m| m.deleted.contains(message_id))
    }

    pub async fn moderators(&self, room: &RoomRef) -> Result<Vec<IdentityName>, ModerationError> {
        self.read(room, |m| m.moderators.iter().cloned().collect())
            .await
    }

    pub async fn list_blocked(&self, room: &RoomRef) -> Result<Vec<IdentityName>, ModerationError> {
        self.read(room, |m| m.blocked.iter().cloned().collect()).await
    }

    pub async fn list_deleted(&self, room: &RoomRef) -> Result<Vec<MessageId>, ModerationError> {
        self.read(room, |m| m.deleted.iter().copied().collect()).await
    }

    pub async fn room_meta(
        &self,
        room: &RoomRef,
    ) -> Result<BTreeMap<String, String>, ModerationError> {
        self.read(room, |m| m.room_meta.clone()).await
    }

    /// Returns false if `target` was already blocked
    pub async fn block_user(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        target: &IdentityName,
    ) -> Result<bool, ModerationError> {
        let changed = self
            .write(actor, room, "block users", |m| Ok(m.blocked.insert(target.clone())))
            .await?;
        if changed {
            info!(%room, %actor, %target, "Blocked user");
        }
        Ok(changed)
    }

    pub async fn unblock_user(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        target: &IdentityName,
    ) -> Result<bool, ModerationError> {
        self.write(actor, room, "unblock users", |m| Ok(m.blocked.remove(target)))
            .await
    }

    pub async fn add_moderator(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        target: &IdentityName,
    ) -> Result<bool, ModerationError> {
        let changed = self
            .write(actor, room, "add moderators", |m| {
                Ok(m.moderators.insert(target.clone()))
            })
            .await?;
        if changed {
            info!(%room, %actor, %target, "Added moderator");
        }
        Ok(changed)
    }

    /// Refuses to leave the room without moderators
    pub async fn remove_moderator(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        target: &IdentityName,
    ) -> Result<bool, ModerationError> {
        self.write(actor, room, "remove moderators", |m| {
            if !m.moderators.contains(target) {
                return Ok(false);
            }
            if m.moderators.len() == 1 {
                return Err(ModerationError::LastModerator(m.room.clone()));
            }
            Ok(m.moderators.remove(target))
        })
        .await
    }

    pub async fn moderator_delete(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        message_id: &MessageId,
    ) -> Result<bool, ModerationError> {
        let changed = self
            .write(actor, room, "delete messages", |m| {
                Ok(m.deleted.insert(*message_id))
            })
            .await?;
        if changed {
            info!(%room, %actor, %message_id, "Moderator deleted message");
        }
        Ok(changed)
    }

    pub async fn restore_message(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        message_id: &MessageId,
    ) -> Result<bool, ModerationError> {
        self.write(actor, room, "restore messages", |m| {
            Ok(m.deleted.remove(message_id))
        })
        .await
    }

    pub async fn set_room_meta(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        key: &str,
        value: &str,
    ) -> Result<(), ModerationError> {
        self.write(actor, room, "edit room details", |m| {
            m.room_meta.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    /// Authors may delete their own messages without being moderators
    pub fn author_delete(
        actor: &IdentityName,
        room: &RoomRef,
        author: &IdentityName,
    ) -> Result<(), ModerationError> {
        if actor != author {
            return Err(ModerationError::NotAuthorized {
                actor: actor.clone(),
                action: "delete another author's message",
                room: room.clone(),
            });
        }
        Ok(())
    }

    async fn read<T>(
        &self,
        room: &RoomRef,
        f: impl FnOnce(&Manifest) -> T,
    ) -> Result<T, ModerationError> {
        self.manifests
            .read()
            .await
            .get(room)
            .map(f)
            .ok_or_else(|| ModerationError::RoomNotFound(room.clone()))
    }

    /// Run `f` on the manifest once both gates pass. `f` must not mutate
    /// before returning an error.
    async fn write<T>(
        &self,
        actor: &IdentityName,
        room: &RoomRef,
        action: &'static str,
        f: impl FnOnce(&mut Manifest) -> Result<T, ModerationError>,
    ) -> Result<T, ModerationError> {
        let writable = self
            .replicas
            .is_writable(&ReplicaId::Manifest(room.clone()))
            .await;

        let mut manifests = self.manifests.write().await;
        let manifest = manifests
            .get_mut(room)
            .ok_or_else(|| ModerationError::RoomNotFound(room.clone()))?;

        if !writable || !manifest.moderators.contains(actor) {
            debug!(%room, %actor, action, writable, "Rejected manifest write");
            return Err(ModerationError::NotAuthorized {
                actor: actor.clone(),
                action,
                room: room.clone(),
            });
        }
        f(manifest)
    }
}
