//! Replica write-authorization
//!
//! Replication itself is external. This module models the part the trust
//! protocols depend on: which replicas this device has joined, its local
//! writer key for each, and which writer keys a replica accepts.

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::topic::Topic;
use super::types::RoomRef;
use crate::core_identity::IdentityName;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaId {
    Identity(IdentityName),
    Room(RoomRef),
    Manifest(RoomRef),
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaId::Identity(name) => write!(f, "identity:{}", name),
            ReplicaId::Room(room) => write!(f, "room:{}", room),
            ReplicaId::Manifest(room) => write!(f, "manifest:{}", room),
        }
    }
}

/// Public key of a replica writer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriterKey(#[serde(with = "crate::serde_hex")] [u8; 32]);

impl WriterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        WriterKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        WriterKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterKey({})", &hex::encode(self.0)[..12])
    }
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Replica not joined: {0}")]
    NotJoined(ReplicaId),

    #[error("Replica already exists: {0}")]
    AlreadyJoined(ReplicaId),

    #[error("Local writer is not authorized on {0}")]
    NotWriter(ReplicaId),
}

/// Result of a join. `newly_joined` is false when the replica was already
/// present, so a rollback must not leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    pub local_key: WriterKey,
    pub newly_joined: bool,
}

#[async_trait]
pub trait ReplicaRegistry: Send + Sync {
    /// Create a replica with the local writer authorized
    async fn create(&self, id: ReplicaId, discovery_key: Topic) -> Result<WriterKey, ReplicaError>;

    /// Start replicating someone else's replica without write access
    async fn join(&self, id: ReplicaId, discovery_key: Topic) -> Result<Joined, ReplicaError>;

    async fn leave(&self, id: &ReplicaId) -> Result<(), ReplicaError>;

    async fn is_joined(&self, id: &ReplicaId) -> bool;

    async fn local_key(&self, id: &ReplicaId) -> Result<WriterKey, ReplicaError>;

    async fn discovery_key(&self, id: &ReplicaId) -> Result<Topic, ReplicaError>;

    /// Grant write access to `key`. Requires the local writer to be
    /// authorized. Returns false if `key` was already a writer.
    async fn authorize(&self, id: &ReplicaId, key: WriterKey) -> Result<bool, ReplicaError>;

    async fn is_authorized(&self, id: &ReplicaId, key: &WriterKey) -> Result<bool, ReplicaError>;

    /// Whether the local writer may write to `id`
    async fn is_writable(&self, id: &ReplicaId) -> bool {
        match self.local_key(id).await {
            Ok(key) => self.is_authorized(id, &key).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
struct ReplicaState {
    discovery_key: Topic,
    local_key: WriterKey,
    writers: BTreeSet<WriterKey>,
}

/// In-memory registry. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryReplicas {
    replicas: Arc<RwLock<HashMap<ReplicaId, ReplicaState>>>,
}

impl MemoryReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a writer granted remotely. Stands in for replication delivering
    /// another writer's authorization of this device.
    pub async fn record_remote_grant(&self, id: &ReplicaId, key: WriterKey) -> Result<(), ReplicaError> {
        let mut replicas = self.replicas.write().await;
        let state = replicas
            .get_mut(id)
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))?;
        state.writers.insert(key);
        Ok(())
    }

    /// Pull writer grants from `other` into every replica both registries
    /// hold under the same discovery key. Stands in for one replication
    /// round. Returns how many grants were new.
    pub async fn replicate_from(&self, other: &MemoryReplicas) -> usize {
        let remote: Vec<(ReplicaId, Topic, BTreeSet<WriterKey>)> = other
            .replicas
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.discovery_key, s.writers.clone()))
            .collect();

        let mut replicas = self.replicas.write().await;
        let mut added = 0;
        for (id, discovery_key, writers) in remote {
            let Some(state) = replicas.get_mut(&id) else {
                continue;
            };
            if state.discovery_key != discovery_key {
                continue;
            }
            for key in writers {
                if state.writers.insert(key) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Replicate both ways every `interval` until the task is aborted
    pub fn spawn_link(&self, other: &MemoryReplicas, interval: Duration) -> JoinHandle<()> {
        let (a, b) = (self.clone(), other.clone());
        tokio::spawn(async move {
            loop {
                a.replicate_from(&b).await;
                b.replicate_from(&a).await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    pub async fn joined(&self) -> Vec<ReplicaId> {
        self.replicas.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ReplicaRegistry for MemoryReplicas {
    async fn create(&self, id: ReplicaId, discovery_key: Topic) -> Result<WriterKey, ReplicaError> {
        let mut replicas = self.replicas.write().await;
        if replicas.contains_key(&id) {
            return Err(ReplicaError::AlreadyJoined(id));
        }
        let local_key = WriterKey::generate();
        let mut writers = BTreeSet::new();
        writers.insert(local_key);
        replicas.insert(
            id,
            ReplicaState {
                discovery_key,
                local_key,
                writers,
            },
        );
        Ok(local_key)
    }

    async fn join(&self, id: ReplicaId, discovery_key: Topic) -> Result<Joined, ReplicaError> {
        let mut replicas = self.replicas.write().await;
        if let Some(existing) = replicas.get(&id) {
            return Ok(Joined {
                local_key: existing.local_key,
                newly_joined: false,
            });
        }
        let local_key = WriterKey::generate();
        replicas.insert(
            id,
            ReplicaState {
                discovery_key,
                local_key,
                writers: BTreeSet::new(),
            },
        );
        Ok(Joined {
            local_key,
            newly_joined: true,
        })
    }

    async fn leave(&self, id: &ReplicaId) -> Result<(), ReplicaError> {
        self.replicas
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))
    }

    async fn is_joined(&self, id: &ReplicaId) -> bool {
        self.replicas.read().await.contains_key(id)
    }

    async fn local_key(&self, id: &ReplicaId) -> Result<WriterKey, ReplicaError> {
        self.replicas
            .read()
            .await
            .get(id)
            .map(|s| s.local_key)
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))
    }

    async fn discovery_key(&self, id: &ReplicaId) -> Result<Topic, ReplicaError> {
        self.replicas
            .read()
            .await
            .get(id)
            .map(|s| s.discovery_key)
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))
    }

    async fn authorize(&self, id: &ReplicaId, key: WriterKey) -> Result<bool, ReplicaError> {
        let mut replicas = self.replicas.write().await;
        let state = replicas
            .get_mut(id)
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))?;
        if !state.writers.contains(&state.local_key) {
            return Err(ReplicaError::NotWriter(id.clone()));
        }
        Ok(state.writers.insert(key))
    }

    async fn is_authorized(&self, id: &ReplicaId, key: &WriterKey) -> Result<bool, ReplicaError> {
        self.replicas
            .read()
            .await
            .get(id)
            .map(|s| s.writers.contains(key))
            .ok_or_else(|| ReplicaError::NotJoined(id.clone()))
    }
}
