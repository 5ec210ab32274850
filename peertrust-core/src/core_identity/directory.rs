//! Identity lookup
//!
//! Resolves a claimed identity name to its published document. Every remote
//! signature is checked against the key returned here, never against a key
//! supplied by the peer itself.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::identity::{IdentityDocument, IdentityName};
use super::keypair::PublicKey;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Identity not found: {0}")]
    IdentityNotFound(IdentityName),

    #[error("Identity {0} is already published with a different key")]
    KeyConflict(IdentityName),
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Publish or update a document. The key of an existing name is fixed.
    async fn publish(&self, document: &IdentityDocument) -> Result<(), DirectoryError>;

    async fn lookup(&self, name: &IdentityName) -> Result<IdentityDocument, DirectoryError>;

    async fn public_key(&self, name: &IdentityName) -> Result<PublicKey, DirectoryError> {
        Ok(self.lookup(name).await?.public_key)
    }
}

/// In-process directory shared by peers in tests and simulations
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    documents: Arc<RwLock<HashMap<IdentityName, IdentityDocument>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn publish(&self, document: &IdentityDocument) -> Result<(), DirectoryError> {
        let mut documents = self.documents.write().await;
        if let Some(existing) = documents.get(&document.name) {
            if existing.public_key != document.public_key {
                return Err(DirectoryError::KeyConflict(document.name.clone()));
            }
        }
        documents.insert(document.name.clone(), document.clone());
        Ok(())
    }

    async fn lookup(&self, name: &IdentityName) -> Result<IdentityDocument, DirectoryError> {
        self.documents
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::IdentityNotFound(name.clone()))
    }
}
