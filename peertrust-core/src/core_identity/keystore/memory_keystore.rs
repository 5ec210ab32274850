//! In-memory keystore for tests and simulations

use super::{Keystore, KeystoreError};
use crate::core_identity::identity::{IdentityDocument, IdentityName};
use crate::core_identity::seed::SealedSeed;
use crate::core_room::RoomRef;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Helper to convert poison errors into KeystoreError
fn handle_poison<T>(_err: PoisonError<T>) -> KeystoreError {
    KeystoreError::Other("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// In-memory keystore (non-persistent)
#[derive(Clone, Default)]
pub struct MemoryKeystore {
    account_seeds: Arc<RwLock<HashMap<IdentityName, SealedSeed>>>,
    documents: Arc<RwLock<HashMap<IdentityName, IdentityDocument>>>,
    room_seeds: Arc<RwLock<HashMap<RoomRef, SealedSeed>>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keystore for MemoryKeystore {
    fn load_account_seed(&self, identity: &IdentityName) -> Result<SealedSeed, KeystoreError> {
        self.account_seeds
            .read()
            .map_err(handle_poison)?
            .get(identity)
            .cloned()
            .ok_or_else(|| KeystoreError::NotFound(format!("Account seed for {}", identity)))
    }

    fn save_account_seed(
        &self,
        identity: &IdentityName,
        seed: &SealedSeed,
    ) -> Result<(), KeystoreError> {
        self.account_seeds
            .write()
            .map_err(handle_poison)?
            .insert(identity.clone(), seed.clone());
        Ok(())
    }

    fn remove_account_seed(&self, identity: &IdentityName) -> Result<bool, KeystoreError> {
        Ok(self
            .account_seeds
            .write()
            .map_err(handle_poison)?
            .remove(identity)
            .is_some())
    }

    fn load_document(&self, identity: &IdentityName) -> Result<IdentityDocument, KeystoreError> {
        self.documents
            .read()
            .map_err(handle_poison)?
            .get(identity)
            .cloned()
            .ok_or_else(|| KeystoreError::NotFound(format!("Identity document for {}", identity)))
    }

    fn save_document(&self, document: &IdentityDocument) -> Result<(), KeystoreError> {
        self.documents
            .write()
            .map_err(handle_poison)?
            .insert(document.name.clone(), document.clone());
        Ok(())
    }

    fn load_room_seed(&self, room: &RoomRef) -> Result<SealedSeed, KeystoreError> {
        self.room_seeds
            .read()
            .map_err(handle_poison)?
            .get(room)
            .cloned()
            .ok_or_else(|| KeystoreError::NotFound(format!("Room seed for {}", room)))
    }

    fn save_room_seed(&self, room: &RoomRef, seed: &SealedSeed) -> Result<(), KeystoreError> {
        self.room_seeds
            .write()
            .map_err(handle_poison)?
            .insert(room.clone(), seed.clone());
        Ok(())
    }

    fn remove_room_seed(&self, room: &RoomRef) -> Result<bool, KeystoreError> {
        Ok(self
            .room_seeds
            .write()
            .map_err(handle_poison)?
            .remove(room)
            .is_some())
    }

    fn list_room_seeds(&self) -> Result<Vec<RoomRef>, KeystoreError> {
        Ok(self
            .room_seeds
            .read()
            .map_err(handle_poison)?
            .keys()
            .cloned()
            .collect())
    }
}
