//! Keystore module
//!
//! Local persistence for PIN-sealed seeds and the device's copy of its
//! identity document. Everything stored here is already encrypted under a
//! PIN; the file backend can add a second, passphrase-based layer at rest.

use crate::core_identity::identity::{Identity, IdentityDocument, IdentityName};
use crate::core_identity::seed::SealedSeed;
use crate::core_room::RoomRef;
use thiserror::Error;

pub mod file_keystore;
pub mod memory_keystore;

pub use file_keystore::FileKeystore;
pub use memory_keystore::MemoryKeystore;

/// Keystore errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Other error: {0}")]
    Other(String),
}

/// Abstract keystore trait
pub trait Keystore: Send + Sync {
    fn load_account_seed(&self, identity: &IdentityName) -> Result<SealedSeed, KeystoreError>;

    fn save_account_seed(
        &self,
        identity: &IdentityName,
        seed: &SealedSeed,
    ) -> Result<(), KeystoreError>;

    /// Returns whether a seed was present
    fn remove_account_seed(&self, identity: &IdentityName) -> Result<bool, KeystoreError>;

    fn load_document(&self, identity: &IdentityName) -> Result<IdentityDocument, KeystoreError>;

    fn save_document(&self, document: &IdentityDocument) -> Result<(), KeystoreError>;

    fn load_room_seed(&self, room: &RoomRef) -> Result<SealedSeed, KeystoreError>;

    fn save_room_seed(&self, room: &RoomRef, seed: &SealedSeed) -> Result<(), KeystoreError>;

    /// Returns whether a seed was present
    fn remove_room_seed(&self, room: &RoomRef) -> Result<bool, KeystoreError>;

    fn list_room_seeds(&self) -> Result<Vec<RoomRef>, KeystoreError>;

    fn load_identity(&self, name: &IdentityName) -> Result<Identity, KeystoreError> {
        let document = self.load_document(name)?;
        let sealed_seed = self.load_account_seed(name)?;
        Ok(Identity::from_parts(document, sealed_seed))
    }

    fn save_identity(&self, identity: &Identity) -> Result<(), KeystoreError> {
        self.save_account_seed(identity.name(), identity.sealed_seed())?;
        self.save_document(identity.document())
    }
}
