//! Identity management module
//!
//! - `keypair`: secp256k1 keys, signatures and ECDH
//! - `cipher`: the checksummed AES-256-CBC envelope
//! - `seed`: seeds, PINs and PIN-sealed seeds
//! - `identity`: identity documents and locally held identities
//! - `device_id`: device ids, device records and device codes
//! - `directory`: resolving a claimed identity to its published key
//! - `keystore`: local persistence of sealed seeds and documents

pub mod cipher;
pub mod device_id;
pub mod directory;
pub mod identity;
pub mod keypair;
pub mod keystore;
pub mod seed;

use thiserror::Error;

pub use cipher::{decrypt_from, encrypt_for, SealedMessage};
pub use device_id::{DeviceCode, DeviceId, DeviceRecord};
pub use directory::{DirectoryError, IdentityDirectory, MemoryDirectory};
pub use identity::{Identity, IdentityDocument, IdentityName, DEFAULT_SECRET};
pub use keypair::{Keypair, PublicKey, Signature};
pub use keystore::{FileKeystore, Keystore, KeystoreError, MemoryKeystore};
pub use seed::{decrypt_seed, encrypt_seed, KdfParams, Pin, SealedSeed, Seed};

/// Failures of local cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Checksum mismatch: the material is not the one the data was sealed with
    #[error("Wrong key")]
    WrongKey,

    #[error("Wrong PIN")]
    WrongPin,

    #[error("PIN must have at least {0} characters")]
    WeakPin(usize),

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret {0} cannot be replaced or removed")]
    ProtectedSecret(String),

    #[error("Invalid public key")]
    InvalidKey,

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Seed must be 32 bytes, got {0}")]
    InvalidSeed(usize),

    #[error("Invalid identity name: {0:?}")]
    InvalidName(String),

    #[error("Key derivation failed: {0}")]
    Kdf(String),

    #[error("Cipher error: {0}")]
    Cipher(String),
}
