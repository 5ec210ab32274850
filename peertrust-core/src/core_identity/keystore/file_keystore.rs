//! File-based keystore with encryption at rest
//!
//! One file per entry, `bincode`-serialized:
//!
//! ```text
//! seed-<identity>.bin.enc
//! identity-<identity>.bin.enc
//! room-<kind>-<hex(name)>.bin.enc
//! ```
//!
//! Encrypted file format:
//! ```text
//! [Magic: 8 bytes "PTKS0001"]
//! [Version: 1 byte]
//! [Salt: 16 bytes]
//! [Nonce: 12 bytes]
//! [Ciphertext + AEAD tag: variable]
//! ```

use super::{Keystore, KeystoreError};
use crate::core_identity::identity::{IdentityDocument, IdentityName};
use crate::core_identity::seed::{KdfParams, SealedSeed};
use crate::core_room::{RoomKind, RoomRef};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Magic header for encrypted keystore files
const MAGIC_HEADER: &[u8; 8] = b"PTKS0001";

/// Marker for files written without a passphrase
const RAW_HEADER: &[u8; 8] = b"PTKS_RAW";

const FORMAT_VERSION: u8 = 1;

const SALT_LEN: usize = 16;

const NONCE_LEN: usize = 12;

/// magic(8) + version(1) + salt(16) + nonce(12)
const HEADER_SIZE: usize = 8 + 1 + SALT_LEN + NONCE_LEN;

const EXTENSION: &str = ".bin.enc";

/// File-based keystore
pub struct FileKeystore {
    base_path: PathBuf,
    password: Option<Zeroizing<String>>,
    kdf: KdfParams,
}

impl FileKeystore {
    /// Open (and create if needed) a keystore directory
    pub fn new(base_path: PathBuf, password: Option<&str>) -> Result<Self, KeystoreError> {
        fs::create_dir_all(&base_path)?;

        Ok(FileKeystore {
            base_path,
            password: password.map(|s| Zeroizing::new(s.to_string())),
            kdf: KdfParams::default(),
        })
    }

    /// Override the passphrase stretching cost
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    fn seed_path(&self, identity: &IdentityName) -> PathBuf {
        self.base_path.join(format!("seed-{}{}", identity, EXTENSION))
    }

    fn document_path(&self, identity: &IdentityName) -> PathBuf {
        self.base_path
            .join(format!("identity-{}{}", identity, EXTENSION))
    }

    fn room_path(&self, room: &RoomRef) -> PathBuf {
        self.base_path.join(format!(
            "room-{}-{}{}",
            room.kind.as_str(),
            hex::encode(room.name.as_bytes()),
            EXTENSION
        ))
    }

    fn parse_room_file(filename: &str) -> Option<RoomRef> {
        let stem = filename.strip_prefix("room-")?.strip_suffix(EXTENSION)?;
        let (kind, name) = stem.split_once('-')?;
        let kind: RoomKind = kind.parse().ok()?;
        let name = String::from_utf8(hex::decode(name).ok()?).ok()?;
        Some(RoomRef::new(kind, name))
    }

    /// Encrypt data with AES-256-GCM
    ///
    /// Returns: [magic][version][salt][nonce][ciphertext+tag]
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let Some(password) = &self.password else {
            let mut result = Vec::with_capacity(9 + data.len());
            result.extend_from_slice(RAW_HEADER);
            result.push(FORMAT_VERSION);
            result.extend_from_slice(data);
            return Ok(result);
        };

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let key = derive_key_from_password(password, &salt, &self.kdf)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KeystoreError::Encryption(format!("Invalid key: {}", e)))?;
        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|e| KeystoreError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        result.extend_from_slice(MAGIC_HEADER);
        result.push(FORMAT_VERSION);
        result.extend_from_slice(&salt);
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data written by [`Self::encrypt`]
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        if data.len() < 9 {
            return Err(KeystoreError::Decryption("File too short".to_string()));
        }

        if &data[0..8] == RAW_HEADER {
            if self.password.is_some() {
                return Err(KeystoreError::Decryption(
                    "Encrypted keystore expected, found unencrypted".to_string(),
                ));
            }
            return Ok(data[9..].to_vec());
        }

        if &data[0..8] != MAGIC_HEADER {
            return Err(KeystoreError::Decryption("Invalid magic header".to_string()));
        }

        let version = data[8];
        if version != FORMAT_VERSION {
            return Err(KeystoreError::Decryption(format!(
                "Unsupported version: {}",
                version
            )));
        }

        // 16 is the AEAD tag size
        if data.len() < HEADER_SIZE + 16 {
            return Err(KeystoreError::Decryption("Truncated file".to_string()));
        }

        let Some(password) = &self.password else {
            return Err(KeystoreError::Decryption(
                "Password required to decrypt".to_string(),
            ));
        };

        let salt = &data[9..9 + SALT_LEN];
        let nonce = Nonce::from_slice(&data[9 + SALT_LEN..HEADER_SIZE]);
        let key = derive_key_from_password(password, salt, &self.kdf)?;

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| KeystoreError::Decryption(format!("Invalid key: {}", e)))?;

        // AEAD tag mismatch means wrong password or corruption
        cipher
            .decrypt(nonce, &data[HEADER_SIZE..])
            .map_err(|_| KeystoreError::InvalidPassword)
    }

    /// Write to a temp file, then rename over the target
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), KeystoreError> {
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, data)?;
        fs::rename(temp_path, path)?;
        Ok(())
    }

    fn store<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), KeystoreError> {
        let serialized =
            bincode::serialize(value).map_err(|e| KeystoreError::Serialization(e.to_string()))?;
        let encrypted = self.encrypt(&serialized)?;
        self.write_atomic(path, &encrypted)
    }

    fn load<T: DeserializeOwned>(&self, path: &Path, what: &str) -> Result<T, KeystoreError> {
        if !path.exists() {
            return Err(KeystoreError::NotFound(what.to_string()));
        }
        let encrypted = fs::read(path)?;
        let decrypted = Zeroizing::new(self.decrypt(&encrypted)?);
        bincode::deserialize(&decrypted).map_err(|e| KeystoreError::Serialization(e.to_string()))
    }
}

impl Keystore for FileKeystore {
    fn load_account_seed(&self, identity: &IdentityName) -> Result<SealedSeed, KeystoreError> {
        self.load(
            &self.seed_path(identity),
            &format!("Account seed for {}", identity),
        )
    }

    fn save_account_seed(
        &self,
        identity: &IdentityName,
        seed: &SealedSeed,
    ) -> Result<(), KeystoreError> {
        self.store(&self.seed_path(identity), seed)
    }

    fn remove_account_seed(&self, identity: &IdentityName) -> Result<bool, KeystoreError> {
        let path = self.seed_path(identity);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    fn load_document(&self, identity: &IdentityName) -> Result<IdentityDocument, KeystoreError> {
        self.load(
            &self.document_path(identity),
            &format!("Identity document for {}", identity),
        )
    }

    fn save_document(&self, document: &IdentityDocument) -> Result<(), KeystoreError> {
        self.store(&self.document_path(&document.name), document)
    }

    fn load_room_seed(&self, room: &RoomRef) -> Result<SealedSeed, KeystoreError> {
        self.load(&self.room_path(room), &format!("Room seed for {}", room))
    }

    fn save_room_seed(&self, room: &RoomRef, seed: &SealedSeed) -> Result<(), KeystoreError> {
        self.store(&self.room_path(room), seed)
    }

    fn remove_room_seed(&self, room: &RoomRef) -> Result<bool, KeystoreError> {
        let path = self.room_path(room);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    fn list_room_seeds(&self) -> Result<Vec<RoomRef>, KeystoreError> {
        let mut rooms = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let filename = entry.file_name();
            if let Some(room) = Self::parse_room_file(&filename.to_string_lossy()) {
                rooms.push(room);
            }
        }
        rooms.sort();
        Ok(rooms)
    }
}

/// Derive a 256-bit file key from the keystore passphrase using Argon2id
fn derive_key_from_password(
    password: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, KeystoreError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| KeystoreError::Encryption(format!("Invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| KeystoreError::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}
