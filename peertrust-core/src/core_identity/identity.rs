//! Identity documents
//!
//! The published [`IdentityDocument`] carries the public key, named secrets
//! sealed by the account seed, and the device list. The local [`Identity`]
//! adds the account seed sealed by the user's PIN. Decrypted material only
//! exists for the duration of a single call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

use super::cipher::{self, SealedMessage};
use super::device_id::{DeviceId, DeviceRecord};
use super::keypair::{Keypair, PublicKey, Signature};
use super::seed::{decrypt_seed, encrypt_seed, KdfParams, Pin, SealedSeed, Seed};
use super::CryptoError;

/// Label of the secret holding the signing key entropy
pub const DEFAULT_SECRET: &str = "default";

const MIN_PIN_LEN: usize = 4;
const MAX_NAME_LEN: usize = 64;

/// User name an identity is published under
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityName(String);

impl IdentityName {
    pub fn new(name: impl Into<String>) -> Result<Self, CryptoError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(CryptoError::InvalidName(name));
        }
        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c);
        if !name.chars().all(allowed) {
            return Err(CryptoError::InvalidName(name));
        }
        Ok(IdentityName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityName {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IdentityName::new(value)
    }
}

impl From<IdentityName> for String {
    fn from(name: IdentityName) -> Self {
        name.0
    }
}

impl fmt::Display for IdentityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdentityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Replicated, publicly readable part of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub name: IdentityName,
    pub public_key: PublicKey,
    pub secrets: BTreeMap<String, SealedMessage>,
    pub devices: Vec<DeviceRecord>,
    pub master_device_id: Option<DeviceId>,
}

impl IdentityDocument {
    /// Derive the signing keypair from the account seed. Fails unless `seed`
    /// opens the default secret and yields the published key.
    pub fn keypair_from_seed(&self, seed: &Seed) -> Result<Keypair, CryptoError> {
        let sealed = self
            .secrets
            .get(DEFAULT_SECRET)
            .ok_or_else(|| CryptoError::SecretNotFound(DEFAULT_SECRET.to_string()))?;
        let entropy = cipher::open(seed.as_bytes(), sealed)?;
        let entropy: &[u8; 32] = entropy
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Cipher("default secret has wrong length".to_string()))?;

        let keypair = Keypair::from_entropy(entropy);
        if keypair.public_key() != self.public_key {
            return Err(CryptoError::Cipher(
                "default secret does not match the published key".to_string(),
            ));
        }
        Ok(keypair)
    }
}

/// A locally held identity
#[derive(Debug, Clone)]
pub struct Identity {
    document: IdentityDocument,
    sealed_seed: SealedSeed,
}

impl Identity {
    /// Create a new identity on the device labelled `device_label`.
    ///
    /// The registering device becomes the master device.
    pub fn register(
        name: IdentityName,
        device_label: &str,
        pin: &Pin,
        params: &KdfParams,
    ) -> Result<Self, CryptoError> {
        if pin.len() < MIN_PIN_LEN {
            return Err(CryptoError::WeakPin(MIN_PIN_LEN));
        }

        let seed = Seed::generate();
        let entropy = Seed::generate();
        let keypair = Keypair::from_entropy(entropy.as_bytes());

        let mut secrets = BTreeMap::new();
        secrets.insert(
            DEFAULT_SECRET.to_string(),
            cipher::seal(seed.as_bytes(), entropy.as_bytes())?,
        );

        let device = DeviceRecord::new(device_label, name.clone());
        let document = IdentityDocument {
            name,
            public_key: keypair.public_key(),
            secrets,
            master_device_id: Some(device.device_id),
            devices: vec![device],
        };

        Ok(Identity {
            document,
            sealed_seed: encrypt_seed(&seed, pin, params)?,
        })
    }

    /// Assemble an identity from a replicated document and a seed sealed on
    /// this device
    pub fn from_parts(document: IdentityDocument, sealed_seed: SealedSeed) -> Self {
        Identity {
            document,
            sealed_seed,
        }
    }

    pub fn name(&self) -> &IdentityName {
        &self.document.name
    }

    pub fn public_key(&self) -> PublicKey {
        self.document.public_key
    }

    pub fn document(&self) -> &IdentityDocument {
        &self.document
    }

    pub fn sealed_seed(&self) -> &SealedSeed {
        &self.sealed_seed
    }

    pub fn decrypt_seed(&self, pin: &Pin) -> Result<Seed, CryptoError> {
        decrypt_seed(&self.sealed_seed, pin)
    }

    /// Decrypt the secret stored under `label`
    pub fn decrypt_secret(&self, label: &str, pin: &Pin) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let sealed = self
            .document
            .secrets
            .get(label)
            .ok_or_else(|| CryptoError::SecretNotFound(label.to_string()))?;
        let seed = self.decrypt_seed(pin)?;
        cipher::open(seed.as_bytes(), sealed)
    }

    /// Re-derive the signing keypair
    pub fn keypair(&self, pin: &Pin) -> Result<Keypair, CryptoError> {
        let seed = self.decrypt_seed(pin)?;
        self.document.keypair_from_seed(&seed)
    }

    pub fn sign(&self, message: &[u8], pin: &Pin) -> Result<Signature, CryptoError> {
        Ok(self.keypair(pin)?.sign(message))
    }

    pub fn add_secret(&mut self, label: &str, secret: &[u8], pin: &Pin) -> Result<(), CryptoError> {
        if label == DEFAULT_SECRET && self.document.secrets.contains_key(label) {
            return Err(CryptoError::ProtectedSecret(label.to_string()));
        }
        let seed = self.decrypt_seed(pin)?;
        let sealed = cipher::seal(seed.as_bytes(), secret)?;
        self.document.secrets.insert(label.to_string(), sealed);
        Ok(())
    }

    pub fn remove_secret(&mut self, label: &str) -> Result<(), CryptoError> {
        if label == DEFAULT_SECRET {
            return Err(CryptoError::ProtectedSecret(label.to_string()));
        }
        self.document
            .secrets
            .remove(label)
            .map(|_| ())
            .ok_or_else(|| CryptoError::SecretNotFound(label.to_string()))
    }

    pub fn secret_labels(&self) -> impl Iterator<Item = &str> {
        self.document.secrets.keys().map(String::as_str)
    }

    /// Re-seal the account seed under a new PIN
    pub fn change_pin(&mut self, old: &Pin, new: &Pin, params: &KdfParams) -> Result<(), CryptoError> {
        if new.len() < MIN_PIN_LEN {
            return Err(CryptoError::WeakPin(MIN_PIN_LEN));
        }
        let seed = self.decrypt_seed(old)?;
        self.sealed_seed = encrypt_seed(&seed, new, params)?;
        Ok(())
    }

    /// Record a device. Returns false if its id is already known.
    pub fn add_device(&mut self, device: DeviceRecord) -> bool {
        if self
            .document
            .devices
            .iter()
            .any(|d| d.device_id == device.device_id)
        {
            return false;
        }
        self.document.devices.push(device);
        true
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.document.devices
    }

    pub fn master_device(&self) -> Option<&DeviceRecord> {
        let master = self.document.master_device_id?;
        self.document.devices.iter().find(|d| d.device_id == master)
    }
}
