//! Device ID module
//!
//! Each device of an identity has a random 256-bit id. An unauthorized device
//! listens for device-sync sessions on its raw id, and shows an 8-digit
//! [`DeviceCode`] that a new device must read off the screen to prove
//! physical access.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::identity::IdentityName;

pub const DEVICE_ID_LEN: usize = 32;
pub const DEVICE_CODE_DIGITS: usize = 8;

/// DeviceId uniquely identifies a device. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "crate::serde_hex")] [u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEVICE_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        DeviceId(bytes)
    }

    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        DeviceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let raw = hex::decode(s).map_err(|e| format!("Invalid hex: {}", e))?;
        let bytes: [u8; DEVICE_ID_LEN] = raw
            .try_into()
            .map_err(|_| format!("Device id must be {} bytes", DEVICE_ID_LEN))?;
        Ok(DeviceId(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &hex::encode(self.0)[..16])
    }
}

/// A device known to an identity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub label: String,
    pub owner: IdentityName,
}

impl DeviceRecord {
    /// New record with a fresh id
    pub fn new(label: impl Into<String>, owner: IdentityName) -> Self {
        Self {
            device_id: DeviceId::generate(),
            label: label.into(),
            owner,
        }
    }
}

/// Out-of-band code displayed by the device being asked to share its seed
#[derive(Clone)]
pub struct DeviceCode(Zeroizing<String>);

impl DeviceCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code: String = (0..DEVICE_CODE_DIGITS)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect();
        DeviceCode(Zeroizing::new(code))
    }

    /// Digits to show on screen
    pub fn reveal(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a submitted proof
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        if candidate.len() != self.0.len() {
            return false;
        }
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl fmt::Debug for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceCode(<redacted>)")
    }
}
