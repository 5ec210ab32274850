//! Seeds and PIN protection
//!
//! A seed is 32 bytes of symmetric key material: the account seed protects an
//! identity's secrets, a room seed protects a private room or chat. Seeds are
//! only stored as [`SealedSeed`], encrypted under a key stretched from the
//! user's PIN with Argon2id. The KDF parameters are stored alongside the
//! ciphertext so they can be raised later without breaking old seeds.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use super::cipher::{self, SealedMessage};
use super::CryptoError;

pub const SEED_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Argon2id cost parameters for PIN stretching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Minimal cost. Only for tests and local simulations.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        self.argon2().map(|_| ())
    }

    fn argon2(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(32),
        )
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// User PIN. Never logged, zeroized on drop.
#[derive(Clone)]
pub struct Pin(Zeroizing<String>);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Pin(Zeroizing::new(pin.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// 32 bytes of symmetric key material
#[derive(Clone)]
pub struct Seed(Zeroizing<[u8; SEED_LEN]>);

impl Seed {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; SEED_LEN]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Seed(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SEED_LEN {
            return Err(CryptoError::InvalidSeed(bytes.len()));
        }
        let mut out = Zeroizing::new([0u8; SEED_LEN]);
        out.copy_from_slice(bytes);
        Ok(Seed(out))
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl PartialEq for Seed {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for Seed {}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

/// A seed encrypted under a PIN-derived key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSeed {
    pub kdf: KdfParams,
    #[serde(with = "crate::serde_hex")]
    pub salt: [u8; SALT_LEN],
    pub sealed: SealedMessage,
}

fn stretch_pin(
    pin: &Pin,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    params
        .argon2()?
        .hash_password_into(pin.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

/// Encrypt `seed` under `pin`
pub fn encrypt_seed(seed: &Seed, pin: &Pin, params: &KdfParams) -> Result<SealedSeed, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let key = stretch_pin(pin, &salt, params)?;
    let sealed = cipher::seal(&key[..], seed.as_bytes())?;

    Ok(SealedSeed {
        kdf: *params,
        salt,
        sealed,
    })
}

/// Decrypt a sealed seed. A mismatching PIN is reported as `WrongPin`.
pub fn decrypt_seed(sealed: &SealedSeed, pin: &Pin) -> Result<Seed, CryptoError> {
    let key = stretch_pin(pin, &sealed.salt, &sealed.kdf)?;
    let plaintext = cipher::open(&key[..], &sealed.sealed).map_err(|e| match e {
        CryptoError::WrongKey => CryptoError::WrongPin,
        other => other,
    })?;
    Seed::from_slice(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> KdfParams {
        KdfParams::insecure_fast()
    }

    #[test]
    fn test_seed_roundtrip() {
        let seed = Seed::generate();
        let pin = Pin::new("4821");
        let sealed = encrypt_seed(&seed, &pin, &params()).unwrap();
        assert_eq!(decrypt_seed(&sealed, &pin).unwrap(), seed);
    }

    #[test]
    fn test_wrong_pin() {
        let seed = Seed::generate();
        let sealed = encrypt_seed(&seed, &Pin::new("4821"), &params()).unwrap();
        assert!(matches!(
            decrypt_seed(&sealed, &Pin::new("4822")),
            Err(CryptoError::WrongPin)
        ));
    }

    #[test]
    fn test_sealing_twice_differs() {
        let seed = Seed::generate();
        let pin = Pin::new("0000");
        let a = encrypt_seed(&seed, &pin, &params()).unwrap();
        let b = encrypt_seed(&seed, &pin, &params()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.sealed.ciphertext, b.sealed.ciphertext);
    }

    #[test]
    fn test_params_travel_with_ciphertext() {
        let seed = Seed::generate();
        let pin = Pin::new("1234");
        let custom = KdfParams {
            memory_kib: 128,
            iterations: 2,
            parallelism: 1,
        };
        let sealed = encrypt_seed(&seed, &pin, &custom).unwrap();
        assert_eq!(sealed.kdf, custom);
        assert_eq!(decrypt_seed(&sealed, &pin).unwrap(), seed);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = KdfParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        assert!(matches!(bad.validate(), Err(CryptoError::Kdf(_))));
        assert!(KdfParams::default().validate().is_ok());
    }

    #[test]
    fn test_seed_length_checked() {
        assert!(matches!(
            Seed::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidSeed(31))
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let seed = Seed::from_slice(&[0xab; SEED_LEN]).unwrap();
        assert_eq!(format!("{:?}", seed), "Seed(<redacted>)");
        assert_eq!(format!("{:?}", Pin::new("9999")), "Pin(<redacted>)");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_seed_roundtrip(bytes in any::<[u8; 32]>(), pin in "[0-9]{4,8}") {
            let seed = Seed::from_slice(&bytes).unwrap();
            let pin = Pin::new(pin);
            let sealed = encrypt_seed(&seed, &pin, &params()).unwrap();
            prop_assert_eq!(decrypt_seed(&sealed, &pin).unwrap(), seed);
        }

        #[test]
        fn prop_other_pin_never_opens(bytes in any::<[u8; 32]>(), a in "[0-9]{4,8}", b in "[0-9]{4,8}") {
            prop_assume!(a != b);
            let seed = Seed::from_slice(&bytes).unwrap();
            let sealed = encrypt_seed(&seed, &Pin::new(a), &params()).unwrap();
            match decrypt_seed(&sealed, &Pin::new(b)) {
                Ok(opened) => prop_assert_ne!(opened, seed),
                Err(_) => {}
            }
        }
    }
}
