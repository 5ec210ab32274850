//! Symmetric envelope
//!
//! Key schedule for key material `M` and a 64-bit nonce `n`:
//!
//! ```text
//! E        = sha512(le64(n) || M)
//! key      = E[0..32]
//! iv       = E[32..48]
//! checksum = le32(sha256(E)[0..4])
//! ```
//!
//! The payload is AES-256-CBC with PKCS#7 padding. The checksum travels next
//! to the ciphertext and is compared before decrypting, so a wrong key is
//! reported as such instead of producing garbage plaintext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

use super::keypair::{Keypair, PublicKey};
use super::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Ciphertext plus the parameters needed to open it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub nonce: u64,
    pub checksum: u32,
    #[serde(with = "crate::serde_hex::vec")]
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for SealedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedMessage")
            .field("nonce", &self.nonce)
            .field("checksum", &self.checksum)
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

struct DerivedKey {
    key: Zeroizing<[u8; 32]>,
    iv: Zeroizing<[u8; 16]>,
    checksum: u32,
}

fn derive(material: &[u8], nonce: u64) -> DerivedKey {
    let mut hasher = Sha512::new();
    hasher.update(nonce.to_le_bytes());
    hasher.update(material);
    let mut expanded = Zeroizing::new([0u8; 64]);
    expanded.copy_from_slice(&hasher.finalize());

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&expanded[..32]);
    let mut iv = Zeroizing::new([0u8; 16]);
    iv.copy_from_slice(&expanded[32..48]);

    let check = Sha256::digest(&expanded[..]);
    let checksum = u32::from_le_bytes([check[0], check[1], check[2], check[3]]);

    DerivedKey { key, iv, checksum }
}

/// Millisecond clock in the high bits, a process-wide counter in the low 16.
fn unique_nonce() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let count = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
    (millis << 16) | count
}

/// Encrypt `plaintext` under `material` with a fresh nonce
pub fn seal(material: &[u8], plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
    seal_with_nonce(material, unique_nonce(), plaintext)
}

pub(crate) fn seal_with_nonce(
    material: &[u8],
    nonce: u64,
    plaintext: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let derived = derive(material, nonce);
    let cipher = Aes256CbcEnc::new_from_slices(&derived.key[..], &derived.iv[..])
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    Ok(SealedMessage {
        nonce,
        checksum: derived.checksum,
        ciphertext: cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    })
}

/// Decrypt a sealed message. A checksum mismatch is `WrongKey`.
pub fn open(material: &[u8], sealed: &SealedMessage) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let derived = derive(material, sealed.nonce);
    if derived.checksum != sealed.checksum {
        return Err(CryptoError::WrongKey);
    }

    let cipher = Aes256CbcDec::new_from_slices(&derived.key[..], &derived.iv[..])
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&sealed.ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Cipher("invalid padding".to_string()))
}

/// Encrypt for `peer` with the ECDH shared secret as key material
pub fn encrypt_for(
    keypair: &Keypair,
    peer: &PublicKey,
    plaintext: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let shared = keypair.shared_secret(peer)?;
    seal(&shared[..], plaintext)
}

/// Decrypt a message sealed by `peer` with [`encrypt_for`]
pub fn decrypt_from(
    keypair: &Keypair,
    peer: &PublicKey,
    sealed: &SealedMessage,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let shared = keypair.shared_secret(peer)?;
    open(&shared[..], sealed)
}
