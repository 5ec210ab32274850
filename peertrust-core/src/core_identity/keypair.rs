//! Keypair module
//!
//! secp256k1 identity keys. Signatures are deterministic (RFC 6979) ECDSA over
//! SHA-256 in 64-byte compact form; public keys travel as 33-byte compressed
//! SEC1 points.
//!
//! Security: the secret scalar lives inside `k256::ecdsa::SigningKey`, which
//! zeroizes itself on drop. Derivation intermediates are wrapped in
//! `Zeroizing`.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use super::CryptoError;

/// Length of a compressed SEC1 public key
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of a compact ECDSA signature
pub const SIGNATURE_LEN: usize = 64;

/// Published half of an identity keypair
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Parse a compressed or uncompressed SEC1 encoding
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::from_verifying_key(&key))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(encoded).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_sec1_bytes(&raw)
    }

    fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(true);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(point.as_bytes());
        PublicKey(bytes)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_sec1_bytes(&self.0).map_err(|_| CryptoError::InvalidKey)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Check `signature` over `message`. Malformed input yields `false`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(sig) = EcdsaSignature::from_slice(&signature.0) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_hex(&encoded).map_err(de::Error::custom)
    }
}

/// Compact 64-byte ECDSA signature
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "crate::serde_hex")] [u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|_| CryptoError::MalformedSignature)?;
        Ok(Signature(raw))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// secp256k1 signing keypair
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Derive a keypair from 32 bytes of entropy.
    ///
    /// The scalar is `sha256(entropy || counter)` for the first counter value
    /// that lands in `[1, n)`, so the same entropy always yields the same key.
    pub fn from_entropy(entropy: &[u8; 32]) -> Self {
        let mut counter: u32 = 0;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(entropy);
            hasher.update(counter.to_le_bytes());
            let mut candidate = Zeroizing::new([0u8; 32]);
            candidate.copy_from_slice(&hasher.finalize());

            if let Ok(signing) = SigningKey::from_slice(&candidate[..]) {
                let public = PublicKey::from_verifying_key(signing.verifying_key());
                return Keypair { signing, public };
            }
            counter = counter.wrapping_add(1);
        }
    }

    /// Generate a keypair from fresh OS entropy
    pub fn generate() -> Self {
        let mut entropy = [0u8; 32];
        rand::rng().fill_bytes(&mut entropy);
        let keypair = Self::from_entropy(&entropy);
        entropy.zeroize();
        keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: EcdsaSignature = self.signing.sign(message);
        let mut raw = [0u8; SIGNATURE_LEN];
        raw.copy_from_slice(&sig.to_bytes());
        Signature(raw)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.public.verify(message, signature)
    }

    /// ECDH with `peer`, hashed with SHA-512 over the shared x-coordinate.
    pub fn shared_secret(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
        let peer_key = peer.verifying_key()?;
        let shared = k256::ecdh::diffie_hellman(self.signing.as_nonzero_scalar(), peer_key.as_affine());

        let mut out = Zeroizing::new([0u8; 64]);
        out.copy_from_slice(&Sha512::digest(shared.raw_secret_bytes()));
        Ok(out)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let entropy = [7u8; 32];
        let a = Keypair::from_entropy(&entropy);
        let b = Keypair::from_entropy(&entropy);
        assert_eq!(a.public_key(), b.public_key());

        let c = Keypair::from_entropy(&[8u8; 32]);
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_zero_entropy_still_yields_key() {
        let kp = Keypair::from_entropy(&[0u8; 32]);
        let sig = kp.sign(b"zero");
        assert!(kp.verify(b"zero", &sig));
    }

    #[test]
    fn test_sign_and_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hodlers");
        assert!(kp.public_key().verify(b"hodlers", &sig));
        assert!(!kp.public_key().verify(b"hodler", &sig));
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let kp = Keypair::generate();
        let encoded = kp.public_key().to_string();
        assert_eq!(encoded.len(), PUBLIC_KEY_LEN * 2);
        assert_eq!(PublicKey::from_hex(&encoded).unwrap(), kp.public_key());
    }

    #[test]
    fn test_invalid_public_key_rejected() {
        assert!(matches!(
            PublicKey::from_sec1_bytes(&[2u8; 10]),
            Err(CryptoError::InvalidKey)
        ));
        assert!(PublicKey::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_malformed_signature_fails_verification() {
        let kp = Keypair::generate();
        let zeroes = Signature([0u8; SIGNATURE_LEN]);
        assert!(!kp.verify(b"msg", &zeroes));
        assert!(Signature::from_slice(&[1u8; 63]).is_err());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let ab = alice.shared_secret(&bob.public_key()).unwrap();
        let ba = bob.shared_secret(&alice.public_key()).unwrap();
        assert_eq!(ab.as_ref(), ba.as_ref());

        let carol = Keypair::generate();
        let ac = alice.shared_secret(&carol.public_key()).unwrap();
        assert_ne!(ab.as_ref(), ac.as_ref());
    }

    #[test]
    fn test_serde_roundtrip() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"payload");
        let json = serde_json::to_string(&(kp.public_key(), sig.clone())).unwrap();
        let (pk, sig2): (PublicKey, Signature) = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, kp.public_key());
        assert_eq!(sig2, sig);
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let kp = Keypair::from_entropy(&[3u8; 32]);
        let debug_str = format!("{:?}", kp);
        assert!(debug_str.contains("<redacted>"));
        let scalar = hex::encode(kp.signing.to_bytes());
        assert!(!debug_str.contains(&scalar));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sign_verify_roundtrip(entropy in any::<[u8; 32]>(), msg in proptest::collection::vec(any::<u8>(), 0..256)) {
            let kp = Keypair::from_entropy(&entropy);
            let sig = kp.sign(&msg);
            prop_assert!(kp.public_key().verify(&msg, &sig));
        }

        #[test]
        fn prop_mismatched_key_rejects(a in any::<[u8; 32]>(), b in any::<[u8; 32]>(), msg in proptest::collection::vec(any::<u8>(), 1..64)) {
            prop_assume!(a != b);
            let signer = Keypair::from_entropy(&a);
            let other = Keypair::from_entropy(&b);
            let sig = signer.sign(&msg);
            prop_assert!(!other.public_key().verify(&msg, &sig));
        }
    }
}
