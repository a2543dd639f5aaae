//! Key management for event and block signing.
//!
//! Ed25519 keys identify participants: the registry maps public keys to
//! numeric participant ids, and every event body is signed with its creator's
//! key. Public keys and signatures serialize as raw byte vectors with sizes
//! validated during deserialization.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::Hash;

// Expected sizes for validation
const ED25519_PK_BYTES: usize = 32;
const ED25519_SK_BYTES: usize = 32;
pub(crate) const ED25519_SIG_BYTES: usize = 64;

/// An Ed25519 signing public key (32 bytes).
///
/// Inner bytes are `pub(crate)` to prevent external construction of
/// unvalidated keys. Use [`SigningKeypair::generate`] or deserialization.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

impl SigningPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Construct from raw bytes, validating the length and curve point.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ED25519_PK_BYTES] = bytes.try_into().ok()?;
        ed25519_dalek::VerifyingKey::from_bytes(&arr).ok()?;
        Some(SigningPublicKey(bytes.to_vec()))
    }

    /// BLAKE3 fingerprint of the key; used as the participant address.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain("moira.key.fingerprint", &self.0)
    }

    /// Hex form used in logs and the registry.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }

    /// Verify a detached signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(arr) = <[u8; ED25519_PK_BYTES]>::try_from(self.0.as_slice()) else {
            return false;
        };
        let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&arr) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; ED25519_SIG_BYTES]>::try_from(signature.0.as_slice()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
        vk.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey({})", self.to_hex())
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != ED25519_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Ed25519 public key: expected {} bytes, got {}",
                ED25519_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(SigningPublicKey(bytes))
    }
}

/// An Ed25519 signing secret key.
///
/// Inner bytes are `pub(crate)` so external crates cannot read or construct
/// secret keys directly.
#[derive(Clone)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// An Ed25519 detached signature (64 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature (used for not-yet-signed events in tests).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Construct from raw bytes, validating the length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ED25519_SIG_BYTES {
            return None;
        }
        Some(Signature(bytes.to_vec()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Allow empty signatures (unsigned test events). Reject anything else
        // that is not exactly one Ed25519 signature.
        if !bytes.is_empty() && bytes.len() != ED25519_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Ed25519 signature: expected {} bytes, got {}",
                ED25519_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// An Ed25519 signing keypair.
///
/// Implements [`Clone`] because the keypair is shared between the node's
/// event-creation and block-signing paths.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let sk = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        SigningKeypair {
            public: SigningPublicKey(sk.verifying_key().to_bytes().to_vec()),
            secret: SigningSecretKey(sk.to_bytes().to_vec()),
        }
    }

    /// Reconstruct a keypair from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Option<Self> {
        let arr: [u8; ED25519_SK_BYTES] = seed.try_into().ok()?;
        let sk = ed25519_dalek::SigningKey::from_bytes(&arr);
        Some(SigningKeypair {
            public: SigningPublicKey(sk.verifying_key().to_bytes().to_vec()),
            secret: SigningSecretKey(sk.to_bytes().to_vec()),
        })
    }

    /// The 32-byte seed, for persisting to the data directory.
    pub fn seed(&self) -> &[u8] {
        &self.secret.0
    }

    /// Sign a message, producing a detached signature.
    ///
    /// If the internal secret key is somehow corrupted, logs an error and
    /// returns an empty signature instead of panicking. An empty signature
    /// always fails verification, so no security property is lost.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let Ok(arr) = <[u8; ED25519_SK_BYTES]>::try_from(self.secret.0.as_slice()) else {
            tracing::error!("SigningKeypair::sign called with corrupted secret key");
            return Signature::empty();
        };
        let sk = ed25519_dalek::SigningKey::from_bytes(&arr);
        Signature(sk.sign(message).to_bytes().to_vec())
    }
}
