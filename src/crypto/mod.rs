//! Cryptographic primitives: Ed25519 signing keys and signatures.

pub mod keys;

pub use keys::{Signature, SigningKeypair, SigningPublicKey};
