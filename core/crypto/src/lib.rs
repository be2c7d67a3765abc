//! Cryptographic primitives for the PassVault container.
//!
//! This module provides:
//! - Composite keys built from password, keyfile and extra factors
//! - Key derivation using AES-KDF, Argon2d or Argon2id
//! - Body encryption with AES-256-CBC or ChaCha20
//! - The inner random stream (Salsa20 / ChaCha20) for protected fields
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod cipher;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod stream;

pub use cipher::CipherId;
pub use kdf::{derive_key, Argon2Variant, KdfParams};
pub use keys::{constant_time_eq, CompositeKey, HmacKey, MasterKey, TransformedKey, KEY_LENGTH};
pub use stream::{InnerStreamAlgorithm, RandomStream};
