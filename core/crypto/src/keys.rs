//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.
//!
//! The hierarchy is: [`CompositeKey`] (credentials) → KDF →
//! [`TransformedKey`] → per-save [`MasterKey`] (body cipher) and
//! [`HmacKey`] (block authentication).

use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keyfile;
use passvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Fill a fresh array from the OS-seeded thread RNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Random bytes of arbitrary length.
pub fn random_vec(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Compare two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// User credentials: one hashed component per factor.
///
/// Components are kept in the order they were added; the raw composite is
/// SHA-256 over their concatenation.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CompositeKey {
    components: Vec<[u8; KEY_LENGTH]>,
}

impl CompositeKey {
    /// Create an empty key. At least one component must be added before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a password-only key.
    pub fn from_password(password: &[u8]) -> Self {
        Self::new().with_password(password)
    }

    /// Add a password component.
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.components.push(Sha256::digest(password).into());
        self
    }

    /// Add a keyfile component.
    ///
    /// # Errors
    /// - `InvalidCredentialsFormat` if the keyfile is empty or is an XML
    ///   keyfile with bad structure, encoding or checksum
    pub fn with_keyfile(mut self, keyfile_bytes: &[u8]) -> Result<Self> {
        let component = keyfile::key_from_bytes(keyfile_bytes)?;
        self.components.push(component);
        Ok(self)
    }

    /// Add an additional factor (e.g. a challenge-response secret).
    pub fn with_raw_component(mut self, data: &[u8]) -> Self {
        self.components.push(Sha256::digest(data).into());
        self
    }

    /// Number of factors in this key.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Compute the 32-byte raw composite fed into the KDF.
    ///
    /// # Errors
    /// - `InvalidCredentialsFormat` if no component was added
    pub fn raw(&self) -> Result<[u8; KEY_LENGTH]> {
        if self.components.is_empty() {
            return Err(Error::InvalidCredentialsFormat(
                "Composite key has no components".to_string(),
            ));
        }

        let mut hasher = Sha256::new();
        for component in &self.components {
            hasher.update(component);
        }
        Ok(hasher.finalize().into())
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompositeKey([REDACTED; {} components])", self.components.len())
    }
}

/// Output of the key derivation function.
///
/// Stable for as long as the KDF parameters are unchanged, so a session can
/// cache it and skip the slow transform on every save.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransformedKey {
    key: [u8; KEY_LENGTH],
}

impl TransformedKey {
    /// Create a transformed key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the body cipher key for one save: `SHA-256(seed || key)`.
    pub fn master_key(&self, master_seed: &[u8]) -> MasterKey {
        let mut hasher = Sha256::new();
        hasher.update(master_seed);
        hasher.update(self.key);
        MasterKey::from_bytes(hasher.finalize().into())
    }

    /// Derive the block authentication key: `SHA-512(seed || key || 0x01)`.
    pub fn hmac_key(&self, master_seed: &[u8]) -> HmacKey {
        let mut hasher = Sha512::new();
        hasher.update(master_seed);
        hasher.update(self.key);
        hasher.update([1u8]);
        let mut base = [0u8; 64];
        base.copy_from_slice(&hasher.finalize());
        HmacKey { base }
    }
}

impl fmt::Debug for TransformedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformedKey([REDACTED])")
    }
}

/// Key for the body cipher of a single saved file.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Base key for per-block HMACs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HmacKey {
    base: [u8; 64],
}

impl HmacKey {
    /// Key for the block at `index`: `SHA-512(index_le || base)`.
    ///
    /// The header is authenticated with `index = u64::MAX`.
    pub fn block_key(&self, index: u64) -> [u8; 64] {
        let mut hasher = Sha512::new();
        hasher.update(index.to_le_bytes());
        hasher.update(self.base);
        let mut out = [0u8; 64];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

impl fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HmacKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_only_composite_is_double_sha256() {
        let key = CompositeKey::from_password(b"test");
        let expected: [u8; 32] = Sha256::digest(Sha256::digest(b"test")).into();
        assert_eq!(key.raw().unwrap(), expected);
    }

    #[test]
    fn test_empty_composite_rejected() {
        let key = CompositeKey::new();
        assert!(matches!(key.raw(), Err(Error::InvalidCredentialsFormat(_))));
    }

    #[test]
    fn test_component_order_matters() {
        let a = CompositeKey::new().with_password(b"pw").with_raw_component(b"extra");
        let b = CompositeKey::new().with_raw_component(b"extra").with_password(b"pw");
        assert_ne!(a.raw().unwrap(), b.raw().unwrap());
        assert_eq!(a.component_count(), 2);
    }

    #[test]
    fn test_master_key_depends_on_seed() {
        let transformed = TransformedKey::from_bytes([7u8; KEY_LENGTH]);
        let k1 = transformed.master_key(&[1u8; 32]);
        let k2 = transformed.master_key(&[2u8; 32]);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_block_keys_differ_per_index() {
        let hmac = TransformedKey::from_bytes([9u8; KEY_LENGTH]).hmac_key(&[3u8; 32]);
        assert_ne!(hmac.block_key(0), hmac.block_key(1));
        assert_ne!(hmac.block_key(0), hmac.block_key(u64::MAX));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = CompositeKey::from_password(b"secret");
        assert!(!format!("{:?}", key).contains("secret"));
        let master = MasterKey::from_bytes([0xAB; KEY_LENGTH]);
        assert_eq!(format!("{:?}", master), "MasterKey([REDACTED])");
    }

    #[test]
    fn test_random_values_differ() {
        let a: [u8; 32] = random_array();
        let b: [u8; 32] = random_array();
        assert_ne!(a, b);
        assert_eq!(random_vec(12).len(), 12);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
