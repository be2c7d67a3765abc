//! Values that stay masked while held in memory.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use passvault_crypto::{constant_time_eq, keys::random_vec};

/// A sensitive string XOR-masked with a random pad of the same length.
///
/// The plaintext only exists transiently inside [`ProtectedValue::reveal`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProtectedValue {
    masked: Vec<u8>,
    pad: Vec<u8>,
}

impl ProtectedValue {
    /// Mask `plaintext` with a fresh pad.
    pub fn new(plaintext: &str) -> Self {
        Self::from_bytes(plaintext.as_bytes())
    }

    /// Mask raw bytes. Invalid UTF-8 is replaced on reveal.
    pub fn from_bytes(plaintext: &[u8]) -> Self {
        let pad = random_vec(plaintext.len());
        let masked = plaintext.iter().zip(&pad).map(|(p, k)| p ^ k).collect();
        Self { masked, pad }
    }

    /// Recover the plaintext. The returned buffer is wiped on drop.
    pub fn reveal(&self) -> Zeroizing<String> {
        let bytes = self.reveal_bytes();
        Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Recover the plaintext bytes.
    pub fn reveal_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(
            self.masked
                .iter()
                .zip(&self.pad)
                .map(|(m, k)| m ^ k)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.masked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masked.is_empty()
    }
}

impl PartialEq for ProtectedValue {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.reveal_bytes(), &other.reveal_bytes())
    }
}

impl Eq for ProtectedValue {}

impl fmt::Debug for ProtectedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedValue([REDACTED; {} bytes])", self.masked.len())
    }
}

/// Value of an entry string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Plain(String),
    Protected(ProtectedValue),
}

impl FieldValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain(value.into())
    }

    pub fn protected(value: &str) -> Self {
        Self::Protected(ProtectedValue::new(value))
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Protected(_))
    }

    /// Plaintext of the value, unmasking if needed.
    pub fn reveal(&self) -> Zeroizing<String> {
        match self {
            Self::Plain(s) => Zeroizing::new(s.clone()),
            Self::Protected(p) => p.reveal(),
        }
    }

    /// Same plaintext, switched to the requested protection.
    pub fn with_protection(&self, protect: bool) -> Self {
        match (self, protect) {
            (Self::Plain(s), true) => Self::protected(s),
            (Self::Protected(p), false) => Self::Plain(p.reveal().to_string()),
            _ => self.clone(),
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        Self::Plain(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reveal_roundtrip() {
        let value = ProtectedValue::new("hunter2");
        assert_eq!(value.reveal().as_str(), "hunter2");
        assert_eq!(value.len(), 7);
    }

    #[test]
    fn test_equality_compares_plaintext() {
        let a = ProtectedValue::new("same");
        let b = ProtectedValue::new("same");
        assert_eq!(a, b);
        assert_ne!(a, ProtectedValue::new("other"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let value = FieldValue::protected("secret");
        assert!(!format!("{:?}", value).contains("secret"));
    }

    #[test]
    fn test_with_protection() {
        let plain = FieldValue::plain("x");
        let protected = plain.with_protection(true);
        assert!(protected.is_protected());
        assert_eq!(protected.reveal().as_str(), "x");
        assert_eq!(protected.with_protection(false), plain);
    }
}
