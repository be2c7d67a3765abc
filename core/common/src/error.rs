//! Common error types for PassVault.
//!
//! Every variant is terminal for the call that produced it. Messages never
//! carry key material or decrypted field values.

use thiserror::Error;

/// Top-level error type for PassVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad signature, truncated header or a field with the wrong width.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Container major version newer (or older) than this codec understands.
    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// Unknown key derivation algorithm id.
    #[error("Unsupported key derivation function: {0}")]
    UnsupportedKdf(String),

    /// Unknown body cipher or inner stream algorithm.
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Keyfile or credential material could not be interpreted.
    #[error("Invalid credentials format: {0}")]
    InvalidCredentialsFormat(String),

    /// Wrong credentials or corrupt file. Deliberately not more specific.
    #[error("Integrity check failed: wrong credentials or corrupt file")]
    IntegrityCheckFailed,

    /// I/O operation on the byte stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cancellation token was triggered during a long-running step.
    #[error("Operation cancelled")]
    OperationCancelled,

    /// The decrypted payload is not a valid database document.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Cryptographic primitive failed for a reason other than integrity.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure means "wrong key or damaged file".
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Error::IntegrityCheckFailed)
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_does_not_leak_detail() {
        let msg = Error::IntegrityCheckFailed.to_string();
        assert!(msg.contains("wrong credentials or corrupt file"));
        assert!(Error::IntegrityCheckFailed.is_integrity_failure());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_integrity_failure());
    }

    #[test]
    fn test_version_display() {
        let err = Error::UnsupportedVersion { major: 5, minor: 0 };
        assert_eq!(err.to_string(), "Unsupported format version: 5.0");
    }
}
