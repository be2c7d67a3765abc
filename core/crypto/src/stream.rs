//! Inner random stream for protected fields.
//!
//! Protected values inside the payload are XORed with one continuous
//! keystream, consumed in document order. The stream key is regenerated on
//! every save, so the same password never meets the same keystream twice.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

use crate::keys::random_vec;
use passvault_common::{Error, Result};

/// Fixed Salsa20 nonce used for the inner stream.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner stream algorithm, identified by a numeric header id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InnerStreamAlgorithm {
    Salsa20,
    ChaCha20,
}

impl InnerStreamAlgorithm {
    /// Resolve a header id.
    ///
    /// # Errors
    /// - `UnsupportedCipher` for 0 (none), 1 (ArcFour) and unknown ids
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(Error::UnsupportedCipher(format!(
                "inner random stream id {}",
                other
            ))),
        }
    }

    /// Header id of this algorithm.
    pub fn id(&self) -> u32 {
        match self {
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }

    /// Length of a freshly generated stream key.
    pub fn key_len(&self) -> usize {
        match self {
            Self::Salsa20 => 32,
            Self::ChaCha20 => 64,
        }
    }

    /// Fresh random stream key.
    pub fn generate_key(&self) -> Vec<u8> {
        random_vec(self.key_len())
    }
}

impl Default for InnerStreamAlgorithm {
    fn default() -> Self {
        Self::ChaCha20
    }
}

enum Keystream {
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

/// Position-dependent keystream over the whole payload.
pub struct RandomStream {
    algorithm: InnerStreamAlgorithm,
    keystream: Keystream,
}

impl RandomStream {
    /// Initialise the stream from the key stored in the (inner) header.
    ///
    /// # Errors
    /// - `Crypto` if the derived key/nonce lengths do not fit the cipher
    pub fn new(algorithm: InnerStreamAlgorithm, key: &[u8]) -> Result<Self> {
        let keystream = match algorithm {
            InnerStreamAlgorithm::Salsa20 => {
                let hashed = Sha256::digest(key);
                let cipher = Salsa20::new_from_slices(&hashed, &SALSA20_NONCE)
                    .map_err(|e| Error::Crypto(format!("Invalid Salsa20 key: {}", e)))?;
                Keystream::Salsa20(Box::new(cipher))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let hashed = Sha512::digest(key);
                let cipher = ChaCha20::new_from_slices(&hashed[..32], &hashed[32..44])
                    .map_err(|e| Error::Crypto(format!("Invalid ChaCha20 key: {}", e)))?;
                Keystream::ChaCha20(Box::new(cipher))
            }
        };
        Ok(Self {
            algorithm,
            keystream,
        })
    }

    /// Algorithm backing this stream.
    pub fn algorithm(&self) -> InnerStreamAlgorithm {
        self.algorithm
    }

    /// XOR `data` in place with the next `data.len()` keystream bytes.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.keystream {
            Keystream::Salsa20(cipher) => cipher.apply_keystream(data),
            Keystream::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }

    /// Copying variant of [`RandomStream::apply`].
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

impl fmt::Debug for RandomStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RandomStream({:?}, [REDACTED])", self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_is_position_dependent() {
        let key = [7u8; 32];
        let mut stream = RandomStream::new(InnerStreamAlgorithm::Salsa20, &key).unwrap();
        let first = stream.process(b"password");
        let second = stream.process(b"password");
        assert_ne!(first, second);
    }

    #[test]
    fn test_same_key_same_sequence() {
        for algorithm in [InnerStreamAlgorithm::Salsa20, InnerStreamAlgorithm::ChaCha20] {
            let key = algorithm.generate_key();
            let mut writer = RandomStream::new(algorithm, &key).unwrap();
            let mut reader = RandomStream::new(algorithm, &key).unwrap();

            let a = writer.process(b"first");
            let b = writer.process(b"second value");

            assert_eq!(reader.process(&a), b"first");
            assert_eq!(reader.process(&b), b"second value");
        }
    }

    #[test]
    fn test_ids() {
        assert_eq!(InnerStreamAlgorithm::from_id(2).unwrap(), InnerStreamAlgorithm::Salsa20);
        assert_eq!(InnerStreamAlgorithm::from_id(3).unwrap(), InnerStreamAlgorithm::ChaCha20);
        assert!(InnerStreamAlgorithm::from_id(1).is_err());
        assert_eq!(InnerStreamAlgorithm::ChaCha20.id(), 3);
        assert_eq!(InnerStreamAlgorithm::ChaCha20.key_len(), 64);
    }
}
