//! Body ciphers: AES-256-CBC (PKCS#7) and ChaCha20.
//!
//! The container authenticates ciphertext separately (hashed or HMAC block
//! stream), so these are plain confidentiality transforms.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20::cipher::StreamCipher;
use chacha20::ChaCha20;
use serde::{Deserialize, Serialize};

use crate::keys::{random_vec, MasterKey};
use passvault_common::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size.
const AES_BLOCK: usize = 16;

/// Body cipher selected by the header's cipher id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherId {
    Aes256,
    ChaCha20,
}

impl CipherId {
    /// Header id of AES-256-CBC.
    pub const AES256_UUID: [u8; 16] = [
        0x31, 0xC1, 0xF2, 0xE6, 0xBF, 0x71, 0x43, 0x50, 0xBE, 0x58, 0x05, 0x21, 0x6A, 0xFC, 0x5A,
        0xFF,
    ];

    /// Header id of ChaCha20.
    pub const CHACHA20_UUID: [u8; 16] = [
        0xD6, 0x03, 0x8A, 0x2B, 0x8B, 0x6F, 0x4C, 0xB5, 0xA5, 0x24, 0x33, 0x9A, 0x31, 0xDB, 0xB5,
        0x9A,
    ];

    /// Resolve a header cipher id.
    ///
    /// # Errors
    /// - `UnsupportedCipher` for any id other than AES-256 and ChaCha20
    pub fn from_uuid(id: &[u8]) -> Result<Self> {
        if *id == Self::AES256_UUID {
            Ok(Self::Aes256)
        } else if *id == Self::CHACHA20_UUID {
            Ok(Self::ChaCha20)
        } else {
            Err(Error::UnsupportedCipher(hex::encode(id)))
        }
    }

    /// Header id of this cipher.
    pub fn uuid(&self) -> [u8; 16] {
        match self {
            Self::Aes256 => Self::AES256_UUID,
            Self::ChaCha20 => Self::CHACHA20_UUID,
        }
    }

    /// Required IV length in bytes.
    pub fn iv_len(&self) -> usize {
        match self {
            Self::Aes256 => 16,
            Self::ChaCha20 => 12,
        }
    }

    /// Fresh random IV of the right length.
    pub fn generate_iv(&self) -> Vec<u8> {
        random_vec(self.iv_len())
    }

    /// Encrypt a whole body.
    ///
    /// # Errors
    /// - `Crypto` if the IV has the wrong length
    pub fn encrypt(&self, key: &MasterKey, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Aes256 => {
                let enc = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
                    .map_err(|e| Error::Crypto(format!("Invalid AES key or IV: {}", e)))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
            }
            Self::ChaCha20 => chacha20_apply(key, iv, plaintext),
        }
    }

    /// Decrypt a whole body.
    ///
    /// # Errors
    /// - `IntegrityCheckFailed` on bad block alignment or padding, which is
    ///   how a wrong key usually surfaces with CBC
    /// - `Crypto` if the IV has the wrong length
    pub fn decrypt(&self, key: &MasterKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Aes256 => {
                if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK != 0 {
                    return Err(Error::IntegrityCheckFailed);
                }
                let dec = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
                    .map_err(|e| Error::Crypto(format!("Invalid AES key or IV: {}", e)))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(|_| Error::IntegrityCheckFailed)
            }
            Self::ChaCha20 => chacha20_apply(key, iv, ciphertext),
        }
    }
}

impl Default for CipherId {
    fn default() -> Self {
        Self::Aes256
    }
}

fn chacha20_apply(key: &MasterKey, iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut cipher = ChaCha20::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| Error::Crypto(format!("Invalid ChaCha20 key or IV: {}", e)))?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_aes_roundtrip_and_padding() {
        let cipher = CipherId::Aes256;
        let iv = cipher.generate_iv();
        let plaintext = b"exactly sixteen!";

        let ct = cipher.encrypt(&key(1), &iv, plaintext).unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(cipher.decrypt(&key(1), &iv, &ct).unwrap(), plaintext);
    }

    #[test]
    fn test_chacha20_roundtrip() {
        let cipher = CipherId::ChaCha20;
        let iv = cipher.generate_iv();
        assert_eq!(iv.len(), 12);

        let ct = cipher.encrypt(&key(2), &iv, b"stream data").unwrap();
        assert_eq!(ct.len(), 11);
        assert_eq!(cipher.decrypt(&key(2), &iv, &ct).unwrap(), b"stream data");
    }

    #[test]
    fn test_aes_misaligned_ciphertext_is_integrity_failure() {
        let cipher = CipherId::Aes256;
        let result = cipher.decrypt(&key(1), &[0u8; 16], &[0u8; 17]);
        assert!(matches!(result, Err(Error::IntegrityCheckFailed)));
    }

    #[test]
    fn test_wrong_iv_length() {
        let result = CipherId::ChaCha20.encrypt(&key(1), &[0u8; 16], b"x");
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_uuid_lookup() {
        assert_eq!(CipherId::from_uuid(&CipherId::AES256_UUID).unwrap(), CipherId::Aes256);
        assert_eq!(
            CipherId::from_uuid(&CipherId::CHACHA20_UUID).unwrap(),
            CipherId::ChaCha20
        );
        assert!(matches!(
            CipherId::from_uuid(&[0u8; 16]),
            Err(Error::UnsupportedCipher(_))
        ));
    }
}
