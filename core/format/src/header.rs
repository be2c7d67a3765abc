//! Outer container header.
//!
//! Layout: two signatures, a packed version, then type-length-value fields
//! until the end marker. Field lengths are `u16` in 3.x and `u32` in 4.x.

use tracing::debug;

use passvault_common::{Error, Result};
use passvault_crypto::kdf::{
    Argon2Variant, AES_KDF_UUID, ARGON2D_UUID, ARGON2ID_UUID,
};
use passvault_crypto::{CipherId, InnerStreamAlgorithm, KdfParams};
use passvault_model::{Compression, ContainerSettings, FormatVersion};

use crate::cursor::ByteCursor;
use crate::variant::{VariantDictionary, VariantValue};

/// First file signature.
pub const SIGNATURE_1: u32 = 0x9AA2_D903;
/// Second file signature (KeePass 2.x).
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

const END_MARKER: &[u8] = b"\r\n\r\n";

mod field {
    pub const END: u8 = 0;
    pub const COMMENT: u8 = 1;
    pub const CIPHER_ID: u8 = 2;
    pub const COMPRESSION: u8 = 3;
    pub const MASTER_SEED: u8 = 4;
    pub const TRANSFORM_SEED: u8 = 5;
    pub const TRANSFORM_ROUNDS: u8 = 6;
    pub const ENCRYPTION_IV: u8 = 7;
    pub const PROTECTED_STREAM_KEY: u8 = 8;
    pub const STREAM_START_BYTES: u8 = 9;
    pub const INNER_RANDOM_STREAM_ID: u8 = 10;
    pub const KDF_PARAMETERS: u8 = 11;
    pub const PUBLIC_CUSTOM_DATA: u8 = 12;
}

mod kdf_key {
    pub const UUID: &str = "$UUID";
    pub const ROUNDS: &str = "R";
    pub const SEED: &str = "S";
    pub const SALT: &str = "S";
    pub const PARALLELISM: &str = "P";
    pub const MEMORY: &str = "M";
    pub const ITERATIONS: &str = "I";
    pub const VERSION: &str = "V";
}

/// Parsed outer header.
///
/// The 3.x-only fields are `None` for 4.x containers, whose stream settings
/// live in the inner header instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: FormatVersion,
    pub cipher: CipherId,
    pub compression: Compression,
    pub master_seed: [u8; 32],
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParams,
    pub protected_stream_key: Option<Vec<u8>>,
    pub stream_start_bytes: Option<[u8; 32]>,
    pub inner_stream: Option<InnerStreamAlgorithm>,
    pub public_custom_data: Option<Vec<u8>>,
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedHeader(msg.into())
}

fn truncated() -> Error {
    malformed("Header is truncated")
}

fn exact<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        malformed(format!(
            "{} must be {} bytes, found {}",
            what,
            N,
            data.len()
        ))
    })
}

impl Header {
    /// Container settings described by this header.
    pub fn settings(&self) -> ContainerSettings {
        ContainerSettings {
            version: self.version,
            cipher: self.cipher,
            compression: self.compression,
            kdf: self.kdf.clone(),
            inner_stream: self.inner_stream.unwrap_or_default(),
            public_custom_data: self.public_custom_data.clone(),
        }
    }

    /// Parse the header at the start of `data`.
    ///
    /// Returns the header and its length in bytes; `data[..len]` is the raw
    /// header that the integrity checks cover.
    ///
    /// # Errors
    /// - `MalformedHeader` for bad signatures, truncation, wrong widths or
    ///   missing mandatory fields
    /// - `UnsupportedVersion` for a major version other than 3 or 4
    /// - `UnsupportedCipher` / `UnsupportedKdf` for unknown algorithm ids
    pub fn read(data: &[u8]) -> Result<(Header, usize)> {
        let mut cursor = ByteCursor::new(data);

        let sig1 = cursor.u32().ok_or_else(truncated)?;
        let sig2 = cursor.u32().ok_or_else(truncated)?;
        if sig1 != SIGNATURE_1 || sig2 != SIGNATURE_2 {
            return Err(malformed("Not a KeePass 2.x database (bad signature)"));
        }

        let version = FormatVersion::from_u32(cursor.u32().ok_or_else(truncated)?);
        if !version.is_supported() {
            return Err(Error::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            });
        }
        let v4 = version.is_kdbx4();

        let mut cipher = None;
        let mut compression = None;
        let mut master_seed = None;
        let mut encryption_iv = None;
        let mut transform_seed = None;
        let mut transform_rounds = None;
        let mut protected_stream_key = None;
        let mut stream_start_bytes = None;
        let mut inner_stream = None;
        let mut kdf = None;
        let mut public_custom_data = None;

        loop {
            let id = cursor.u8().ok_or_else(truncated)?;
            let len = if v4 {
                cursor.u32().ok_or_else(truncated)? as usize
            } else {
                cursor.u16().ok_or_else(truncated)? as usize
            };
            let value = cursor.take(len).ok_or_else(truncated)?;

            match id {
                field::END => break,
                field::COMMENT => {}
                field::CIPHER_ID => cipher = Some(CipherId::from_uuid(value)?),
                field::COMPRESSION => {
                    let raw = u32::from_le_bytes(exact(value, "Compression flag")?);
                    compression = Some(Compression::from_id(raw).ok_or_else(|| {
                        malformed(format!("Unknown compression algorithm {}", raw))
                    })?);
                }
                field::MASTER_SEED => master_seed = Some(exact::<32>(value, "Master seed")?),
                field::ENCRYPTION_IV => encryption_iv = Some(value.to_vec()),
                field::TRANSFORM_SEED if !v4 => {
                    transform_seed = Some(exact::<32>(value, "Transform seed")?)
                }
                field::TRANSFORM_ROUNDS if !v4 => {
                    transform_rounds =
                        Some(u64::from_le_bytes(exact(value, "Transform rounds")?))
                }
                field::PROTECTED_STREAM_KEY if !v4 => {
                    protected_stream_key = Some(value.to_vec())
                }
                field::STREAM_START_BYTES if !v4 => {
                    stream_start_bytes = Some(exact::<32>(value, "Stream start bytes")?)
                }
                field::INNER_RANDOM_STREAM_ID if !v4 => {
                    let raw = u32::from_le_bytes(exact(value, "Inner random stream id")?);
                    inner_stream = Some(InnerStreamAlgorithm::from_id(raw)?);
                }
                field::KDF_PARAMETERS if v4 => {
                    kdf = Some(kdf_from_dictionary(&VariantDictionary::parse(value)?)?)
                }
                field::PUBLIC_CUSTOM_DATA if v4 => public_custom_data = Some(value.to_vec()),
                other => debug!(field = other, len, "Skipping unknown header field"),
            }
        }

        let cipher = cipher.ok_or_else(|| malformed("Missing cipher id"))?;
        let master_seed = master_seed.ok_or_else(|| malformed("Missing master seed"))?;
        let encryption_iv = encryption_iv.ok_or_else(|| malformed("Missing encryption IV"))?;
        if encryption_iv.len() != cipher.iv_len() {
            return Err(malformed(format!(
                "Encryption IV must be {} bytes, found {}",
                cipher.iv_len(),
                encryption_iv.len()
            )));
        }

        let kdf = if v4 {
            kdf.ok_or_else(|| malformed("Missing KDF parameters"))?
        } else {
            KdfParams::Aes {
                rounds: transform_rounds.ok_or_else(|| malformed("Missing transform rounds"))?,
                seed: transform_seed.ok_or_else(|| malformed("Missing transform seed"))?,
            }
        };

        if !v4 {
            if protected_stream_key.is_none() {
                return Err(malformed("Missing protected stream key"));
            }
            if stream_start_bytes.is_none() {
                return Err(malformed("Missing stream start bytes"));
            }
            if inner_stream.is_none() {
                return Err(malformed("Missing inner random stream id"));
            }
        }

        let header = Header {
            version,
            cipher,
            compression: compression.unwrap_or(Compression::None),
            master_seed,
            encryption_iv,
            kdf,
            protected_stream_key,
            stream_start_bytes,
            inner_stream,
            public_custom_data,
        };
        debug!(
            version = %header.version,
            cipher = ?header.cipher,
            kdf = header.kdf.name(),
            len = cursor.position(),
            "Header read"
        );
        Ok((header, cursor.position()))
    }

    /// Serialize the header in fixed field order.
    ///
    /// # Errors
    /// - `InvalidInput` if a 3.x header is asked to carry Argon2 or lacks
    ///   its stream fields
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let v4 = self.version.is_kdbx4();
        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        out.extend_from_slice(&self.version.to_u32().to_le_bytes());

        let mut put = |id: u8, value: &[u8]| {
            out.push(id);
            if v4 {
                out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            }
            out.extend_from_slice(value);
        };

        put(field::CIPHER_ID, &self.cipher.uuid());
        put(field::COMPRESSION, &self.compression.id().to_le_bytes());
        put(field::MASTER_SEED, &self.master_seed);

        if v4 {
            put(field::ENCRYPTION_IV, &self.encryption_iv);
            put(
                field::KDF_PARAMETERS,
                &kdf_to_dictionary(&self.kdf).to_bytes(),
            );
            if let Some(data) = &self.public_custom_data {
                put(field::PUBLIC_CUSTOM_DATA, data);
            }
        } else {
            let (rounds, seed) = match &self.kdf {
                KdfParams::Aes { rounds, seed } => (*rounds, seed),
                KdfParams::Argon2 { .. } => {
                    return Err(Error::InvalidInput(
                        "A 3.x header cannot carry Argon2 parameters".to_string(),
                    ))
                }
            };
            let missing = || Error::InvalidInput("3.x header lacks stream fields".to_string());
            let stream_key = self.protected_stream_key.as_ref().ok_or_else(missing)?;
            let start_bytes = self.stream_start_bytes.as_ref().ok_or_else(missing)?;
            let inner = self.inner_stream.ok_or_else(missing)?;

            put(field::TRANSFORM_SEED, seed);
            put(field::TRANSFORM_ROUNDS, &rounds.to_le_bytes());
            put(field::ENCRYPTION_IV, &self.encryption_iv);
            put(field::PROTECTED_STREAM_KEY, stream_key);
            put(field::STREAM_START_BYTES, start_bytes);
            put(field::INNER_RANDOM_STREAM_ID, &inner.id().to_le_bytes());
        }
        put(field::END, END_MARKER);

        Ok(out)
    }
}

/// Decode KDF parameters from a 4.x dictionary.
///
/// # Errors
/// - `UnsupportedKdf` for an unknown algorithm id
/// - `MalformedHeader` for missing or mistyped parameters
pub fn kdf_from_dictionary(dict: &VariantDictionary) -> Result<KdfParams> {
    let uuid = dict
        .get_bytes(kdf_key::UUID)
        .ok_or_else(|| malformed("KDF parameters lack an algorithm id"))?;
    let missing = |name: &str| malformed(format!("KDF parameter '{}' missing or mistyped", name));

    if *uuid == AES_KDF_UUID {
        let rounds = dict
            .get_u64(kdf_key::ROUNDS)
            .ok_or_else(|| missing(kdf_key::ROUNDS))?;
        let seed = dict
            .get_bytes(kdf_key::SEED)
            .ok_or_else(|| missing(kdf_key::SEED))?;
        return Ok(KdfParams::Aes {
            rounds,
            seed: exact::<32>(seed, "AES-KDF seed")?,
        });
    }

    let variant = if *uuid == ARGON2D_UUID {
        Argon2Variant::D
    } else if *uuid == ARGON2ID_UUID {
        Argon2Variant::Id
    } else {
        return Err(Error::UnsupportedKdf(hex::encode(uuid)));
    };

    Ok(KdfParams::Argon2 {
        variant,
        salt: dict
            .get_bytes(kdf_key::SALT)
            .ok_or_else(|| missing(kdf_key::SALT))?
            .to_vec(),
        iterations: dict
            .get_u64(kdf_key::ITERATIONS)
            .ok_or_else(|| missing(kdf_key::ITERATIONS))?,
        memory: dict
            .get_u64(kdf_key::MEMORY)
            .ok_or_else(|| missing(kdf_key::MEMORY))?,
        parallelism: dict
            .get_u32(kdf_key::PARALLELISM)
            .ok_or_else(|| missing(kdf_key::PARALLELISM))?,
        version: dict
            .get_u32(kdf_key::VERSION)
            .ok_or_else(|| missing(kdf_key::VERSION))?,
    })
}

/// Encode KDF parameters as a 4.x dictionary.
pub fn kdf_to_dictionary(kdf: &KdfParams) -> VariantDictionary {
    let mut dict = VariantDictionary::new();
    dict.set(kdf_key::UUID, VariantValue::Bytes(kdf.uuid().to_vec()));
    match kdf {
        KdfParams::Aes { rounds, seed } => {
            dict.set(kdf_key::ROUNDS, VariantValue::U64(*rounds));
            dict.set(kdf_key::SEED, VariantValue::Bytes(seed.to_vec()));
        }
        KdfParams::Argon2 {
            salt,
            iterations,
            memory,
            parallelism,
            version,
            ..
        } => {
            dict.set(kdf_key::SALT, VariantValue::Bytes(salt.clone()));
            dict.set(kdf_key::PARALLELISM, VariantValue::U32(*parallelism));
            dict.set(kdf_key::MEMORY, VariantValue::U64(*memory));
            dict.set(kdf_key::ITERATIONS, VariantValue::U64(*iterations));
            dict.set(kdf_key::VERSION, VariantValue::U32(*version));
        }
    }
    dict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_header() -> Header {
        Header {
            version: FormatVersion::CURRENT,
            cipher: CipherId::ChaCha20,
            compression: Compression::Gzip,
            master_seed: [1u8; 32],
            encryption_iv: vec![2u8; 12],
            kdf: KdfParams::argon2id(2, 64 * 1024, 1),
            protected_stream_key: None,
            stream_start_bytes: None,
            inner_stream: None,
            public_custom_data: Some(vec![9, 9]),
        }
    }

    fn v3_header() -> Header {
        Header {
            version: FormatVersion::KDBX3_1,
            cipher: CipherId::Aes256,
            compression: Compression::None,
            master_seed: [3u8; 32],
            encryption_iv: vec![4u8; 16],
            kdf: KdfParams::aes(6000),
            protected_stream_key: Some(vec![5u8; 32]),
            stream_start_bytes: Some([6u8; 32]),
            inner_stream: Some(InnerStreamAlgorithm::Salsa20),
            public_custom_data: None,
        }
    }

    #[test]
    fn test_v4_header_reads_back() {
        let header = v4_header();
        let mut bytes = header.to_bytes().unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"body follows");

        let (parsed, len) = Header::read(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(len, header_len);
    }

    #[test]
    fn test_v3_header_reads_back() {
        let header = v3_header();
        let bytes = header.to_bytes().unwrap();
        let (parsed, len) = Header::read(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(len, bytes.len());
        assert_eq!(parsed.settings().inner_stream, InnerStreamAlgorithm::Salsa20);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = v4_header().to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(Header::read(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_unsupported_major_version() {
        let mut bytes = v4_header().to_bytes().unwrap();
        bytes[10] = 5;
        assert!(matches!(
            Header::read(&bytes),
            Err(Error::UnsupportedVersion { major: 5, .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = v3_header().to_bytes().unwrap();
        for cut in [3, 12, 40, bytes.len() - 1] {
            assert!(matches!(
                Header::read(&bytes[..cut]),
                Err(Error::MalformedHeader(_))
            ));
        }
    }

    #[test]
    fn test_unknown_kdf_rejected() {
        let mut dict = VariantDictionary::new();
        dict.set("$UUID", VariantValue::Bytes(vec![0xAA; 16]));
        assert!(matches!(
            kdf_from_dictionary(&dict),
            Err(Error::UnsupportedKdf(_))
        ));
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let mut bytes = v3_header().to_bytes().unwrap();
        // cipher id value starts after sigs, version, id byte and u16 length
        bytes[12 + 3] ^= 0xFF;
        assert!(matches!(
            Header::read(&bytes),
            Err(Error::UnsupportedCipher(_))
        ));
    }

    #[test]
    fn test_v3_cannot_carry_argon2() {
        let mut header = v3_header();
        header.kdf = KdfParams::argon2id(1, 64 * 1024, 1);
        assert!(matches!(header.to_bytes(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_kdf_dictionary_roundtrip() {
        for kdf in [KdfParams::aes(1234), KdfParams::argon2id(3, 1 << 20, 2)] {
            let parsed = kdf_from_dictionary(&kdf_to_dictionary(&kdf)).unwrap();
            assert_eq!(parsed, kdf);
        }
    }
}
