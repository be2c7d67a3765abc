//! Key derivation: AES-KDF and Argon2.
//!
//! Argon2 (d or id) is memory-hard and the default for new databases.
//! AES-KDF is the pure iteration-count transform every KDBX reader
//! supports and the only one a 3.x container can describe.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::keys::{random_array, random_vec, CompositeKey, TransformedKey, KEY_LENGTH};
use passvault_common::{CancellationToken, Error, Result};

/// Algorithm id of AES-KDF.
pub const AES_KDF_UUID: [u8; 16] = [
    0xC9, 0xD9, 0xF3, 0x9A, 0x62, 0x8A, 0x44, 0x60, 0xBF, 0x74, 0x0D, 0x08, 0xC1, 0x8A, 0x4F, 0xEA,
];

/// Algorithm id of Argon2d.
pub const ARGON2D_UUID: [u8; 16] = [
    0xEF, 0x63, 0x6D, 0xDF, 0x8C, 0x29, 0x44, 0x4B, 0x91, 0xF7, 0xA9, 0xA4, 0x03, 0xE3, 0x0A, 0x0C,
];

/// Algorithm id of Argon2id.
pub const ARGON2ID_UUID: [u8; 16] = [
    0x9E, 0x29, 0x8B, 0x19, 0x56, 0xDB, 0x47, 0x73, 0xB2, 0x3D, 0xFC, 0x3E, 0xC6, 0xF0, 0xA1, 0xE6,
];

/// Argon2 version 1.0.
pub const ARGON2_VERSION_10: u32 = 0x10;
/// Argon2 version 1.3.
pub const ARGON2_VERSION_13: u32 = 0x13;

/// AES-KDF rounds between cancellation checks.
const AES_ROUNDS_PER_CHECK: u64 = 10_000;

/// Argon2 flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Argon2Variant {
    D,
    Id,
}

/// Stored key derivation parameters.
///
/// These round-trip through the container header unchanged; a save never
/// regenerates them on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfParams {
    /// AES-256-ECB applied `rounds` times.
    Aes { rounds: u64, seed: [u8; 32] },
    /// Argon2 with memory given in bytes.
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        iterations: u64,
        memory: u64,
        parallelism: u32,
        version: u32,
    },
}

impl KdfParams {
    /// AES-KDF with a random seed.
    pub fn aes(rounds: u64) -> Self {
        Self::Aes {
            rounds,
            seed: random_array(),
        }
    }

    /// Argon2id with explicit costs and a random salt.
    pub fn argon2id(iterations: u64, memory: u64, parallelism: u32) -> Self {
        Self::Argon2 {
            variant: Argon2Variant::Id,
            salt: random_vec(32),
            iterations,
            memory,
            parallelism,
            version: ARGON2_VERSION_13,
        }
    }

    /// Create parameters suitable for interactive use.
    ///
    /// Targets approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self::argon2id(3, 64 * 1024 * 1024, 4)
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self::argon2id(4, 256 * 1024 * 1024, 4)
    }

    /// Create moderate parameters for mobile devices.
    pub fn moderate() -> Self {
        Self::argon2id(3, 32 * 1024 * 1024, 2)
    }

    /// The 16-byte algorithm id stored in the header.
    pub fn uuid(&self) -> [u8; 16] {
        match self {
            Self::Aes { .. } => AES_KDF_UUID,
            Self::Argon2 {
                variant: Argon2Variant::D,
                ..
            } => ARGON2D_UUID,
            Self::Argon2 {
                variant: Argon2Variant::Id,
                ..
            } => ARGON2ID_UUID,
        }
    }

    /// Human readable algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes { .. } => "AES-KDF",
            Self::Argon2 {
                variant: Argon2Variant::D,
                ..
            } => "Argon2d",
            Self::Argon2 {
                variant: Argon2Variant::Id,
                ..
            } => "Argon2id",
        }
    }

    /// Whether this transform is memory-hard.
    pub fn is_memory_hard(&self) -> bool {
        matches!(self, Self::Argon2 { .. })
    }

    /// Same costs with a new random seed or salt.
    pub fn with_fresh_seed(&self) -> Self {
        match self {
            Self::Aes { rounds, .. } => Self::aes(*rounds),
            Self::Argon2 {
                variant,
                salt,
                iterations,
                memory,
                parallelism,
                version,
            } => Self::Argon2 {
                variant: *variant,
                salt: random_vec(salt.len().max(8)),
                iterations: *iterations,
                memory: *memory,
                parallelism: *parallelism,
                version: *version,
            },
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive the transformed key from credentials.
///
/// # Postconditions
/// - Deterministic for the same key and parameters
///
/// # Errors
/// - `InvalidCredentialsFormat` if the composite key is empty
/// - `UnsupportedKdf` for an unknown Argon2 version
/// - `Crypto` if the Argon2 costs are out of range
/// - `OperationCancelled` if `cancel` fires between rounds
///
/// # Security
/// - The raw composite never leaves this function
pub fn derive_key(
    key: &CompositeKey,
    params: &KdfParams,
    cancel: &CancellationToken,
) -> Result<TransformedKey> {
    cancel.check()?;
    let mut raw = key.raw()?;
    debug!(kdf = params.name(), "Deriving transformed key");

    let result = match params {
        KdfParams::Aes { rounds, seed } => aes_transform(&raw, seed, *rounds, cancel),
        KdfParams::Argon2 {
            variant,
            salt,
            iterations,
            memory,
            parallelism,
            version,
        } => argon2_transform(
            &raw,
            *variant,
            salt,
            *iterations,
            *memory,
            *parallelism,
            *version,
        ),
    };
    zeroize::Zeroize::zeroize(&mut raw);

    let transformed = result?;
    cancel.check()?;
    Ok(TransformedKey::from_bytes(transformed))
}

fn aes_transform(
    raw: &[u8; KEY_LENGTH],
    seed: &[u8; 32],
    rounds: u64,
    cancel: &CancellationToken,
) -> Result<[u8; KEY_LENGTH]> {
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut blocks = [
        GenericArray::clone_from_slice(&raw[..16]),
        GenericArray::clone_from_slice(&raw[16..]),
    ];

    let mut done = 0u64;
    while done < rounds {
        cancel.check()?;
        let batch = (rounds - done).min(AES_ROUNDS_PER_CHECK);
        for _ in 0..batch {
            cipher.encrypt_blocks(&mut blocks);
        }
        done += batch;
    }

    let mut hasher = Sha256::new();
    hasher.update(blocks[0]);
    hasher.update(blocks[1]);
    Ok(hasher.finalize().into())
}

fn argon2_transform(
    raw: &[u8; KEY_LENGTH],
    variant: Argon2Variant,
    salt: &[u8],
    iterations: u64,
    memory: u64,
    parallelism: u32,
    version: u32,
) -> Result<[u8; KEY_LENGTH]> {
    let version = match version {
        ARGON2_VERSION_10 => Version::V0x10,
        ARGON2_VERSION_13 => Version::V0x13,
        other => {
            return Err(Error::UnsupportedKdf(format!(
                "Argon2 version 0x{:x}",
                other
            )))
        }
    };
    let algorithm = match variant {
        Argon2Variant::D => Algorithm::Argon2d,
        Argon2Variant::Id => Algorithm::Argon2id,
    };

    let memory_kib = u32::try_from(memory / 1024)
        .map_err(|_| Error::Crypto("Argon2 memory cost out of range".to_string()))?;
    let iterations = u32::try_from(iterations)
        .map_err(|_| Error::Crypto("Argon2 iteration count out of range".to_string()))?;

    let argon2_params = Params::new(memory_kib, iterations, parallelism, Some(KEY_LENGTH))
        .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(algorithm, version, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(raw, salt, &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(key_bytes)
}
