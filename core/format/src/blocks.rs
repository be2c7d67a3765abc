//! Authenticated block streams framing the encrypted body.
//!
//! - 3.x: hashed blocks `index:u32, sha256:[32], size:u32, data` inside the
//!   ciphertext, ended by an empty block with an all-zero hash
//! - 4.x: HMAC blocks `hmac:[32], size:i32, data` around the ciphertext,
//!   ended by an empty block

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use passvault_common::{CancellationToken, Error, Result};
use passvault_crypto::HmacKey;

use crate::cursor::ByteCursor;

/// Payload bytes per block when writing.
pub const BLOCK_SIZE: usize = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Index whose block key authenticates the header.
pub const HEADER_HMAC_INDEX: u64 = u64::MAX;

fn hmac_for(key: &HmacKey, index: u64) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(&key.block_key(index))
        .map_err(|e| Error::Crypto(format!("Invalid HMAC key: {}", e)))
}

/// HMAC-SHA-256 of the raw header.
pub fn header_hmac(header: &[u8], key: &HmacKey) -> Result<[u8; 32]> {
    let mut mac = hmac_for(key, HEADER_HMAC_INDEX)?;
    mac.update(header);
    Ok(mac.finalize().into_bytes().into())
}

/// Check the header HMAC in constant time.
///
/// # Errors
/// - `IntegrityCheckFailed` on mismatch, which is how wrong credentials
///   surface for 4.x containers
pub fn verify_header_hmac(header: &[u8], expected: &[u8], key: &HmacKey) -> Result<()> {
    let mut mac = hmac_for(key, HEADER_HMAC_INDEX)?;
    mac.update(header);
    mac.verify_slice(expected)
        .map_err(|_| Error::IntegrityCheckFailed)
}

fn block_hmac(key: &HmacKey, index: u64, data: &[u8]) -> Result<HmacSha256> {
    let mut mac = hmac_for(key, index)?;
    mac.update(&index.to_le_bytes());
    mac.update(&(data.len() as i32).to_le_bytes());
    mac.update(data);
    Ok(mac)
}

/// Split `data` into HMAC blocks.
pub fn write_hmac_blocks(
    data: &[u8],
    key: &HmacKey,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + (data.len() / BLOCK_SIZE + 2) * 36);
    let mut index = 0u64;
    for chunk in data.chunks(BLOCK_SIZE).chain(std::iter::once(&[][..])) {
        cancel.check()?;
        let tag = block_hmac(key, index, chunk)?.finalize().into_bytes();
        out.extend_from_slice(&tag);
        out.extend_from_slice(&(chunk.len() as i32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    debug!(blocks = index, "HMAC block stream written");
    Ok(out)
}

/// Verify and join HMAC blocks.
///
/// # Errors
/// - `IntegrityCheckFailed` on a bad tag, negative size or truncation
/// - `OperationCancelled` if `cancel` fires between blocks
pub fn read_hmac_blocks(
    data: &[u8],
    key: &HmacKey,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut cursor = ByteCursor::new(data);
    let mut out = Vec::with_capacity(data.len());
    let mut index = 0u64;
    loop {
        cancel.check()?;
        let tag = cursor.take(32).ok_or(Error::IntegrityCheckFailed)?;
        let size = cursor.i32().ok_or(Error::IntegrityCheckFailed)?;
        let size = usize::try_from(size).map_err(|_| Error::IntegrityCheckFailed)?;
        let chunk = cursor.take(size).ok_or(Error::IntegrityCheckFailed)?;

        block_hmac(key, index, chunk)?
            .verify_slice(tag)
            .map_err(|_| Error::IntegrityCheckFailed)?;

        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(chunk);
        index += 1;
    }
    debug!(blocks = index + 1, "HMAC block stream verified");
    Ok(out)
}

/// Split `data` into hashed blocks.
pub fn write_hashed_blocks(data: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + (data.len() / BLOCK_SIZE + 2) * 40);
    let mut index = 0u32;
    for chunk in data.chunks(BLOCK_SIZE) {
        cancel.check()?;
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&Sha256::digest(chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index += 1;
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    debug!(blocks = index + 1, "Hashed block stream written");
    Ok(out)
}

/// Verify and join hashed blocks.
///
/// # Errors
/// - `IntegrityCheckFailed` on a wrong index, hash mismatch, non-zero
///   terminator hash or truncation
pub fn read_hashed_blocks(data: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
    let mut cursor = ByteCursor::new(data);
    let mut out = Vec::with_capacity(data.len());
    let mut expected_index = 0u32;
    loop {
        cancel.check()?;
        let index = cursor.u32().ok_or(Error::IntegrityCheckFailed)?;
        let hash = cursor.take(32).ok_or(Error::IntegrityCheckFailed)?;
        let size = cursor.u32().ok_or(Error::IntegrityCheckFailed)? as usize;
        if index != expected_index {
            return Err(Error::IntegrityCheckFailed);
        }

        if size == 0 {
            if hash.iter().any(|b| *b != 0) {
                return Err(Error::IntegrityCheckFailed);
            }
            break;
        }

        let chunk = cursor.take(size).ok_or(Error::IntegrityCheckFailed)?;
        if Sha256::digest(chunk).as_slice() != hash {
            return Err(Error::IntegrityCheckFailed);
        }
        out.extend_from_slice(chunk);
        expected_index += 1;
    }
    debug!(blocks = expected_index + 1, "Hashed block stream verified");
    Ok(out)
}
