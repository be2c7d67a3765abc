//! Gzip for payloads and pooled binaries.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use passvault_common::{Error, Result};

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate gzip data.
///
/// # Errors
/// - `MalformedPayload` if the stream is not valid gzip
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::MalformedPayload(format!("Invalid gzip stream: {}", e)))?;
    Ok(out)
}
