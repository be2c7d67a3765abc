//! Inner header of 4.x payloads.
//!
//! Sits in front of the XML inside the decrypted (and decompressed)
//! payload. Fields are `id:u8, len:u32, data`: stream algorithm, stream
//! key, any number of binaries (`flags:u8` then the blob), then the end
//! marker.

use zeroize::Zeroizing;

use passvault_common::{Error, Result};
use passvault_crypto::InnerStreamAlgorithm;

use crate::cursor::ByteCursor;
use crate::xml::PoolBinary;

const END: u8 = 0;
const STREAM_ID: u8 = 1;
const STREAM_KEY: u8 = 2;
const BINARY: u8 = 3;

const FLAG_PROTECTED: u8 = 0x01;

/// Parsed inner header.
pub struct InnerHeader {
    pub stream: InnerStreamAlgorithm,
    pub stream_key: Zeroizing<Vec<u8>>,
    pub binaries: Vec<PoolBinary>,
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPayload(msg.into())
}

impl InnerHeader {
    /// Parse the inner header; returns it and the offset of the XML.
    ///
    /// # Errors
    /// - `MalformedPayload` on truncation or missing stream settings
    /// - `UnsupportedCipher` for an unsupported stream algorithm
    pub fn read(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = ByteCursor::new(data);
        let truncated = || malformed("Inner header is truncated");

        let mut stream = None;
        let mut stream_key = None;
        let mut binaries = Vec::new();

        loop {
            let id = cursor.u8().ok_or_else(truncated)?;
            let len = cursor.u32().ok_or_else(truncated)? as usize;
            let value = cursor.take(len).ok_or_else(truncated)?;
            match id {
                END => break,
                STREAM_ID => {
                    let raw: [u8; 4] = value
                        .try_into()
                        .map_err(|_| malformed("Inner stream id must be 4 bytes"))?;
                    stream = Some(InnerStreamAlgorithm::from_id(u32::from_le_bytes(raw))?);
                }
                STREAM_KEY => stream_key = Some(Zeroizing::new(value.to_vec())),
                BINARY => {
                    let (flags, blob) = value
                        .split_first()
                        .ok_or_else(|| malformed("Empty inner binary field"))?;
                    binaries.push(PoolBinary {
                        data: blob.to_vec(),
                        protected: flags & FLAG_PROTECTED != 0,
                    });
                }
                other => tracing::debug!(field = other, len, "Skipping unknown inner header field"),
            }
        }

        let header = InnerHeader {
            stream: stream.ok_or_else(|| malformed("Inner header lacks stream id"))?,
            stream_key: stream_key.ok_or_else(|| malformed("Inner header lacks stream key"))?,
            binaries,
        };
        Ok((header, cursor.position()))
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::new());
        let mut put = |id: u8, parts: &[&[u8]]| {
            let len: usize = parts.iter().map(|p| p.len()).sum();
            out.push(id);
            out.extend_from_slice(&(len as u32).to_le_bytes());
            for part in parts {
                out.extend_from_slice(part);
            }
        };

        put(STREAM_ID, &[&self.stream.id().to_le_bytes()[..]]);
        put(STREAM_KEY, &[self.stream_key.as_slice()]);
        for binary in &self.binaries {
            let flags = if binary.protected { FLAG_PROTECTED } else { 0 };
            put(BINARY, &[&[flags][..], binary.data.as_slice()]);
        }
        put(END, &[]);
        out
    }
}
