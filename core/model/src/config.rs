//! Container settings carried alongside a database.
//!
//! These are the knobs that live in the binary header rather than the XML
//! payload. They round-trip through a load and save unchanged, except for
//! the per-save random material which never appears here.

use serde::{Deserialize, Serialize};

use passvault_crypto::{CipherId, InnerStreamAlgorithm, KdfParams};

/// Container format version (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    /// Version written for new databases.
    pub const CURRENT: Self = Self { major: 4, minor: 0 };

    /// Last 3.x revision.
    pub const KDBX3_1: Self = Self { major: 3, minor: 1 };

    /// Whether the codec can read this version.
    pub fn is_supported(&self) -> bool {
        self.major == 3 || self.major == 4
    }

    /// Major 4 and later carry KDF parameters and an inner header.
    pub fn is_kdbx4(&self) -> bool {
        self.major >= 4
    }

    /// Packed header form: minor in the low half, major in the high half.
    pub fn to_u32(&self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn id(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            _ => None,
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::Gzip
    }
}

/// Header-level settings of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub version: FormatVersion,
    pub cipher: CipherId,
    pub compression: Compression,
    pub kdf: KdfParams,
    pub inner_stream: InnerStreamAlgorithm,
    /// Public custom data (v4 header field 12), kept as raw bytes.
    pub public_custom_data: Option<Vec<u8>>,
}

impl ContainerSettings {
    /// Settings with a specific KDF and defaults elsewhere.
    pub fn with_kdf(kdf: KdfParams) -> Self {
        Self {
            kdf,
            ..Self::default()
        }
    }

    /// Version that will actually be written.
    ///
    /// A 3.x container cannot describe Argon2, so such settings are
    /// promoted to the current version.
    pub fn effective_version(&self) -> FormatVersion {
        if !self.version.is_kdbx4() && self.kdf.is_memory_hard() {
            FormatVersion::CURRENT
        } else {
            self.version
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            version: FormatVersion::CURRENT,
            cipher: CipherId::default(),
            compression: Compression::default(),
            kdf: KdfParams::default(),
            inner_stream: InnerStreamAlgorithm::default(),
            public_custom_data: None,
        }
    }
}
