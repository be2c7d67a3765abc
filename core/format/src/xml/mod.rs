//! Mapping between the XML payload and the object model.
//!
//! Three flavors share one mapper:
//! - `Kdbx3`: ISO-8601 times, binaries pooled under `Meta/Binaries`,
//!   `HeaderHash` written into `Meta`
//! - `Kdbx4`: base64 binary times, binaries carried in the inner header
//!   and referenced by index
//! - `Plain`: cleartext projection; protected values are written as
//!   plaintext marked `ProtectInMemory`, binaries inline
//!
//! Reading accepts every variant regardless of flavor. Protected values
//! consume the inner random stream in document order on both paths.

pub mod dom;
mod read;
pub mod values;
mod write;

use passvault_common::Result;
use passvault_crypto::RandomStream;
use passvault_model::Database;

/// Output dialect of the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XmlFlavor {
    Kdbx3,
    Kdbx4,
    Plain,
}

/// A binary from the pool (inner header or `Meta/Binaries`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBinary {
    pub data: Vec<u8>,
    pub protected: bool,
}

/// Result of parsing a payload document.
#[derive(Debug)]
pub struct ParsedXml {
    pub database: Database,
    /// `Meta/HeaderHash` when present (3.x documents).
    pub header_hash: Option<Vec<u8>>,
}

/// Result of serializing a database.
#[derive(Debug)]
pub struct SerializedXml {
    pub xml: Vec<u8>,
    /// Binaries to place in the inner header (`Kdbx4` only).
    pub binaries: Vec<PoolBinary>,
}

/// Parse a payload document.
///
/// `binaries` is the inner-header pool of a 4.x container; 3.x documents
/// carry their own pool. The returned database has default container
/// settings; callers fill them in from the header.
///
/// # Errors
/// - `MalformedPayload` for invalid XML, unexpected structure, bad scalar
///   encodings, dangling binary references, or protected values without a
///   stream
pub fn parse(
    xml: &[u8],
    stream: Option<&mut RandomStream>,
    binaries: &[PoolBinary],
) -> Result<ParsedXml> {
    let document = dom::parse_document(xml)?;
    read::read_document(&document, stream, binaries)
}

/// Serialize a database.
///
/// `stream` must be the fresh inner stream of the current save for the
/// `Kdbx3`/`Kdbx4` flavors; it is ignored for `Plain`.
pub fn serialize(
    db: &Database,
    stream: Option<&mut RandomStream>,
    flavor: XmlFlavor,
    header_hash: Option<&[u8]>,
) -> Result<SerializedXml> {
    let (document, binaries) = write::write_document(db, stream, flavor, header_hash)?;
    Ok(SerializedXml {
        xml: dom::write_document(&document)?,
        binaries,
    })
}

/// Cleartext XML projection of a database, for export and comparison.
pub fn to_plain_xml(db: &Database) -> Result<String> {
    let out = serialize(db, None, XmlFlavor::Plain, None)?;
    Ok(String::from_utf8_lossy(&out.xml).into_owned())
}

/// Parse a cleartext projection.
pub fn from_plain_xml(xml: &[u8]) -> Result<Database> {
    Ok(parse(xml, None, &[])?.database)
}
