//! Encrypted container codec for PassVault databases.
//!
//! This module provides:
//! - Header parsing and writing for 3.1 and 4.x containers
//! - Hashed (3.x) and HMAC (4.x) block streams
//! - `open` / `seal` pipelines with key caching
//! - The XML mapper between payload documents and the object model
//!
//! # Security
//! Any integrity failure surfaces as `IntegrityCheckFailed`, whether caused
//! by wrong credentials or by corruption.

pub mod blocks;
pub mod compress;
pub mod container;
mod cursor;
pub mod header;
pub mod inner;
pub mod variant;
pub mod xml;

pub use container::{open, read_header, seal, DerivedKey, Opened, Sealed};
pub use header::Header;
pub use xml::{from_plain_xml, to_plain_xml, XmlFlavor};
