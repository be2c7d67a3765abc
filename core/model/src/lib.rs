//! In-memory object model of a password database.
//!
//! This module provides:
//! - The `Database` aggregate with its `Meta`, root `Group` and deletion records
//! - `Entry` nodes with ordered fields, attachments and history
//! - Protected values that stay masked until explicitly revealed
//! - A `TreeIndex` for parent lookups without back-pointers
//! - Edit operations that keep timestamps and tombstones consistent
//!
//! # Architecture
//! Groups own their children directly; every back-reference (entry to
//! group, group to parent) is answered by the index instead of a stored
//! pointer, so the tree always has a single owner per node.

pub mod config;
pub mod database;
pub mod digest;
pub mod element;
pub mod entry;
pub mod group;
pub mod meta;
pub mod operations;
pub mod protected;
pub mod times;
pub mod tree;

pub use config::{Compression, ContainerSettings, FormatVersion};
pub use database::{Database, DeletedObject};
pub use element::XmlElement;
pub use entry::{Attachment, Entry, Field};
pub use group::Group;
pub use meta::{CustomIcon, MemoryProtection, Meta};
pub use protected::{FieldValue, ProtectedValue};
pub use times::{Timestamp, Times};
pub use tree::{NodeKind, NodeLocation, TreeIndex};
pub use uuid::Uuid;
