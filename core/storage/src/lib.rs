//! Byte transport for PassVault containers.
//!
//! This module provides a blocking, trait-based interface between the
//! container codec and wherever the bytes live.
//!
//! # Design Principles
//! - Transport isolation: no format or crypto logic in connections
//! - Atomic publish: a write becomes visible only on `commit`
//! - Unified error semantics: every transport failure surfaces as `Io`

pub mod connection;
pub mod local;
pub mod memory;

pub use connection::{IoConnection, WriteStream};
pub use local::LocalFileConnection;
pub use memory::MemoryConnection;
