//! PassVault sync layer.
//!
//! This module provides:
//! - A deterministic merge of two diverged copies of a database
//! - Database sessions that load, save and reconcile through a connection
//!
//! # Architecture
//! Sessions never hold a lock on the stored file. A save reads the stored
//! bytes, compares their fingerprint with the last one seen and, when they
//! differ, merges, overwrites or reports according to [`SaveMode`].

pub mod merge;
pub mod session;

pub use merge::{merge, merge_with_stats, MergeStats};
pub use session::{DatabaseSession, SaveMode, SaveOutcome};
