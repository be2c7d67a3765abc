//! Common utilities and types shared across the PassVault crates.
//!
//! This module provides the error taxonomy every load, save and merge call
//! reports through, plus the cancellation token shared by the long-running
//! key derivation and container steps.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::CancellationToken;
