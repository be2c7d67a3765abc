//! Common types used throughout PassVault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Cooperative cancellation signal for long-running work.
///
/// Clones share the same flag, so the caller keeps one handle and passes
/// another into the load/save call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `OperationCancelled` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::OperationCancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_shared_between_clones() {
        let token = CancellationToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(matches!(worker.check(), Err(Error::OperationCancelled)));
    }
}
