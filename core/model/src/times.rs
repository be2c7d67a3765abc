//! Node timestamps.
//!
//! The container stores whole seconds, so every timestamp produced here is
//! truncated to the second. That keeps a freshly edited node equal to its
//! own reloaded copy.

use chrono::{DateTime, Timelike, Utc};

/// Timestamp type used throughout the model.
pub type Timestamp = DateTime<Utc>;

/// Current time, truncated to whole seconds.
pub fn now() -> Timestamp {
    truncate(Utc::now())
}

/// Drop sub-second precision.
pub fn truncate(ts: Timestamp) -> Timestamp {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Creation, modification, access and expiry bookkeeping for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub creation: Timestamp,
    pub last_modification: Timestamp,
    pub last_access: Timestamp,
    pub expiry: Timestamp,
    pub expires: bool,
    pub usage_count: u64,
    /// When the node last moved to a different parent.
    pub location_changed: Timestamp,
}

impl Times {
    /// All timestamps set to now, no expiry.
    pub fn new() -> Self {
        Self::at(now())
    }

    /// All timestamps set to `ts`, no expiry.
    pub fn at(ts: Timestamp) -> Self {
        let ts = truncate(ts);
        Self {
            creation: ts,
            last_modification: ts,
            last_access: ts,
            expiry: ts,
            expires: false,
            usage_count: 0,
            location_changed: ts,
        }
    }

    /// Record an access, and a modification when `modified` is set.
    pub fn touch(&mut self, modified: bool) {
        let ts = now();
        self.last_access = ts;
        if modified {
            self.last_modification = ts;
        }
    }

    /// Record a move to another parent. A move also counts as a modification.
    pub fn mark_moved(&mut self) {
        let ts = now();
        self.location_changed = ts;
        self.last_modification = ts;
        self.last_access = ts;
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::new()
    }
}
