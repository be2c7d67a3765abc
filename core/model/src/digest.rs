//! Content digests used to order otherwise equal snapshots.

use sha2::{Digest, Sha256};

use crate::element::XmlElement;
use crate::times::{Timestamp, Times};

/// SHA-256 over length-prefixed fields, so adjacent fields cannot blur.
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new(tag: &str) -> Self {
        let mut hasher = Self {
            inner: Sha256::new(),
        };
        hasher.str(tag);
        hasher
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes())
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.inner.update([v as u8]);
        self
    }

    pub fn opt_bool(&mut self, v: Option<bool>) -> &mut Self {
        self.inner.update([match v {
            None => 2,
            Some(b) => b as u8,
        }]);
        self
    }

    pub fn time(&mut self, ts: &Timestamp) -> &mut Self {
        self.inner.update(ts.timestamp().to_le_bytes());
        self
    }

    pub fn times(&mut self, times: &Times) -> &mut Self {
        self.edit_times(times).time(&times.location_changed)
    }

    /// Every time field except `location_changed`.
    pub fn edit_times(&mut self, times: &Times) -> &mut Self {
        self.time(&times.creation)
            .time(&times.last_modification)
            .time(&times.last_access)
            .time(&times.expiry)
            .bool(times.expires)
            .u64(times.usage_count)
    }

    /// Fold an opaque element tree in, depth first.
    pub fn element(&mut self, el: &XmlElement) -> &mut Self {
        self.str(&el.name).u64(el.attributes.len() as u64);
        for (k, v) in &el.attributes {
            self.str(k).str(v);
        }
        self.str(&el.text).u64(el.children.len() as u64);
        for child in &el.children {
            self.element(child);
        }
        self
    }

    pub fn finish(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}
