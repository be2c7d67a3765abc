//! The database aggregate.

use uuid::Uuid;

use crate::config::ContainerSettings;
use crate::element::XmlElement;
use crate::group::Group;
use crate::meta::Meta;
use crate::times::Timestamp;
use crate::tree::TreeIndex;

/// Record that an object was deleted, so a merge does not resurrect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: Timestamp,
}

/// A whole password database: settings, metadata, tree and tombstones.
///
/// # Invariants
/// - Exactly one root group; every node is reachable from it once
/// - Group uuids are unique among groups, entry uuids among entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    pub settings: ContainerSettings,
    pub meta: Meta,
    pub root: Group,
    pub deleted_objects: Vec<DeletedObject>,
    /// Unknown children of the document element.
    pub unknown: Vec<XmlElement>,
    /// Unknown children of `Root` besides the root group and tombstones.
    pub root_unknown: Vec<XmlElement>,
}

impl Database {
    /// Create an empty database whose root group is named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, ContainerSettings::default())
    }

    pub fn with_settings(name: impl Into<String>, settings: ContainerSettings) -> Self {
        let name = name.into();
        let mut meta = Meta::new();
        meta.database_name = name.clone();
        Self {
            settings,
            meta,
            root: Group::new(name),
            deleted_objects: Vec::new(),
            unknown: Vec::new(),
            root_unknown: Vec::new(),
        }
    }

    /// Equality of everything the payload stores, ignoring header settings.
    pub fn content_eq(&self, other: &Database) -> bool {
        self.meta == other.meta
            && self.root == other.root
            && self.deleted_objects == other.deleted_objects
            && self.unknown == other.unknown
            && self.root_unknown == other.root_unknown
    }

    /// Build a fresh parent index over the current tree.
    pub fn index(&self) -> TreeIndex {
        TreeIndex::build(&self.root)
    }

    pub fn deletion_of(&self, uuid: &Uuid) -> Option<&DeletedObject> {
        self.deleted_objects.iter().find(|d| d.uuid == *uuid)
    }

    /// Add or refresh a deletion record, keeping the later time.
    pub fn record_deletion(&mut self, uuid: Uuid, deletion_time: Timestamp) {
        match self.deleted_objects.iter_mut().find(|d| d.uuid == uuid) {
            Some(existing) => {
                if deletion_time > existing.deletion_time {
                    existing.deletion_time = deletion_time;
                }
            }
            None => self.deleted_objects.push(DeletedObject {
                uuid,
                deletion_time,
            }),
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new("Database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::times::now;
    use chrono::Duration;
    use passvault_crypto::KdfParams;

    #[test]
    fn test_new_database_names_root_and_meta() {
        let db = Database::new("Personal");
        assert_eq!(db.root.name, "Personal");
        assert_eq!(db.meta.database_name, "Personal");
        assert!(db.deleted_objects.is_empty());
    }

    #[test]
    fn test_content_eq_ignores_settings() {
        let db = Database::new("A");
        let mut other = db.clone();
        other.settings.kdf = KdfParams::aes(1);
        assert!(db.content_eq(&other));
        assert_ne!(db, other);
    }

    #[test]
    fn test_record_deletion_keeps_latest() {
        let mut db = Database::new("A");
        let id = Uuid::new_v4();
        let t = now();
        db.record_deletion(id, t);
        db.record_deletion(id, t - Duration::seconds(5));
        assert_eq!(db.deleted_objects.len(), 1);
        assert_eq!(db.deletion_of(&id).unwrap().deletion_time, t);

        db.record_deletion(id, t + Duration::seconds(5));
        assert_eq!(db.deletion_of(&id).unwrap().deletion_time, t + Duration::seconds(5));
    }
}
