//! Edit operations on a database.
//!
//! Every mutation stamps the touched node's modification time so that a
//! later merge can tell which copy is newer. Permanent removals leave a
//! [`DeletedObject`](crate::DeletedObject) for every removed id.

use tracing::debug;
use uuid::Uuid;

use crate::database::Database;
use crate::entry::Entry;
use crate::group::Group;
use crate::times::now;
use crate::tree::NodeKind;
use passvault_common::{Error, Result};

/// Icon of the recycle bin group.
pub const RECYCLE_BIN_ICON: u32 = 43;

/// Name given to an on-demand recycle bin.
pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";

fn group_not_found(uuid: &Uuid) -> Error {
    Error::NotFound(format!("Group {}", uuid))
}

fn entry_not_found(uuid: &Uuid) -> Error {
    Error::NotFound(format!("Entry {}", uuid))
}

impl Database {
    pub fn find_group(&self, uuid: &Uuid) -> Option<&Group> {
        self.root.find_group(uuid)
    }

    pub fn find_group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        self.root.find_group_mut(uuid)
    }

    pub fn find_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.root.find_entry(uuid)
    }

    pub fn find_entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.root.find_entry_mut(uuid)
    }

    /// Parent group of a node.
    pub fn parent_of(&self, kind: NodeKind, uuid: &Uuid) -> Option<Uuid> {
        self.index().parent(kind, uuid)
    }

    /// Add a group under `parent`.
    ///
    /// # Errors
    /// - `NotFound` if `parent` does not exist
    /// - `InvalidInput` if a group with the same uuid already exists
    pub fn add_group(&mut self, parent: &Uuid, group: Group) -> Result<Uuid> {
        if self.find_group(&group.uuid).is_some() {
            return Err(Error::InvalidInput(format!(
                "Group {} already exists",
                group.uuid
            )));
        }
        let uuid = group.uuid;
        let target = self
            .find_group_mut(parent)
            .ok_or_else(|| group_not_found(parent))?;
        target.groups.push(group);
        debug!(group = %uuid, parent = %parent, "Group added");
        Ok(uuid)
    }

    /// Add an entry under `parent`.
    ///
    /// # Errors
    /// - `NotFound` if `parent` does not exist
    /// - `InvalidInput` if an entry with the same uuid already exists
    pub fn add_entry(&mut self, parent: &Uuid, entry: Entry) -> Result<Uuid> {
        if self.find_entry(&entry.uuid).is_some() {
            return Err(Error::InvalidInput(format!(
                "Entry {} already exists",
                entry.uuid
            )));
        }
        let uuid = entry.uuid;
        let target = self
            .find_group_mut(parent)
            .ok_or_else(|| group_not_found(parent))?;
        target.entries.push(entry);
        debug!(entry = %uuid, parent = %parent, "Entry added");
        Ok(uuid)
    }

    /// Edit an entry, keeping its previous state in the history.
    ///
    /// # Postconditions
    /// - A backup of the pre-edit state is appended to the history
    /// - Last modification is stamped
    /// - History is trimmed to the database's retention caps
    ///
    /// # Errors
    /// - `NotFound` if the entry does not exist
    pub fn update_entry<F>(&mut self, uuid: &Uuid, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Entry),
    {
        let max_items = self.meta.history_max_items;
        let max_size = self.meta.history_max_size;
        let entry = self
            .find_entry_mut(uuid)
            .ok_or_else(|| entry_not_found(uuid))?;

        let backup = entry.create_backup();
        entry.push_history(backup);
        edit(&mut *entry);
        entry.uuid = *uuid;
        entry.times.touch(true);
        entry.maintain_history(max_items, max_size);
        Ok(())
    }

    /// Edit a group's own fields.
    ///
    /// # Errors
    /// - `NotFound` if the group does not exist
    pub fn update_group<F>(&mut self, uuid: &Uuid, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Group),
    {
        let group = self
            .find_group_mut(uuid)
            .ok_or_else(|| group_not_found(uuid))?;
        edit(&mut *group);
        group.uuid = *uuid;
        group.times.touch(true);
        Ok(())
    }

    /// Move an entry to another group.
    ///
    /// # Errors
    /// - `NotFound` if the entry or the target group does not exist
    pub fn move_entry(&mut self, uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if self.find_group(new_parent).is_none() {
            return Err(group_not_found(new_parent));
        }
        let mut entry = self
            .root
            .remove_entry(uuid)
            .ok_or_else(|| entry_not_found(uuid))?;
        entry.times.mark_moved();
        if let Some(target) = self.find_group_mut(new_parent) {
            target.entries.push(entry);
        }
        debug!(entry = %uuid, parent = %new_parent, "Entry moved");
        Ok(())
    }

    /// Move a group (with its subtree) to another group.
    ///
    /// # Errors
    /// - `NotFound` if either group does not exist
    /// - `InvalidInput` when moving the root, or into the group's own subtree
    pub fn move_group(&mut self, uuid: &Uuid, new_parent: &Uuid) -> Result<()> {
        if *uuid == self.root.uuid {
            return Err(Error::InvalidInput("The root group cannot be moved".to_string()));
        }
        let index = self.index();
        if !index.contains(NodeKind::Group, uuid) {
            return Err(group_not_found(uuid));
        }
        if !index.contains(NodeKind::Group, new_parent) {
            return Err(group_not_found(new_parent));
        }
        if index.is_within(new_parent, uuid) {
            return Err(Error::InvalidInput(format!(
                "Cannot move group {} into its own subtree",
                uuid
            )));
        }

        let mut group = self
            .root
            .remove_group(uuid)
            .ok_or_else(|| group_not_found(uuid))?;
        group.times.mark_moved();
        if let Some(target) = self.find_group_mut(new_parent) {
            target.groups.push(group);
        }
        debug!(group = %uuid, parent = %new_parent, "Group moved");
        Ok(())
    }

    /// Whether a node is the recycle bin or lies beneath it.
    pub fn is_recycled(&self, kind: NodeKind, uuid: &Uuid) -> bool {
        let bin = self.meta.recycle_bin_uuid;
        if bin.is_nil() {
            return false;
        }
        let index = self.index();
        let group = match kind {
            NodeKind::Group => *uuid,
            NodeKind::Entry => match index.parent(NodeKind::Entry, uuid) {
                Some(parent) => parent,
                None => return false,
            },
        };
        index.contains(NodeKind::Group, &group) && index.is_within(&group, &bin)
    }

    /// Uuid of the recycle bin, creating it under the root if missing.
    pub fn ensure_recycle_bin(&mut self) -> Uuid {
        let bin = self.meta.recycle_bin_uuid;
        if !bin.is_nil() && self.find_group(&bin).is_some() {
            return bin;
        }

        let mut group = Group::new(RECYCLE_BIN_NAME);
        group.icon_id = RECYCLE_BIN_ICON;
        group.enable_auto_type = Some(false);
        group.enable_searching = Some(false);
        group.is_expanded = false;
        let uuid = group.uuid;
        self.root.groups.push(group);

        self.meta.recycle_bin_uuid = uuid;
        self.meta.recycle_bin_changed = now();
        debug!(group = %uuid, "Recycle bin created");
        uuid
    }

    /// Delete an entry.
    ///
    /// With the recycle bin enabled and the entry outside it, the entry is
    /// moved into the bin. Otherwise it is removed and a deletion record is
    /// kept.
    ///
    /// # Errors
    /// - `NotFound` if the entry does not exist
    pub fn delete_entry(&mut self, uuid: &Uuid) -> Result<()> {
        if self.find_entry(uuid).is_none() {
            return Err(entry_not_found(uuid));
        }
        if self.meta.recycle_bin_enabled && !self.is_recycled(NodeKind::Entry, uuid) {
            let bin = self.ensure_recycle_bin();
            return self.move_entry(uuid, &bin);
        }

        self.root.remove_entry(uuid);
        self.record_deletion(*uuid, now());
        debug!(entry = %uuid, "Entry deleted permanently");
        Ok(())
    }

    /// Delete a group and its subtree.
    ///
    /// Follows the same recycle bin rule as [`Database::delete_entry`]. A
    /// permanent delete records every removed group and entry.
    ///
    /// # Errors
    /// - `NotFound` if the group does not exist
    /// - `InvalidInput` for the root group
    pub fn delete_group(&mut self, uuid: &Uuid) -> Result<()> {
        if *uuid == self.root.uuid {
            return Err(Error::InvalidInput("The root group cannot be deleted".to_string()));
        }
        let index = self.index();
        if !index.contains(NodeKind::Group, uuid) {
            return Err(group_not_found(uuid));
        }

        let bin = self.meta.recycle_bin_uuid;
        let bin_inside = !bin.is_nil()
            && index.contains(NodeKind::Group, &bin)
            && index.is_within(&bin, uuid);
        if self.meta.recycle_bin_enabled
            && !bin_inside
            && !self.is_recycled(NodeKind::Group, uuid)
        {
            let bin = self.ensure_recycle_bin();
            return self.move_group(uuid, &bin);
        }

        let removed = self
            .root
            .remove_group(uuid)
            .ok_or_else(|| group_not_found(uuid))?;
        self.record_subtree_deletion(&removed);
        if bin_inside {
            self.meta.recycle_bin_uuid = Uuid::nil();
            self.meta.recycle_bin_changed = now();
        }
        debug!(group = %uuid, "Group deleted permanently");
        Ok(())
    }

    /// Permanently delete everything inside the recycle bin.
    pub fn empty_recycle_bin(&mut self) {
        let bin = self.meta.recycle_bin_uuid;
        let (entries, groups) = match self.find_group_mut(&bin) {
            Some(group) if !bin.is_nil() => (
                std::mem::take(&mut group.entries),
                std::mem::take(&mut group.groups),
            ),
            _ => return,
        };

        let ts = now();
        for entry in &entries {
            self.record_deletion(entry.uuid, ts);
        }
        for group in &groups {
            self.record_subtree_deletion(group);
        }
        debug!(
            entries = entries.len(),
            groups = groups.len(),
            "Recycle bin emptied"
        );
    }

    fn record_subtree_deletion(&mut self, removed: &Group) {
        let ts = now();
        for group in removed.all_groups() {
            self.record_deletion(group.uuid, ts);
        }
        for entry in removed.all_entries() {
            self.record_deletion(entry.uuid, ts);
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.meta.database_name = name.into();
        self.meta.database_name_changed = now();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.meta.database_description = description.into();
        self.meta.database_description_changed = now();
    }

    pub fn set_default_username(&mut self, username: impl Into<String>) {
        self.meta.default_username = username.into();
        self.meta.default_username_changed = now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{PASSWORD, TITLE};

    fn db_with_entry() -> (Database, Uuid, Uuid) {
        let mut db = Database::new("Test");
        let root = db.root.uuid;
        let group = db.add_group(&root, Group::new("Work")).unwrap();
        let mut entry = Entry::new();
        entry.set(TITLE, "Mail");
        let entry = db.add_entry(&group, entry).unwrap();
        (db, group, entry)
    }

    #[test]
    fn test_add_and_find() {
        let (db, group, entry) = db_with_entry();
        assert_eq!(db.find_group(&group).unwrap().name, "Work");
        assert_eq!(db.find_entry(&entry).unwrap().title(), "Mail");
        assert_eq!(db.parent_of(NodeKind::Entry, &entry), Some(group));
    }

    #[test]
    fn test_add_to_missing_parent() {
        let mut db = Database::new("Test");
        let result = db.add_entry(&Uuid::new_v4(), Entry::new());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let (mut db, group, entry) = db_with_entry();
        let result = db.add_entry(&group, Entry::with_uuid(entry));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_update_entry_creates_history() {
        let (mut db, _, entry) = db_with_entry();
        db.update_entry(&entry, |e| e.set_protected(PASSWORD, "new"))
            .unwrap();

        let e = db.find_entry(&entry).unwrap();
        assert_eq!(e.get(PASSWORD), "new");
        assert_eq!(e.history.len(), 1);
        assert!(e.history[0].field(PASSWORD).is_none());
    }

    #[test]
    fn test_update_entry_respects_history_cap() {
        let (mut db, _, entry) = db_with_entry();
        db.meta.history_max_items = 2;
        for i in 0..5 {
            db.update_entry(&entry, |e| e.set(TITLE, format!("v{}", i)))
                .unwrap();
        }
        assert_eq!(db.find_entry(&entry).unwrap().history.len(), 2);
    }

    #[test]
    fn test_move_group_into_own_subtree_rejected() {
        let (mut db, group, _) = db_with_entry();
        let child = db.add_group(&group, Group::new("Child")).unwrap();

        assert!(matches!(
            db.move_group(&group, &child),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            db.move_group(&group, &group),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_move_entry_stamps_location() {
        let (mut db, _, entry) = db_with_entry();
        let root = db.root.uuid;
        let before = db.find_entry(&entry).unwrap().times.location_changed;

        db.move_entry(&entry, &root).unwrap();

        let e = db.find_entry(&entry).unwrap();
        assert!(e.times.location_changed >= before);
        assert_eq!(db.parent_of(NodeKind::Entry, &entry), Some(root));
    }

    #[test]
    fn test_delete_entry_goes_to_recycle_bin_first() {
        let (mut db, _, entry) = db_with_entry();

        db.delete_entry(&entry).unwrap();
        let bin = db.meta.recycle_bin_uuid;
        assert!(!bin.is_nil());
        assert_eq!(db.parent_of(NodeKind::Entry, &entry), Some(bin));
        assert!(db.is_recycled(NodeKind::Entry, &entry));
        assert!(db.deleted_objects.is_empty());

        db.delete_entry(&entry).unwrap();
        assert!(db.find_entry(&entry).is_none());
        assert!(db.deletion_of(&entry).is_some());
    }

    #[test]
    fn test_delete_group_without_bin_records_subtree() {
        let (mut db, group, entry) = db_with_entry();
        db.meta.recycle_bin_enabled = false;
        let child = db.add_group(&group, Group::new("Child")).unwrap();

        db.delete_group(&group).unwrap();

        assert!(db.find_group(&group).is_none());
        for id in [group, child, entry] {
            assert!(db.deletion_of(&id).is_some());
        }
    }

    #[test]
    fn test_delete_root_rejected() {
        let mut db = Database::new("Test");
        let root = db.root.uuid;
        assert!(matches!(db.delete_group(&root), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_deleting_the_bin_clears_meta() {
        let (mut db, _, entry) = db_with_entry();
        db.delete_entry(&entry).unwrap();
        let bin = db.meta.recycle_bin_uuid;

        db.delete_group(&bin).unwrap();

        assert!(db.meta.recycle_bin_uuid.is_nil());
        assert!(db.deletion_of(&bin).is_some());
        assert!(db.deletion_of(&entry).is_some());
    }

    #[test]
    fn test_empty_recycle_bin() {
        let (mut db, group, entry) = db_with_entry();
        db.delete_group(&group).unwrap();
        let bin = db.meta.recycle_bin_uuid;
        assert!(db.is_recycled(NodeKind::Entry, &entry));

        db.empty_recycle_bin();

        let bin_group = db.find_group(&bin).unwrap();
        assert!(bin_group.groups.is_empty());
        assert!(db.deletion_of(&group).is_some());
        assert!(db.deletion_of(&entry).is_some());
    }

    #[test]
    fn test_set_name_stamps_changed() {
        let mut db = Database::new("Test");
        db.meta.database_name_changed = chrono::DateTime::<chrono::Utc>::MIN_UTC;
        db.set_name("Renamed");
        assert_eq!(db.meta.database_name, "Renamed");
        assert!(db.meta.database_name_changed > chrono::DateTime::<chrono::Utc>::MIN_UTC);
    }
}
