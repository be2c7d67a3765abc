//! Groups: the folders of the tree.

use uuid::Uuid;

use crate::digest::ContentHasher;
use crate::element::XmlElement;
use crate::entry::Entry;
use crate::times::Times;

/// A group owning its child entries and child groups, both ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub times: Times,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    /// `None` inherits from the parent.
    pub enable_auto_type: Option<bool>,
    /// `None` inherits from the parent.
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    pub entries: Vec<Entry>,
    pub groups: Vec<Group>,
    pub unknown: Vec<XmlElement>,
}

impl Group {
    /// Icon used for regular folders.
    pub const FOLDER_ICON: u32 = 48;

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            notes: String::new(),
            icon_id: Self::FOLDER_ICON,
            custom_icon: None,
            times: Times::new(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            entries: Vec::new(),
            groups: Vec::new(),
            unknown: Vec::new(),
        }
    }

    /// Copy of this group's own fields with no children.
    pub fn shallow_clone(&self) -> Group {
        Group {
            entries: Vec::new(),
            groups: Vec::new(),
            ..self.clone()
        }
    }

    /// Find a group in this subtree, including `self`.
    pub fn find_group(&self, uuid: &Uuid) -> Option<&Group> {
        if self.uuid == *uuid {
            return Some(self);
        }
        self.groups.iter().find_map(|g| g.find_group(uuid))
    }

    pub fn find_group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        if self.uuid == *uuid {
            return Some(self);
        }
        self.groups.iter_mut().find_map(|g| g.find_group_mut(uuid))
    }

    /// Find an entry anywhere in this subtree.
    pub fn find_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.uuid == *uuid)
            .or_else(|| self.groups.iter().find_map(|g| g.find_entry(uuid)))
    }

    pub fn find_entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        if let Some(pos) = self.entries.iter().position(|e| e.uuid == *uuid) {
            return Some(&mut self.entries[pos]);
        }
        self.groups.iter_mut().find_map(|g| g.find_entry_mut(uuid))
    }

    /// Detach a descendant group. `self` itself cannot be removed.
    pub fn remove_group(&mut self, uuid: &Uuid) -> Option<Group> {
        if let Some(pos) = self.groups.iter().position(|g| g.uuid == *uuid) {
            return Some(self.groups.remove(pos));
        }
        self.groups.iter_mut().find_map(|g| g.remove_group(uuid))
    }

    /// Detach an entry from anywhere in this subtree.
    pub fn remove_entry(&mut self, uuid: &Uuid) -> Option<Entry> {
        if let Some(pos) = self.entries.iter().position(|e| e.uuid == *uuid) {
            return Some(self.entries.remove(pos));
        }
        self.groups.iter_mut().find_map(|g| g.remove_entry(uuid))
    }

    /// All groups in this subtree in pre-order, `self` first.
    pub fn all_groups(&self) -> Vec<&Group> {
        let mut out = vec![self];
        for child in &self.groups {
            out.extend(child.all_groups());
        }
        out
    }

    /// All entries in this subtree in pre-order.
    pub fn all_entries(&self) -> Vec<&Entry> {
        let mut out: Vec<&Entry> = self.entries.iter().collect();
        for child in &self.groups {
            out.extend(child.all_entries());
        }
        out
    }

    /// Digest of this group's own fields; children are not included.
    pub fn content_digest(&self) -> [u8; 32] {
        self.digest(true)
    }

    /// [`Group::content_digest`] without `location_changed`.
    pub fn edit_digest(&self) -> [u8; 32] {
        self.digest(false)
    }

    fn digest(&self, with_location: bool) -> [u8; 32] {
        let mut h = ContentHasher::new("group");
        h.bytes(self.uuid.as_bytes())
            .str(&self.name)
            .str(&self.notes)
            .u64(self.icon_id as u64)
            .bytes(self.custom_icon.map(|u| u.into_bytes()).unwrap_or_default().as_slice());
        if with_location {
            h.times(&self.times);
        } else {
            h.edit_times(&self.times);
        }
        h.bool(self.is_expanded)
            .str(&self.default_auto_type_sequence)
            .opt_bool(self.enable_auto_type)
            .opt_bool(self.enable_searching)
            .bytes(self.last_top_visible_entry.as_bytes())
            .u64(self.unknown.len() as u64);
        for el in &self.unknown {
            h.element(el);
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Group, Uuid, Uuid) {
        let mut root = Group::new("Root");
        let mut inner = Group::new("Inner");
        let entry = Entry::new();
        let entry_id = entry.uuid;
        let inner_id = inner.uuid;
        inner.entries.push(entry);
        root.groups.push(inner);
        (root, inner_id, entry_id)
    }

    #[test]
    fn test_find_and_remove() {
        let (mut root, inner_id, entry_id) = sample();
        assert!(root.find_group(&inner_id).is_some());
        assert!(root.find_entry(&entry_id).is_some());

        let entry = root.remove_entry(&entry_id).unwrap();
        assert_eq!(entry.uuid, entry_id);
        assert!(root.find_entry(&entry_id).is_none());

        assert!(root.remove_group(&inner_id).is_some());
        assert!(root.groups.is_empty());
    }

    #[test]
    fn test_root_cannot_remove_itself() {
        let (mut root, _, _) = sample();
        let root_id = root.uuid;
        assert!(root.remove_group(&root_id).is_none());
    }

    #[test]
    fn test_traversal_counts() {
        let (root, _, _) = sample();
        assert_eq!(root.all_groups().len(), 2);
        assert_eq!(root.all_entries().len(), 1);
    }

    #[test]
    fn test_digest_ignores_children() {
        let (root, _, _) = sample();
        assert_eq!(root.content_digest(), root.shallow_clone().content_digest());

        let mut renamed = root.shallow_clone();
        renamed.name = "Other".to_string();
        assert_ne!(renamed.content_digest(), root.content_digest());
    }
}
