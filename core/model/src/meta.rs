//! Database-wide metadata.
//!
//! Several fields carry their own "changed" timestamp so that two edited
//! copies can be reconciled field by field instead of as a whole.

use uuid::Uuid;

use crate::digest::ContentHasher;
use crate::element::XmlElement;
use crate::entry::{NOTES, PASSWORD, TITLE, URL, USERNAME};
use crate::times::{now, Timestamp};

/// Generator string written by this library.
pub const GENERATOR: &str = "PassVault";

/// Default number of history snapshots kept per entry.
pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;

/// Default total history size per entry (6 MiB).
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

/// Which standard fields are written protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl MemoryProtection {
    /// Whether the named standard field must be protected.
    pub fn protects(&self, field: &str) -> bool {
        match field {
            TITLE => self.protect_title,
            USERNAME => self.protect_username,
            PASSWORD => self.protect_password,
            URL => self.protect_url,
            NOTES => self.protect_notes,
            _ => false,
        }
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

/// A custom icon stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub name: Option<String>,
    pub last_modification: Option<Timestamp>,
}

/// Database metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub settings_changed: Timestamp,
    pub database_name: String,
    pub database_name_changed: Timestamp,
    pub database_description: String,
    pub database_description_changed: Timestamp,
    pub default_username: String,
    pub default_username_changed: Timestamp,
    pub maintenance_history_days: u32,
    pub color: String,
    pub master_key_changed: Timestamp,
    /// Days until a key change is recommended; -1 disables.
    pub master_key_change_rec: i64,
    /// Days until a key change is forced; -1 disables.
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    /// Nil when no recycle bin exists yet.
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: Timestamp,
    pub entry_templates_group: Uuid,
    pub entry_templates_group_changed: Timestamp,
    /// -1 disables the cap.
    pub history_max_items: i32,
    /// -1 disables the cap.
    pub history_max_size: i64,
    pub last_selected_group: Uuid,
    pub last_top_visible_group: Uuid,
    pub unknown: Vec<XmlElement>,
}

impl Meta {
    pub fn new() -> Self {
        let ts = now();
        Self {
            generator: GENERATOR.to_string(),
            settings_changed: ts,
            database_name: String::new(),
            database_name_changed: ts,
            database_description: String::new(),
            database_description_changed: ts,
            default_username: String::new(),
            default_username_changed: ts,
            maintenance_history_days: 365,
            color: String::new(),
            master_key_changed: ts,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: ts,
            entry_templates_group: Uuid::nil(),
            entry_templates_group_changed: ts,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            last_selected_group: Uuid::nil(),
            last_top_visible_group: Uuid::nil(),
            unknown: Vec::new(),
        }
    }

    pub fn custom_icon(&self, uuid: &Uuid) -> Option<&CustomIcon> {
        self.custom_icons.iter().find(|i| i.uuid == *uuid)
    }

    /// Digest of the settings governed by `settings_changed`.
    ///
    /// Fields with their own "changed" timestamp are excluded.
    pub fn settings_digest(&self) -> [u8; 32] {
        let mp = &self.memory_protection;
        let mut h = ContentHasher::new("meta");
        h.str(&self.generator)
            .time(&self.settings_changed)
            .u64(self.maintenance_history_days as u64)
            .str(&self.color)
            .u64(self.master_key_change_rec as u64)
            .u64(self.master_key_change_force as u64)
            .bool(mp.protect_title)
            .bool(mp.protect_username)
            .bool(mp.protect_password)
            .bool(mp.protect_url)
            .bool(mp.protect_notes)
            .bool(self.recycle_bin_enabled)
            .u64(self.history_max_items as u64)
            .u64(self.history_max_size as u64)
            .bytes(self.last_selected_group.as_bytes())
            .bytes(self.last_top_visible_group.as_bytes())
            .u64(self.unknown.len() as u64);
        for el in &self.unknown {
            h.element(el);
        }
        h.finish()
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let meta = Meta::new();
        assert_eq!(meta.generator, GENERATOR);
        assert!(meta.recycle_bin_enabled);
        assert!(meta.recycle_bin_uuid.is_nil());
        assert_eq!(meta.history_max_items, 10);
        assert!(meta.memory_protection.protects(PASSWORD));
        assert!(!meta.memory_protection.protects(TITLE));
        assert!(!meta.memory_protection.protects("Custom"));
    }

    #[test]
    fn test_settings_digest_ignores_name() {
        let mut a = Meta::new();
        let b = a.clone();
        a.database_name = "Renamed".to_string();
        assert_eq!(a.settings_digest(), b.settings_digest());

        a.history_max_items = 3;
        assert_ne!(a.settings_digest(), b.settings_digest());
    }
}
