//! Entries: ordered string fields, attachments and history.

use uuid::Uuid;

use crate::digest::ContentHasher;
use crate::element::XmlElement;
use crate::protected::FieldValue;
use crate::times::Times;

/// Standard field names.
pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Fields every client shows, in their canonical order.
pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

/// A named string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

/// A named binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
    /// Whether the binary pool marks this blob as protected.
    pub protected: bool,
}

/// A password entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub tags: String,
    pub times: Times,
    pub fields: Vec<Field>,
    pub attachments: Vec<Attachment>,
    /// Prior snapshots, oldest first. Snapshots carry no history of their own.
    pub history: Vec<Entry>,
    /// Elements this library does not interpret (AutoType, CustomData, ...).
    pub unknown: Vec<XmlElement>,
}

impl Entry {
    /// Create an entry with a random uuid and no fields.
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            icon_id: 0,
            custom_icon: None,
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: String::new(),
            times: Times::new(),
            fields: Vec::new(),
            attachments: Vec::new(),
            history: Vec::new(),
            unknown: Vec::new(),
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    /// Field plaintext, or an empty string when absent.
    pub fn get(&self, name: &str) -> String {
        self.field(name)
            .map(|v| v.reveal().to_string())
            .unwrap_or_default()
    }

    pub fn title(&self) -> String {
        self.get(TITLE)
    }

    /// Set a field, keeping its position when it already exists.
    pub fn set_field(&mut self, name: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Set a plain field.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.set_field(name, FieldValue::plain(value));
    }

    /// Set a protected field.
    pub fn set_protected(&mut self, name: &str, value: &str) {
        self.set_field(name, FieldValue::protected(value));
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|f| f.name == name)?;
        Some(self.fields.remove(pos).value)
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    /// Snapshot of the current state, suitable for the history list.
    pub fn create_backup(&self) -> Entry {
        let mut backup = self.clone();
        backup.history.clear();
        backup
    }

    /// Append a snapshot to the history.
    pub fn push_history(&mut self, snapshot: Entry) {
        self.history.push(snapshot);
    }

    /// Enforce the retention caps, dropping the oldest snapshots first.
    ///
    /// Negative limits disable the corresponding cap. Returns whether any
    /// snapshot was removed.
    pub fn maintain_history(&mut self, max_items: i32, max_size: i64) -> bool {
        let before = self.history.len();

        if max_items >= 0 {
            let max_items = max_items as usize;
            if self.history.len() > max_items {
                let excess = self.history.len() - max_items;
                self.history.drain(..excess);
            }
        }

        if max_size >= 0 {
            let max_size = max_size as u64;
            let mut total: u64 = self.history.iter().map(Entry::approximate_size).sum();
            while total > max_size && !self.history.is_empty() {
                total -= self.history.remove(0).approximate_size();
            }
        }

        self.history.len() != before
    }

    /// Rough in-memory size used by the history size cap.
    pub fn approximate_size(&self) -> u64 {
        let mut size = (self.override_url.len()
            + self.tags.len()
            + self.foreground_color.len()
            + self.background_color.len()) as u64;
        for field in &self.fields {
            size += (field.name.len() + field.value.reveal().len()) as u64;
        }
        for attachment in &self.attachments {
            size += (attachment.name.len() + attachment.data.len()) as u64;
        }
        size + self
            .history
            .iter()
            .map(Entry::approximate_size)
            .sum::<u64>()
    }

    /// Digest of everything except the history list.
    pub fn content_digest(&self) -> [u8; 32] {
        self.digest(true)
    }

    /// [`Entry::content_digest`] without `location_changed`. Two copies
    /// that differ only in when they were last moved share it.
    pub fn edit_digest(&self) -> [u8; 32] {
        self.digest(false)
    }

    fn digest(&self, with_location: bool) -> [u8; 32] {
        let mut h = ContentHasher::new("entry");
        h.bytes(self.uuid.as_bytes())
            .u64(self.icon_id as u64)
            .bytes(self.custom_icon.map(|u| u.into_bytes()).unwrap_or_default().as_slice())
            .str(&self.foreground_color)
            .str(&self.background_color)
            .str(&self.override_url)
            .str(&self.tags);
        if with_location {
            h.times(&self.times);
        } else {
            h.edit_times(&self.times);
        }
        h.u64(self.fields.len() as u64);
        for field in &self.fields {
            h.str(&field.name)
                .bool(field.value.is_protected())
                .str(&field.value.reveal());
        }
        h.u64(self.attachments.len() as u64);
        for attachment in &self.attachments {
            h.str(&attachment.name)
                .bool(attachment.protected)
                .bytes(&attachment.data);
        }
        h.u64(self.unknown.len() as u64);
        for el in &self.unknown {
            h.element(el);
        }
        h.finish()
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}
