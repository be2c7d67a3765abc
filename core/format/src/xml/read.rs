use std::collections::BTreeMap;
use zeroize::Zeroizing;

use passvault_common::{Error, Result};
use passvault_crypto::RandomStream;
use passvault_model::{
    Attachment, CustomIcon, Database, DeletedObject, Entry, Field, FieldValue, Group,
    MemoryProtection, Meta, ProtectedValue, Times, XmlElement,
};

use super::values::{
    parse_base64, parse_bool, parse_number, parse_time, parse_tristate, parse_uuid, zero_time,
};
use super::{ParsedXml, PoolBinary};
use crate::compress::gunzip;

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPayload(msg.into())
}

fn flag(el: &XmlElement, name: &str) -> bool {
    el.attr(name)
        .map(|v| parse_bool(v).unwrap_or(false))
        .unwrap_or(false)
}

struct Context<'s> {
    stream: Option<&'s mut RandomStream>,
    pool: BTreeMap<usize, PoolBinary>,
}

impl Context<'_> {
    /// Decode and unmask the next protected value in document order.
    fn unprotect(&mut self, text: &str) -> Result<Zeroizing<Vec<u8>>> {
        let stream = self
            .stream
            .as_deref_mut()
            .ok_or_else(|| malformed("Protected value but no inner stream"))?;
        let mut data = Zeroizing::new(parse_base64(text)?);
        stream.apply(&mut data);
        Ok(data)
    }
}

pub(super) fn read_document(
    root: &XmlElement,
    stream: Option<&mut RandomStream>,
    binaries: &[PoolBinary],
) -> Result<ParsedXml> {
    if root.name != "KeePassFile" {
        return Err(malformed(format!(
            "Unexpected document element <{}>",
            root.name
        )));
    }

    let mut ctx = Context {
        stream,
        pool: binaries.iter().cloned().enumerate().collect(),
    };
    let mut meta = None;
    let mut header_hash = None;
    let mut root_group = None;
    let mut deleted_objects = Vec::new();
    let mut unknown = Vec::new();
    let mut root_unknown = Vec::new();

    for child in &root.children {
        match child.name.as_str() {
            "Meta" => {
                let (m, hash) = read_meta(child, &mut ctx)?;
                meta = Some(m);
                header_hash = hash;
            }
            "Root" => {
                for item in &child.children {
                    match item.name.as_str() {
                        "Group" if root_group.is_none() => {
                            root_group = Some(read_group(item, &mut ctx)?)
                        }
                        "DeletedObjects" => deleted_objects = read_deleted_objects(item)?,
                        _ => root_unknown.push(item.clone()),
                    }
                }
            }
            _ => unknown.push(child.clone()),
        }
    }

    let root_group = root_group.ok_or_else(|| malformed("Document has no root group"))?;
    let mut database = Database::new(String::new());
    database.meta = meta.unwrap_or_else(blank_meta);
    database.root = root_group;
    database.deleted_objects = deleted_objects;
    database.unknown = unknown;
    database.root_unknown = root_unknown;

    Ok(ParsedXml {
        database,
        header_hash,
    })
}

fn blank_meta() -> Meta {
    let zero = zero_time();
    Meta {
        generator: String::new(),
        settings_changed: zero,
        database_name_changed: zero,
        database_description_changed: zero,
        default_username_changed: zero,
        master_key_changed: zero,
        recycle_bin_changed: zero,
        entry_templates_group_changed: zero,
        ..Meta::new()
    }
}

fn read_meta(el: &XmlElement, ctx: &mut Context<'_>) -> Result<(Meta, Option<Vec<u8>>)> {
    let mut meta = blank_meta();
    let mut header_hash = None;

    for child in &el.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "Generator" => meta.generator = text.to_string(),
            "HeaderHash" => header_hash = Some(parse_base64(text)?),
            "SettingsChanged" => meta.settings_changed = parse_time(text)?,
            "DatabaseName" => meta.database_name = text.to_string(),
            "DatabaseNameChanged" => meta.database_name_changed = parse_time(text)?,
            "DatabaseDescription" => meta.database_description = text.to_string(),
            "DatabaseDescriptionChanged" => {
                meta.database_description_changed = parse_time(text)?
            }
            "DefaultUserName" => meta.default_username = text.to_string(),
            "DefaultUserNameChanged" => meta.default_username_changed = parse_time(text)?,
            "MaintenanceHistoryDays" => {
                meta.maintenance_history_days = parse_number(text, "MaintenanceHistoryDays")?
            }
            "Color" => meta.color = text.to_string(),
            "MasterKeyChanged" => meta.master_key_changed = parse_time(text)?,
            "MasterKeyChangeRec" => {
                meta.master_key_change_rec = parse_number(text, "MasterKeyChangeRec")?
            }
            "MasterKeyChangeForce" => {
                meta.master_key_change_force = parse_number(text, "MasterKeyChangeForce")?
            }
            "MemoryProtection" => meta.memory_protection = read_memory_protection(child)?,
            "CustomIcons" => {
                meta.custom_icons = child
                    .find_all("Icon")
                    .map(read_custom_icon)
                    .collect::<Result<_>>()?
            }
            "RecycleBinEnabled" => meta.recycle_bin_enabled = parse_bool(text)?,
            "RecycleBinUUID" => meta.recycle_bin_uuid = parse_uuid(text)?,
            "RecycleBinChanged" => meta.recycle_bin_changed = parse_time(text)?,
            "EntryTemplatesGroup" => meta.entry_templates_group = parse_uuid(text)?,
            "EntryTemplatesGroupChanged" => {
                meta.entry_templates_group_changed = parse_time(text)?
            }
            "HistoryMaxItems" => meta.history_max_items = parse_number(text, "HistoryMaxItems")?,
            "HistoryMaxSize" => meta.history_max_size = parse_number(text, "HistoryMaxSize")?,
            "LastSelectedGroup" => meta.last_selected_group = parse_uuid(text)?,
            "LastTopVisibleGroup" => meta.last_top_visible_group = parse_uuid(text)?,
            "Binaries" => read_binary_pool(child, ctx)?,
            _ => meta.unknown.push(child.clone()),
        }
    }
    Ok((meta, header_hash))
}

fn read_memory_protection(el: &XmlElement) -> Result<MemoryProtection> {
    let mut mp = MemoryProtection::default();
    for child in &el.children {
        let value = parse_bool(&child.text)?;
        match child.name.as_str() {
            "ProtectTitle" => mp.protect_title = value,
            "ProtectUserName" => mp.protect_username = value,
            "ProtectPassword" => mp.protect_password = value,
            "ProtectURL" => mp.protect_url = value,
            "ProtectNotes" => mp.protect_notes = value,
            _ => {}
        }
    }
    Ok(mp)
}

fn read_custom_icon(el: &XmlElement) -> Result<CustomIcon> {
    let mut icon = CustomIcon {
        uuid: uuid::Uuid::nil(),
        data: Vec::new(),
        name: None,
        last_modification: None,
    };
    for child in &el.children {
        match child.name.as_str() {
            "UUID" => icon.uuid = parse_uuid(&child.text)?,
            "Data" => icon.data = parse_base64(&child.text)?,
            "Name" => icon.name = Some(child.text.clone()),
            "LastModificationTime" => icon.last_modification = Some(parse_time(&child.text)?),
            _ => {}
        }
    }
    Ok(icon)
}

fn read_binary_pool(el: &XmlElement, ctx: &mut Context<'_>) -> Result<()> {
    for (position, item) in el.find_all("Binary").enumerate() {
        let id = match item.attr("ID") {
            Some(id) => parse_number(id, "binary ID")?,
            None => position,
        };
        let binary = if flag(item, "Protected") {
            PoolBinary {
                data: ctx.unprotect(&item.text)?.to_vec(),
                protected: true,
            }
        } else {
            let raw = parse_base64(&item.text)?;
            let data = if flag(item, "Compressed") {
                gunzip(&raw)?
            } else {
                raw
            };
            PoolBinary {
                data,
                protected: false,
            }
        };
        ctx.pool.insert(id, binary);
    }
    Ok(())
}

fn read_times(el: &XmlElement) -> Result<Times> {
    let mut times = Times::at(zero_time());
    for child in &el.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "CreationTime" => times.creation = parse_time(text)?,
            "LastModificationTime" => times.last_modification = parse_time(text)?,
            "LastAccessTime" => times.last_access = parse_time(text)?,
            "ExpiryTime" => times.expiry = parse_time(text)?,
            "Expires" => times.expires = parse_bool(text)?,
            "UsageCount" => times.usage_count = parse_number(text, "UsageCount")?,
            "LocationChanged" => times.location_changed = parse_time(text)?,
            _ => {}
        }
    }
    Ok(times)
}

fn read_group(el: &XmlElement, ctx: &mut Context<'_>) -> Result<Group> {
    let mut group = Group::with_uuid(uuid::Uuid::nil(), String::new());
    group.times = Times::at(zero_time());

    for child in &el.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "UUID" => group.uuid = parse_uuid(text)?,
            "Name" => group.name = text.to_string(),
            "Notes" => group.notes = text.to_string(),
            "IconID" => group.icon_id = parse_number(text, "IconID")?,
            "CustomIconUUID" => group.custom_icon = non_nil(parse_uuid(text)?),
            "Times" => group.times = read_times(child)?,
            "IsExpanded" => group.is_expanded = parse_bool(text)?,
            "DefaultAutoTypeSequence" => group.default_auto_type_sequence = text.to_string(),
            "EnableAutoType" => group.enable_auto_type = parse_tristate(text)?,
            "EnableSearching" => group.enable_searching = parse_tristate(text)?,
            "LastTopVisibleEntry" => group.last_top_visible_entry = parse_uuid(text)?,
            "Entry" => group.entries.push(read_entry(child, ctx, false)?),
            "Group" => group.groups.push(read_group(child, ctx)?),
            _ => group.unknown.push(child.clone()),
        }
    }
    Ok(group)
}

fn non_nil(uuid: uuid::Uuid) -> Option<uuid::Uuid> {
    if uuid.is_nil() {
        None
    } else {
        Some(uuid)
    }
}

fn read_entry(el: &XmlElement, ctx: &mut Context<'_>, in_history: bool) -> Result<Entry> {
    let mut entry = Entry::with_uuid(uuid::Uuid::nil());
    entry.times = Times::at(zero_time());

    for child in &el.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "UUID" => entry.uuid = parse_uuid(text)?,
            "IconID" => entry.icon_id = parse_number(text, "IconID")?,
            "CustomIconUUID" => entry.custom_icon = non_nil(parse_uuid(text)?),
            "ForegroundColor" => entry.foreground_color = text.to_string(),
            "BackgroundColor" => entry.background_color = text.to_string(),
            "OverrideURL" => entry.override_url = text.to_string(),
            "Tags" => entry.tags = text.to_string(),
            "Times" => entry.times = read_times(child)?,
            "String" => entry.fields.push(read_field(child, ctx)?),
            "Binary" => entry.attachments.push(read_attachment(child, ctx)?),
            "History" if !in_history => {
                for snapshot in child.find_all("Entry") {
                    entry.history.push(read_entry(snapshot, ctx, true)?);
                }
            }
            "History" => {
                // Nested snapshots are dropped but still consume the inner stream.
                for snapshot in child.find_all("Entry") {
                    read_entry(snapshot, ctx, true)?;
                }
            }
            _ => entry.unknown.push(child.clone()),
        }
    }
    Ok(entry)
}

fn read_field(el: &XmlElement, ctx: &mut Context<'_>) -> Result<Field> {
    let name = el
        .find("Key")
        .map(|k| k.text.clone())
        .ok_or_else(|| malformed("String without Key"))?;
    let value = match el.find("Value") {
        None => FieldValue::Plain(String::new()),
        Some(v) if flag(v, "Protected") => {
            let data = ctx.unprotect(&v.text)?;
            FieldValue::Protected(ProtectedValue::from_bytes(&data))
        }
        Some(v) if flag(v, "ProtectInMemory") => FieldValue::protected(&v.text),
        Some(v) => FieldValue::Plain(v.text.clone()),
    };
    Ok(Field { name, value })
}

fn read_attachment(el: &XmlElement, ctx: &mut Context<'_>) -> Result<Attachment> {
    let name = el
        .find("Key")
        .map(|k| k.text.clone())
        .ok_or_else(|| malformed("Binary without Key"))?;
    let value = el
        .find("Value")
        .ok_or_else(|| malformed(format!("Binary '{}' without Value", name)))?;

    if let Some(reference) = value.attr("Ref") {
        let index: usize = parse_number(reference, "binary reference")?;
        let binary = ctx
            .pool
            .get(&index)
            .ok_or_else(|| malformed(format!("Binary reference {} not in pool", index)))?;
        return Ok(Attachment {
            name,
            data: binary.data.clone(),
            protected: binary.protected,
        });
    }

    if flag(value, "Protected") {
        let data = ctx.unprotect(&value.text)?;
        return Ok(Attachment {
            name,
            data: data.to_vec(),
            protected: true,
        });
    }

    let raw = parse_base64(&value.text)?;
    let data = if flag(value, "Compressed") {
        gunzip(&raw)?
    } else {
        raw
    };
    Ok(Attachment {
        name,
        data,
        protected: flag(value, "ProtectInMemory"),
    })
}

fn read_deleted_objects(el: &XmlElement) -> Result<Vec<DeletedObject>> {
    el.find_all("DeletedObject")
        .map(|item| -> Result<DeletedObject> {
            let uuid = item
                .find("UUID")
                .ok_or_else(|| malformed("DeletedObject without UUID"))?;
            let time = item
                .find("DeletionTime")
                .ok_or_else(|| malformed("DeletedObject without DeletionTime"))?;
            Ok(DeletedObject {
                uuid: parse_uuid(&uuid.text)?,
                deletion_time: parse_time(&time.text)?,
            })
        })
        .collect()
}
