use sha2::{Digest, Sha256};
use std::collections::HashMap;
use zeroize::Zeroizing;

use passvault_common::{Error, Result};
use passvault_crypto::RandomStream;
use passvault_model::{
    Attachment, CustomIcon, Database, Entry, Field, Group, Meta, Times, Timestamp, XmlElement,
};

use super::values::{
    format_base64, format_bool, format_time_binary, format_time_iso, format_tristate,
    format_uuid,
};
use super::{PoolBinary, XmlFlavor};
use crate::compress::gzip;

fn text(name: &str, value: impl Into<String>) -> XmlElement {
    XmlElement::with_text(name, value)
}

/// Pool identity of an attachment: identical blobs are stored once.
fn pool_key(attachment: &Attachment) -> ([u8; 32], bool) {
    (Sha256::digest(&attachment.data).into(), attachment.protected)
}

struct Context<'a, 's> {
    flavor: XmlFlavor,
    stream: Option<&'s mut RandomStream>,
    pool: Vec<PoolBinary>,
    pool_index: HashMap<([u8; 32], bool), usize>,
    meta: &'a Meta,
}

impl Context<'_, '_> {
    fn time(&self, name: &str, ts: &Timestamp) -> XmlElement {
        let value = match self.flavor {
            XmlFlavor::Kdbx4 => format_time_binary(ts),
            XmlFlavor::Kdbx3 | XmlFlavor::Plain => format_time_iso(ts),
        };
        text(name, value)
    }

    /// Mask `data` with the next keystream bytes and encode it.
    fn protect(&mut self, data: &[u8]) -> Result<String> {
        let stream = self.stream.as_deref_mut().ok_or_else(|| {
            Error::InvalidInput("Protected output requires an inner stream".to_string())
        })?;
        let masked = stream.process(data);
        Ok(format_base64(&masked))
    }

    fn collect_pool(&mut self, entries: &[&Entry]) {
        for &entry in entries {
            let snapshots = std::iter::once(entry).chain(entry.history.iter());
            for snapshot in snapshots {
                for attachment in &snapshot.attachments {
                    let key = pool_key(attachment);
                    if !self.pool_index.contains_key(&key) {
                        self.pool_index.insert(key, self.pool.len());
                        self.pool.push(PoolBinary {
                            data: attachment.data.clone(),
                            protected: attachment.protected,
                        });
                    }
                }
            }
        }
    }
}

pub(super) fn write_document(
    db: &Database,
    stream: Option<&mut RandomStream>,
    flavor: XmlFlavor,
    header_hash: Option<&[u8]>,
) -> Result<(XmlElement, Vec<PoolBinary>)> {
    let mut ctx = Context {
        flavor,
        stream,
        pool: Vec::new(),
        pool_index: HashMap::new(),
        meta: &db.meta,
    };
    if flavor != XmlFlavor::Plain {
        ctx.collect_pool(&db.root.all_entries());
    }

    let mut doc = XmlElement::new("KeePassFile");
    doc.children.push(write_meta(&mut ctx, header_hash)?);

    let mut root = XmlElement::new("Root");
    root.children.push(write_group(&mut ctx, &db.root)?);
    let mut deleted = XmlElement::new("DeletedObjects");
    for object in &db.deleted_objects {
        deleted.children.push(
            XmlElement::new("DeletedObject")
                .child(text("UUID", format_uuid(&object.uuid)))
                .child(ctx.time("DeletionTime", &object.deletion_time)),
        );
    }
    root.children.push(deleted);
    root.children.extend(db.root_unknown.iter().cloned());
    doc.children.push(root);
    doc.children.extend(db.unknown.iter().cloned());

    let binaries = match flavor {
        XmlFlavor::Kdbx4 => ctx.pool,
        XmlFlavor::Kdbx3 | XmlFlavor::Plain => Vec::new(),
    };
    Ok((doc, binaries))
}

fn write_meta(ctx: &mut Context<'_, '_>, header_hash: Option<&[u8]>) -> Result<XmlElement> {
    let meta = ctx.meta;
    let mut el = XmlElement::new("Meta").child(text("Generator", meta.generator.as_str()));
    if let (Some(hash), XmlFlavor::Kdbx3) = (header_hash, ctx.flavor) {
        el.children.push(text("HeaderHash", format_base64(hash)));
    }

    let mp = &meta.memory_protection;
    el.children.extend([
        ctx.time("SettingsChanged", &meta.settings_changed),
        text("DatabaseName", meta.database_name.as_str()),
        ctx.time("DatabaseNameChanged", &meta.database_name_changed),
        text("DatabaseDescription", meta.database_description.as_str()),
        ctx.time(
            "DatabaseDescriptionChanged",
            &meta.database_description_changed,
        ),
        text("DefaultUserName", meta.default_username.as_str()),
        ctx.time("DefaultUserNameChanged", &meta.default_username_changed),
        text(
            "MaintenanceHistoryDays",
            meta.maintenance_history_days.to_string(),
        ),
        text("Color", meta.color.as_str()),
        ctx.time("MasterKeyChanged", &meta.master_key_changed),
        text("MasterKeyChangeRec", meta.master_key_change_rec.to_string()),
        text(
            "MasterKeyChangeForce",
            meta.master_key_change_force.to_string(),
        ),
        XmlElement::new("MemoryProtection")
            .child(text("ProtectTitle", format_bool(mp.protect_title)))
            .child(text("ProtectUserName", format_bool(mp.protect_username)))
            .child(text("ProtectPassword", format_bool(mp.protect_password)))
            .child(text("ProtectURL", format_bool(mp.protect_url)))
            .child(text("ProtectNotes", format_bool(mp.protect_notes))),
    ]);

    let mut icons = XmlElement::new("CustomIcons");
    for icon in &meta.custom_icons {
        icons.children.push(write_custom_icon(ctx, icon));
    }
    el.children.push(icons);

    el.children.extend([
        text("RecycleBinEnabled", format_bool(meta.recycle_bin_enabled)),
        text("RecycleBinUUID", format_uuid(&meta.recycle_bin_uuid)),
        ctx.time("RecycleBinChanged", &meta.recycle_bin_changed),
        text("EntryTemplatesGroup", format_uuid(&meta.entry_templates_group)),
        ctx.time(
            "EntryTemplatesGroupChanged",
            &meta.entry_templates_group_changed,
        ),
        text("HistoryMaxItems", meta.history_max_items.to_string()),
        text("HistoryMaxSize", meta.history_max_size.to_string()),
        text("LastSelectedGroup", format_uuid(&meta.last_selected_group)),
        text(
            "LastTopVisibleGroup",
            format_uuid(&meta.last_top_visible_group),
        ),
    ]);

    if ctx.flavor == XmlFlavor::Kdbx3 {
        el.children.push(write_binary_pool(ctx)?);
    }
    el.children.extend(meta.unknown.iter().cloned());
    Ok(el)
}

fn write_custom_icon(ctx: &Context<'_, '_>, icon: &CustomIcon) -> XmlElement {
    let mut el = XmlElement::new("Icon")
        .child(text("UUID", format_uuid(&icon.uuid)))
        .child(text("Data", format_base64(&icon.data)));
    if let Some(name) = &icon.name {
        el.children.push(text("Name", name.as_str()));
    }
    if let Some(ts) = &icon.last_modification {
        el.children.push(ctx.time("LastModificationTime", ts));
    }
    el
}

fn write_binary_pool(ctx: &mut Context<'_, '_>) -> Result<XmlElement> {
    let mut el = XmlElement::new("Binaries");
    let pool = std::mem::take(&mut ctx.pool);
    for (id, binary) in pool.iter().enumerate() {
        let item = if binary.protected {
            XmlElement::with_text("Binary", ctx.protect(&binary.data)?)
                .attribute("ID", id.to_string())
                .attribute("Protected", "True")
        } else {
            XmlElement::with_text("Binary", format_base64(&gzip(&binary.data)?))
                .attribute("ID", id.to_string())
                .attribute("Compressed", "True")
        };
        el.children.push(item);
    }
    ctx.pool = pool;
    Ok(el)
}

fn write_times(ctx: &Context<'_, '_>, times: &Times) -> XmlElement {
    XmlElement::new("Times")
        .child(ctx.time("CreationTime", &times.creation))
        .child(ctx.time("LastModificationTime", &times.last_modification))
        .child(ctx.time("LastAccessTime", &times.last_access))
        .child(ctx.time("ExpiryTime", &times.expiry))
        .child(text("Expires", format_bool(times.expires)))
        .child(text("UsageCount", times.usage_count.to_string()))
        .child(ctx.time("LocationChanged", &times.location_changed))
}

fn write_group(ctx: &mut Context<'_, '_>, group: &Group) -> Result<XmlElement> {
    let mut el = XmlElement::new("Group")
        .child(text("UUID", format_uuid(&group.uuid)))
        .child(text("Name", group.name.as_str()))
        .child(text("Notes", group.notes.as_str()))
        .child(text("IconID", group.icon_id.to_string()));
    if let Some(icon) = &group.custom_icon {
        el.children.push(text("CustomIconUUID", format_uuid(icon)));
    }
    el.children.extend([
        write_times(ctx, &group.times),
        text("IsExpanded", format_bool(group.is_expanded)),
        text(
            "DefaultAutoTypeSequence",
            group.default_auto_type_sequence.as_str(),
        ),
        text("EnableAutoType", format_tristate(group.enable_auto_type)),
        text("EnableSearching", format_tristate(group.enable_searching)),
        text(
            "LastTopVisibleEntry",
            format_uuid(&group.last_top_visible_entry),
        ),
    ]);
    el.children.extend(group.unknown.iter().cloned());

    for entry in &group.entries {
        el.children.push(write_entry(ctx, entry, false)?);
    }
    for child in &group.groups {
        el.children.push(write_group(ctx, child)?);
    }
    Ok(el)
}

fn write_entry(ctx: &mut Context<'_, '_>, entry: &Entry, in_history: bool) -> Result<XmlElement> {
    let mut el = XmlElement::new("Entry")
        .child(text("UUID", format_uuid(&entry.uuid)))
        .child(text("IconID", entry.icon_id.to_string()));
    if let Some(icon) = &entry.custom_icon {
        el.children.push(text("CustomIconUUID", format_uuid(icon)));
    }
    el.children.extend([
        text("ForegroundColor", entry.foreground_color.as_str()),
        text("BackgroundColor", entry.background_color.as_str()),
        text("OverrideURL", entry.override_url.as_str()),
        text("Tags", entry.tags.as_str()),
        write_times(ctx, &entry.times),
    ]);

    for field in &entry.fields {
        el.children.push(write_field(ctx, field)?);
    }
    for attachment in &entry.attachments {
        el.children.push(write_attachment(ctx, attachment)?);
    }
    el.children.extend(entry.unknown.iter().cloned());

    if !in_history {
        let mut history = XmlElement::new("History");
        for snapshot in &entry.history {
            history.children.push(write_entry(ctx, snapshot, true)?);
        }
        el.children.push(history);
    }
    Ok(el)
}

fn write_field(ctx: &mut Context<'_, '_>, field: &Field) -> Result<XmlElement> {
    let protect = field.value.is_protected() || ctx.meta.memory_protection.protects(&field.name);
    let plaintext = field.value.reveal();

    let value = match (protect, ctx.flavor) {
        (false, _) => text("Value", plaintext.as_str()),
        (true, XmlFlavor::Plain) => {
            text("Value", plaintext.as_str()).attribute("ProtectInMemory", "True")
        }
        (true, _) => {
            let bytes = Zeroizing::new(plaintext.as_bytes().to_vec());
            text("Value", ctx.protect(&bytes)?).attribute("Protected", "True")
        }
    };
    Ok(XmlElement::new("String")
        .child(text("Key", field.name.as_str()))
        .child(value))
}

fn write_attachment(ctx: &mut Context<'_, '_>, attachment: &Attachment) -> Result<XmlElement> {
    let value = if ctx.flavor == XmlFlavor::Plain {
        let el = text("Value", format_base64(&attachment.data));
        if attachment.protected {
            el.attribute("ProtectInMemory", "True")
        } else {
            el
        }
    } else {
        let index = ctx
            .pool_index
            .get(&pool_key(attachment))
            .copied()
            .ok_or_else(|| {
                Error::InvalidInput(format!("Attachment '{}' missing from pool", attachment.name))
            })?;
        XmlElement::new("Value").attribute("Ref", index.to_string())
    };
    Ok(XmlElement::new("Binary")
        .child(text("Key", attachment.name.as_str()))
        .child(value))
}
