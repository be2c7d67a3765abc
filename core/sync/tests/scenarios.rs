//! End-to-end scenarios: containers on disk, two writers, merge properties.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

use passvault_common::{CancellationToken, Error};
use passvault_crypto::{CipherId, CompositeKey, InnerStreamAlgorithm, KdfParams};
use passvault_format::to_plain_xml;
use passvault_model::entry::{NOTES, PASSWORD, TITLE, URL, USERNAME};
use passvault_model::{
    Attachment, Compression, ContainerSettings, CustomIcon, Database, Entry, FormatVersion, Group,
    NodeKind, Timestamp, Uuid, XmlElement,
};
use passvault_storage::{IoConnection, LocalFileConnection};
use passvault_sync::{merge, DatabaseSession, SaveMode, SaveOutcome};

fn key() -> CompositeKey {
    CompositeKey::from_password(b"correct horse battery staple")
}

fn v4_settings() -> ContainerSettings {
    ContainerSettings::with_kdf(KdfParams::argon2id(2, 256 * 1024, 1))
}

fn v3_settings() -> ContainerSettings {
    ContainerSettings {
        version: FormatVersion::KDBX3_1,
        inner_stream: InnerStreamAlgorithm::Salsa20,
        ..ContainerSettings::with_kdf(KdfParams::aes(1000))
    }
}

fn local_file(dir: &TempDir) -> Arc<dyn IoConnection> {
    Arc::new(LocalFileConnection::new(dir.path().join("vault.kdbx")))
}

/// A database touching most of the model.
fn complex_database(settings: ContainerSettings) -> Database {
    let mut db = Database::with_settings("Complex", settings);
    db.set_description("Everything at once");
    db.set_default_username("admin");
    db.meta.color = "#336699".to_string();
    db.meta.custom_icons.push(CustomIcon {
        uuid: Uuid::new_v4(),
        data: vec![0x89, b'P', b'N', b'G'],
        name: Some("logo".to_string()),
        last_modification: Some(passvault_model::times::now()),
    });
    db.meta
        .unknown
        .push(XmlElement::with_text("FuturePolicy", "strict"));
    db.unknown.push(
        XmlElement::new("PluginState")
            .attribute("plugin", "x")
            .child(XmlElement::with_text("Value", "42")),
    );

    let root = db.root.uuid;
    let banking = db.add_group(&root, Group::new("Banking")).unwrap();
    let cards = db.add_group(&banking, Group::new("Cards")).unwrap();
    let mut hidden = Group::new("Hidden");
    hidden.enable_searching = Some(false);
    hidden.enable_auto_type = Some(true);
    hidden.is_expanded = false;
    db.add_group(&root, hidden).unwrap();

    let mut bank = Entry::new();
    bank.set(TITLE, "Bank <& \"quotes\">");
    bank.set(USERNAME, "jdoe");
    bank.set_protected(PASSWORD, "p@ss\u{00e9}w\u{00f6}rd");
    bank.set(URL, "https://bank.example");
    bank.set(NOTES, "multi\nline\n\tnotes");
    bank.set_protected("PIN", "1234");
    bank.set("Custom", "");
    bank.tags = "finance;important".to_string();
    bank.times.expires = true;
    bank.attachments.push(Attachment {
        name: "statement.pdf".to_string(),
        data: (0..=255u8).collect(),
        protected: false,
    });
    bank.attachments.push(Attachment {
        name: "secret.key".to_string(),
        data: b"private".to_vec(),
        protected: true,
    });
    bank.unknown
        .push(XmlElement::new("AutoType").child(XmlElement::with_text("Enabled", "True")));
    let bank_id = db.add_entry(&banking, bank).unwrap();
    db.update_entry(&bank_id, |e| e.set(USERNAME, "john.doe")).unwrap();
    db.update_entry(&bank_id, |e| e.set_protected(PASSWORD, "rotated"))
        .unwrap();

    let mut card = Entry::new();
    card.set(TITLE, "Visa");
    card.set_protected(PASSWORD, "4111");
    card.attachments.push(Attachment {
        name: "copy.pdf".to_string(),
        data: (0..=255u8).collect(),
        protected: false,
    });
    db.add_entry(&cards, card).unwrap();

    let mut doomed = Entry::new();
    doomed.set(TITLE, "Doomed");
    let doomed_id = db.add_entry(&root, doomed).unwrap();
    db.delete_entry(&doomed_id).unwrap();

    let mut gone = Entry::new();
    gone.set(TITLE, "Gone");
    let gone_id = db.add_entry(&root, gone).unwrap();
    db.meta.recycle_bin_enabled = false;
    db.delete_entry(&gone_id).unwrap();
    db
}

#[test]
fn test_complex_database_survives_save_and_reload() {
    for settings in [v4_settings(), v3_settings()] {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let db = complex_database(settings);
        let expected = to_plain_xml(&db).unwrap();

        DatabaseSession::create(local_file(&dir), key(), db, &cancel).unwrap();
        let reopened = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();

        assert_eq!(to_plain_xml(reopened.database()).unwrap(), expected);

        let copy: Arc<dyn IoConnection> =
            Arc::new(LocalFileConnection::new(dir.path().join("copy.kdbx")));
        DatabaseSession::create(copy.clone(), key(), reopened.database().clone(), &cancel)
            .unwrap();
        let copied = DatabaseSession::open(copy, key(), &cancel).unwrap();
        assert_eq!(to_plain_xml(copied.database()).unwrap(), expected);
    }
}

#[test]
fn test_every_cipher_and_stream_combination() {
    for cipher in [CipherId::Aes256, CipherId::ChaCha20] {
        for inner_stream in [InnerStreamAlgorithm::Salsa20, InnerStreamAlgorithm::ChaCha20] {
            for compression in [Compression::None, Compression::Gzip] {
                let dir = TempDir::new().unwrap();
                let cancel = CancellationToken::new();
                let settings = ContainerSettings {
                    cipher,
                    inner_stream,
                    compression,
                    ..ContainerSettings::with_kdf(KdfParams::aes(100))
                };
                let db = complex_database(settings.clone());
                let expected = to_plain_xml(&db).unwrap();

                DatabaseSession::create(local_file(&dir), key(), db, &cancel).unwrap();
                let reopened = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();
                assert_eq!(reopened.database().settings.cipher, cipher);
                assert_eq!(reopened.database().settings.inner_stream, inner_stream);
                assert_eq!(to_plain_xml(reopened.database()).unwrap(), expected);
            }
        }
    }
}

#[test]
fn test_two_writers_keep_both_groups() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let seed = Database::with_settings("Shared", v4_settings());
    DatabaseSession::create(local_file(&dir), key(), seed, &cancel).unwrap();

    let mut laptop = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();
    let mut phone = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();

    let laptop_root = laptop.database().root.uuid;
    let work = laptop
        .database_mut()
        .add_group(&laptop_root, Group::new("Work"))
        .unwrap();
    let phone_root = phone.database().root.uuid;
    let home = phone
        .database_mut()
        .add_group(&phone_root, Group::new("Home"))
        .unwrap();

    assert_eq!(laptop.save(SaveMode::Merge, &cancel).unwrap(), SaveOutcome::Saved);
    assert!(matches!(
        phone.save(SaveMode::Merge, &cancel).unwrap(),
        SaveOutcome::Merged(_)
    ));

    let result = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();
    assert!(result.database().find_group(&work).is_some());
    assert!(result.database().find_group(&home).is_some());
}

#[test]
fn test_corrupted_byte_is_detected() {
    for settings in [v4_settings(), v3_settings()] {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let conn = local_file(&dir);
        DatabaseSession::create(conn.clone(), key(), complex_database(settings), &cancel).unwrap();

        let mut bytes = conn.read_all().unwrap();
        let middle = bytes.len() - 100;
        bytes[middle] ^= 0x40;
        conn.write_all(&bytes).unwrap();

        let result = DatabaseSession::open(conn, key(), &cancel);
        assert!(matches!(result, Err(Error::IntegrityCheckFailed)));
    }
}

#[test]
fn test_wrong_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    DatabaseSession::create(local_file(&dir), key(), complex_database(v4_settings()), &cancel)
        .unwrap();

    let wrong = CompositeKey::from_password(b"Correct horse battery staple");
    let result = DatabaseSession::open(local_file(&dir), wrong, &cancel);
    assert!(matches!(result, Err(Error::IntegrityCheckFailed)));
}

#[test]
fn test_keyfile_is_part_of_the_key() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let with_file = || key().with_keyfile(&[7u8; 32]).unwrap();
    DatabaseSession::create(local_file(&dir), with_file(), Database::new("K"), &cancel).unwrap();

    assert!(DatabaseSession::open(local_file(&dir), key(), &cancel).is_err());
    assert!(DatabaseSession::open(local_file(&dir), with_file(), &cancel).is_ok());
}

#[test]
fn test_deletion_versus_edit() {
    let cancel = CancellationToken::new();
    let mut db = Database::with_settings("Race", ContainerSettings::with_kdf(KdfParams::aes(10)));
    db.meta.recycle_bin_enabled = false;
    let root = db.root.uuid;
    let kept = db.add_entry(&root, Entry::new()).unwrap();
    let lost = db.add_entry(&root, Entry::new()).unwrap();

    let dir = TempDir::new().unwrap();
    DatabaseSession::create(local_file(&dir), key(), db, &cancel).unwrap();
    let mut deleter = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();
    let mut editor = DatabaseSession::open(local_file(&dir), key(), &cancel).unwrap();

    let deleted_at = Utc::now() - Duration::seconds(60);
    {
        let db = deleter.database_mut();
        db.delete_entry(&kept).unwrap();
        db.delete_entry(&lost).unwrap();
        for record in &mut db.deleted_objects {
            record.deletion_time = deleted_at;
        }
    }
    editor
        .database_mut()
        .update_entry(&kept, |e| e.set(TITLE, "edited after the deletion"))
        .unwrap();
    editor.database_mut().find_entry_mut(&lost).unwrap().times.last_modification =
        deleted_at - Duration::seconds(60);

    deleter.save(SaveMode::Merge, &cancel).unwrap();
    editor.save(SaveMode::Merge, &cancel).unwrap();

    let db = editor.database();
    assert_eq!(db.find_entry(&kept).unwrap().title(), "edited after the deletion");
    assert!(db.deletion_of(&kept).is_none());
    assert!(db.find_entry(&lost).is_none());
    assert!(db.deletion_of(&lost).is_some());
}

#[test]
fn test_cancelled_open_returns_no_session() {
    let dir = TempDir::new().unwrap();
    DatabaseSession::create(
        local_file(&dir),
        key(),
        Database::new("C"),
        &CancellationToken::new(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = DatabaseSession::open(local_file(&dir), key(), &cancel);
    assert!(matches!(result, Err(Error::OperationCancelled)));
}

// Merge properties over random edit sequences.

#[derive(Debug, Clone)]
enum Op {
    Edit { entry: usize, secs: i64 },
    Delete { entry: usize, secs: i64 },
    Add { group: usize, secs: i64 },
    MoveEntry { entry: usize, group: usize, secs: i64 },
    MoveGroup { group: usize, target: usize, secs: i64 },
    Rename { group: usize, secs: i64 },
    RenameDatabase { secs: i64 },
    Recolor { secs: i64 },
    AddIcon { icon: usize, secs: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 1..50i64).prop_map(|(entry, secs)| Op::Edit { entry, secs }),
        (0..4usize, 1..50i64).prop_map(|(entry, secs)| Op::Delete { entry, secs }),
        (0..3usize, 1..50i64).prop_map(|(group, secs)| Op::Add { group, secs }),
        (0..4usize, 0..3usize, 1..50i64)
            .prop_map(|(entry, group, secs)| Op::MoveEntry { entry, group, secs }),
        (1..3usize, 0..3usize, 1..50i64)
            .prop_map(|(group, target, secs)| Op::MoveGroup { group, target, secs }),
        (0..3usize, 1..50i64).prop_map(|(group, secs)| Op::Rename { group, secs }),
        (1..50i64).prop_map(|secs| Op::RenameDatabase { secs }),
        (1..50i64).prop_map(|secs| Op::Recolor { secs }),
        (0..3usize, 1..50i64).prop_map(|(icon, secs)| Op::AddIcon { icon, secs }),
    ]
}

struct Fixture {
    db: Database,
    groups: Vec<Uuid>,
    entries: Vec<Uuid>,
    icons: Vec<Uuid>,
    epoch: Timestamp,
}

fn fixture() -> Fixture {
    let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut db = Database::new("Prop");
    db.meta.recycle_bin_enabled = false;
    db.meta.settings_changed = epoch;
    db.meta.database_name_changed = epoch;
    let root = db.root.uuid;
    let a = db.add_group(&root, Group::new("A")).unwrap();
    let b = db.add_group(&root, Group::new("B")).unwrap();
    let groups = vec![root, a, b];

    let mut entries = Vec::new();
    for (i, parent) in [root, a, a, b].iter().enumerate() {
        let mut entry = Entry::new();
        entry.set(TITLE, format!("entry {}", i));
        entries.push(db.add_entry(parent, entry).unwrap());
    }

    let group_ids: Vec<Uuid> = db.root.all_groups().iter().map(|g| g.uuid).collect();
    for id in group_ids {
        if let Some(group) = db.find_group_mut(&id) {
            group.times = passvault_model::Times::at(epoch);
        }
    }
    for id in &entries {
        if let Some(entry) = db.find_entry_mut(id) {
            entry.times = passvault_model::Times::at(epoch);
        }
    }
    Fixture {
        db,
        groups,
        entries,
        icons: (0..3).map(|_| Uuid::new_v4()).collect(),
        epoch,
    }
}

fn apply(fixture: &Fixture, ops: &[Op]) -> Database {
    let mut db = fixture.db.clone();
    for op in ops {
        match *op {
            Op::Edit { entry, secs } => {
                let id = fixture.entries[entry];
                if db.update_entry(&id, |e| e.set(TITLE, format!("edit {}", secs))).is_ok() {
                    if let Some(e) = db.find_entry_mut(&id) {
                        e.times.last_modification = fixture.epoch + Duration::seconds(secs);
                    }
                }
            }
            Op::Delete { entry, secs } => {
                let id = fixture.entries[entry];
                if db.delete_entry(&id).is_ok() {
                    if let Some(record) = db.deleted_objects.iter_mut().find(|d| d.uuid == id) {
                        record.deletion_time = fixture.epoch + Duration::seconds(secs);
                    }
                }
            }
            Op::Add { group, secs } => {
                let mut entry = Entry::new();
                entry.set(TITLE, format!("added {}", secs));
                entry.times = passvault_model::Times::at(fixture.epoch + Duration::seconds(secs));
                let _ = db.add_entry(&fixture.groups[group], entry);
            }
            Op::MoveEntry { entry, group, secs } => {
                let id = fixture.entries[entry];
                if db.move_entry(&id, &fixture.groups[group]).is_ok() {
                    if let Some(e) = db.find_entry_mut(&id) {
                        let ts = fixture.epoch + Duration::seconds(secs);
                        e.times.location_changed = ts;
                        e.times.last_modification = ts;
                    }
                }
            }
            Op::MoveGroup { group, target, secs } => {
                let id = fixture.groups[group];
                if db.move_group(&id, &fixture.groups[target]).is_ok() {
                    if let Some(g) = db.find_group_mut(&id) {
                        let ts = fixture.epoch + Duration::seconds(secs);
                        g.times.location_changed = ts;
                        g.times.last_modification = ts;
                    }
                }
            }
            Op::Rename { group, secs } => {
                let id = fixture.groups[group];
                let _ = db.update_group(&id, |g| g.name = format!("renamed {}", secs));
                if let Some(g) = db.find_group_mut(&id) {
                    g.times.last_modification = fixture.epoch + Duration::seconds(secs);
                }
            }
            Op::RenameDatabase { secs } => {
                db.set_name(format!("database {}", secs));
                db.meta.database_name_changed = fixture.epoch + Duration::seconds(secs);
            }
            Op::Recolor { secs } => {
                db.meta.color = format!("#{:06X}", secs);
                db.meta.settings_changed = fixture.epoch + Duration::seconds(secs);
            }
            Op::AddIcon { icon, secs } => {
                let uuid = fixture.icons[icon];
                db.meta.custom_icons.retain(|i| i.uuid != uuid);
                db.meta.custom_icons.push(CustomIcon {
                    uuid,
                    data: vec![secs as u8],
                    name: None,
                    last_modification: Some(fixture.epoch + Duration::seconds(secs)),
                });
            }
        }
    }
    db
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn merge_is_commutative(
        left in prop::collection::vec(op_strategy(), 0..8),
        right in prop::collection::vec(op_strategy(), 0..8),
    ) {
        let fixture = fixture();
        let a = apply(&fixture, &left);
        let b = apply(&fixture, &right);

        let ab = merge(&a, &b);
        let ba = merge(&b, &a);
        prop_assert!(ab.content_eq(&ba));
        prop_assert_eq!(to_plain_xml(&ab).unwrap(), to_plain_xml(&ba).unwrap());
    }

    #[test]
    fn merge_is_idempotent(
        left in prop::collection::vec(op_strategy(), 0..8),
        right in prop::collection::vec(op_strategy(), 0..8),
    ) {
        let fixture = fixture();
        let a = apply(&fixture, &left);
        let b = apply(&fixture, &right);
        let merged = merge(&a, &b);
        prop_assert!(merge(&merged, &merged).content_eq(&merged));
        prop_assert!(merge(&merged, &b).content_eq(&merged));
        prop_assert!(merge(&merged, &a).content_eq(&merged));
        prop_assert!(merge(&b, &merged).content_eq(&merged));
    }

    #[test]
    fn merge_never_loses_the_tree(
        left in prop::collection::vec(op_strategy(), 0..8),
        right in prop::collection::vec(op_strategy(), 0..8),
    ) {
        let fixture = fixture();
        let a = apply(&fixture, &left);
        let b = apply(&fixture, &right);
        let merged = merge(&a, &b);

        let index = merged.index();
        for id in &fixture.groups[1..] {
            let in_either = a.find_group(id).is_some() || b.find_group(id).is_some();
            prop_assert_eq!(index.contains(NodeKind::Group, id), in_either);
        }
        for id in index.group_ids() {
            prop_assert!(index.is_within(id, &merged.root.uuid));
        }
    }
}
