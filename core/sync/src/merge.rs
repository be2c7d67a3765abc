//! Merge of two diverged copies of one database.
//!
//! Groups and entries are matched by uuid (separate namespaces), the two
//! root groups are matched regardless of uuid. For every node the copy with
//! the later last-modification wins; equal timestamps fall back to the
//! greater content digest so the result does not depend on argument order.
//! Digests used for these decisions leave out `location_changed`, which
//! follows the parent choice rather than the content winner.
//! Deletion records are unioned and compared against the winning
//! modification time.
//!
//! Both inputs are read-only. The merge never fails: every disagreement has
//! a deterministic resolution.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use passvault_model::{CustomIcon, Database, DeletedObject, Entry, Group, Meta, Timestamp};

/// Counters describing one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Groups in the result, root included.
    pub groups: usize,
    /// Entries in the result.
    pub entries: usize,
    /// Nodes present on both sides with different content.
    pub conflicts: usize,
    /// Nodes dropped because of a deletion record.
    pub deleted: usize,
    /// Nodes that outlived a deletion record through a later edit.
    pub resurrected: usize,
    /// Nodes whose chosen parent did not survive.
    pub reparented: usize,
}

/// Merge `local` and `remote` into a new database.
///
/// # Postconditions
/// - `merge(a, b)` and `merge(b, a)` have equal content
/// - `merge(m, m)` equals `m` for any merge result `m`
pub fn merge(local: &Database, remote: &Database) -> Database {
    merge_with_stats(local, remote).0
}

/// [`merge`], also returning what happened.
pub fn merge_with_stats(local: &Database, remote: &Database) -> (Database, MergeStats) {
    let mut merger = Merger::new(local, remote);
    let database = merger.run();
    info!(
        groups = merger.stats.groups,
        entries = merger.stats.entries,
        conflicts = merger.stats.conflicts,
        deleted = merger.stats.deleted,
        resurrected = merger.stats.resurrected,
        "Merged databases"
    );
    (database, merger.stats)
}

/// Pick `(winner, loser)` by timestamp, then by digest.
fn newer<'a, T, D: Ord>(
    a: &'a T,
    b: &'a T,
    stamp: impl Fn(&T) -> Timestamp,
    digest: impl Fn(&T) -> D,
) -> (&'a T, &'a T) {
    let order = stamp(a)
        .cmp(&stamp(b))
        .then_with(|| digest(a).cmp(&digest(b)));
    if order == Ordering::Less {
        (b, a)
    } else {
        (a, b)
    }
}

/// A value guarded by its own "changed" timestamp.
fn stamped<T: Clone + Ord>(a: (&T, Timestamp), b: (&T, Timestamp)) -> (T, Timestamp) {
    match a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)) {
        Ordering::Less => (b.0.clone(), b.1),
        _ => (a.0.clone(), a.1),
    }
}

struct Placed<'a, T> {
    node: &'a T,
    parent: Uuid,
}

fn group_rank(g: &Group) -> ([u8; 32], [u8; 32]) {
    (g.edit_digest(), g.content_digest())
}

fn entry_rank(e: &Entry) -> ([u8; 32], [u8; 32]) {
    (e.edit_digest(), e.content_digest())
}

/// Flat view of one side with parents normalised to the merged root id.
struct Side<'a> {
    root: &'a Group,
    groups: HashMap<Uuid, Placed<'a, Group>>,
    entries: HashMap<Uuid, Placed<'a, Entry>>,
}

impl<'a> Side<'a> {
    fn index(db: &'a Database, root_id: Uuid) -> Self {
        let mut side = Side {
            root: &db.root,
            groups: HashMap::new(),
            entries: HashMap::new(),
        };
        side.visit(&db.root, root_id);
        side
    }

    fn visit(&mut self, group: &'a Group, id: Uuid) {
        for entry in &group.entries {
            self.entries.insert(
                entry.uuid,
                Placed {
                    node: entry,
                    parent: id,
                },
            );
        }
        for child in &group.groups {
            self.groups.insert(
                child.uuid,
                Placed {
                    node: child,
                    parent: id,
                },
            );
            self.visit(child, child.uuid);
        }
    }

    fn group(&self, id: &Uuid, root_id: &Uuid) -> Option<&'a Group> {
        if id == root_id {
            Some(self.root)
        } else {
            self.groups.get(id).map(|p| p.node)
        }
    }
}

/// A merged node waiting to be placed in the tree.
struct Pending<T> {
    node: T,
    parent: Uuid,
    alternative: Option<Uuid>,
}

struct Merger<'a> {
    local_db: &'a Database,
    remote_db: &'a Database,
    root_id: Uuid,
    local: Side<'a>,
    remote: Side<'a>,
    deletions: BTreeMap<Uuid, Timestamp>,
    stats: MergeStats,
}

impl<'a> Merger<'a> {
    fn new(local_db: &'a Database, remote_db: &'a Database) -> Self {
        let (root, _) = newer(
            &local_db.root,
            &remote_db.root,
            |g| g.times.last_modification,
            group_rank,
        );
        let root_id = root.uuid;

        let mut deletions = BTreeMap::new();
        for record in local_db
            .deleted_objects
            .iter()
            .chain(&remote_db.deleted_objects)
        {
            deletions
                .entry(record.uuid)
                .and_modify(|t: &mut Timestamp| *t = (*t).max(record.deletion_time))
                .or_insert(record.deletion_time);
        }

        Self {
            local_db,
            remote_db,
            root_id,
            local: Side::index(local_db, root_id),
            remote: Side::index(remote_db, root_id),
            deletions,
            stats: MergeStats::default(),
        }
    }

    /// Apply the deletion rule to a node whose winning copy was last
    /// modified at `modified`.
    fn survives(&mut self, id: &Uuid, modified: Timestamp) -> bool {
        match self.deletions.get(id) {
            Some(deleted) if modified <= *deleted => {
                self.stats.deleted += 1;
                false
            }
            Some(_) => {
                self.deletions.remove(id);
                self.stats.resurrected += 1;
                true
            }
            None => true,
        }
    }

    fn run(&mut self) -> Database {
        let (meta, local_settings) = merge_meta(&self.local_db.meta, &self.remote_db.meta);
        let settings_side = if local_settings {
            self.local_db
        } else {
            self.remote_db
        };

        let root = self.merge_root();
        let mut groups = self.merge_groups();
        let mut entries = self.merge_entries(&meta);

        let mut survivors: HashSet<Uuid> = groups.keys().copied().collect();
        survivors.insert(self.root_id);
        self.resolve_parents(&mut groups, &survivors);
        self.resolve_parents(&mut entries, &survivors);
        self.break_cycles(&mut groups);

        let group_children =
            self.order_children(&groups, |g| &g.groups, |g: &Group| g.uuid);
        let entry_children =
            self.order_children(&entries, |g| &g.entries, |e: &Entry| e.uuid);

        let mut shells: HashMap<Uuid, Group> = groups
            .into_iter()
            .map(|(id, pending)| (id, pending.node))
            .collect();
        shells.insert(self.root_id, root);
        let mut entries: HashMap<Uuid, Entry> = entries
            .into_iter()
            .map(|(id, pending)| (id, pending.node))
            .collect();
        let root = assemble(
            self.root_id,
            &mut shells,
            &mut entries,
            &group_children,
            &entry_children,
        );

        let mut deleted_objects: Vec<DeletedObject> = self
            .deletions
            .iter()
            .map(|(uuid, deletion_time)| DeletedObject {
                uuid: *uuid,
                deletion_time: *deletion_time,
            })
            .collect();
        deleted_objects.sort_by(|a, b| {
            a.deletion_time
                .cmp(&b.deletion_time)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });

        self.stats.groups = root.all_groups().len();
        self.stats.entries = root.all_entries().len();

        Database {
            settings: settings_side.settings.clone(),
            meta,
            root,
            deleted_objects,
            unknown: settings_side.unknown.clone(),
            root_unknown: settings_side.root_unknown.clone(),
        }
    }

    fn merge_root(&mut self) -> Group {
        let local = &self.local_db.root;
        let remote = &self.remote_db.root;
        let (winner, loser) = newer(
            local,
            remote,
            |g| g.times.last_modification,
            group_rank,
        );
        if winner.edit_digest() != loser.edit_digest() {
            self.stats.conflicts += 1;
        }
        let mut root = winner.shallow_clone();
        root.uuid = self.root_id;
        root
    }

    fn merge_groups(&mut self) -> HashMap<Uuid, Pending<Group>> {
        let mut ids: Vec<Uuid> = self
            .local
            .groups
            .keys()
            .chain(self.remote.groups.keys())
            .filter(|id| **id != self.root_id)
            .copied()
            .collect();
        ids.sort();
        ids.dedup();

        let mut out = HashMap::new();
        for id in ids {
            let local = self.local.groups.get(&id).map(|p| (p.node, p.parent));
            let remote = self.remote.groups.get(&id).map(|p| (p.node, p.parent));

            let (node, parent, alternative) = match (local, remote) {
                (Some((l, lp)), Some((r, rp))) => {
                    let (winner, loser) =
                        newer(l, r, |g| g.times.last_modification, group_rank);
                    if winner.edit_digest() != loser.edit_digest() {
                        self.stats.conflicts += 1;
                    }
                    let mut node = winner.shallow_clone();
                    let (parent, alternative, moved) = choose_parent(
                        (lp, l.times.location_changed),
                        (rp, r.times.location_changed),
                    );
                    node.times.location_changed = moved;
                    (node, parent, alternative)
                }
                (Some((l, lp)), None) => (l.shallow_clone(), lp, None),
                (None, Some((r, rp))) => (r.shallow_clone(), rp, None),
                (None, None) => continue,
            };

            if !self.survives(&id, node.times.last_modification) {
                continue;
            }
            out.insert(
                id,
                Pending {
                    node,
                    parent,
                    alternative,
                },
            );
        }
        debug!(groups = out.len(), "Merged groups");
        out
    }

    fn merge_entries(&mut self, meta: &Meta) -> HashMap<Uuid, Pending<Entry>> {
        let mut ids: Vec<Uuid> = self
            .local
            .entries
            .keys()
            .chain(self.remote.entries.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();

        let mut out = HashMap::new();
        for id in ids {
            let local = self.local.entries.get(&id).map(|p| (p.node, p.parent));
            let remote = self.remote.entries.get(&id).map(|p| (p.node, p.parent));

            let (node, parent, alternative) = match (local, remote) {
                (Some((l, lp)), Some((r, rp))) => {
                    if l.edit_digest() != r.edit_digest() {
                        self.stats.conflicts += 1;
                    }
                    let mut node = merge_entry(l, r, meta);
                    let (parent, alternative, moved) = choose_parent(
                        (lp, l.times.location_changed),
                        (rp, r.times.location_changed),
                    );
                    node.times.location_changed = moved;
                    (node, parent, alternative)
                }
                (Some((l, lp)), None) => (merge_entry(l, l, meta), lp, None),
                (None, Some((r, rp))) => (merge_entry(r, r, meta), rp, None),
                (None, None) => continue,
            };

            if !self.survives(&id, node.times.last_modification) {
                continue;
            }
            out.insert(
                id,
                Pending {
                    node,
                    parent,
                    alternative,
                },
            );
        }
        debug!(entries = out.len(), "Merged entries");
        out
    }

    /// Redirect nodes whose parent was dropped: other side's parent, else root.
    fn resolve_parents<T>(&mut self, nodes: &mut HashMap<Uuid, Pending<T>>, survivors: &HashSet<Uuid>) {
        for pending in nodes.values_mut() {
            if survivors.contains(&pending.parent) {
                continue;
            }
            self.stats.reparented += 1;
            pending.parent = pending
                .alternative
                .filter(|alt| survivors.contains(alt))
                .unwrap_or(self.root_id);
        }
    }

    /// Crossed moves can leave groups that are their own ancestors. Visit
    /// groups in uuid order and re-hang each one found on a cycle.
    fn break_cycles(&mut self, groups: &mut HashMap<Uuid, Pending<Group>>) {
        let mut ids: Vec<Uuid> = groups.keys().copied().collect();
        ids.sort();

        for id in ids {
            let parents: HashMap<Uuid, Uuid> =
                groups.iter().map(|(k, p)| (*k, p.parent)).collect();
            let Some(start) = parents.get(&id).copied() else {
                continue;
            };
            if !reaches(&parents, start, id, self.root_id) {
                continue;
            }

            let alternative = groups.get(&id).and_then(|p| p.alternative);
            let replacement = alternative
                .filter(|alt| *alt != id)
                .filter(|alt| *alt == self.root_id || parents.contains_key(alt))
                .filter(|alt| !reaches(&parents, *alt, id, self.root_id))
                .unwrap_or(self.root_id);
            debug!(group = %id, "Breaking group cycle");
            self.stats.reparented += 1;
            if let Some(pending) = groups.get_mut(&id) {
                pending.parent = replacement;
            }
        }
    }

    /// Final child lists: the leading parent version's order, then the
    /// other side's order, then everything else by uuid.
    ///
    /// The leader is the side whose version of the parent won (later
    /// modification, then greater digest). When both versions are equal
    /// the side listing more of the final children leads, then the
    /// greater list. A merge result lists all of its children, so merging
    /// it again with either input keeps its order.
    fn order_children<T, C>(
        &self,
        nodes: &HashMap<Uuid, Pending<T>>,
        list: impl Fn(&'a Group) -> &'a Vec<C>,
        key: impl Fn(&C) -> Uuid,
    ) -> HashMap<Uuid, Vec<Uuid>>
    where
        C: 'a,
    {
        let mut members: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for (id, pending) in nodes {
            members.entry(pending.parent).or_default().insert(*id);
        }

        let mut out = HashMap::new();
        for (parent, children) in members {
            let rank = |side: &Side<'a>| {
                side.group(&parent, &self.root_id).map(|group| {
                    let listed: Vec<Uuid> = list(group)
                        .iter()
                        .map(&key)
                        .filter(|id| children.contains(id))
                        .collect();
                    (
                        group.times.last_modification,
                        group.edit_digest(),
                        listed.len(),
                        listed,
                    )
                })
            };
            let (first, second) = {
                let local = rank(&self.local);
                let remote = rank(&self.remote);
                if local >= remote {
                    (local, remote)
                } else {
                    (remote, local)
                }
            };

            let mut ordered = Vec::with_capacity(children.len());
            let mut placed = HashSet::new();
            for listed in [first, second].into_iter().flatten().map(|r| r.3) {
                for id in listed {
                    if placed.insert(id) {
                        ordered.push(id);
                    }
                }
            }
            let mut rest: Vec<Uuid> = children
                .iter()
                .filter(|id| !placed.contains(*id))
                .copied()
                .collect();
            rest.sort();
            ordered.extend(rest);
            out.insert(parent, ordered);
        }
        out
    }
}

/// Parent with the later location change; ties go to the greater uuid.
/// Returns `(parent, alternative, location_changed)`.
fn choose_parent(
    local: (Uuid, Timestamp),
    remote: (Uuid, Timestamp),
) -> (Uuid, Option<Uuid>, Timestamp) {
    let (chosen, other) = match local.1.cmp(&remote.1).then_with(|| local.0.cmp(&remote.0)) {
        Ordering::Less => (remote, local),
        _ => (local, remote),
    };
    let alternative = (other.0 != chosen.0).then_some(other.0);
    (chosen.0, alternative, chosen.1)
}

/// Whether walking up from `start` arrives at `target` before the root.
fn reaches(parents: &HashMap<Uuid, Uuid>, start: Uuid, target: Uuid, root: Uuid) -> bool {
    let mut seen = HashSet::new();
    let mut current = start;
    loop {
        if current == target {
            return true;
        }
        if current == root || !seen.insert(current) {
            return false;
        }
        match parents.get(&current) {
            Some(parent) => current = *parent,
            None => return false,
        }
    }
}

fn assemble(
    id: Uuid,
    shells: &mut HashMap<Uuid, Group>,
    entries: &mut HashMap<Uuid, Entry>,
    group_children: &HashMap<Uuid, Vec<Uuid>>,
    entry_children: &HashMap<Uuid, Vec<Uuid>>,
) -> Group {
    let mut group = shells
        .remove(&id)
        .unwrap_or_else(|| Group::with_uuid(id, String::new()));
    if let Some(children) = entry_children.get(&id) {
        group.entries = children.iter().filter_map(|e| entries.remove(e)).collect();
    }
    if let Some(children) = group_children.get(&id) {
        group.groups = children
            .iter()
            .map(|child| assemble(*child, shells, entries, group_children, entry_children))
            .collect();
    }
    group
}

/// Winner's content with the union of both histories.
fn merge_entry(local: &Entry, remote: &Entry, meta: &Meta) -> Entry {
    let (winner, loser) = newer(local, remote, |e| e.times.last_modification, entry_rank);

    let mut snapshots: BTreeMap<(Timestamp, Uuid), Entry> = BTreeMap::new();
    let loser_state = (loser.edit_digest() != winner.edit_digest()).then(|| loser.create_backup());
    for snapshot in local
        .history
        .iter()
        .chain(&remote.history)
        .cloned()
        .chain(loser_state)
    {
        let key = (snapshot.times.last_modification, snapshot.uuid);
        match snapshots.get(&key) {
            Some(existing) if existing.content_digest() >= snapshot.content_digest() => {}
            _ => {
                snapshots.insert(key, snapshot);
            }
        }
    }

    let mut merged = winner.clone();
    merged.history = snapshots.into_values().collect();
    merged.maintain_history(meta.history_max_items, meta.history_max_size);
    merged
}

/// Field-wise meta merge. Also returns whether `local` won the general
/// settings.
fn merge_meta(local: &Meta, remote: &Meta) -> (Meta, bool) {
    let (winner, _) = newer(local, remote, |m| m.settings_changed, Meta::settings_digest);
    let local_won = std::ptr::eq(winner, local);
    let mut meta = winner.clone();

    (meta.database_name, meta.database_name_changed) = stamped(
        (&local.database_name, local.database_name_changed),
        (&remote.database_name, remote.database_name_changed),
    );
    (meta.database_description, meta.database_description_changed) = stamped(
        (&local.database_description, local.database_description_changed),
        (&remote.database_description, remote.database_description_changed),
    );
    (meta.default_username, meta.default_username_changed) = stamped(
        (&local.default_username, local.default_username_changed),
        (&remote.default_username, remote.default_username_changed),
    );
    (meta.recycle_bin_uuid, meta.recycle_bin_changed) = stamped(
        (&local.recycle_bin_uuid, local.recycle_bin_changed),
        (&remote.recycle_bin_uuid, remote.recycle_bin_changed),
    );
    (meta.entry_templates_group, meta.entry_templates_group_changed) = stamped(
        (&local.entry_templates_group, local.entry_templates_group_changed),
        (&remote.entry_templates_group, remote.entry_templates_group_changed),
    );
    meta.master_key_changed = local.master_key_changed.max(remote.master_key_changed);
    let icon_rank = |m: &Meta| {
        (
            m.settings_changed,
            m.settings_digest(),
            m.custom_icons.iter().map(|i| i.uuid).collect::<Vec<_>>(),
        )
    };
    meta.custom_icons = if icon_rank(local) >= icon_rank(remote) {
        merge_icons(&local.custom_icons, &remote.custom_icons)
    } else {
        merge_icons(&remote.custom_icons, &local.custom_icons)
    };

    (meta, local_won)
}

fn merge_icons(first: &[CustomIcon], second: &[CustomIcon]) -> Vec<CustomIcon> {
    let mut out: Vec<CustomIcon> = Vec::with_capacity(first.len() + second.len());
    for icon in first.iter().chain(second) {
        match out.iter_mut().find(|existing| existing.uuid == icon.uuid) {
            Some(existing) => {
                let newer = (icon.last_modification, icon.data.as_slice(), icon.name.as_deref())
                    > (
                        existing.last_modification,
                        existing.data.as_slice(),
                        existing.name.as_deref(),
                    );
                if newer {
                    *existing = icon.clone();
                }
            }
            None => out.push(icon.clone()),
        }
    }
    out
}
