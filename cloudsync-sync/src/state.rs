//! Sync entries and the table that indexes them.
//!
//! One [`SyncEntry`] per logical object spans every side. The table keeps
//! two indices: `(side, oid)` and logical path. Entries are read out as
//! snapshots and written back whole with [`SyncTable::put`], which re-derives
//! both indices, so no caller ever edits an index directly.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use cloudsync_core::{paths, ContentHash, Event, OType, Oid, Side};

// ---------------------------------------------------------------------------
// 1. States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Seen on one side so far; nothing decided.
    Unresolved,
    /// Exists only locally; the remote copy is pending.
    LocalOnly,
    /// Exists only on remote sides; the local copy is pending.
    RemoteOnly,
    InSync,
    /// Divergent concurrent changes are being resolved.
    Conflict,
    /// Absent everywhere; kept for the grace window, then purged.
    Tombstoned,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Unresolved => "unresolved",
            SyncState::LocalOnly => "local-only",
            SyncState::RemoteOnly => "remote-only",
            SyncState::InSync => "in-sync",
            SyncState::Conflict => "conflict",
            SyncState::Tombstoned => "tombstoned",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// 2. Per-side state
// ---------------------------------------------------------------------------

/// What the engine knows about one entry on one side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideState {
    /// `None` until the side has reported the object.
    pub oid: Option<Oid>,
    /// Path relative to the side's sync root.
    pub path: Option<String>,
    pub otype: OType,
    pub hash: Option<ContentHash>,
    /// Hash at the last in-sync point.
    pub sync_hash: Option<ContentHash>,
    pub exists: bool,
    /// Timestamp of an unreconciled change on this side.
    pub changed: Option<f64>,
    /// Timestamp of the last applied event.
    pub timestamp: f64,
}

impl SideState {
    pub fn is_seen(&self) -> bool {
        self.oid.is_some()
    }

    pub fn is_live(&self) -> bool {
        self.oid.is_some() && self.exists
    }

    /// Whether applying `event` (at `path`, already made relative) would
    /// change nothing. Paths compare by exact spelling, so a case-only
    /// rename is a change.
    pub fn matches(&self, event: &Event, path: Option<&str>) -> bool {
        if self.oid.as_ref() != Some(&event.oid) || self.exists != event.exists {
            return false;
        }
        if !event.exists {
            return true;
        }
        let hash_same = event.hash.is_none() || self.hash == event.hash;
        let path_same = match (path, self.path.as_deref()) {
            (None, _) => true,
            (Some(new), Some(old)) => new == old,
            (Some(_), None) => false,
        };
        hash_same && path_same
    }
}

// ---------------------------------------------------------------------------
// 3. Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One logical file or directory across all sides.
#[derive(Debug, Clone)]
pub struct SyncEntry {
    pub id: EntryId,
    /// Path relative to every side's sync root. Meaningless until `placed`.
    pub logical_path: String,
    /// False while the object is known only by oid. Unplaced entries are
    /// indexed by oid alone and never reconciled.
    pub placed: bool,
    pub otype: OType,
    /// Indexed by side.
    pub sides: Vec<SideState>,
    pub state: SyncState,
    pub last_transition_ts: f64,
    pub tombstoned_at: Option<Instant>,
}

impl SyncEntry {
    pub fn new(logical_path: impl Into<String>, otype: OType, side_count: usize, now: f64) -> Self {
        Self {
            id: EntryId(0),
            logical_path: logical_path.into(),
            placed: true,
            otype,
            sides: vec![SideState::default(); side_count],
            state: SyncState::Unresolved,
            last_transition_ts: now,
            tombstoned_at: None,
        }
    }

    /// An entry for an object whose path could not be resolved yet.
    pub fn unplaced(otype: OType, side_count: usize, now: f64) -> Self {
        Self {
            placed: false,
            ..Self::new(String::new(), otype, side_count, now)
        }
    }

    /// Give an unplaced entry its logical path.
    pub fn place(&mut self, logical_path: impl Into<String>) {
        self.logical_path = logical_path.into();
        self.placed = true;
    }

    pub fn side(&self, side: Side) -> Option<&SideState> {
        self.sides.get(side.index())
    }

    /// Sides with an unreconciled change, in side order.
    pub fn changed_sides(&self) -> Vec<usize> {
        (0..self.sides.len())
            .filter(|&i| self.sides[i].changed.is_some())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.sides.iter().any(|s| s.changed.is_some())
    }

    pub fn exists_anywhere(&self) -> bool {
        self.sides.iter().any(SideState::is_live)
    }

    pub fn depth(&self) -> usize {
        self.logical_path.split('/').filter(|c| !c.is_empty()).count()
    }

    pub fn transition(&mut self, state: SyncState, now: f64) {
        if self.state != state {
            tracing::debug!(
                entry = %self.id,
                path = %self.logical_path,
                from = %self.state,
                to = %state,
                "transition"
            );
            self.state = state;
            self.last_transition_ts = now;
        }
        self.tombstoned_at = match (state, self.tombstoned_at) {
            (SyncState::Tombstoned, Some(t)) => Some(t),
            (SyncState::Tombstoned, None) => Some(Instant::now()),
            _ => None,
        };
    }

    /// State implied by existence alone, before any operation is decided.
    pub fn presence_state(&self) -> SyncState {
        let live: Vec<usize> = (0..self.sides.len())
            .filter(|&i| self.sides[i].is_live())
            .collect();
        let seen = self.sides.iter().filter(|s| s.is_seen()).count();
        match live.as_slice() {
            [] => SyncState::Tombstoned,
            _ if seen < 2 => SyncState::Unresolved,
            [0] => SyncState::LocalOnly,
            l if !l.contains(&0) => SyncState::RemoteOnly,
            _ => self.state,
        }
    }
}

// ---------------------------------------------------------------------------
// 4. Table
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SyncTable {
    case_sensitive: bool,
    next_id: u64,
    entries: BTreeMap<EntryId, SyncEntry>,
    by_oid: HashMap<(Side, Oid), EntryId>,
    /// Usually one id per key; briefly more while a rename-over or a
    /// re-creation overlaps an entry that is on its way out.
    by_path: HashMap<String, Vec<EntryId>>,
}

impl SyncTable {
    /// `case_sensitive` governs logical path matching; it is false when any
    /// side is case-insensitive.
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            next_id: 1,
            entries: BTreeMap::new(),
            by_oid: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&SyncEntry> {
        self.entries.get(&id)
    }

    pub fn find_by_oid(&self, side: Side, oid: &Oid) -> Option<EntryId> {
        self.by_oid.get(&(side, oid.clone())).copied()
    }

    /// Prefers a live entry over a tombstone, then the newest.
    pub fn find_by_path(&self, path: &str) -> Option<EntryId> {
        self.by_path
            .get(&self.key(path))?
            .iter()
            .filter_map(|id| self.entries.get(id))
            .max_by_key(|e| (e.state != SyncState::Tombstoned, e.id))
            .map(|e| e.id)
    }

    pub fn entry_at(&self, path: &str) -> Option<&SyncEntry> {
        self.find_by_path(path).and_then(|id| self.entries.get(&id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.values()
    }

    /// Dirty entries: live-side changes shallow-first, then deletions
    /// deep-first, so parents exist before children and are removed after.
    pub fn dirty_ids(&self) -> Vec<EntryId> {
        let mut creates: Vec<&SyncEntry> = Vec::new();
        let mut deletes: Vec<&SyncEntry> = Vec::new();
        for e in self.entries.values().filter(|e| e.placed && e.is_dirty()) {
            let deleting = e
                .changed_sides()
                .iter()
                .all(|&i| !e.sides[i].exists);
            if deleting {
                deletes.push(e);
            } else {
                creates.push(e);
            }
        }
        creates.sort_by_key(|e| (e.depth(), e.id));
        deletes.sort_by_key(|e| (std::cmp::Reverse(e.depth()), e.id));
        creates.into_iter().chain(deletes).map(|e| e.id).collect()
    }

    /// Add a new entry and return its id.
    pub fn insert(&mut self, mut entry: SyncEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        entry.id = id;
        self.put(entry);
        id
    }

    /// Store `entry` and re-derive its index keys.
    pub fn put(&mut self, entry: SyncEntry) {
        let id = entry.id;
        if let Some(old) = self.entries.remove(&id) {
            self.unindex(&old);
        }
        for (i, s) in entry.sides.iter().enumerate() {
            if let Some(oid) = &s.oid {
                self.by_oid.insert((Side(i), oid.clone()), id);
            }
        }
        if entry.placed {
            let key = self.key(&entry.logical_path);
            self.by_path.entry(key).or_default().push(id);
        }
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: EntryId) -> Option<SyncEntry> {
        let old = self.entries.remove(&id)?;
        self.unindex(&old);
        Some(old)
    }

    /// Rewrite `side`'s path of every entry below `from` to lie below `to`.
    /// The entry at `from` itself is left alone.
    pub fn rewrite_side_paths(&mut self, side: Side, from: &str, to: &str) -> usize {
        let cs = self.case_sensitive;
        let moved: Vec<SyncEntry> = self
            .entries
            .values()
            .filter_map(|e| {
                let p = e.sides.get(side.index())?.path.as_deref()?;
                if paths::paths_match(p, from, cs) {
                    return None;
                }
                let np = paths::replace_prefix(p, from, to, cs)?;
                let mut e = e.clone();
                e.sides[side.index()].path = Some(np);
                Some(e)
            })
            .collect();
        let n = moved.len();
        for e in moved {
            self.put(e);
        }
        n
    }

    /// Rewrite the logical path of every entry below `from`.
    pub fn rewrite_logical_paths(&mut self, from: &str, to: &str) -> usize {
        let cs = self.case_sensitive;
        let moved: Vec<SyncEntry> = self
            .entries
            .values()
            .filter(|e| e.placed && !paths::paths_match(&e.logical_path, from, cs))
            .filter_map(|e| {
                let np = paths::replace_prefix(&e.logical_path, from, to, cs)?;
                let mut e = e.clone();
                e.logical_path = np;
                Some(e)
            })
            .collect();
        let n = moved.len();
        for e in moved {
            self.put(e);
        }
        n
    }

    /// Drop tombstones older than `grace`. Returns how many were purged.
    pub fn purge_tombstones(&mut self, grace: Duration) -> usize {
        let expired: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state == SyncState::Tombstoned && !e.is_dirty())
            .filter(|e| e.tombstoned_at.is_some_and(|t| t.elapsed() >= grace))
            .map(|e| e.id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired.len()
    }

    fn unindex(&mut self, entry: &SyncEntry) {
        for (i, s) in entry.sides.iter().enumerate() {
            if let Some(oid) = &s.oid {
                let k = (Side(i), oid.clone());
                if self.by_oid.get(&k) == Some(&entry.id) {
                    self.by_oid.remove(&k);
                }
            }
        }
        if !entry.placed {
            return;
        }
        let key = self.key(&entry.logical_path);
        if let Some(ids) = self.by_path.get_mut(&key) {
            ids.retain(|id| *id != entry.id);
            if ids.is_empty() {
                self.by_path.remove(&key);
            }
        }
    }

    fn key(&self, path: &str) -> String {
        paths::key(path, self.case_sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(oid: &str, path: &str) -> SideState {
        SideState {
            oid: Some(Oid::from(oid)),
            path: Some(path.to_string()),
            otype: OType::File,
            hash: Some(ContentHash::sha256(path.as_bytes())),
            exists: true,
            ..SideState::default()
        }
    }

    fn entry(path: &str, local: SideState, remote: SideState) -> SyncEntry {
        let mut e = SyncEntry::new(path, OType::File, 2, 0.0);
        e.sides = vec![local, remote];
        e
    }

    #[test]
    fn put_reindexes_oid_and_path() {
        let mut t = SyncTable::new(true);
        let id = t.insert(entry("/a", live("l1", "/a"), SideState::default()));
        assert_eq!(t.find_by_oid(Side::LOCAL, &Oid::from("l1")), Some(id));
        assert_eq!(t.find_by_path("/a"), Some(id));

        let mut e = t.get(id).cloned().unwrap();
        e.logical_path = "/b".into();
        e.sides[0] = live("l2", "/b");
        t.put(e);

        assert_eq!(t.find_by_path("/a"), None);
        assert_eq!(t.find_by_path("/b"), Some(id));
        assert_eq!(t.find_by_oid(Side::LOCAL, &Oid::from("l1")), None);
        assert_eq!(t.find_by_oid(Side::LOCAL, &Oid::from("l2")), Some(id));
    }

    #[test]
    fn tombstone_does_not_steal_live_path() {
        let mut t = SyncTable::new(true);
        let live_id = t.insert(entry("/x", live("a", "/x"), SideState::default()));
        let mut dead = SyncEntry::new("/x", OType::File, 2, 0.0);
        dead.state = SyncState::Tombstoned;
        t.insert(dead);
        assert_eq!(t.find_by_path("/x"), Some(live_id));
    }

    #[test]
    fn rewrite_moves_only_descendants() {
        let mut t = SyncTable::new(true);
        let dir = t.insert(entry("/a", live("d", "/a"), live("rd", "/a")));
        let child = t.insert(entry("/a/f", live("f", "/a/f"), live("rf", "/a/f")));
        let other = t.insert(entry("/ab", live("o", "/ab"), live("ro", "/ab")));

        assert_eq!(t.rewrite_side_paths(Side::REMOTE, "/a", "/b"), 1);
        assert_eq!(t.rewrite_logical_paths("/a", "/b"), 1);

        assert_eq!(t.get(dir).unwrap().logical_path, "/a");
        let c = t.get(child).unwrap();
        assert_eq!(c.logical_path, "/b/f");
        assert_eq!(c.sides[1].path.as_deref(), Some("/b/f"));
        assert_eq!(c.sides[0].path.as_deref(), Some("/a/f"));
        assert_eq!(t.find_by_path("/b/f"), Some(child));
        assert_eq!(t.get(other).unwrap().logical_path, "/ab");
    }

    #[test]
    fn dirty_order_is_parents_first_then_deepest_deletes() {
        let mut t = SyncTable::new(true);
        let mut mk = |path: &str, exists: bool| {
            let mut s = live(path, path);
            s.exists = exists;
            s.changed = Some(1.0);
            t.insert(entry(path, s, SideState::default()))
        };
        let deep_create = mk("/d/e/f", true);
        let shallow_create = mk("/d", true);
        let shallow_delete = mk("/x", false);
        let deep_delete = mk("/x/y", false);
        assert_eq!(
            t.dirty_ids(),
            vec![shallow_create, deep_create, deep_delete, shallow_delete]
        );
    }

    #[test]
    fn purge_respects_grace() {
        let mut t = SyncTable::new(true);
        let mut e = SyncEntry::new("/gone", OType::File, 2, 0.0);
        e.transition(SyncState::Tombstoned, 1.0);
        let id = t.insert(e);
        assert_eq!(t.purge_tombstones(Duration::from_secs(3600)), 0);
        assert_eq!(t.purge_tombstones(Duration::ZERO), 1);
        assert!(t.get(id).is_none());
        assert!(t.find_by_path("/gone").is_none());
    }

    #[test]
    fn matches_requires_identical_payload() {
        let s = live("o", "/p");
        let same = Event::new(OType::File, "o", None, s.hash.clone(), true, 5.0);
        assert!(s.matches(&same, Some("/p")));
        assert!(!s.matches(&same, Some("/q")));
        let z = Some(ContentHash::sha256(b"z"));
        let other_hash = Event::new(OType::File, "o", None, z, true, 5.0);
        assert!(!s.matches(&other_hash, Some("/p")));
        let deleted = Event::new(OType::File, "o", None, None, false, 5.0);
        assert!(!s.matches(&deleted, None));
    }

    #[test]
    fn presence_state_by_sides() {
        let mut e = entry("/f", live("a", "/f"), SideState::default());
        assert_eq!(e.presence_state(), SyncState::Unresolved);
        e.sides[1] = live("b", "/f");
        e.sides[1].exists = false;
        assert_eq!(e.presence_state(), SyncState::LocalOnly);
        e.sides[0].exists = false;
        assert_eq!(e.presence_state(), SyncState::Tombstoned);
    }

    #[test]
    fn unplaced_entry_is_found_by_oid_only_and_never_dirty() {
        let mut t = SyncTable::new(true);
        let mut e = SyncEntry::unplaced(OType::File, 2, 0.0);
        e.sides[0] = live("l1", "/ignored");
        e.sides[0].path = None;
        e.sides[0].changed = Some(1.0);
        let id = t.insert(e);

        assert_eq!(t.find_by_oid(Side::LOCAL, &Oid::from("l1")), Some(id));
        assert_eq!(t.find_by_path(""), None);
        assert!(t.dirty_ids().is_empty());

        let mut e = t.get(id).cloned().unwrap();
        e.place("/found");
        t.put(e);
        assert_eq!(t.find_by_path("/found"), Some(id));
        assert_eq!(t.dirty_ids(), vec![id]);
    }
}
