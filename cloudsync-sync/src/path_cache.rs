//! Per-side bidirectional oid ↔ path cache.
//!
//! Soft state: every entry can be rebuilt from a provider `walk`. All
//! mutation happens under one lock, so a rename is observed either entirely
//! before or entirely after, never as a duplicate or a gap.
//!
//! Lock order: callers hold the side's provider lock (if any) before calling
//! into the cache. The cache never holds its own lock across a provider call.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use cloudsync_core::{paths, CloudError, Event, Oid, Provider};

#[derive(Debug, Default)]
struct Maps {
    /// Path key (case-folded on insensitive sides) → oid.
    by_path: HashMap<String, Oid>,
    /// Oid → path as the provider spells it.
    by_oid: HashMap<Oid, String>,
}

impl Maps {
    fn remove_oid(&mut self, oid: &Oid, case_sensitive: bool) -> Option<String> {
        let path = self.by_oid.remove(oid)?;
        let key = paths::key(&path, case_sensitive);
        if self.by_path.get(&key) == Some(oid) {
            self.by_path.remove(&key);
        }
        Some(path)
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(old) = self.by_path.remove(key) {
            self.by_oid.remove(&old);
        }
    }

    /// Bind without touching descendants.
    fn bind(&mut self, oid: &Oid, path: &str, case_sensitive: bool) {
        self.remove_oid(oid, case_sensitive);
        let key = paths::key(path, case_sensitive);
        self.remove_key(&key);
        self.by_path.insert(key, oid.clone());
        self.by_oid.insert(oid.clone(), path.to_string());
    }
}

#[derive(Debug)]
pub struct PathCache {
    case_sensitive: bool,
    max_depth: usize,
    maps: Mutex<Maps>,
}

impl PathCache {
    pub fn new(case_sensitive: bool, max_depth: usize) -> Self {
        Self {
            case_sensitive,
            max_depth,
            maps: Mutex::new(Maps::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache-only lookup.
    pub fn get_oid(&self, path: &str) -> Option<Oid> {
        let key = paths::key(path, self.case_sensitive);
        self.maps.lock().by_path.get(&key).cloned()
    }

    /// Cache-only lookup.
    pub fn get_path(&self, oid: &Oid) -> Option<String> {
        self.maps.lock().by_oid.get(oid).cloned()
    }

    /// Record that `oid` now lives at `path`.
    ///
    /// If `oid` was cached under another path, every cached descendant of
    /// the old path moves with it. Any other oid previously at `path` (or
    /// at a moved descendant path) is evicted.
    pub fn upsert(&self, oid: &Oid, path: &str) {
        let path = paths::normalize(path);
        let cs = self.case_sensitive;
        let mut maps = self.maps.lock();

        let old = maps.by_oid.get(oid).cloned();
        let Some(old) = old.filter(|old| !paths::paths_match(old, &path, true)) else {
            maps.bind(oid, &path, cs);
            return;
        };

        let moved: Vec<(Oid, String)> = maps
            .by_oid
            .iter()
            .filter(|(o, _)| *o != oid)
            .filter_map(|(o, p)| {
                paths::replace_prefix(p, &old, &path, cs)
                    .filter(|_| !paths::paths_match(p, &old, cs))
                    .map(|np| (o.clone(), np))
            })
            .collect();

        for (o, _) in &moved {
            maps.remove_oid(o, cs);
        }
        maps.bind(oid, &path, cs);
        for (o, np) in moved {
            maps.bind(&o, &np, cs);
        }
        tracing::trace!(oid = %oid, from = %old, to = %path, "cache moved subtree");
    }

    pub fn remove_oid(&self, oid: &Oid) -> Option<String> {
        self.maps.lock().remove_oid(oid, self.case_sensitive)
    }

    pub fn remove_path(&self, path: &str) -> Option<Oid> {
        let key = paths::key(path, self.case_sensitive);
        let mut maps = self.maps.lock();
        let oid = maps.by_path.remove(&key)?;
        maps.by_oid.remove(&oid);
        Some(oid)
    }

    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        maps.by_path.clear();
        maps.by_oid.clear();
    }

    /// Replace the whole cache with the existing objects in `events`.
    pub fn reseed(&self, events: &[Event]) {
        let mut maps = self.maps.lock();
        maps.by_path.clear();
        maps.by_oid.clear();
        for ev in events.iter().filter(|e| e.exists) {
            if let Some(p) = &ev.path {
                maps.bind(&ev.oid, &paths::normalize(p), self.case_sensitive);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Provider-backed resolution
    // -----------------------------------------------------------------------

    /// Oid at `path`, asking the provider on a miss.
    pub fn path_to_oid(
        &self,
        provider: &mut dyn Provider,
        path: &str,
    ) -> Result<Option<Oid>, CloudError> {
        if let Some(oid) = self.get_oid(path) {
            return Ok(Some(oid));
        }
        match provider.info_path(path)? {
            Some(info) => {
                let at = info.path.clone().unwrap_or_else(|| paths::normalize(path));
                self.upsert(&info.oid, &at);
                Ok(Some(info.oid))
            }
            None => Ok(None),
        }
    }

    /// Path of `oid`, ascending the provider's parent chain on a miss.
    ///
    /// Every resolved hop is memoized. Returns `None` when the object is
    /// gone, when the chain cannot be followed, or when it is corrupt
    /// (revisits an oid or exceeds the depth bound).
    pub fn oid_to_path(
        &self,
        provider: &mut dyn Provider,
        oid: &Oid,
    ) -> Result<Option<String>, CloudError> {
        if let Some(p) = self.get_path(oid) {
            return Ok(Some(p));
        }

        let mut pending: Vec<(Oid, String)> = Vec::new();
        let mut seen: HashSet<Oid> = HashSet::new();
        let mut current = oid.clone();
        let mut base: Option<String> = None;

        for _ in 0..=self.max_depth {
            if let Some(p) = self.get_path(&current) {
                base = Some(p);
                break;
            }
            if !seen.insert(current.clone()) {
                tracing::error!(oid = %oid, at = %current, "parent chain revisits an oid");
                return Ok(None);
            }
            let Some(info) = provider.info_oid(&current)? else {
                return Ok(None);
            };
            if let Some(p) = info.path {
                self.upsert(&current, &p);
                base = Some(paths::normalize(&p));
                break;
            }
            match info.parent {
                Some(parent) if parent == current => {
                    self.upsert(&current, "/");
                    base = Some("/".to_string());
                    break;
                }
                Some(parent) => {
                    let Some(name) = info.name else {
                        return Ok(None);
                    };
                    pending.push((current, name));
                    current = parent;
                }
                None => return Ok(None),
            }
        }

        let Some(mut path) = base else {
            tracing::error!(oid = %oid, max_depth = self.max_depth, "parent chain too deep");
            return Ok(None);
        };
        while let Some((hop, name)) = pending.pop() {
            path = paths::join(&path, &name);
            self.upsert(&hop, &path);
        }
        Ok(Some(path))
    }

    /// Whether `oid` lies at or below `top`, by parent-chain ascent.
    ///
    /// `None` means the answer is unknown: the object vanished or the chain
    /// is corrupt.
    pub fn is_suboid(
        &self,
        provider: &mut dyn Provider,
        top: &Oid,
        oid: &Oid,
    ) -> Result<Option<bool>, CloudError> {
        let mut seen: HashSet<Oid> = HashSet::new();
        let mut current = oid.clone();
        for _ in 0..=self.max_depth {
            if &current == top {
                return Ok(Some(true));
            }
            if !seen.insert(current.clone()) {
                return Ok(None);
            }
            let Some(info) = provider.info_oid(&current)? else {
                return Ok(None);
            };
            match info.parent {
                Some(parent) if parent == current => return Ok(Some(false)),
                Some(parent) => current = parent,
                None => return Ok(Some(false)),
            }
        }
        Ok(None)
    }

    /// Rename through the provider, then move the cache entry.
    ///
    /// On failure the cache is left untouched.
    pub fn rename_object(
        &self,
        provider: &mut dyn Provider,
        oid: &Oid,
        new_path: &str,
    ) -> Result<Oid, CloudError> {
        let new_oid = provider.rename(oid, new_path)?;
        if &new_oid != oid {
            let mut maps = self.maps.lock();
            if let Some(p) = maps.remove_oid(oid, self.case_sensitive) {
                maps.bind(&new_oid, &p, self.case_sensitive);
            }
        }
        self.upsert(&new_oid, new_path);
        Ok(new_oid)
    }
}
