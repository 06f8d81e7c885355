//! The sync engine.
//!
//! A [`SyncEngine`] owns one provider per side. Each cycle polls every side
//! concurrently, folds the resulting events into the [`SyncTable`], then
//! reconciles dirty entries one at a time by issuing provider operations.
//!
//! Provider calls never happen under the table lock: an entry is read out as
//! a snapshot, reconciled, and written back whole, whether or not every
//! operation succeeded. A failed entry simply stays dirty for the next cycle.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use cloudsync_core::{
    paths, CloudError, ContentHash, Credentials, Cursor, Event, Metadata, OType, ObjectInfo, Oid,
    Provider, ProviderConfig, ProviderRegistry, Side, SyncConfig,
};

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::event_manager::{EventManager, PollOutcome};
use crate::path_cache::PathCache;
use crate::retry::with_retry;
use crate::state::{EntryId, SideState, SyncEntry, SyncState, SyncTable};

/// Conflict copies tried per losing object before giving up.
const MAX_CONFLICT_ATTEMPTS: u32 = 64;

/// Reconcile passes per cycle. Later passes pick up entries that earlier
/// passes created, such as conflict copies.
const MAX_RECONCILE_PASSES: usize = 4;

// ---------------------------------------------------------------------------
// 1. Public types
// ---------------------------------------------------------------------------

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub events_applied: u64,
    /// Mutating provider operations issued by reconciliation.
    pub operations: u64,
    pub conflicts: u64,
    pub retries: u64,
}

/// How [`SyncEngine::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The caller's predicate returned true.
    Satisfied,
    TimedOut,
}

impl RunOutcome {
    pub fn is_satisfied(self) -> bool {
        self == RunOutcome::Satisfied
    }
}

// ---------------------------------------------------------------------------
// 2. Sides
// ---------------------------------------------------------------------------

struct SideHandle {
    side: Side,
    name: String,
    config: ProviderConfig,
    provider: Mutex<Box<dyn Provider>>,
    cache: PathCache,
    poller: Mutex<EventManager>,
}

impl SideHandle {
    fn poll(&self, budget: Duration) -> Result<PollOutcome, SyncError> {
        let mut provider = self.provider.lock();
        let mut poller = self.poller.lock();
        poller.poll(&mut **provider, &self.cache, budget)
    }

    /// Logical path → this side's provider path.
    fn to_side_path(&self, logical: &str) -> String {
        paths::join(&self.config.sync_root, logical)
    }

    /// Provider path → logical path, if inside the sync root.
    fn to_logical(&self, side_path: &str) -> Option<String> {
        paths::is_subpath(&self.config.sync_root, side_path, self.config.case_sensitive)
    }
}

/// A provider call that failed after retries, attributed to its side.
#[derive(Debug)]
struct OpFailure {
    side: Side,
    error: CloudError,
}

type OpResult<T> = Result<T, OpFailure>;

/// Whether an entry's propagation finished or needs another look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Again,
}

// ---------------------------------------------------------------------------
// 3. Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    config: EngineConfig,
    sides: Vec<SideHandle>,
    table: Mutex<SyncTable>,
    stats: Mutex<RunStats>,
    /// Set when cursors are restored into an empty table: the next cycle
    /// walks every side to rebuild the table before trusting the feeds.
    needs_baseline: AtomicBool,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("sides", &self.sides.iter().map(|h| h.name.as_str()).collect::<Vec<_>>())
            .field("entries", &self.table.lock().len())
            .finish()
    }
}

impl SyncEngine {
    /// One side per provider, in order: side 0 is local.
    pub fn new(config: EngineConfig, providers: Vec<Box<dyn Provider>>) -> Self {
        let case_sensitive = providers.iter().all(|p| p.config().case_sensitive);
        let sides = providers
            .into_iter()
            .enumerate()
            .map(|(i, provider)| {
                let side = Side(i);
                let pc = provider.config().clone();
                SideHandle {
                    side,
                    name: provider.name().to_string(),
                    cache: PathCache::new(pc.case_sensitive, config.max_parent_depth),
                    poller: Mutex::new(EventManager::new(
                        side,
                        &pc,
                        config.poll_interval,
                        config.retry.clone(),
                    )),
                    config: pc,
                    provider: Mutex::new(provider),
                }
            })
            .collect();
        Self {
            table: Mutex::new(SyncTable::new(case_sensitive)),
            stats: Mutex::new(RunStats::default()),
            needs_baseline: AtomicBool::new(false),
            config,
            sides,
        }
    }

    /// Build an engine from a stored configuration.
    pub fn from_config(
        config: &SyncConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self, SyncError> {
        let providers = config.build_providers(registry)?;
        Ok(Self::new(EngineConfig::from(&config.engine), providers))
    }

    pub fn with_credentials(self, side: Side, credentials: Credentials) -> Result<Self, SyncError> {
        self.set_credentials(side, credentials)?;
        Ok(self)
    }

    /// Replace a side's credentials. Lifts an auth stop on that side.
    pub fn set_credentials(&self, side: Side, credentials: Credentials) -> Result<(), SyncError> {
        self.handle(side)?.poller.lock().set_credentials(credentials);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sides(&self) -> Vec<Side> {
        self.sides.iter().map(|h| h.side).collect()
    }

    pub fn stats(&self) -> RunStats {
        self.stats.lock().clone()
    }

    fn handle(&self, side: Side) -> Result<&SideHandle, SyncError> {
        self.sides.get(side.index()).ok_or(SyncError::UnknownSide(side))
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Cycle until `until` returns true or `timeout` elapses.
    ///
    /// At least one cycle always runs. Stops early with
    /// [`SyncError::AuthFailed`] when a side's credentials are rejected.
    pub fn run<F>(&self, timeout: Duration, mut until: F) -> Result<RunOutcome, SyncError>
    where
        F: FnMut(&SyncEngine) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.cycle(deadline.saturating_duration_since(Instant::now()))?;
            if until(self) {
                return Ok(RunOutcome::Satisfied);
            }
            if Instant::now() >= deadline {
                debug!(?timeout, "run timed out");
                return Ok(RunOutcome::TimedOut);
            }
        }
    }

    /// Poll every side once, apply what they reported, reconcile.
    pub fn cycle(&self, budget: Duration) -> Result<(), SyncError> {
        let budget = budget.min(self.config.poll_budget);
        let baseline = if self.needs_baseline.load(Ordering::SeqCst) {
            match self.walk_all() {
                Ok(walks) => Some(walks),
                Err(failure) => {
                    self.stats.lock().cycles += 1;
                    return self.absorb_failure(failure);
                }
            }
        } else {
            None
        };

        let outcomes: Vec<Result<PollOutcome, SyncError>> = std::thread::scope(|scope| {
            let threads: Vec<_> = self
                .sides
                .iter()
                .map(|h| scope.spawn(move || h.poll(budget)))
                .collect();
            threads
                .into_iter()
                .zip(&self.sides)
                .map(|(t, h)| {
                    t.join().unwrap_or_else(|_| {
                        Err(SyncError::ContractViolation(format!("poller for {} panicked", h.side)))
                    })
                })
                .collect()
        });

        if let Some(walks) = baseline {
            let fed: HashSet<(Side, Oid)> = outcomes
                .iter()
                .zip(&self.sides)
                .filter_map(|(o, h)| Some((h.side, o.as_ref().ok()?)))
                .flat_map(|(side, o)| o.events.iter().map(move |e| (side, e.oid.clone())))
                .collect();
            self.seed_baseline(walks, &fed);
            self.needs_baseline.store(false, Ordering::SeqCst);
        }

        let mut first_err = None;
        for (handle, outcome) in self.sides.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => self.absorb_outcome(handle.side, outcome),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        self.place_unplaced()?;
        self.reconcile_dirty()?;

        let purged = self.table.lock().purge_tombstones(self.config.tombstone_grace);
        if purged > 0 {
            debug!(purged, "purged tombstones");
        }
        self.stats.lock().cycles += 1;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn absorb_outcome(&self, side: Side, outcome: PollOutcome) {
        if let Some(walk) = outcome.walk {
            let seen: HashSet<Oid> = walk.iter().map(|e| e.oid.clone()).collect();
            for event in walk {
                self.apply_logged(side, event);
            }
            let vanished: Vec<(Oid, OType)> = self
                .table
                .lock()
                .entries()
                .filter_map(|e| {
                    let s = e.side(side)?;
                    let oid = s.oid.as_ref()?;
                    (s.exists && !seen.contains(oid)).then(|| (oid.clone(), s.otype))
                })
                .collect();
            let now = now_ts();
            for (oid, otype) in vanished {
                debug!(side = %side, oid = %oid, "object missing from walk");
                self.apply_logged(side, Event::new(otype, oid, None, None, false, now));
            }
        }
        for event in outcome.events {
            self.apply_logged(side, event);
        }
    }

    /// Walk every side, keeping objects inside the sync root, keyed by
    /// logical path.
    fn walk_all(&self) -> OpResult<Vec<Vec<(String, Event)>>> {
        let mut walks = Vec::with_capacity(self.sides.len());
        for handle in &self.sides {
            let walked = self.op(handle.side, "walk", |p, _| p.walk(None))?;
            let kept: Vec<(String, Event)> = walked
                .into_iter()
                .filter_map(|e| {
                    let side_path = e.path.clone()?;
                    let logical = handle.to_logical(&side_path)?;
                    if paths::is_root(&logical) {
                        return None;
                    }
                    handle.cache.upsert(&e.oid, &side_path);
                    Some((logical, e))
                })
                .collect();
            info!(side = %handle.side, objects = kept.len(), "walked side for baseline");
            walks.push(kept);
        }
        Ok(walks)
    }

    /// Rebuild the table from fresh walks after a restart.
    ///
    /// Objects that agree on every side are in sync. Otherwise the sides
    /// whose feed mentioned the object this cycle are the changed ones; when
    /// no feed did, every live side counts as changed.
    fn seed_baseline(&self, walks: Vec<Vec<(String, Event)>>, fed: &HashSet<(Side, Oid)>) {
        let now = now_ts();
        let mut seeded: Vec<EntryId> = Vec::new();
        {
            let mut table = self.table.lock();
            for (idx, walk) in walks.into_iter().enumerate() {
                for (logical, event) in walk {
                    let existing = table
                        .find_by_path(&logical)
                        .and_then(|id| table.get(id).cloned());
                    let mut entry = match existing {
                        Some(e) => e,
                        None => {
                            let otype = event.resolved_type();
                            let fresh = SyncEntry::new(&*logical, otype, self.sides.len(), now);
                            let id = table.insert(fresh.clone());
                            seeded.push(id);
                            SyncEntry { id, ..fresh }
                        }
                    };
                    entry.sides[idx] = SideState {
                        otype: event.resolved_type(),
                        oid: Some(event.oid),
                        path: Some(logical),
                        hash: event.hash,
                        exists: true,
                        timestamp: event.timestamp,
                        ..SideState::default()
                    };
                    table.put(entry);
                }
            }
        }

        for id in seeded {
            let Some(mut entry) = self.table.lock().get(id).cloned() else {
                continue;
            };
            let live: Vec<usize> = (0..entry.sides.len())
                .filter(|&i| entry.sides[i].is_live())
                .collect();
            let Some(&first) = live.first() else {
                continue;
            };
            let agree = live.len() == entry.sides.len()
                && live[1..].iter().all(|&i| {
                    match (entry.sides[first].otype, entry.sides[i].otype) {
                        (OType::Directory, OType::Directory) => true,
                        (OType::Directory, _) | (_, OType::Directory) => false,
                        _ => self.same_content(&entry, first, i).unwrap_or(false),
                    }
                });
            if agree {
                for s in &mut entry.sides {
                    s.sync_hash = s.hash.clone();
                }
                entry.transition(SyncState::InSync, now);
            } else {
                let mentioned: Vec<usize> = live
                    .iter()
                    .copied()
                    .filter(|&i| {
                        let oid = entry.sides[i].oid.clone();
                        oid.is_some_and(|o| fed.contains(&(Side(i), o)))
                    })
                    .collect();
                let changed = if mentioned.is_empty() { live } else { mentioned };
                for i in changed {
                    entry.sides[i].changed = Some(entry.sides[i].timestamp);
                }
            }
            self.table.lock().put(entry);
        }
        debug!(entries = self.table.lock().len(), "baseline seeded");
    }

    /// Try to resolve a path for every entry known only by oid.
    fn place_unplaced(&self) -> Result<(), SyncError> {
        let pending: Vec<(EntryId, Vec<(usize, Oid)>)> = self
            .table
            .lock()
            .entries()
            .filter(|e| !e.placed)
            .map(|e| {
                let oids = e
                    .sides
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_live())
                    .filter_map(|(i, s)| Some((i, s.oid.clone()?)))
                    .collect();
                (e.id, oids)
            })
            .collect();

        for (id, oids) in pending {
            for (idx, oid) in oids {
                let handle = &self.sides[idx];
                let lookup = self.op(handle.side, "oid_to_path", |p, c| c.oid_to_path(p, &oid));
                let resolved = match lookup {
                    Ok(resolved) => resolved,
                    Err(failure) => {
                        self.absorb_failure(failure)?;
                        continue;
                    }
                };
                let Some(side_path) = resolved else {
                    continue;
                };
                let mut table = self.table.lock();
                let Some(mut entry) = table.get(id).cloned() else {
                    break;
                };
                match handle.to_logical(&side_path) {
                    Some(l) if !paths::is_root(&l) => {
                        debug!(side = %handle.side, entry = %id, path = %l, "entry placed");
                        entry.sides[idx].path = Some(l.clone());
                        entry.place(l);
                        table.put(entry);
                    }
                    _ => {
                        debug!(
                            side = %handle.side,
                            entry = %id,
                            path = %side_path,
                            "oid-only entry is outside the sync root"
                        );
                        table.remove(id);
                    }
                }
                break;
            }
        }
        Ok(())
    }

    fn apply_logged(&self, side: Side, event: Event) {
        let oid = event.oid.clone();
        if let Err(e) = self.apply_event(side, event) {
            error!(side = %side, oid = %oid, error = %e, "event rejected");
        }
    }

    // -----------------------------------------------------------------------
    // Event application
    // -----------------------------------------------------------------------

    /// Fold one normalised event into the table.
    ///
    /// Returns false when the event changed nothing: a replay, an echo of the
    /// engine's own operation, the sync root itself, or a deletion of
    /// something never tracked.
    pub fn apply_event(&self, side: Side, event: Event) -> Result<bool, SyncError> {
        let handle = self.handle(side)?;
        event.validate().map_err(SyncError::ContractViolation)?;

        let logical = match event.path.as_deref() {
            None => None,
            Some(p) => match handle.to_logical(p) {
                Some(l) if paths::is_root(&l) => return Ok(false),
                Some(l) => Some(l),
                None => {
                    trace!(side = %side, path = %p, "event outside sync root");
                    return Ok(false);
                }
            },
        };

        let now = now_ts();
        let mut table = self.table.lock();
        // A deletion only ever applies to the oid it names.
        let found = table.find_by_oid(side, &event.oid).or_else(|| {
            if event.exists {
                table.find_by_path(logical.as_deref()?)
            } else {
                None
            }
        });

        let mut entry = match found.and_then(|id| table.get(id).cloned()) {
            Some(entry) => entry,
            None if !event.exists => {
                trace!(side = %side, oid = %event.oid, "deletion of untracked object");
                return Ok(false);
            }
            None => {
                let otype = event.resolved_type();
                let fresh = match logical.clone() {
                    Some(path) => SyncEntry::new(path, otype, self.sides.len(), now),
                    None => {
                        debug!(side = %side, oid = %event.oid, "tracked by oid until placed");
                        SyncEntry::unplaced(otype, self.sides.len(), now)
                    }
                };
                let id = table.insert(fresh.clone());
                SyncEntry { id, ..fresh }
            }
        };
        if !entry.placed {
            if let Some(l) = &logical {
                debug!(side = %side, entry = %entry.id, path = %l, "oid-only entry placed");
                entry.place(l.clone());
            }
        }

        let idx = side.index();
        if entry.sides[idx].matches(&event, logical.as_deref()) {
            trace!(side = %side, oid = %event.oid, "event already applied");
            return Ok(false);
        }

        let was_live = entry.sides[idx].is_live();
        let old_path = entry.sides[idx].path.clone();
        {
            let s = &mut entry.sides[idx];
            s.oid = Some(event.oid.clone());
            s.exists = event.exists;
            s.timestamp = event.timestamp;
            s.changed = Some(event.timestamp);
            if event.exists {
                let otype = event.resolved_type();
                if otype != OType::Unknown {
                    s.otype = otype;
                }
                if event.hash.is_some() || s.otype == OType::Directory {
                    s.hash = event.hash.clone();
                }
                if let Some(l) = &logical {
                    s.path = Some(l.clone());
                }
            }
        }

        if event.exists {
            let side_type = entry.sides[idx].otype;
            let others_live = entry
                .sides
                .iter()
                .enumerate()
                .any(|(i, s)| i != idx && s.is_live());
            if side_type != OType::Unknown && (!others_live || entry.otype == OType::Unknown) {
                entry.otype = side_type;
            }
            if entry.state == SyncState::Tombstoned {
                entry.transition(SyncState::Unresolved, now);
            }

            let cs = table.case_sensitive();
            match (was_live, old_path, logical) {
                (true, Some(old), Some(new)) if old != new => {
                    if side_type == OType::Directory {
                        let moved = table.rewrite_side_paths(side, &old, &new);
                        if paths::paths_match(&entry.logical_path, &old, cs) {
                            table.rewrite_logical_paths(&old, &new);
                        }
                        debug!(side = %side, children = moved, "directory move carried children");
                    }
                    if paths::paths_match(&entry.logical_path, &old, cs) {
                        entry.logical_path = new.clone();
                    }
                    info!(side = %side, from = %old, to = %new, "rename observed");
                }
                (false, _, Some(new)) if !others_live => entry.logical_path = new,
                _ => {}
            }
        }

        if entry.presence_state() == SyncState::Unresolved {
            entry.transition(SyncState::Unresolved, now);
        }
        debug!(
            side = %side,
            entry = %entry.id,
            path = %entry.logical_path,
            exists = event.exists,
            "event applied"
        );
        table.put(entry);
        drop(table);
        self.stats.lock().events_applied += 1;
        Ok(true)
    }

    /// Tell the engine a local path changed without waiting for the feed.
    ///
    /// The local provider is asked for the object's current state; if it is
    /// gone, the last known oid at `path` is marked deleted.
    pub fn inject_local_event(&self, path: &str, exists: bool) -> Result<bool, SyncError> {
        let handle = self.handle(Side::LOCAL)?;
        let side_path = handle.to_side_path(path);
        let now = now_ts();

        let info = if exists {
            handle.provider.lock().info_path(&side_path)?
        } else {
            None
        };
        let event = match info {
            Some(info) => {
                handle.cache.upsert(&info.oid, &side_path);
                let mut ev = Event::from_info(&info, now);
                ev.path.get_or_insert(side_path);
                ev
            }
            None => {
                let known = handle.cache.remove_path(&side_path).or_else(|| {
                    let table = self.table.lock();
                    table.entry_at(&paths::normalize(path))?.sides[0].oid.clone()
                });
                let Some(oid) = known else {
                    debug!(path = %path, "injected deletion of unknown path");
                    return Ok(false);
                };
                handle.cache.remove_oid(&oid);
                Event::new(OType::Unknown, oid, Some(side_path), None, false, now)
            }
        };
        self.apply_event(Side::LOCAL, event)
    }

    /// Current local state of a logical path.
    pub fn lookup(&self, path: &str) -> Result<Option<ObjectInfo>, SyncError> {
        self.lookup_on(Side::LOCAL, path)
    }

    pub fn lookup_on(&self, side: Side, path: &str) -> Result<Option<ObjectInfo>, SyncError> {
        let handle = self.handle(side)?;
        let side_path = handle.to_side_path(path);
        let info = handle.provider.lock().info_path(&side_path)?;
        Ok(info)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn entry(&self, path: &str) -> Option<SyncEntry> {
        self.table.lock().entry_at(&paths::normalize(path)).cloned()
    }

    pub fn entry_state(&self, path: &str) -> Option<SyncState> {
        self.entry(path).map(|e| e.state)
    }

    pub fn entries(&self) -> Vec<SyncEntry> {
        self.table.lock().entries().cloned().collect()
    }

    /// No placed entry has pending work.
    pub fn is_settled(&self) -> bool {
        self.table.lock().entries().filter(|e| e.placed).all(|e| {
            !e.is_dirty() && matches!(e.state, SyncState::InSync | SyncState::Tombstoned)
        })
    }

    pub fn path_cache(&self, side: Side) -> Result<&PathCache, SyncError> {
        Ok(&self.handle(side)?.cache)
    }

    pub fn cursors(&self) -> Vec<(Side, Option<Cursor>)> {
        self.sides
            .iter()
            .map(|h| (h.side, h.poller.lock().cursor().cloned()))
            .collect()
    }

    /// Resume `side`'s feed at `cursor`. Into an empty table this also
    /// schedules a baseline walk of every side for the next cycle.
    pub fn restore_cursor(&self, side: Side, cursor: Cursor) -> Result<(), SyncError> {
        info!(side = %side, cursor = %cursor, "cursor restored");
        self.handle(side)?.poller.lock().restore_cursor(cursor);
        if self.table.lock().is_empty() {
            self.needs_baseline.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drop a side's cursor so its next poll walks it.
    pub fn reseed(&self, side: Side) -> Result<(), SyncError> {
        self.handle(side)?.poller.lock().reset_cursor();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    fn reconcile_dirty(&self) -> Result<(), SyncError> {
        let mut failed: HashSet<EntryId> = HashSet::new();
        for _ in 0..MAX_RECONCILE_PASSES {
            let ids: Vec<EntryId> = self
                .table
                .lock()
                .dirty_ids()
                .into_iter()
                .filter(|id| !failed.contains(id))
                .collect();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Err(failure) = self.reconcile(id) {
                    failed.insert(id);
                    self.absorb_failure(failure)?;
                }
            }
        }
        Ok(())
    }

    fn absorb_failure(&self, failure: OpFailure) -> Result<(), SyncError> {
        let side = failure.side;
        let handle = self.handle(side)?;
        match failure.error {
            CloudError::Token(reason) => {
                error!(side = %side, reason = %reason, "credentials rejected during sync");
                handle.poller.lock().stop(reason.clone());
                Err(SyncError::AuthFailed { side, reason })
            }
            CloudError::Disconnected(reason) => {
                warn!(side = %side, reason = %reason, "side unreachable, entry stays pending");
                handle.poller.lock().note_disconnect();
                Ok(())
            }
            other => {
                warn!(side = %side, error = %other, "operation failed, entry stays pending");
                Ok(())
            }
        }
    }

    fn reconcile(&self, id: EntryId) -> OpResult<()> {
        let Some(mut entry) = self.table.lock().get(id).cloned() else {
            return Ok(());
        };
        let result = self.reconcile_entry(&mut entry);
        self.table.lock().put(entry);
        result
    }

    fn reconcile_entry(&self, entry: &mut SyncEntry) -> OpResult<()> {
        for _ in 0..3 {
            let changed = entry.changed_sides();
            if changed.is_empty() {
                return Ok(());
            }
            let src = match changed.as_slice() {
                [only] => *only,
                _ => self.resolve_conflict(entry, &changed)?,
            };
            let presence = entry.presence_state();
            if matches!(presence, SyncState::LocalOnly | SyncState::RemoteOnly)
                && entry.state != SyncState::Conflict
            {
                entry.transition(presence, now_ts());
            }
            if self.propagate(entry, src)? == Step::Done {
                self.mark_synced(entry);
                return Ok(());
            }
        }
        Ok(())
    }

    fn mark_synced(&self, entry: &mut SyncEntry) {
        for s in &mut entry.sides {
            s.changed = None;
            s.sync_hash = if s.exists { s.hash.clone() } else { None };
        }
        let state = if entry.exists_anywhere() {
            SyncState::InSync
        } else {
            SyncState::Tombstoned
        };
        entry.transition(state, now_ts());
    }

    /// Carry side `src`'s state to every other side.
    fn propagate(&self, entry: &mut SyncEntry, src: usize) -> OpResult<Step> {
        let s = entry.sides[src].clone();
        if s.exists {
            if s.otype != OType::Unknown {
                entry.otype = s.otype;
            }
            if let Some(p) = s.path {
                entry.logical_path = p;
            }
        }
        for dst in (0..entry.sides.len()).filter(|&d| d != src) {
            let step = if s.exists {
                self.push_object(entry, src, dst)?
            } else {
                self.push_delete(entry, src, dst)?
            };
            if step == Step::Again {
                return Ok(Step::Again);
            }
        }
        Ok(Step::Done)
    }

    fn push_object(&self, entry: &mut SyncEntry, src: usize, dst: usize) -> OpResult<Step> {
        let s = entry.sides[src].clone();
        let Some(src_oid) = s.oid.clone() else {
            return Ok(Step::Done);
        };
        let logical = s.path.clone().unwrap_or_else(|| entry.logical_path.clone());
        let dside = Side(dst);
        let handle = &self.sides[dst];
        let target = handle.to_side_path(&logical);
        let d = entry.sides[dst].clone();

        if !d.is_live() {
            self.ensure_parents(dst, &logical)?;
            if s.otype == OType::Directory {
                let oid = self.op(dside, "mkdir", |p, c| {
                    let oid = p.mkdir(&target)?;
                    c.upsert(&oid, &target);
                    Ok(oid)
                })?;
                self.count_op();
                info!(side = %dside, path = %target, "created directory");
                entry.sides[dst] = SideState {
                    oid: Some(oid),
                    path: Some(logical),
                    otype: OType::Directory,
                    exists: true,
                    timestamp: now_ts(),
                    ..SideState::default()
                };
                return Ok(Step::Done);
            }

            let data = self.fetch(Side(src), &src_oid)?;
            let created = self.op(dside, "create", |p, c| {
                let info = p.create(&target, &mut data.as_slice(), &Metadata::new())?;
                c.upsert(&info.oid, &target);
                Ok(info)
            });
            return match created {
                Ok(info) => {
                    self.count_op();
                    info!(side = %dside, path = %target, bytes = data.len(), "created file");
                    entry.sides[dst] = SideState {
                        oid: Some(info.oid),
                        path: Some(logical),
                        otype: OType::File,
                        hash: info.hash,
                        exists: true,
                        timestamp: now_ts(),
                        ..SideState::default()
                    };
                    Ok(Step::Done)
                }
                Err(OpFailure {
                    error: CloudError::FileExists(_),
                    ..
                }) => self.adopt(entry, dst, &target, logical),
                Err(e) => Err(e),
            };
        }

        if s.otype != OType::Unknown && d.otype != OType::Unknown && s.otype != d.otype {
            warn!(side = %dside, path = %target, "object type differs across sides");
            entry.sides[dst].changed = Some(d.changed.unwrap_or(0.0));
            return Ok(Step::Again);
        }

        if d.path.as_deref() != Some(logical.as_str()) && !self.move_object(entry, dst, &logical)? {
            entry.sides[dst].exists = false;
            return self.push_object(entry, src, dst);
        }

        let stale = s.sync_hash.is_none() || s.hash != s.sync_hash || d.hash != d.sync_hash;
        if s.otype == OType::File && stale {
            let data = self.fetch(Side(src), &src_oid)?;
            let want = self.hash_on(dst, &data)?;
            if entry.sides[dst].hash.as_ref() != Some(&want) {
                let Some(oid) = entry.sides[dst].oid.clone() else {
                    return Ok(Step::Done);
                };
                let info = self.op(dside, "upload", |p, _| p.upload(&oid, &mut data.as_slice()))?;
                self.count_op();
                info!(side = %dside, path = %target, bytes = data.len(), "uploaded content");
                entry.sides[dst].hash = info.hash;
                entry.sides[dst].oid = Some(info.oid);
            }
        }
        Ok(Step::Done)
    }

    /// A create hit an object nobody reported. Take it on as a concurrent
    /// change so conflict resolution decides between the two.
    fn adopt(
        &self,
        entry: &mut SyncEntry,
        dst: usize,
        target: &str,
        logical: String,
    ) -> OpResult<Step> {
        let dside = Side(dst);
        let Some(info) = self.op(dside, "info_path", |p, _| p.info_path(target))? else {
            return Err(OpFailure {
                side: dside,
                error: CloudError::FileExists(target.to_string()),
            });
        };
        self.sides[dst].cache.upsert(&info.oid, target);
        warn!(
            side = %dside,
            path = %target,
            "create target already exists, treating as concurrent change"
        );
        entry.sides[dst] = SideState {
            otype: info.resolved_type(),
            oid: Some(info.oid),
            path: Some(logical),
            hash: info.hash,
            exists: true,
            changed: Some(0.0),
            ..SideState::default()
        };
        Ok(Step::Again)
    }

    /// Rename `dst`'s object to `logical`. Returns false when the object has
    /// vanished on that side.
    fn move_object(&self, entry: &mut SyncEntry, dst: usize, logical: &str) -> OpResult<bool> {
        let dside = Side(dst);
        let handle = &self.sides[dst];
        let Some(oid) = entry.sides[dst].oid.clone() else {
            return Ok(false);
        };
        let old = entry.sides[dst].path.clone();
        let target = handle.to_side_path(logical);
        self.ensure_parents(dst, logical)?;

        if !handle.config.allow_renames_over_existing {
            let occupant = self.op(dside, "info_path", |p, _| p.info_path(&target))?;
            if let Some(occupant) = occupant.filter(|o| o.oid != oid) {
                self.op(dside, "delete", |p, c| {
                    p.delete(&occupant.oid)?;
                    c.remove_oid(&occupant.oid);
                    Ok(())
                })?;
                self.count_op();
                info!(side = %dside, path = %target, "cleared rename target");
            }
        }

        match self.op(dside, "rename", |p, c| c.rename_object(p, &oid, &target)) {
            Ok(new_oid) => {
                self.count_op();
                info!(side = %dside, from = ?old, to = %target, "renamed");
                entry.sides[dst].oid = Some(new_oid);
                entry.sides[dst].path = Some(logical.to_string());
                if let (OType::Directory, Some(old)) = (entry.sides[dst].otype, old) {
                    self.table.lock().rewrite_side_paths(dside, &old, logical);
                }
                Ok(true)
            }
            Err(OpFailure {
                side,
                error: CloudError::FileNotFound(msg),
            }) => {
                if self.op(dside, "exists_oid", |p, _| p.exists_oid(&oid))? {
                    Err(OpFailure {
                        side,
                        error: CloudError::FileNotFound(msg),
                    })
                } else {
                    debug!(side = %dside, oid = %oid, "rename source vanished");
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn push_delete(&self, entry: &mut SyncEntry, src: usize, dst: usize) -> OpResult<Step> {
        let dside = Side(dst);
        let d = &entry.sides[dst];
        let Some(oid) = d.oid.clone().filter(|_| d.exists) else {
            return Ok(Step::Done);
        };
        let target = self.sides[dst].to_side_path(&entry.logical_path);
        match self.op(dside, "delete", |p, c| {
            p.delete(&oid)?;
            c.remove_oid(&oid);
            Ok(())
        }) {
            Ok(()) => {
                self.count_op();
                info!(side = %dside, path = %target, "deleted");
            }
            Err(OpFailure {
                error: CloudError::FileNotFound(_),
                ..
            }) => {}
            Err(OpFailure {
                error: CloudError::FileExists(_),
                ..
            }) if entry.sides[dst].otype == OType::Directory => {
                warn!(
                    side = %dside,
                    path = %target,
                    "directory not empty, restoring it on the deleting side"
                );
                entry.sides[src] = SideState::default();
                entry.sides[dst].changed = Some(now_ts());
                return Ok(Step::Again);
            }
            Err(e) => return Err(e),
        }
        entry.sides[dst].exists = false;
        entry.sides[dst].hash = None;
        Ok(Step::Done)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    /// Pick the side whose state wins among concurrent changes, preserving
    /// every divergent loser under a conflict name first.
    fn resolve_conflict(&self, entry: &mut SyncEntry, changed: &[usize]) -> OpResult<usize> {
        let live: Vec<usize> = changed
            .iter()
            .copied()
            .filter(|&i| entry.sides[i].is_live())
            .collect();
        match live.as_slice() {
            [] => return Ok(changed[0]),
            [only] => {
                debug!(entry = %entry.id, winner = *only, "modification beats deletion");
                return Ok(*only);
            }
            _ => {}
        }

        let stamp = |i: usize| entry.sides[i].changed.unwrap_or(entry.sides[i].timestamp);
        let mut winner = live
            .iter()
            .copied()
            .max_by(|&a, &b| stamp(a).total_cmp(&stamp(b)).then(b.cmp(&a)))
            .unwrap_or(live[0]);
        if entry.sides[winner].otype != OType::Directory {
            if let Some(dir) = live
                .iter()
                .copied()
                .find(|&i| entry.sides[i].otype == OType::Directory)
            {
                winner = dir;
            }
        }

        for loser in live.into_iter().filter(|&i| i != winner) {
            let same = match (entry.sides[winner].otype, entry.sides[loser].otype) {
                (OType::Directory, OType::Directory) => true,
                (OType::Directory, _) | (_, OType::Directory) => false,
                _ => self.same_content(entry, winner, loser)?,
            };
            if same {
                debug!(entry = %entry.id, path = %entry.logical_path, "concurrent changes agree");
                continue;
            }
            entry.transition(SyncState::Conflict, now_ts());
            self.preserve_loser(entry, loser)?;
        }
        Ok(winner)
    }

    fn same_content(&self, entry: &SyncEntry, a: usize, b: usize) -> OpResult<bool> {
        let (sa, sb) = (&entry.sides[a], &entry.sides[b]);
        if sa.hash.is_some() && self.sides[a].name == self.sides[b].name {
            return Ok(sa.hash == sb.hash);
        }
        let Some(oid) = sa.oid.clone() else {
            return Ok(false);
        };
        let data = self.fetch(Side(a), &oid)?;
        let theirs = self.hash_on(b, &data)?;
        Ok(sb.hash.as_ref() == Some(&theirs))
    }

    /// Move the loser aside on its own side and track it as a new entry.
    fn preserve_loser(&self, entry: &mut SyncEntry, loser: usize) -> OpResult<()> {
        let lside = Side(loser);
        let l = entry.sides[loser].clone();
        let Some(oid) = l.oid.clone() else {
            return Ok(());
        };
        let base = l.path.clone().unwrap_or_else(|| entry.logical_path.clone());
        let handle = &self.sides[loser];

        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let candidate = paths::conflict_path(&base, attempt);
            if self.table.lock().find_by_path(&candidate).is_some() {
                continue;
            }
            let target = handle.to_side_path(&candidate);
            if self.op(lside, "exists_path", |p, _| p.exists_path(&target))? {
                continue;
            }
            let new_oid = self.op(lside, "rename", |p, c| c.rename_object(p, &oid, &target))?;
            self.count_op();
            self.stats.lock().conflicts += 1;
            warn!(
                side = %lside,
                path = %base,
                preserved_as = %candidate,
                "conflict, losing copy preserved"
            );

            let now = now_ts();
            let changed = Some(l.changed.unwrap_or(l.timestamp));
            let mut copy = SyncEntry::new(candidate.clone(), l.otype, self.sides.len(), now);
            copy.sides[loser] = SideState {
                oid: Some(new_oid),
                path: Some(candidate),
                sync_hash: None,
                changed,
                ..l
            };
            self.table.lock().insert(copy);
            entry.sides[loser] = SideState::default();
            return Ok(());
        }
        Err(OpFailure {
            side: lside,
            error: CloudError::FileExists(format!("no free conflict name for {base}")),
        })
    }

    // -----------------------------------------------------------------------
    // Provider plumbing
    // -----------------------------------------------------------------------

    /// Create missing ancestors of `logical` on sides that will not do it
    /// themselves.
    fn ensure_parents(&self, dst: usize, logical: &str) -> OpResult<()> {
        let handle = &self.sides[dst];
        if !handle.config.require_parent_folder {
            return Ok(());
        }
        let dside = Side(dst);
        for ancestor in paths::ancestors(logical) {
            let target = handle.to_side_path(&ancestor);
            if self.op(dside, "info_path", |p, c| c.path_to_oid(p, &target))?.is_some() {
                continue;
            }
            self.op(dside, "mkdir", |p, c| {
                let oid = p.mkdir(&target)?;
                c.upsert(&oid, &target);
                Ok(oid)
            })?;
            self.count_op();
            info!(side = %dside, path = %target, "created missing parent");
        }
        Ok(())
    }

    fn fetch(&self, side: Side, oid: &Oid) -> OpResult<Vec<u8>> {
        self.op(side, "download", |p, _| {
            let mut buf = Vec::new();
            p.download(oid, &mut buf)?;
            Ok(buf)
        })
    }

    fn hash_on(&self, side: usize, data: &[u8]) -> OpResult<ContentHash> {
        self.sides[side]
            .provider
            .lock()
            .hash_data(&mut &data[..])
            .map_err(|error| OpFailure {
                side: Side(side),
                error,
            })
    }

    /// Run one provider call on `side` under the call-site retry policy.
    fn op<T>(
        &self,
        side: Side,
        name: &str,
        mut call: impl FnMut(&mut dyn Provider, &PathCache) -> Result<T, CloudError>,
    ) -> OpResult<T> {
        let handle = &self.sides[side.index()];
        with_retry(
            &self.config.retry,
            name,
            |_, _| self.stats.lock().retries += 1,
            || {
                let mut provider = handle.provider.lock();
                call(&mut **provider, &handle.cache)
            },
        )
        .map_err(|error| OpFailure { side, error })
    }

    fn count_op(&self) {
        self.stats.lock().operations += 1;
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
