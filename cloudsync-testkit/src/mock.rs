//! In-memory [`Provider`] for tests.
//!
//! A [`MockProvider`] is a cheap handle onto shared state: clone it, hand one
//! clone to the engine and keep the other to drive changes and inspect the
//! result. Objects carry generated oids (`mock-N`); the change feed reports
//! oids only, so consumers must resolve paths themselves, as with most real
//! backends.
//!
//! Test-side helpers (`write`, `remove`, `move_to`, ...) bypass fault
//! injection and call counters but still emit feed events. Only calls made
//! through the [`Provider`] trait count as calls and mutations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cloudsync_core::{
    paths, CloudError, ContentHash, Credentials, Cursor, Event, EventBatch, Metadata, OType,
    ObjectInfo, Oid, Provider, ProviderConfig,
};

const ROOT_OID: &str = "mock-root";

/// Clock start, in seconds since the epoch.
pub const START_TIME: f64 = 1_700_000_000.0;

/// Each recorded change advances the clock by this much.
const TICK: f64 = 0.001;

/// Provider calls that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    CurrentCursor,
    Events,
    Walk,
    Upload,
    Create,
    Download,
    Rename,
    Mkdir,
    Delete,
    InfoPath,
    InfoOid,
    Listdir,
}

// ---------------------------------------------------------------------------
// 1. State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Object {
    oid: Oid,
    path: String,
    otype: OType,
    contents: Vec<u8>,
    exists: bool,
    mtime: f64,
}

impl Object {
    fn hash(&self) -> Option<ContentHash> {
        (self.otype == OType::File).then(|| ContentHash::sha256(&self.contents))
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    oid: Oid,
    otype: OType,
    exists: bool,
    at: f64,
}

#[derive(Debug)]
struct State {
    config: ProviderConfig,
    objects: HashMap<Oid, Object>,
    by_path: HashMap<String, Oid>,
    events: Vec<Recorded>,
    cursor_floor: usize,
    batch_size: usize,
    next_oid: u64,
    clock: f64,
    connected: bool,
    offline: bool,
    recycle_oid: bool,
    report_paths: bool,
    failures: HashMap<MockOp, VecDeque<CloudError>>,
    calls: HashMap<MockOp, usize>,
    mutations: usize,
    parent_overrides: HashMap<Oid, Oid>,
}

impl State {
    fn new(config: ProviderConfig) -> Self {
        let root = Object {
            oid: Oid::from(ROOT_OID),
            path: "/".to_string(),
            otype: OType::Directory,
            contents: Vec::new(),
            exists: true,
            mtime: START_TIME,
        };
        let mut state = Self {
            config,
            objects: HashMap::new(),
            by_path: HashMap::new(),
            events: Vec::new(),
            cursor_floor: 0,
            batch_size: 64,
            next_oid: 1,
            clock: START_TIME,
            connected: true,
            offline: false,
            recycle_oid: false,
            report_paths: true,
            failures: HashMap::new(),
            calls: HashMap::new(),
            mutations: 0,
            parent_overrides: HashMap::new(),
        };
        state.store(root);
        let sync_root = state.config.sync_root.clone();
        if state.make_dirs(&sync_root).is_ok() {
            state.events.clear();
        }
        state
    }

    fn key(&self, path: &str) -> String {
        paths::key(path, self.config.case_sensitive)
    }

    fn live(&self, oid: &Oid) -> Option<&Object> {
        self.objects.get(oid).filter(|o| o.exists)
    }

    fn live_at(&self, path: &str) -> Option<&Object> {
        self.by_path
            .get(&self.key(path))
            .and_then(|oid| self.live(oid))
    }

    fn stamp(&mut self) -> f64 {
        let t = self.clock;
        self.clock += TICK;
        t
    }

    fn record(&mut self, oid: &Oid, at: f64) {
        if let Some(o) = self.objects.get(oid) {
            self.events.push(Recorded {
                oid: o.oid.clone(),
                otype: o.otype,
                exists: o.exists,
                at,
            });
        }
    }

    fn store(&mut self, object: Object) {
        let key = self.key(&object.path);
        self.by_path.insert(key, object.oid.clone());
        self.objects.insert(object.oid.clone(), object);
    }

    fn fresh_oid(&mut self) -> Oid {
        let oid = Oid(format!("mock-{}", self.next_oid));
        self.next_oid += 1;
        oid
    }

    /// Count the call, then fail it if offline, injected or disconnected.
    fn gate(&mut self, op: MockOp) -> Result<(), CloudError> {
        *self.calls.entry(op).or_default() += 1;
        if self.offline {
            self.connected = false;
            return Err(CloudError::Disconnected("mock is offline".into()));
        }
        if let Some(err) = self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            if matches!(err, CloudError::Disconnected(_)) {
                self.connected = false;
            }
            return Err(err);
        }
        if !self.connected && op != MockOp::Connect {
            return Err(CloudError::Disconnected("not connected".into()));
        }
        Ok(())
    }

    fn info(&self, o: &Object) -> ObjectInfo {
        let path = self.report_paths.then(|| o.path.clone());
        let base = match o.otype {
            OType::Directory => ObjectInfo::directory(o.oid.clone(), path),
            _ => ObjectInfo::file(o.oid.clone(), ContentHash::sha256(&o.contents), path),
        };
        if o.oid.0 == ROOT_OID {
            return base.with_parent(o.oid.clone(), "");
        }
        let (parent_path, name) = paths::split(&o.path);
        let parent = self
            .parent_overrides
            .get(&o.oid)
            .cloned()
            .or_else(|| self.live_at(&parent_path).map(|p| p.oid.clone()));
        match parent {
            Some(parent) => base.with_parent(parent, name),
            None => base,
        }
    }

    fn info_of(&self, oid: &Oid) -> Result<ObjectInfo, CloudError> {
        self.live(oid)
            .map(|o| self.info(o))
            .ok_or_else(|| CloudError::FileNotFound(oid.to_string()))
    }

    fn has_live_children(&self, dir: &Object) -> bool {
        let cs = self.config.case_sensitive;
        self.objects.values().any(|o| {
            o.exists
                && o.oid != dir.oid
                && paths::paths_match(&paths::parent(&o.path), &dir.path, cs)
                && !paths::is_root(&o.path)
        })
    }

    // -----------------------------------------------------------------------
    // Mutations shared by the trait and the helpers
    // -----------------------------------------------------------------------

    fn ensure_parent(&mut self, path: &str, create_missing: bool) -> Result<(), CloudError> {
        let parent = paths::parent(path);
        if paths::is_root(&parent) {
            return Ok(());
        }
        match self.live_at(&parent).map(|o| o.otype) {
            Some(OType::Directory) => Ok(()),
            Some(_) => Err(CloudError::FileExists(format!("{parent} is a file"))),
            None if create_missing => self.make_dirs(&parent).map(|_| ()),
            None => Err(CloudError::FileNotFound(parent)),
        }
    }

    fn make_dirs(&mut self, path: &str) -> Result<Oid, CloudError> {
        let path = paths::normalize(path);
        let mut last = Oid::from(ROOT_OID);
        if paths::is_root(&path) {
            return Ok(last);
        }
        let mut chain = paths::ancestors(&path);
        chain.push(path);
        for dir in chain {
            match self.live_at(&dir).map(|o| (o.oid.clone(), o.otype)) {
                Some((oid, OType::Directory)) => last = oid,
                Some(_) => return Err(CloudError::FileExists(dir)),
                None => {
                    let oid = self.fresh_oid();
                    let at = self.stamp();
                    self.store(Object {
                        oid: oid.clone(),
                        path: dir,
                        otype: OType::Directory,
                        contents: Vec::new(),
                        exists: true,
                        mtime: at,
                    });
                    self.record(&oid, at);
                    last = oid;
                }
            }
        }
        Ok(last)
    }

    /// New file at `path`; the parent must already exist.
    fn make_file(&mut self, path: &str, contents: Vec<u8>) -> Oid {
        let recycled = if self.recycle_oid {
            self.by_path
                .get(&self.key(path))
                .filter(|oid| {
                    self.objects
                        .get(*oid)
                        .is_some_and(|o| !o.exists && o.otype == OType::File)
                })
                .cloned()
        } else {
            None
        };
        let oid = match recycled {
            Some(oid) => oid,
            None => self.fresh_oid(),
        };
        let at = self.stamp();
        self.store(Object {
            oid: oid.clone(),
            path: path.to_string(),
            otype: OType::File,
            contents,
            exists: true,
            mtime: at,
        });
        self.record(&oid, at);
        oid
    }

    fn overwrite(&mut self, oid: &Oid, contents: Vec<u8>) -> Result<(), CloudError> {
        match self.live(oid).map(|o| o.otype) {
            None => return Err(CloudError::FileNotFound(oid.to_string())),
            Some(OType::Directory) => {
                return Err(CloudError::FileExists(format!("{oid} is a directory")))
            }
            Some(_) => {}
        }
        let at = self.stamp();
        if let Some(o) = self.objects.get_mut(oid) {
            o.contents = contents;
            o.mtime = at;
        }
        self.record(oid, at);
        Ok(())
    }

    fn kill(&mut self, oid: &Oid) {
        let at = self.stamp();
        if let Some(o) = self.objects.get_mut(oid) {
            o.exists = false;
            o.mtime = at;
        }
        self.record(oid, at);
    }

    /// Delete one object. Absent is a no-op; a non-empty directory is
    /// refused. Returns whether anything changed.
    fn delete(&mut self, oid: &Oid) -> Result<bool, CloudError> {
        let Some(o) = self.live(oid) else {
            tracing::debug!(oid = %oid, "delete of absent object ignored");
            return Ok(false);
        };
        if o.otype == OType::Directory && self.has_live_children(o) {
            return Err(CloudError::FileExists(format!("{} is not empty", o.path)));
        }
        if o.oid.0 == ROOT_OID {
            return Err(CloudError::FileExists("cannot delete the root".into()));
        }
        self.kill(oid);
        Ok(true)
    }

    /// Move an object, taking a directory's subtree with it. Feed events go
    /// out for the object first, then its descendants by path.
    fn rename(
        &mut self,
        oid: &Oid,
        new_path: &str,
        create_parents: bool,
    ) -> Result<bool, CloudError> {
        let cs = self.config.case_sensitive;
        let new_path = paths::normalize(new_path);
        let (old_path, otype) = match self.live(oid) {
            Some(o) => (o.path.clone(), o.otype),
            None => return Err(CloudError::FileNotFound(oid.to_string())),
        };
        if old_path == new_path {
            return Ok(false);
        }
        if otype == OType::Directory
            && !paths::paths_match(&old_path, &new_path, cs)
            && paths::is_subpath(&old_path, &new_path, cs).is_some()
        {
            return Err(CloudError::FileExists(format!(
                "cannot move {old_path} into itself"
            )));
        }
        self.ensure_parent(&new_path, create_parents)?;

        let occupant = self
            .live_at(&new_path)
            .filter(|o| &o.oid != oid)
            .map(|o| {
                let busy = o.otype == OType::Directory && self.has_live_children(o);
                (o.oid.clone(), o.otype, busy)
            });
        if let Some((occupant, occupant_type, occupied)) = occupant {
            if !self.config.allow_renames_over_existing || occupant_type != otype || occupied {
                return Err(CloudError::FileExists(new_path));
            }
            self.kill(&occupant);
        }

        let mut moved = vec![oid.clone()];
        if otype == OType::Directory {
            let mut kids: Vec<(String, Oid)> = self
                .objects
                .values()
                .filter(|o| o.exists && &o.oid != oid)
                .filter(|o| paths::is_subpath(&old_path, &o.path, cs).is_some())
                .map(|o| (o.path.clone(), o.oid.clone()))
                .collect();
            kids.sort();
            moved.extend(kids.into_iter().map(|(_, id)| id));
        }

        let at = self.stamp();
        for id in &moved {
            let Some(from) = self.objects.get(id).map(|o| o.path.clone()) else {
                continue;
            };
            let to = paths::replace_prefix(&from, &old_path, &new_path, cs)
                .unwrap_or_else(|| new_path.clone());
            let from_key = self.key(&from);
            if self.by_path.get(&from_key) == Some(id) {
                self.by_path.remove(&from_key);
            }
            let to_key = self.key(&to);
            self.by_path.insert(to_key, id.clone());
            if let Some(o) = self.objects.get_mut(id) {
                o.path = to;
            }
            self.record(id, at);
        }
        Ok(true)
    }

    fn under_root(&self, path: &str) -> Option<String> {
        paths::is_subpath(&self.config.sync_root, path, self.config.case_sensitive)
            .filter(|rel| !paths::is_root(rel))
    }
}

// ---------------------------------------------------------------------------
// 2. Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    config: ProviderConfig,
    state: Arc<Mutex<State>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_config(ProviderConfig::default())
    }

    pub fn with_config(mut config: ProviderConfig) -> Self {
        config.sync_root = paths::normalize(&config.sync_root);
        Self {
            name: "mock".to_string(),
            state: Arc::new(Mutex::new(State::new(config.clone()))),
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `info_*` report parent and name but no path, so paths must be
    /// resolved by walking parents.
    pub fn names_only(self) -> Self {
        self.state.lock().report_paths = false;
        self
    }

    /// Re-creating a deleted file at the same path reuses its oid.
    pub fn with_recycled_oids(self) -> Self {
        self.state.lock().recycle_oid = true;
        self
    }

    // -----------------------------------------------------------------------
    // Driving changes
    // -----------------------------------------------------------------------

    /// Create or overwrite a file, creating parents. Returns its oid.
    pub fn write(&self, path: &str, contents: impl AsRef<[u8]>) -> Oid {
        let mut s = self.state.lock();
        let path = paths::normalize(path);
        let data = contents.as_ref().to_vec();
        if let Some(oid) = s.live_at(&path).map(|o| o.oid.clone()) {
            s.overwrite(&oid, data)
                .unwrap_or_else(|e| panic!("mock write to {path}: {e}"));
            return oid;
        }
        s.ensure_parent(&path, true)
            .unwrap_or_else(|e| panic!("mock write to {path}: {e}"));
        s.make_file(&path, data)
    }

    pub fn mkdirs(&self, path: &str) -> Oid {
        self.state
            .lock()
            .make_dirs(path)
            .unwrap_or_else(|e| panic!("mock mkdirs {path}: {e}"))
    }

    /// Delete `path` and everything below it. Returns false if absent.
    pub fn remove(&self, path: &str) -> bool {
        let mut s = self.state.lock();
        let cs = s.config.case_sensitive;
        let Some(top) = s.live_at(path).map(|o| o.path.clone()) else {
            return false;
        };
        let mut doomed: Vec<(String, Oid)> = s
            .objects
            .values()
            .filter(|o| o.exists && paths::is_subpath(&top, &o.path, cs).is_some())
            .map(|o| (o.path.clone(), o.oid.clone()))
            .collect();
        doomed.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, oid) in doomed {
            s.kill(&oid);
        }
        true
    }

    /// Rename `from` to `to`, creating parents of `to`.
    pub fn move_to(&self, from: &str, to: &str) -> Oid {
        let mut s = self.state.lock();
        let Some(oid) = s.live_at(from).map(|o| o.oid.clone()) else {
            panic!("mock move: {from} does not exist");
        };
        s.rename(&oid, to, true)
            .unwrap_or_else(|e| panic!("mock move {from} -> {to}: {e}"));
        oid
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        let s = self.state.lock();
        s.live_at(path)
            .filter(|o| o.otype == OType::File)
            .map(|o| o.contents.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().live_at(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.state
            .lock()
            .live_at(path)
            .is_some_and(|o| o.otype == OType::Directory)
    }

    pub fn oid_of(&self, path: &str) -> Option<Oid> {
        self.state.lock().live_at(path).map(|o| o.oid.clone())
    }

    pub fn root_oid(&self) -> Oid {
        Oid::from(ROOT_OID)
    }

    /// Live files below the sync root, keyed by path relative to it.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        let s = self.state.lock();
        s.objects
            .values()
            .filter(|o| o.exists && o.otype == OType::File)
            .filter_map(|o| Some((s.under_root(&o.path)?, o.contents.clone())))
            .collect()
    }

    /// Every live object below the sync root, relative to it, sorted.
    pub fn listing(&self) -> Vec<String> {
        let s = self.state.lock();
        let mut out: Vec<String> = s
            .objects
            .values()
            .filter(|o| o.exists)
            .filter_map(|o| s.under_root(&o.path))
            .collect();
        out.sort();
        out
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Successful mutating trait calls that changed something.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    // -----------------------------------------------------------------------
    // Fault injection and environment
    // -----------------------------------------------------------------------

    /// Fail the next trait call of kind `op` with `error`. Queued failures
    /// are consumed in order.
    pub fn fail_next(&self, op: MockOp, error: CloudError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Offline: every call fails `Disconnected` and the session drops.
    pub fn set_offline(&self, offline: bool) {
        let mut s = self.state.lock();
        s.offline = offline;
        if offline {
            s.connected = false;
        }
    }

    /// Every cursor handed out so far becomes invalid.
    pub fn invalidate_cursors(&self) {
        let mut s = self.state.lock();
        s.cursor_floor = s.events.len();
    }

    pub fn set_batch_size(&self, size: usize) {
        self.state.lock().batch_size = size.max(1);
    }

    pub fn set_parent_override(&self, oid: &Oid, parent: &Oid) {
        self.state
            .lock()
            .parent_overrides
            .insert(oid.clone(), parent.clone());
    }

    pub fn now(&self) -> f64 {
        self.state.lock().clock
    }

    pub fn set_time(&self, t: f64) {
        self.state.lock().clock = t;
    }

    pub fn advance(&self, secs: f64) {
        self.state.lock().clock += secs;
    }
}

// ---------------------------------------------------------------------------
// 3. Provider
// ---------------------------------------------------------------------------

fn slurp(content: &mut dyn Read) -> Result<Vec<u8>, CloudError> {
    let mut data = Vec::new();
    content
        .read_to_end(&mut data)
        .map_err(|e| CloudError::Temporary(format!("reading upload: {e}")))?;
    Ok(data)
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn connect(&mut self, _credentials: &Credentials) -> Result<(), CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Connect)?;
        s.connected = true;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }

    fn current_cursor(&mut self) -> Result<Cursor, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::CurrentCursor)?;
        Ok(Cursor(s.events.len().to_string()))
    }

    fn events(&mut self, cursor: &Cursor, _timeout: Duration) -> Result<EventBatch, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Events)?;
        let pos: usize = cursor
            .0
            .parse()
            .map_err(|_| CloudError::InvalidCursor(cursor.0.clone()))?;
        if pos < s.cursor_floor || pos > s.events.len() {
            return Err(CloudError::InvalidCursor(cursor.0.clone()));
        }
        let end = (pos + s.batch_size).min(s.events.len());
        let events = s.events[pos..end]
            .iter()
            .map(|r| Event::new(r.otype, r.oid.clone(), None, None, r.exists, r.at))
            .collect();
        Ok(EventBatch {
            events,
            cursor: Cursor(end.to_string()),
        })
    }

    fn walk(&mut self, since: Option<f64>) -> Result<Vec<Event>, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Walk)?;
        let mut found: Vec<&Object> = s
            .objects
            .values()
            .filter(|o| o.exists && s.under_root(&o.path).is_some())
            .filter(|o| since.map_or(true, |t| o.mtime >= t))
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found
            .into_iter()
            .map(|o| {
                let path = Some(o.path.clone());
                Event::new(o.otype, o.oid.clone(), path, o.hash(), true, o.mtime)
            })
            .collect())
    }

    fn upload(&mut self, oid: &Oid, content: &mut dyn Read) -> Result<ObjectInfo, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Upload)?;
        let data = slurp(content)?;
        s.overwrite(oid, data)?;
        s.mutations += 1;
        s.info_of(oid)
    }

    fn create(
        &mut self,
        path: &str,
        content: &mut dyn Read,
        _metadata: &Metadata,
    ) -> Result<ObjectInfo, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Create)?;
        let path = paths::normalize(path);
        if s.live_at(&path).is_some() {
            return Err(CloudError::FileExists(path));
        }
        let create_parents = !s.config.require_parent_folder;
        s.ensure_parent(&path, create_parents)?;
        let data = slurp(content)?;
        let oid = s.make_file(&path, data);
        s.mutations += 1;
        s.info_of(&oid)
    }

    fn download(&mut self, oid: &Oid, sink: &mut dyn Write) -> Result<(), CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Download)?;
        let Some(o) = s.live(oid).filter(|o| o.otype == OType::File) else {
            return Err(CloudError::FileNotFound(oid.to_string()));
        };
        sink.write_all(&o.contents)
            .map_err(|e| CloudError::Temporary(format!("writing download: {e}")))
    }

    fn rename(&mut self, oid: &Oid, new_path: &str) -> Result<Oid, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Rename)?;
        let create_parents = !s.config.require_parent_folder;
        if s.rename(oid, new_path, create_parents)? {
            s.mutations += 1;
        }
        Ok(oid.clone())
    }

    fn mkdir(&mut self, path: &str) -> Result<Oid, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Mkdir)?;
        let path = paths::normalize(path);
        match s.live_at(&path).map(|o| (o.oid.clone(), o.otype)) {
            Some((oid, OType::Directory)) => return Ok(oid),
            Some(_) => return Err(CloudError::FileExists(path)),
            None => {}
        }
        let create_parents = !s.config.require_parent_folder;
        s.ensure_parent(&path, create_parents)?;
        let oid = s.make_dirs(&path)?;
        s.mutations += 1;
        Ok(oid)
    }

    fn delete(&mut self, oid: &Oid) -> Result<(), CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Delete)?;
        if s.delete(oid)? {
            s.mutations += 1;
        }
        Ok(())
    }

    fn info_path(&mut self, path: &str) -> Result<Option<ObjectInfo>, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::InfoPath)?;
        Ok(s.live_at(path).map(|o| s.info(o)))
    }

    fn info_oid(&mut self, oid: &Oid) -> Result<Option<ObjectInfo>, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::InfoOid)?;
        Ok(s.live(oid).map(|o| s.info(o)))
    }

    fn listdir(&mut self, oid: &Oid) -> Result<Vec<ObjectInfo>, CloudError> {
        let mut s = self.state.lock();
        s.gate(MockOp::Listdir)?;
        let Some(dir) = s.live(oid).filter(|o| o.otype == OType::Directory) else {
            return Err(CloudError::FileNotFound(oid.to_string()));
        };
        let cs = s.config.case_sensitive;
        let mut children: Vec<&Object> = s
            .objects
            .values()
            .filter(|o| o.exists && o.oid != dir.oid && !paths::is_root(&o.path))
            .filter(|o| paths::paths_match(&paths::parent(&o.path), &dir.path, cs))
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children.into_iter().map(|o| s.info(o)).collect())
    }
}
