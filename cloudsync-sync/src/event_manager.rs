//! Change-feed poller, one per side.
//!
//! A poll pulls finite batches from the provider until it goes quiet or the
//! caller's budget runs out. Each batch is normalised (path and hash filled
//! in from the provider, objects outside the sync root dropped) and the
//! cursor advances only once the whole batch has been consumed, so an
//! interrupted batch is re-delivered rather than lost.

use std::time::{Duration, Instant};

use cloudsync_core::{
    paths, CloudError, Credentials, Cursor, Event, OType, Provider, ProviderConfig, Side,
};

use crate::error::SyncError;
use crate::path_cache::PathCache;
use crate::retry::{Backoff, RetryConfig};

/// What one call to [`EventManager::poll`] produced.
#[derive(Debug, Default, Clone)]
pub struct PollOutcome {
    /// Full snapshot of the side, when this poll had to walk it. Objects
    /// tracked on the side but absent here have vanished.
    pub walk: Option<Vec<Event>>,
    /// Normalised feed events in cursor order, after `walk`.
    pub events: Vec<Event>,
    /// The side is unreachable and backing off.
    pub disconnected: bool,
}

#[derive(Debug)]
pub struct EventManager {
    side: Side,
    sync_root: String,
    case_sensitive: bool,
    poll_interval: Duration,
    cursor: Option<Cursor>,
    credentials: Credentials,
    backoff: Backoff,
    stopped: Option<String>,
}

impl EventManager {
    pub fn new(
        side: Side,
        config: &ProviderConfig,
        poll_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            side,
            sync_root: paths::normalize(&config.sync_root),
            case_sensitive: config.case_sensitive,
            poll_interval,
            cursor: None,
            credentials: Credentials::new(),
            backoff: Backoff::new(retry),
            stopped: None,
        }
    }

    /// Replace credentials and lift an auth stop.
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        self.stopped = None;
        self.backoff.reset();
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn restore_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    /// Forget the cursor; the next poll walks the side.
    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn is_backing_off(&self) -> bool {
        self.backoff.is_active()
    }

    /// Stop polling until [`EventManager::set_credentials`] is called.
    pub fn stop(&mut self, reason: impl Into<String>) {
        self.stopped = Some(reason.into());
    }

    /// An operation elsewhere found this side disconnected.
    pub fn note_disconnect(&mut self) {
        let delay = self.backoff.fail();
        tracing::warn!(side = %self.side, ?delay, "side disconnected, backing off");
    }

    /// Pull events for at most `budget`.
    ///
    /// Connectivity problems are absorbed: the outcome is flagged
    /// `disconnected` and a reconnect is scheduled. A rejected token stops
    /// the poller and is returned as [`SyncError::AuthFailed`].
    pub fn poll(
        &mut self,
        provider: &mut dyn Provider,
        cache: &PathCache,
        budget: Duration,
    ) -> Result<PollOutcome, SyncError> {
        if let Some(reason) = &self.stopped {
            return Err(SyncError::AuthFailed {
                side: self.side,
                reason: reason.clone(),
            });
        }

        let mut outcome = PollOutcome::default();
        if !self.backoff.ready() {
            outcome.disconnected = true;
            return Ok(outcome);
        }
        if !provider.connected() || self.backoff.is_active() {
            if let Err(e) = provider.connect(&self.credentials) {
                return self.absorb(e, outcome);
            }
            tracing::info!(side = %self.side, "connected");
            self.backoff.reset();
        }

        let deadline = Instant::now() + budget;
        loop {
            let Some(cursor) = self.cursor.clone() else {
                match self.reseed(provider, cache) {
                    Ok(walked) => {
                        outcome.events.clear();
                        outcome.walk = Some(walked);
                        continue;
                    }
                    Err(e) => return self.absorb(e, outcome),
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.consume_batch(provider, cache, &cursor, remaining) {
                Ok((events, next, raw_len)) => {
                    tracing::debug!(
                        side = %self.side,
                        raw = raw_len,
                        kept = events.len(),
                        cursor = %next,
                        "batch consumed"
                    );
                    outcome.events.extend(events);
                    self.cursor = Some(next);
                    if raw_len > 0 {
                        if Instant::now() >= deadline {
                            return Ok(outcome);
                        }
                        continue;
                    }
                    if !outcome.events.is_empty() || outcome.walk.is_some() {
                        return Ok(outcome);
                    }
                }
                Err(CloudError::InvalidCursor(msg)) => {
                    tracing::warn!(side = %self.side, reason = %msg, "cursor rejected, reseeding");
                    self.cursor = None;
                    cache.clear();
                }
                Err(CloudError::Temporary(msg)) => {
                    tracing::warn!(side = %self.side, reason = %msg, "temporary poll failure");
                }
                Err(e) => return self.absorb(e, outcome),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(outcome);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Turn a poll-level failure into an outcome or an auth stop.
    fn absorb(
        &mut self,
        error: CloudError,
        mut outcome: PollOutcome,
    ) -> Result<PollOutcome, SyncError> {
        match error {
            CloudError::Token(reason) => {
                tracing::error!(side = %self.side, reason = %reason, "credentials rejected");
                self.stopped = Some(reason.clone());
                Err(SyncError::AuthFailed {
                    side: self.side,
                    reason,
                })
            }
            CloudError::Disconnected(_) => {
                outcome.disconnected = true;
                self.note_disconnect();
                Ok(outcome)
            }
            other => {
                tracing::warn!(side = %self.side, error = %other, "poll interrupted");
                Ok(outcome)
            }
        }
    }

    /// Fresh cursor, then a full walk that replaces the cache.
    fn reseed(
        &mut self,
        provider: &mut dyn Provider,
        cache: &PathCache,
    ) -> Result<Vec<Event>, CloudError> {
        let cursor = provider.current_cursor()?;
        let walked = provider.walk(None)?;
        let kept: Vec<Event> = walked
            .into_iter()
            .filter(|e| match &e.path {
                Some(p) => self.relative(p).is_some_and(|rel| rel != "/"),
                None => false,
            })
            .collect();
        cache.reseed(&kept);
        tracing::info!(side = %self.side, objects = kept.len(), cursor = %cursor, "walked side");
        self.cursor = Some(cursor);
        Ok(kept)
    }

    /// One provider batch, fully normalised, or nothing at all.
    fn consume_batch(
        &self,
        provider: &mut dyn Provider,
        cache: &PathCache,
        cursor: &Cursor,
        timeout: Duration,
    ) -> Result<(Vec<Event>, Cursor, usize), CloudError> {
        let batch = provider.events(cursor, timeout)?;
        let raw_len = batch.events.len();
        let mut kept = Vec::with_capacity(raw_len);
        for event in batch.events {
            if let Some(ev) = self.normalize(provider, cache, event)? {
                kept.push(ev);
            }
        }
        Ok((kept, batch.cursor, raw_len))
    }

    /// Complete an event from the provider and filter it by sync root.
    fn normalize(
        &self,
        provider: &mut dyn Provider,
        cache: &PathCache,
        event: Event,
    ) -> Result<Option<Event>, CloudError> {
        if let Err(msg) = event.validate() {
            tracing::error!(side = %self.side, reason = %msg, "dropping malformed event");
            return Ok(None);
        }
        let mut ev = event;

        if ev.exists {
            match provider.info_oid(&ev.oid)? {
                None => {
                    ev.exists = false;
                    ev.hash = None;
                }
                Some(info) => {
                    if ev.otype == OType::Unknown {
                        ev.otype = info.resolved_type();
                    }
                    ev.hash = info.hash.clone();
                    ev.path = match info.path.or(ev.path.take()) {
                        Some(p) => Some(p),
                        None => cache.oid_to_path(provider, &ev.oid)?,
                    };
                }
            }
        }
        if !ev.exists && ev.path.is_none() {
            ev.path = cache.get_path(&ev.oid);
        }

        match ev.path.as_deref().map(|p| self.relative(p)) {
            Some(Some(rel)) if rel == "/" => return Ok(None),
            Some(Some(_)) => {}
            Some(None) => {
                tracing::debug!(side = %self.side, oid = %ev.oid, "event outside sync root");
                if !ev.exists {
                    cache.remove_oid(&ev.oid);
                }
                return Ok(None);
            }
            None if !ev.exists => {}
            None => {
                let root = cache.path_to_oid(provider, &self.sync_root)?;
                let inside = match root {
                    Some(root) => cache.is_suboid(provider, &root, &ev.oid)?,
                    None => None,
                };
                match inside {
                    Some(false) => {
                        tracing::debug!(side = %self.side, oid = %ev.oid, "outside sync root");
                        return Ok(None);
                    }
                    Some(true) => {
                        tracing::debug!(side = %self.side, oid = %ev.oid, "path unresolved");
                    }
                    None => {
                        tracing::warn!(
                            side = %self.side,
                            oid = %ev.oid,
                            "containment unknown, tracking by oid"
                        );
                    }
                }
            }
        }

        if ev.exists {
            if let Some(p) = &ev.path {
                cache.upsert(&ev.oid, p);
            }
        } else {
            cache.remove_oid(&ev.oid);
        }
        tracing::debug!(
            side = %self.side,
            oid = %ev.oid,
            path = ?ev.path,
            exists = ev.exists,
            "event"
        );
        Ok(Some(ev))
    }

    fn relative(&self, path: &str) -> Option<String> {
        paths::is_subpath(&self.sync_root, path, self.case_sensitive)
    }
}
