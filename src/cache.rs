//! Cache of server-derived state.
//!
//! Entries are keyed by [`QueryKey`] (network + query). For any key there is
//! at most one fetch outstanding; readers and subscribers share its outcome.
//! A response is only written if, on arrival, the cache is still in the scope
//! (network and epoch) the fetch started under and the fetch still owns the
//! entry's in-flight slot. Everything else is dropped.
//!
//! The state lives behind a single mutex that is never held across an
//! `.await`; every method below is one non-suspending critical section.

use crate::error::{Result, SyncError};
use crate::gateway::Gateway;
use crate::net::{self, Backoff};
use crate::network::{Network, Scope};
use crate::query::{KeyPrefix, Query, QueryData, QueryKey};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Values younger than this are served without a fetch.
    pub stale_after: Duration,
    /// Unsubscribed entries not read for this long are dropped.
    pub evict_after: Duration,
    pub backoff: Backoff,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            evict_after: Duration::from_secs(300),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Fresh,
    Stale,
    Loading,
    Error,
}

/// Point-in-time view of one key.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub network: Network,
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub last_fetched_at: Option<Instant>,
    /// Last failure, kept until the next successful fetch.
    pub error: Option<SyncError>,
    pub is_fetching: bool,
}

/// Result of a poll tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollResult {
    Started,
    AlreadyInFlight,
    /// The cache moved to another scope; the timer should stop.
    OutOfScope,
}

#[derive(Clone, Debug)]
enum FetchOutcome {
    Applied(Result<QueryData>),
    Discarded,
}

struct InFlight {
    ticket: u64,
    /// Invalidated while outstanding: drop the response and fetch again.
    rerun: bool,
    /// Last subscriber left with nobody awaiting: drop the response.
    cancelled: bool,
    done: watch::Sender<Option<FetchOutcome>>,
}

#[derive(Default)]
struct Entry {
    data: Option<QueryData>,
    fetched_at: Option<Instant>,
    attempted_at: Option<Instant>,
    invalidated: bool,
    error: Option<SyncError>,
    in_flight: Option<InFlight>,
    touched_at: Option<Instant>,
}

impl Entry {
    fn touch(&mut self) -> &mut Self {
        self.touched_at = Some(Instant::now());
        self
    }

    fn is_idle(&self, evict_after: Duration) -> bool {
        self.in_flight.is_none()
            && self
                .touched_at
                .map_or(true, |at| at.elapsed() >= evict_after)
    }

    fn is_fresh(&self, stale_after: Duration) -> bool {
        !self.invalidated
            && self
                .fetched_at
                .is_some_and(|at| at.elapsed() < stale_after)
    }

    fn needs_fetch(&self, stale_after: Duration) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        // Failed attempts back off for one staleness window too.
        self.invalidated
            || self
                .attempted_at
                .map_or(true, |at| at.elapsed() >= stale_after)
    }

    fn status(&self, stale_after: Duration) -> QueryStatus {
        match (&self.data, &self.error) {
            (_, Some(_)) if self.in_flight.is_none() => QueryStatus::Error,
            (None, _) => QueryStatus::Loading,
            (Some(_), _) if self.is_fresh(stale_after) => QueryStatus::Fresh,
            (Some(_), _) => QueryStatus::Stale,
        }
    }
}

struct Watcher {
    count: usize,
    tx: watch::Sender<Snapshot>,
}

struct CacheState {
    scope: Scope,
    entries: HashMap<QueryKey, Entry>,
    watchers: HashMap<Query, Watcher>,
    next_ticket: u64,
    last_sweep: Instant,
}

impl CacheState {
    fn key(&self, query: &Query) -> QueryKey {
        QueryKey {
            network: self.scope.network,
            query: query.clone(),
        }
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    gateway: Arc<dyn Gateway>,
    policy: CachePolicy,
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(gateway: Arc<dyn Gateway>, policy: CachePolicy, scope: Scope) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    scope,
                    entries: HashMap::new(),
                    watchers: HashMap::new(),
                    next_ticket: 0,
                    last_sweep: Instant::now(),
                }),
                gateway,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    pub fn scope(&self) -> Scope {
        self.inner.lock().scope
    }

    /// Current view of `query`. Missing or stale values start a background
    /// refetch; the last known value is returned either way.
    pub fn get(&self, query: &Query) -> Snapshot {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let key = state.key(query);
        let stale_after = self.inner.policy.stale_after;
        state.entries.entry(key.clone()).or_default().touch();
        self.inner.sweep(state);
        if state
            .entries
            .get(&key)
            .is_some_and(|e| e.needs_fetch(stale_after))
        {
            self.inner.start_fetch(state, query);
        }
        self.inner.snapshot(state, query)
    }

    /// Current view of `query` without side effects.
    pub fn peek(&self, query: &Query) -> Option<Snapshot> {
        let guard = self.inner.lock();
        let key = guard.key(query);
        guard
            .entries
            .contains_key(&key)
            .then(|| self.inner.snapshot(&guard, query))
    }

    /// Fresh data for `query` on the network current at the call: served
    /// from cache when fresh, otherwise joins the in-flight fetch or starts
    /// one and waits for it. Fails with [`SyncError::Superseded`] when the
    /// network changes before the data arrives.
    pub async fn fetch(&self, query: &Query) -> Result<QueryData> {
        let issued = self.scope();
        loop {
            let rx = {
                let mut guard = self.inner.lock();
                let state = &mut *guard;
                if state.scope != issued {
                    log::debug!(
                        "[cache] read of {query} on {} superseded by {}",
                        issued.network,
                        state.scope.network
                    );
                    return Err(SyncError::Superseded {
                        network: issued.network,
                    });
                }
                let key = state.key(query);
                let stale_after = self.inner.policy.stale_after;
                if let Some(entry) = state.entries.get_mut(&key) {
                    let entry = entry.touch();
                    if let (true, Some(data)) = (entry.is_fresh(stale_after), &entry.data) {
                        return Ok(data.clone());
                    }
                }
                self.inner.sweep(state);
                self.inner.start_fetch(state, query)
            };

            match wait_outcome(rx).await {
                FetchOutcome::Applied(result) => return result,
                FetchOutcome::Discarded => continue,
            }
        }
    }

    /// Timer tick: fetch unless one is already outstanding.
    pub fn poll(&self, query: &Query, scope: Scope) -> PollResult {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.scope != scope {
            return PollResult::OutOfScope;
        }
        let key = state.key(query);
        if state
            .entries
            .get(&key)
            .is_some_and(|e| e.in_flight.is_some())
        {
            return PollResult::AlreadyInFlight;
        }
        self.inner.start_fetch(state, query);
        PollResult::Started
    }

    /// Register a subscriber. Returns the snapshot stream and whether this is
    /// the first subscriber of `query`.
    pub fn subscribe(&self, query: &Query) -> (watch::Receiver<Snapshot>, bool) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let key = state.key(query);
        let entry = state.entries.entry(key).or_default().touch();
        // A fetch cancelled by the previous last subscriber serves this one.
        if let Some(flight) = entry.in_flight.as_mut() {
            flight.cancelled = false;
        }
        let snapshot = self.inner.snapshot(state, query);

        match state.watchers.entry(query.clone()) {
            MapEntry::Occupied(mut w) => {
                let w = w.get_mut();
                w.count += 1;
                (w.tx.subscribe(), false)
            }
            MapEntry::Vacant(slot) => {
                let (tx, rx) = watch::channel(snapshot);
                slot.insert(Watcher { count: 1, tx });
                (rx, true)
            }
        }
    }

    /// Drop a subscriber. Returns `true` when it was the last one; in that
    /// case an outstanding fetch nobody awaits is cancelled.
    pub fn unsubscribe(&self, query: &Query) -> bool {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let Some(w) = state.watchers.get_mut(query) else {
            return false;
        };
        w.count = w.count.saturating_sub(1);
        if w.count > 0 {
            return false;
        }
        state.watchers.remove(query);

        let key = state.key(query);
        if let Some(flight) = state
            .entries
            .get_mut(&key)
            .map(|e| e.touch())
            .and_then(|e| e.in_flight.as_mut())
        {
            if flight.done.receiver_count() == 0 {
                log::debug!("[cache] {key}: last subscriber left, cancelling fetch");
                flight.cancelled = true;
            }
        }
        true
    }

    pub fn subscriber_count(&self, query: &Query) -> usize {
        self.inner
            .lock()
            .watchers
            .get(query)
            .map_or(0, |w| w.count)
    }

    /// Queries that currently have subscribers.
    pub fn subscribed(&self) -> Vec<Query> {
        self.inner.lock().watchers.keys().cloned().collect()
    }

    /// Mark every entry under `prefix` stale. Subscribed entries refetch at
    /// once; a fetch already outstanding is superseded by a follow-up fetch.
    /// Returns the number of entries marked.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let network = state.scope.network;

        let mut matched = Vec::new();
        for (key, entry) in state.entries.iter_mut() {
            if key.network != network || !key.query.matches(prefix) {
                continue;
            }
            entry.invalidated = true;
            if let Some(flight) = entry.in_flight.as_mut() {
                flight.rerun = true;
            }
            matched.push((key.query.clone(), entry.in_flight.is_some()));
        }

        for (query, in_flight) in &matched {
            let subscribed = state.watchers.get(query).is_some_and(|w| w.count > 0);
            if subscribed && !in_flight {
                self.inner.start_fetch(state, query);
            } else {
                self.inner.publish(state, query);
            }
        }
        log::debug!(
            "[cache] invalidated {} entries under {prefix} on {network}",
            matched.len()
        );
        matched.len()
    }

    /// Move to `scope`, discarding every entry of the previous one. Each
    /// subscriber immediately sees an empty `Loading` snapshot for the new
    /// network. Returns the subscribed queries, to be re-armed by the caller.
    pub fn rescope(&self, scope: Scope) -> Vec<Query> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let previous = state.scope;
        let discarded = state.entries.len();

        state.scope = scope;
        // Dropping the entries drops their in-flight senders, which tells any
        // waiter its fetch was discarded.
        state.entries.clear();

        let queries: Vec<Query> = state.watchers.keys().cloned().collect();
        for query in &queries {
            let key = state.key(query);
            state.entries.insert(key, Entry::default());
            self.inner.publish(state, query);
        }

        log::info!(
            "[cache] rescoped {} -> {} (epoch {}), discarded {discarded} entries",
            previous.network,
            scope.network,
            scope.epoch
        );
        queries
    }

    /// Keys currently held, for diagnostics.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner.lock().entries.keys().cloned().collect()
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, state: &CacheState, query: &Query) -> Snapshot {
        let key = state.key(query);
        let network = state.scope.network;
        match state.entries.get(&key) {
            Some(entry) => Snapshot {
                network,
                data: entry.data.clone(),
                status: entry.status(self.policy.stale_after),
                last_fetched_at: entry.fetched_at,
                error: entry.error.clone(),
                is_fetching: entry.in_flight.is_some(),
            },
            None => Snapshot {
                network,
                data: None,
                status: QueryStatus::Loading,
                last_fetched_at: None,
                error: None,
                is_fetching: false,
            },
        }
    }

    /// Drop entries nobody watches, fetches or has read for `evict_after`.
    /// Runs at most every quarter window.
    fn sweep(&self, state: &mut CacheState) {
        let evict_after = self.policy.evict_after;
        if state.last_sweep.elapsed() < evict_after / 4 {
            return;
        }
        state.last_sweep = Instant::now();

        let CacheState {
            entries, watchers, ..
        } = state;
        let before = entries.len();
        entries.retain(|key, entry| {
            watchers.contains_key(&key.query) || !entry.is_idle(evict_after)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("[cache] evicted {evicted} idle entries");
        }
    }

    fn publish(&self, state: &CacheState, query: &Query) {
        if let Some(w) = state.watchers.get(query) {
            w.tx.send_replace(self.snapshot(state, query));
        }
    }

    /// Join the outstanding fetch for `query` or spawn one. Must be called
    /// with the state locked so the check and the claim are one step.
    fn start_fetch(
        self: &Arc<Self>,
        state: &mut CacheState,
        query: &Query,
    ) -> watch::Receiver<Option<FetchOutcome>> {
        let key = state.key(query);
        let scope = state.scope;
        let ticket = state.next_ticket;
        let entry = state.entries.entry(key.clone()).or_default();

        if let Some(flight) = entry.in_flight.as_mut() {
            flight.cancelled = false;
            return flight.done.subscribe();
        }

        let (tx, rx) = watch::channel(None);
        entry.in_flight = Some(InFlight {
            ticket,
            rerun: false,
            cancelled: false,
            done: tx,
        });
        state.next_ticket += 1;
        self.publish(state, query);

        log::debug!("[cache] fetching {key} (ticket {ticket})");
        tokio::spawn(Arc::clone(self).run_fetch(key, scope, ticket));
        rx
    }

    async fn run_fetch(self: Arc<Self>, key: QueryKey, scope: Scope, ticket: u64) {
        loop {
            let result = {
                let gateway = &self.gateway;
                let query = &key.query;
                let network = key.network;
                let label = key.to_string();
                net::with_backoff(
                    self.policy.backoff,
                    &label,
                    move || gateway.query(network, query),
                    || self.owns_flight(&key, scope, ticket),
                )
                .await
            };

            if !self.settle(&key, scope, ticket, result) {
                return;
            }
        }
    }

    /// Whether the fetch `ticket` is still the one whose result will be used.
    fn owns_flight(&self, key: &QueryKey, scope: Scope, ticket: u64) -> bool {
        let state = self.lock();
        state.scope == scope
            && state
                .entries
                .get(key)
                .and_then(|e| e.in_flight.as_ref())
                .is_some_and(|f| f.ticket == ticket && !f.rerun && !f.cancelled)
    }

    /// Apply or discard a response. Returns `true` when the fetch must run
    /// again because its entry was invalidated meanwhile.
    fn settle(&self, key: &QueryKey, scope: Scope, ticket: u64, result: Result<QueryData>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;

        if state.scope != scope {
            log::debug!(
                "[cache] dropping response for {key}: scope moved to {} (epoch {})",
                state.scope.network,
                state.scope.epoch
            );
            return false;
        }
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        let Some(flight) = entry.in_flight.as_mut().filter(|f| f.ticket == ticket) else {
            log::debug!("[cache] dropping response for {key}: superseded");
            return false;
        };
        if flight.rerun && !flight.cancelled {
            flight.rerun = false;
            log::debug!("[cache] {key} invalidated while in flight, fetching again");
            return true;
        }

        let Some(flight) = entry.in_flight.take() else {
            return false;
        };
        if flight.cancelled {
            log::debug!("[cache] dropping response for {key}: no longer subscribed");
            flight.done.send_replace(Some(FetchOutcome::Discarded));
            self.publish(state, &key.query);
            return false;
        }

        let now = Instant::now();
        entry.attempted_at = Some(now);
        entry.touched_at = Some(now);
        let outcome = match result {
            Ok(data) if data.answers(&key.query) => {
                entry.data = Some(data.clone());
                entry.fetched_at = Some(now);
                entry.invalidated = false;
                entry.error = None;
                Ok(data)
            }
            Ok(_) => {
                let err = SyncError::validation(format!("gateway answered {key} with another payload"));
                entry.error = Some(err.clone());
                Err(err)
            }
            Err(err) => {
                log::warn!("[cache] fetch {key} failed: {err}");
                entry.error = Some(err.clone());
                Err(err)
            }
        };

        flight.done.send_replace(Some(FetchOutcome::Applied(outcome)));
        self.publish(state, &key.query);
        false
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Option<FetchOutcome>>) -> FetchOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Sender dropped with its entry: the scope changed underneath.
            return rx.borrow().clone().unwrap_or(FetchOutcome::Discarded);
        }
    }
}
