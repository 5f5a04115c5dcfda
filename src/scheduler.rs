//! Periodic refetch for subscribed queries.

use crate::cache::{PollResult, QueryCache};
use crate::network::Scope;
use crate::query::Query;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Timer {
    scope: Scope,
    handle: JoinHandle<()>,
}

/// One timer per subscribed query. Timers only exist while the query has at
/// least one subscriber, and each is bound to the scope it was armed for.
pub struct PollingScheduler {
    interval: Duration,
    timers: Mutex<HashMap<Query, Timer>>,
}

impl PollingScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the timer for `query` under `scope`. The first tick fires at once.
    pub fn start(&self, cache: &QueryCache, query: Query, scope: Scope) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = timers.get(&query) {
            if timer.scope == scope && !timer.handle.is_finished() {
                return;
            }
        }

        let cache = cache.clone();
        let interval = self.interval;
        let polled = query.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match cache.poll(&polled, scope) {
                    PollResult::Started => {}
                    PollResult::AlreadyInFlight => {
                        log::trace!("[poll] {polled} still in flight, skipping tick");
                    }
                    PollResult::OutOfScope => {
                        log::debug!("[poll] {polled} armed for a previous network, stopping");
                        break;
                    }
                }
            }
        });

        log::debug!(
            "[poll] armed {query} on {} every {}ms",
            scope.network,
            interval.as_millis()
        );
        if let Some(old) = timers.insert(query, Timer { scope, handle }) {
            old.handle.abort();
        }
    }

    /// Cancel the timer for `query`. Returns whether one was running.
    pub fn stop(&self, query: &Query) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.remove(query) {
            Some(timer) => {
                timer.handle.abort();
                log::debug!("[poll] stopped {query}");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and forget all scheduling state. Returns the
    /// queries that were scheduled.
    pub fn cancel_all(&self) -> Vec<Query> {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers
            .drain()
            .map(|(query, timer)| {
                timer.handle.abort();
                query
            })
            .collect()
    }

    pub fn active(&self) -> Vec<Query> {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let mut queries: Vec<Query> = timers.keys().cloned().collect();
        queries.sort();
        queries
    }

    pub fn is_active(&self, query: &Query) -> bool {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.contains_key(query)
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }
}
