//! `Dashboard` wires the network context, cache, scheduler and mutation
//! coordinator together. It is the entry point for consumers.

use crate::analysis::{AnalysisSession, AnalyzeParams};
use crate::cache::{CachePolicy, QueryCache, Snapshot};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::gateway::{Gateway, HttpGateway};
use crate::models::{AnalyzeResponse, SuggestedInvariant};
use crate::mutation::{AddOutcome, MonitorOutcome, MutationCoordinator};
use crate::network::{Network, NetworkContext, Scope};
use crate::query::{Query, QueryData};
use crate::scheduler::PollingScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Dashboard {
    network: Arc<NetworkContext>,
    cache: QueryCache,
    scheduler: Arc<PollingScheduler>,
    mutations: MutationCoordinator,
}

impl Dashboard {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        network: Network,
        policy: CachePolicy,
        poll_interval: Duration,
    ) -> Self {
        let context = Arc::new(NetworkContext::new(network));
        let cache = QueryCache::new(Arc::clone(&gateway), policy, context.current());
        let mutations = MutationCoordinator::new(gateway, cache.clone(), Arc::clone(&context));
        Self {
            network: context,
            cache,
            scheduler: Arc::new(PollingScheduler::new(poll_interval)),
            mutations,
        }
    }

    /// Dashboard over HTTP using the configured endpoints and policy.
    pub fn from_config(config: &Config) -> Result<Self> {
        let gateway = HttpGateway::new(config.endpoints(), config.request_timeout())?;
        Ok(Self::new(
            Arc::new(gateway),
            config.network,
            config.policy(),
            config.poll_interval(),
        ))
    }

    pub fn network(&self) -> Network {
        self.network.network()
    }

    pub fn scope(&self) -> Scope {
        self.network.current()
    }

    pub fn watch_network(&self) -> watch::Receiver<Scope> {
        self.network.watch()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    /// Watch `query`. Polling runs while at least one subscription is alive.
    pub fn subscribe(&self, query: Query) -> Subscription {
        let (rx, first) = self.cache.subscribe(&query);
        if first {
            self.scheduler
                .start(&self.cache, query.clone(), self.cache.scope());
        }
        Subscription {
            query,
            rx,
            cache: self.cache.clone(),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    pub fn get(&self, query: &Query) -> Snapshot {
        self.cache.get(query)
    }

    pub async fn fetch(&self, query: &Query) -> Result<QueryData> {
        self.cache.fetch(query).await
    }

    /// Move every view to `network`. Returns `false` when already there.
    ///
    /// Timers are cancelled before the cache drops the old network's entries,
    /// and re-armed only afterwards, so no read or poll mixes both networks.
    pub fn switch_network(&self, network: Network) -> bool {
        if self.network.network() == network {
            return false;
        }
        let stopped = self.scheduler.cancel_all();
        let Some(scope) = self.network.select(network) else {
            return false;
        };
        let queries = self.cache.rescope(scope);
        log::info!(
            "[dashboard] switched to {network} (epoch {}): {} timers stopped, {} re-armed",
            scope.epoch,
            stopped.len(),
            queries.len()
        );
        for query in queries {
            self.scheduler.start(&self.cache, query, scope);
        }
        true
    }

    pub async fn add_monitored_object(&self, object_id: &str) -> Result<MonitorOutcome> {
        self.mutations.add_monitored_object(object_id).await
    }

    pub async fn remove_invariant(&self, invariant_id: &str) -> Result<String> {
        self.mutations.remove_invariant(invariant_id).await
    }

    pub async fn add_suggested_invariants(
        &self,
        invariants: &[SuggestedInvariant],
        package_id: &str,
        module_name: &str,
    ) -> Result<AddOutcome> {
        self.mutations
            .add_suggested_invariants(invariants, package_id, module_name)
            .await
    }

    pub async fn analyze_package(&self, params: &AnalyzeParams) -> Result<AnalyzeResponse> {
        self.mutations.analyze_package(params).await
    }

    pub async fn analyze(&self, params: &AnalyzeParams) -> Result<AnalysisSession> {
        AnalysisSession::run(&self.mutations, params).await
    }
}

/// Live view of one query. Dropping the last subscription of a query stops
/// its polling and cancels any fetch nobody else awaits.
pub struct Subscription {
    query: Query,
    rx: watch::Receiver<Snapshot>,
    cache: QueryCache,
    scheduler: Arc<PollingScheduler>,
}

impl Subscription {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn current(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot.
    ///
    /// The feed lives as long as the query has a subscriber, so
    /// [`SyncError::SubscriptionClosed`] is not expected while `self` exists.
    pub async fn changed(&mut self) -> Result<Snapshot> {
        self.rx
            .changed()
            .await
            .map_err(|_| SyncError::SubscriptionClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until a snapshot satisfies `pred`, checking the current one first.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Result<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let snapshot = self
            .rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| SyncError::SubscriptionClosed)?;
        Ok(snapshot.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.cache.unsubscribe(&self.query) {
            self.scheduler.stop(&self.query);
        }
    }
}
