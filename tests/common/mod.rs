// Shared fixtures for the integration tests: an in-process backend.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suiwatch::cache::CachePolicy;
use suiwatch::error::{Result, SyncError};
use suiwatch::gateway::Gateway;
use suiwatch::models::{
    AddInvariantsRequest, AddInvariantsResponse, AnalyzeRequest, AnalyzeResponse, Computation,
    HealthStatus, InvariantRecord, InvariantStatus, ModuleMetadata, MonitorRequest,
    MonitorResponse, MonitorStatus, RemoveInvariantRequest, RemoveInvariantResponse,
};
use suiwatch::net::Backoff;
use suiwatch::query::{Query, QueryData};
use suiwatch::{Dashboard, Network};
use tokio::sync::watch;

pub fn record(id: &str, status: InvariantStatus) -> InvariantRecord {
    let violation_reason = match status {
        InvariantStatus::Violated => Some(format!("{id} does not hold")),
        _ => None,
    };
    InvariantRecord {
        id: id.to_string(),
        name: format!("{id} name"),
        description: format!("{id} description"),
        status,
        evaluated_at: Utc::now(),
        computation: Computation {
            inputs: BTreeMap::from([("supply".to_string(), "100".to_string())]),
            formula: "supply > 0".to_string(),
            result: "true".to_string(),
        },
        violation_reason,
    }
}

#[derive(Default)]
struct Backend {
    invariants: Vec<InvariantRecord>,
    monitored: Vec<String>,
}

#[derive(Default)]
struct MockState {
    backends: HashMap<Network, Backend>,
    calls: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    fail_queries: usize,
    fail_all_queries: bool,
    invalid_queries: usize,
    fail_mutations: usize,
    business_error: Option<String>,
    accept_limit: Option<u64>,
    analysis: Option<AnalyzeResponse>,
    monitor_requests: Vec<MonitorRequest>,
    analyze_requests: Vec<AnalyzeRequest>,
}

/// Open/closed switch that calls wait on before answering.
struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::channel(true).0,
        }
    }

    async fn pass(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    fn set(&self, open: bool) {
        self.open.send_replace(open);
    }
}

/// Scripted backend with one state per network.
///
/// Responses are computed when a call arrives and delivered once the gate for
/// its kind (reads or writes) is open.
pub struct MockGateway {
    state: Mutex<MockState>,
    query_gate: Gate,
    mutation_gate: Gate,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        let mut backends = HashMap::new();
        backends.insert(
            Network::Mainnet,
            Backend {
                invariants: vec![record("INV-001", InvariantStatus::Ok)],
                monitored: vec!["0xmain".to_string()],
            },
        );
        backends.insert(
            Network::Testnet,
            Backend {
                invariants: vec![record("INV-T01", InvariantStatus::Violated)],
                monitored: vec!["0xtest".to_string()],
            },
        );
        Arc::new(Self {
            state: Mutex::new(MockState {
                backends,
                ..Default::default()
            }),
            query_gate: Gate::new(),
            mutation_gate: Gate::new(),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn pause_queries(&self) {
        self.query_gate.set(false);
    }

    pub fn resume_queries(&self) {
        self.query_gate.set(true);
    }

    pub fn pause_mutations(&self) {
        self.mutation_gate.set(false);
    }

    pub fn resume_mutations(&self) {
        self.mutation_gate.set(true);
    }

    /// Fail the next `n` reads with a transport error.
    pub fn fail_next_queries(&self, n: usize) {
        self.with(|s| s.fail_queries = n);
    }

    pub fn fail_all_queries(&self, fail: bool) {
        self.with(|s| s.fail_all_queries = fail);
    }

    /// Answer the next `n` reads with a body that does not match its schema.
    pub fn invalid_next_queries(&self, n: usize) {
        self.with(|s| s.invalid_queries = n);
    }

    pub fn fail_next_mutations(&self, n: usize) {
        self.with(|s| s.fail_mutations = n);
    }

    /// Answer the next write with `success: false`.
    pub fn reject_next_mutation(&self, message: &str) {
        self.with(|s| s.business_error = Some(message.to_string()));
    }

    /// Cap how many invariants one add call persists.
    pub fn set_accept_limit(&self, limit: u64) {
        self.with(|s| s.accept_limit = Some(limit));
    }

    pub fn set_analysis(&self, response: AnalyzeResponse) {
        self.with(|s| s.analysis = Some(response));
    }

    pub fn push_invariant(&self, network: Network, record: InvariantRecord) {
        self.with(|s| {
            s.backends
                .entry(network)
                .or_default()
                .invariants
                .push(record)
        });
    }

    pub fn invariant_ids(&self, network: Network) -> Vec<String> {
        self.with(|s| {
            s.backends
                .get(&network)
                .map(|b| b.invariants.iter().map(|i| i.id.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Reads of `query` across both networks.
    pub fn query_calls(&self, query: &Query) -> usize {
        Network::ALL
            .iter()
            .map(|n| self.query_calls_on(*n, query))
            .sum()
    }

    pub fn query_calls_on(&self, network: Network, query: &Query) -> usize {
        self.calls(&query_label(network, query))
    }

    pub fn total_query_calls(&self) -> usize {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|(k, _)| k.contains(':'))
                .map(|(_, v)| *v)
                .sum()
        })
    }

    /// Calls of one write endpoint: `monitor`, `analyze`, `add` or `remove`.
    pub fn calls(&self, label: &str) -> usize {
        self.with(|s| s.calls.get(label).copied().unwrap_or(0))
    }

    pub fn mutation_calls(&self) -> usize {
        ["monitor", "analyze", "add", "remove"]
            .iter()
            .map(|l| self.calls(l))
            .sum()
    }

    pub fn max_concurrency(&self, network: Network, query: &Query) -> usize {
        let label = query_label(network, query);
        self.with(|s| s.max_in_flight.get(&label).copied().unwrap_or(0))
    }

    pub fn monitor_requests(&self) -> Vec<MonitorRequest> {
        self.with(|s| s.monitor_requests.clone())
    }

    pub fn analyze_requests(&self) -> Vec<AnalyzeRequest> {
        self.with(|s| s.analyze_requests.clone())
    }

    fn answer(&self, network: Network, query: &Query) -> Result<QueryData> {
        self.with(|s| {
            if s.fail_all_queries {
                return Err(SyncError::transport("connection refused"));
            }
            if s.fail_queries > 0 {
                s.fail_queries -= 1;
                return Err(SyncError::transport("connection reset"));
            }
            if s.invalid_queries > 0 {
                s.invalid_queries -= 1;
                return Err(SyncError::validation("missing field `status`"));
            }
            let backend = s.backends.entry(network).or_default();
            let data = match query {
                Query::Invariants => QueryData::Invariants(backend.invariants.clone()),
                Query::Invariant { id } => match backend.invariants.iter().find(|i| &i.id == id) {
                    Some(inv) => QueryData::Invariant(inv.clone()),
                    None => {
                        return Err(SyncError::Validation(format!("no invariant {id}")));
                    }
                },
                Query::Status => {
                    let violations = backend
                        .invariants
                        .iter()
                        .filter(|i| i.is_violated())
                        .count() as u64;
                    QueryData::Status(MonitorStatus {
                        last_check: Some(Utc::now()),
                        violation_count: violations,
                        total_invariants: backend.invariants.len() as u64,
                        monitored_object_ids: backend.monitored.clone(),
                    })
                }
                Query::Health => QueryData::Health(HealthStatus {
                    status: "ok".to_string(),
                    uptime_secs: 42,
                }),
                Query::ModuleMetadata {
                    package_id,
                    module_name,
                } => QueryData::ModuleMetadata(ModuleMetadata {
                    package_id: package_id.clone(),
                    module_name: module_name.clone(),
                    structs: Vec::new(),
                    functions: Vec::new(),
                }),
            };
            Ok(data)
        })
    }

    /// Count the call, then check the injected write failures.
    fn begin_mutation(&self, label: &str) -> Result<Option<String>> {
        self.with(|s| {
            *s.calls.entry(label.to_string()).or_default() += 1;
            if s.fail_mutations > 0 {
                s.fail_mutations -= 1;
                return Err(SyncError::transport("connection reset"));
            }
            Ok(s.business_error.take())
        })
    }
}

fn query_label(network: Network, query: &Query) -> String {
    format!("{network}:{query}")
}

#[async_trait]
impl Gateway for MockGateway {
    async fn query(&self, network: Network, query: &Query) -> Result<QueryData> {
        let label = query_label(network, query);
        self.with(|s| {
            *s.calls.entry(label.clone()).or_default() += 1;
            let n = s.in_flight.entry(label.clone()).or_default();
            *n += 1;
            let n = *n;
            let max = s.max_in_flight.entry(label.clone()).or_default();
            *max = (*max).max(n);
        });

        let answer = self.answer(network, query);
        self.query_gate.pass().await;

        self.with(|s| {
            if let Some(n) = s.in_flight.get_mut(&label) {
                *n -= 1;
            }
        });
        answer
    }

    async fn monitor(&self, network: Network, req: &MonitorRequest) -> Result<MonitorResponse> {
        let rejected = self.begin_mutation("monitor")?;
        self.with(|s| s.monitor_requests.push(req.clone()));
        let res = match rejected {
            Some(message) => MonitorResponse {
                success: false,
                message,
                object_id: req.object_id.clone(),
                object_type: None,
            },
            None => {
                self.with(|s| {
                    let backend = s.backends.entry(network).or_default();
                    if !backend.monitored.contains(&req.object_id) {
                        backend.monitored.push(req.object_id.clone());
                    }
                });
                MonitorResponse {
                    success: true,
                    message: format!("Now monitoring {}", req.object_id),
                    object_id: req.object_id.clone(),
                    object_type: Some("0x2::coin::TreasuryCap".to_string()),
                }
            }
        };
        self.mutation_gate.pass().await;
        Ok(res)
    }

    async fn analyze(&self, _network: Network, req: &AnalyzeRequest) -> Result<AnalyzeResponse> {
        let rejected = self.begin_mutation("analyze")?;
        self.with(|s| s.analyze_requests.push(req.clone()));
        let res = match rejected {
            Some(message) => AnalyzeResponse {
                success: false,
                message,
                modules: Vec::new(),
                analysis_results: Vec::new(),
            },
            None => self
                .with(|s| s.analysis.clone())
                .unwrap_or_else(|| AnalyzeResponse {
                    success: true,
                    message: "nothing to suggest".to_string(),
                    modules: Vec::new(),
                    analysis_results: Vec::new(),
                }),
        };
        self.mutation_gate.pass().await;
        Ok(res)
    }

    async fn add_invariants(
        &self,
        network: Network,
        req: &AddInvariantsRequest,
    ) -> Result<AddInvariantsResponse> {
        let rejected = self.begin_mutation("add")?;
        let res = match rejected {
            Some(message) => AddInvariantsResponse {
                success: false,
                message,
                added_count: 0,
            },
            None => {
                let added = self.with(|s| {
                    let limit = s.accept_limit.unwrap_or(u64::MAX);
                    let backend = s.backends.entry(network).or_default();
                    let mut added = 0u64;
                    for suggestion in &req.invariants {
                        if added >= limit {
                            break;
                        }
                        backend
                            .invariants
                            .push(record(&suggestion.id, InvariantStatus::Ok));
                        added += 1;
                    }
                    added
                });
                AddInvariantsResponse {
                    success: true,
                    message: format!("Added {added} invariants"),
                    added_count: added,
                }
            }
        };
        self.mutation_gate.pass().await;
        Ok(res)
    }

    async fn remove_invariant(
        &self,
        network: Network,
        req: &RemoveInvariantRequest,
    ) -> Result<RemoveInvariantResponse> {
        let rejected = self.begin_mutation("remove")?;
        let res = match rejected {
            Some(message) => RemoveInvariantResponse {
                success: false,
                message,
            },
            None => {
                let removed = self.with(|s| {
                    let backend = s.backends.entry(network).or_default();
                    let before = backend.invariants.len();
                    backend.invariants.retain(|i| i.id != req.invariant_id);
                    backend.invariants.len() < before
                });
                if removed {
                    RemoveInvariantResponse {
                        success: true,
                        message: format!("Removed {}", req.invariant_id),
                    }
                } else {
                    RemoveInvariantResponse {
                        success: false,
                        message: format!("Invariant not found: {}", req.invariant_id),
                    }
                }
            }
        };
        self.mutation_gate.pass().await;
        Ok(res)
    }
}

/// Long staleness window, fast retries, effectively no polling.
pub fn policy() -> CachePolicy {
    CachePolicy {
        stale_after: Duration::from_secs(60),
        evict_after: Duration::from_secs(300),
        backoff: Backoff {
            retries: 2,
            base: Duration::from_millis(1),
        },
    }
}

pub fn dashboard(gateway: &Arc<MockGateway>) -> Dashboard {
    dashboard_with(gateway, policy(), Duration::from_secs(3600))
}

pub fn dashboard_with(
    gateway: &Arc<MockGateway>,
    policy: CachePolicy,
    poll_interval: Duration,
) -> Dashboard {
    let gateway: Arc<dyn Gateway> = gateway.clone();
    Dashboard::new(gateway, Network::Mainnet, policy, poll_interval)
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Await `fut`, failing the test after two seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}

pub fn ids(data: Option<&QueryData>) -> Vec<String> {
    data.and_then(|d| d.as_invariants())
        .map(|list| list.iter().map(|i| i.id.clone()).collect())
        .unwrap_or_default()
}
