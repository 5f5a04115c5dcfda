//! Write path: validation, local dedup, and post-success invalidation.
//!
//! Mutations never touch cached data directly. A confirmed `success: true`
//! invalidates the monitor views (`["invariants"]`, `["status"]`) before the
//! call returns; any failure leaves the cache exactly as it was.

use crate::analysis::AnalyzeParams;
use crate::cache::QueryCache;
use crate::error::{Result, SyncError};
use crate::gateway::Gateway;
use crate::models::{
    Acknowledged, AddInvariantsRequest, AnalyzeResponse, MonitorRequest, MonitoredEntity,
    RemoveInvariantRequest, SuggestedInvariant,
};
use crate::network::{Network, NetworkContext, Scope};
use crate::query::KeyPrefix;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Identity of a logical mutation: operation, network and key arguments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MutationKey {
    AddMonitoredObject {
        network: Network,
        object_id: String,
    },
    RemoveInvariant {
        network: Network,
        invariant_id: String,
    },
    AddSuggestedInvariants {
        network: Network,
        package_id: String,
        module_name: String,
        /// Sorted so submission order does not matter.
        invariant_ids: Vec<String>,
    },
    AnalyzePackage {
        network: Network,
        package_id: String,
        module_name: Option<String>,
    },
}

impl std::fmt::Display for MutationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKey::AddMonitoredObject { network, object_id } => {
                write!(f, "monitor {object_id} on {network}")
            }
            MutationKey::RemoveInvariant {
                network,
                invariant_id,
            } => write!(f, "remove {invariant_id} on {network}"),
            MutationKey::AddSuggestedInvariants {
                network,
                package_id,
                module_name,
                invariant_ids,
            } => write!(
                f,
                "add [{}] for {package_id}::{module_name} on {network}",
                invariant_ids.join(", ")
            ),
            MutationKey::AnalyzePackage {
                network,
                package_id,
                module_name,
            } => match module_name {
                Some(module) => write!(f, "analyze {package_id}::{module} on {network}"),
                None => write!(f, "analyze {package_id} on {network}"),
            },
        }
    }
}

/// Holds a key in the pending set until dropped.
struct PendingGuard {
    pending: Arc<Mutex<HashSet<MutationKey>>>,
    key: MutationKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&self.key);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorOutcome {
    pub entity: MonitoredEntity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    /// As reported by the backend; may be lower than the number submitted.
    pub added_count: u64,
    pub message: String,
}

#[derive(Clone)]
pub struct MutationCoordinator {
    gateway: Arc<dyn Gateway>,
    cache: QueryCache,
    network: Arc<NetworkContext>,
    pending: Arc<Mutex<HashSet<MutationKey>>>,
}

impl MutationCoordinator {
    pub fn new(gateway: Arc<dyn Gateway>, cache: QueryCache, network: Arc<NetworkContext>) -> Self {
        Self {
            gateway,
            cache,
            network,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_pending(&self, key: &MutationKey) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.contains(key)
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }

    fn begin(&self, key: MutationKey) -> Result<PendingGuard> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.insert(key.clone()) {
            log::debug!("[mutation] rejected duplicate: {key}");
            return Err(SyncError::DuplicateMutation(key.to_string()));
        }
        Ok(PendingGuard {
            pending: Arc::clone(&self.pending),
            key,
        })
    }

    /// Invalidate the views every successful write affects. Skipped when the
    /// network changed while the write was in flight: the old entries are
    /// already gone and the new network's entries are unaffected.
    fn invalidate_monitor_state(&self, started: Scope) {
        if self.network.current() != started {
            log::debug!(
                "[mutation] network switched during write, skipping invalidation"
            );
            return;
        }
        self.cache.invalidate(&KeyPrefix::invariants());
        self.cache.invalidate(&KeyPrefix::status());
    }

    pub async fn add_monitored_object(&self, object_id: &str) -> Result<MonitorOutcome> {
        let object_id = required(object_id, "object id")?;
        let scope = self.network.current();
        let _guard = self.begin(MutationKey::AddMonitoredObject {
            network: scope.network,
            object_id: object_id.clone(),
        })?;

        let req = MonitorRequest {
            object_id,
            network: Some(scope.network),
        };
        let res = self
            .gateway
            .monitor(scope.network, &req)
            .await?
            .into_result()?;
        self.invalidate_monitor_state(scope);
        log::info!("[mutation] monitoring {} on {}", res.object_id, scope.network);

        Ok(MonitorOutcome {
            entity: MonitoredEntity {
                object_id: res.object_id,
                network: scope.network,
                object_type: res.object_type,
            },
            message: res.message,
        })
    }

    pub async fn remove_invariant(&self, invariant_id: &str) -> Result<String> {
        let invariant_id = required(invariant_id, "invariant id")?;
        let scope = self.network.current();
        let _guard = self.begin(MutationKey::RemoveInvariant {
            network: scope.network,
            invariant_id: invariant_id.clone(),
        })?;

        let req = RemoveInvariantRequest { invariant_id };
        let res = self
            .gateway
            .remove_invariant(scope.network, &req)
            .await?
            .into_result()?;
        self.invalidate_monitor_state(scope);
        log::info!("[mutation] removed {} on {}", req.invariant_id, scope.network);
        Ok(res.message)
    }

    pub async fn add_suggested_invariants(
        &self,
        invariants: &[SuggestedInvariant],
        package_id: &str,
        module_name: &str,
    ) -> Result<AddOutcome> {
        if invariants.is_empty() {
            return Err(SyncError::validation("no invariants selected"));
        }
        let package_id = required(package_id, "package id")?;
        let module_name = required(module_name, "module name")?;
        let scope = self.network.current();

        let mut invariant_ids: Vec<String> = invariants.iter().map(|i| i.id.clone()).collect();
        invariant_ids.sort();
        let _guard = self.begin(MutationKey::AddSuggestedInvariants {
            network: scope.network,
            package_id: package_id.clone(),
            module_name: module_name.clone(),
            invariant_ids,
        })?;

        let req = AddInvariantsRequest {
            invariants: invariants.to_vec(),
            package_id,
            module_name,
        };
        let res = self
            .gateway
            .add_invariants(scope.network, &req)
            .await?
            .into_result()?;
        self.invalidate_monitor_state(scope);
        if res.added_count < invariants.len() as u64 {
            log::warn!(
                "[mutation] backend added {} of {} invariants for {}::{}",
                res.added_count,
                invariants.len(),
                req.package_id,
                req.module_name
            );
        }

        Ok(AddOutcome {
            added_count: res.added_count,
            message: res.message,
        })
    }

    /// Run AI analysis. Nothing is persisted, so no cache entry is touched.
    pub async fn analyze_package(&self, params: &AnalyzeParams) -> Result<AnalyzeResponse> {
        let scope = self.network.current();
        let req = params.to_request(scope.network)?;
        let _guard = self.begin(MutationKey::AnalyzePackage {
            network: scope.network,
            package_id: req.package_id.clone(),
            module_name: req.module_name.clone(),
        })?;

        log::info!(
            "[mutation] analyzing {} with {:?}/{}",
            req.package_id,
            req.llm_provider,
            req.model
        );
        self.gateway
            .analyze(scope.network, &req)
            .await?
            .into_result()
    }
}

/// Trimmed, non-empty user input.
pub(crate) fn required(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_trims() {
        assert_eq!(required("  0xabc ", "object id").unwrap(), "0xabc");
        assert!(matches!(
            required("   ", "object id"),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn key_display() {
        let key = MutationKey::RemoveInvariant {
            network: Network::Testnet,
            invariant_id: "INV-001".into(),
        };
        assert_eq!(key.to_string(), "remove INV-001 on testnet");
    }

    #[test]
    fn guard_releases_on_drop() {
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let key = MutationKey::AddMonitoredObject {
            network: Network::Mainnet,
            object_id: "0x1".into(),
        };
        pending.lock().unwrap().insert(key.clone());
        let guard = PendingGuard {
            pending: Arc::clone(&pending),
            key: key.clone(),
        };
        assert!(pending.lock().unwrap().contains(&key));
        drop(guard);
        assert!(pending.lock().unwrap().is_empty());
    }
}
