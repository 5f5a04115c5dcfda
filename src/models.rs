//! Data model and HTTP/JSON contracts of the invariant backend.
//!
//! Responses are validated while they are deserialized: a payload that does
//! not match its schema never reaches the cache.

use crate::error::{Result, SyncError};
use crate::network::Network;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// An on-chain object under observation, unique within one network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MonitoredEntity {
    pub object_id: String,
    pub network: Network,
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantStatus {
    Ok,
    Violated,
    Error,
}

impl std::fmt::Display for InvariantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvariantStatus::Ok => "OK",
            InvariantStatus::Violated => "VIOLATED",
            InvariantStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computation {
    pub inputs: BTreeMap<String, String>,
    pub formula: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InvariantRecordWire")]
pub struct InvariantRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: InvariantStatus,
    pub evaluated_at: DateTime<Utc>,
    pub computation: Computation,
    pub violation_reason: Option<String>,
}

impl InvariantRecord {
    pub fn is_violated(&self) -> bool {
        self.status == InvariantStatus::Violated
    }
}

#[derive(Deserialize)]
struct InvariantRecordWire {
    id: String,
    name: String,
    description: String,
    status: InvariantStatus,
    evaluated_at: DateTime<Utc>,
    computation: Computation,
    #[serde(default)]
    violation_reason: Option<String>,
}

impl TryFrom<InvariantRecordWire> for InvariantRecord {
    type Error = String;

    fn try_from(w: InvariantRecordWire) -> std::result::Result<Self, Self::Error> {
        if w.id.is_empty() {
            return Err("invariant id is empty".into());
        }
        // Error records carry the evaluation failure in `violation_reason`.
        match (w.status, w.violation_reason.is_some()) {
            (InvariantStatus::Violated, false) => {
                return Err(format!("invariant {} is Violated without a reason", w.id));
            }
            (InvariantStatus::Ok, true) => {
                return Err(format!("invariant {} is Ok but carries a violation reason", w.id));
            }
            _ => {}
        }
        Ok(InvariantRecord {
            id: w.id,
            name: w.name,
            description: w.description,
            status: w.status,
            evaluated_at: w.evaluated_at,
            computation: w.computation,
            violation_reason: w.violation_reason,
        })
    }
}

/// Aggregate monitor state. `all_ok` is derived from the violation count and
/// never taken from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MonitorStatusWire", into = "MonitorStatusWire")]
pub struct MonitorStatus {
    pub last_check: Option<DateTime<Utc>>,
    pub violation_count: u64,
    pub total_invariants: u64,
    pub monitored_object_ids: Vec<String>,
}

impl MonitorStatus {
    pub fn all_ok(&self) -> bool {
        self.violation_count == 0
    }

    pub fn monitored_entities(&self, network: Network) -> Vec<MonitoredEntity> {
        self.monitored_object_ids
            .iter()
            .map(|id| MonitoredEntity {
                object_id: id.clone(),
                network,
                object_type: None,
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct MonitorStatusWire {
    last_check: Option<DateTime<Utc>>,
    violations: u64,
    total_invariants: u64,
    #[serde(default)]
    all_ok: bool,
    monitored_objects: Vec<String>,
}

impl From<MonitorStatus> for MonitorStatusWire {
    fn from(s: MonitorStatus) -> Self {
        MonitorStatusWire {
            all_ok: s.all_ok(),
            last_check: s.last_check,
            violations: s.violation_count,
            total_invariants: s.total_invariants,
            monitored_objects: s.monitored_object_ids,
        }
    }
}

impl TryFrom<MonitorStatusWire> for MonitorStatus {
    type Error = String;

    fn try_from(w: MonitorStatusWire) -> std::result::Result<Self, Self::Error> {
        if w.violations > w.total_invariants {
            return Err(format!(
                "status reports {} violations out of {} invariants",
                w.violations, w.total_invariants
            ));
        }
        let mut seen = HashSet::new();
        let monitored_object_ids = w
            .monitored_objects
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Ok(MonitorStatus {
            last_check: w.last_check,
            violation_count: w.violations,
            total_invariants: w.total_invariants,
            monitored_object_ids,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub uptime_secs: u64,
}

// ===== Move module metadata =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    pub type_: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructMetadata {
    pub name: String,
    pub abilities: Vec<String>,
    pub fields: Vec<FieldMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub name: String,
    pub visibility: String,
    pub is_entry: bool,
    pub parameters: Vec<String>,
    pub return_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub package_id: String,
    pub module_name: String,
    pub structs: Vec<StructMetadata>,
    pub functions: Vec<FunctionMetadata>,
}

// ===== AI analysis =====

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenRouter,
    #[default]
    Ollama,
}

impl LlmProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "anthropic/claude-3.5-sonnet",
            LlmProvider::Ollama => "llama3.2",
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "openrouter" => Ok(LlmProvider::OpenRouter),
            "ollama" => Ok(LlmProvider::Ollama),
            _ => Err(anyhow::anyhow!(
                "Invalid provider '{s}'. Valid options: openrouter, ollama"
            )),
        }
    }
}

/// An AI-proposed invariant that has not been persisted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedInvariant {
    pub id: String,
    pub name: String,
    pub description: String,
    pub formula: String,
    pub severity: String,
    pub fields_used: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub package_id: String,
    pub module_name: String,
    pub suggested_invariants: Vec<SuggestedInvariant>,
    pub analysis_notes: String,
}

// ===== Requests / responses =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorRequest {
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MonitorResponse {
    pub success: bool,
    pub message: String,
    pub object_id: String,
    #[serde(default)]
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzeRequest {
    pub package_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    pub llm_provider: LlmProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub message: String,
    pub modules: Vec<ModuleMetadata>,
    pub analysis_results: Vec<AnalysisResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddInvariantsRequest {
    pub invariants: Vec<SuggestedInvariant>,
    pub package_id: String,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddInvariantsResponse {
    pub success: bool,
    pub message: String,
    pub added_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveInvariantRequest {
    pub invariant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoveInvariantResponse {
    pub success: bool,
    pub message: String,
}

/// Write responses share a `{success, message}` envelope.
pub trait Acknowledged: Sized {
    fn success(&self) -> bool;
    fn message(&self) -> &str;

    /// `success: false` in a 2xx body becomes a business error.
    fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SyncError::Business(self.message().to_string()))
        }
    }
}

macro_rules! acknowledged {
    ($($ty:ty),* $(,)?) => {
        $(impl Acknowledged for $ty {
            fn success(&self) -> bool {
                self.success
            }
            fn message(&self) -> &str {
                &self.message
            }
        })*
    };
}

acknowledged!(
    MonitorResponse,
    AnalyzeResponse,
    AddInvariantsResponse,
    RemoveInvariantResponse,
);
