//! Cache keys and the typed payloads stored under them.

use crate::models::{HealthStatus, InvariantRecord, ModuleMetadata, MonitorStatus};
use crate::network::Network;

/// A read the dashboard can subscribe to, independent of network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Query {
    Invariants,
    Invariant { id: String },
    Status,
    Health,
    ModuleMetadata {
        package_id: String,
        module_name: String,
    },
}

impl Query {
    pub fn invariant(id: impl Into<String>) -> Self {
        Query::Invariant { id: id.into() }
    }

    pub fn module_metadata(package_id: impl Into<String>, module_name: impl Into<String>) -> Self {
        Query::ModuleMetadata {
            package_id: package_id.into(),
            module_name: module_name.into(),
        }
    }

    /// Path segments used for prefix invalidation.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Query::Invariants => vec!["invariants"],
            Query::Invariant { id } => vec!["invariant", id.as_str()],
            Query::Status => vec!["status"],
            Query::Health => vec!["health"],
            Query::ModuleMetadata {
                package_id,
                module_name,
            } => vec!["metadata", package_id.as_str(), module_name.as_str()],
        }
    }

    pub fn matches(&self, prefix: &KeyPrefix) -> bool {
        let segments = self.segments();
        prefix.0.len() <= segments.len()
            && prefix.0.iter().zip(segments).all(|(p, s)| p == s)
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.segments().join("/"))
    }
}

/// Composite cache key: every entry is namespaced by network.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub network: Network,
    pub query: Query,
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.query)
    }
}

/// Leading key segments, e.g. `["invariants"]`. An empty prefix matches all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPrefix(Vec<String>);

impl KeyPrefix {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPrefix(segments.into_iter().map(Into::into).collect())
    }

    pub fn all() -> Self {
        KeyPrefix(Vec::new())
    }

    pub fn invariants() -> Self {
        Self::new(["invariants"])
    }

    pub fn status() -> Self {
        Self::new(["status"])
    }
}

impl From<&Query> for KeyPrefix {
    fn from(query: &Query) -> Self {
        KeyPrefix::new(query.segments())
    }
}

impl std::fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join("/"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryData {
    Invariants(Vec<InvariantRecord>),
    Invariant(InvariantRecord),
    Status(MonitorStatus),
    Health(HealthStatus),
    ModuleMetadata(ModuleMetadata),
}

impl QueryData {
    pub fn as_invariants(&self) -> Option<&[InvariantRecord]> {
        match self {
            QueryData::Invariants(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_invariant(&self) -> Option<&InvariantRecord> {
        match self {
            QueryData::Invariant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&MonitorStatus> {
        match self {
            QueryData::Status(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_health(&self) -> Option<&HealthStatus> {
        match self {
            QueryData::Health(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_module_metadata(&self) -> Option<&ModuleMetadata> {
        match self {
            QueryData::ModuleMetadata(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this payload is the shape `query` produces.
    pub fn answers(&self, query: &Query) -> bool {
        matches!(
            (self, query),
            (QueryData::Invariants(_), Query::Invariants)
                | (QueryData::Invariant(_), Query::Invariant { .. })
                | (QueryData::Status(_), Query::Status)
                | (QueryData::Health(_), Query::Health)
                | (QueryData::ModuleMetadata(_), Query::ModuleMetadata { .. })
        )
    }
}
