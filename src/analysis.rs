//! AI analysis: request parameters and the accept-suggestions session.

use crate::error::{Result, SyncError};
use crate::models::{
    AnalysisResult, AnalyzeRequest, AnalyzeResponse, LlmProvider, ModuleMetadata,
    SuggestedInvariant,
};
use crate::mutation::{required, MutationCoordinator};
use crate::network::Network;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// User-facing analysis parameters, validated into an [`AnalyzeRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalyzeParams {
    pub package_id: String,
    pub module_name: Option<String>,
    pub provider: LlmProvider,
    /// Falls back to the provider's default model when unset.
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub ollama_url: Option<String>,
}

impl AnalyzeParams {
    pub fn new(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            ..Default::default()
        }
    }

    pub fn to_request(&self, network: Network) -> Result<AnalyzeRequest> {
        let package_id = required(&self.package_id, "package id")?;
        let module_name = self
            .module_name
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let model = match self.model.as_deref() {
            Some(m) => required(m, "model")?,
            None => self.provider.default_model().to_string(),
        };

        let (api_key, ollama_url) = match self.provider {
            LlmProvider::OpenRouter => {
                let key = self
                    .api_key
                    .as_deref()
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| SyncError::validation("OpenRouter requires an API key"))?;
                (Some(key.to_string()), None)
            }
            LlmProvider::Ollama => {
                let url = self
                    .ollama_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .unwrap_or(DEFAULT_OLLAMA_URL);
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(SyncError::validation(format!(
                        "Ollama URL must start with http:// or https://, got '{url}'"
                    )));
                }
                (None, Some(url.to_string()))
            }
        };

        Ok(AnalyzeRequest {
            package_id,
            module_name,
            llm_provider: self.provider,
            api_key,
            model,
            ollama_url,
            network: Some(network),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub submitted: usize,
    pub added_count: u64,
    /// Suggestion ids marked accepted, in submission order.
    pub marked: Vec<String>,
    pub message: String,
}

/// One analysis response plus the suggestions accepted from it so far.
///
/// Acceptance is tracked locally and is not authoritative; the backend's
/// invariant list is.
#[derive(Clone, Debug)]
pub struct AnalysisSession {
    response: AnalyzeResponse,
    accepted: HashMap<String, HashSet<String>>,
}

impl AnalysisSession {
    pub fn new(response: AnalyzeResponse) -> Self {
        Self {
            response,
            accepted: HashMap::new(),
        }
    }

    /// Analyze through `coordinator` and open a session on the result.
    pub async fn run(coordinator: &MutationCoordinator, params: &AnalyzeParams) -> Result<Self> {
        let response = coordinator.analyze_package(params).await?;
        Ok(Self::new(response))
    }

    pub fn response(&self) -> &AnalyzeResponse {
        &self.response
    }

    pub fn modules(&self) -> &[ModuleMetadata] {
        &self.response.modules
    }

    pub fn results(&self) -> &[AnalysisResult] {
        &self.response.analysis_results
    }

    pub fn module(&self, module_name: &str) -> Option<&AnalysisResult> {
        self.response
            .analysis_results
            .iter()
            .find(|r| r.module_name == module_name)
    }

    pub fn is_accepted(&self, module_name: &str, suggestion_id: &str) -> bool {
        self.accepted
            .get(module_name)
            .is_some_and(|ids| ids.contains(suggestion_id))
    }

    /// Suggestions of `module_name` not yet accepted in this session.
    pub fn pending(&self, module_name: &str) -> Vec<&SuggestedInvariant> {
        self.module(module_name)
            .map(|r| {
                r.suggested_invariants
                    .iter()
                    .filter(|s| !self.is_accepted(module_name, &s.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Submit the suggestions named by `ids`. On success the first
    /// `min(added_count, submitted)` are marked accepted; on failure none are.
    pub async fn accept(
        &mut self,
        coordinator: &MutationCoordinator,
        module_name: &str,
        ids: &[&str],
    ) -> Result<AcceptOutcome> {
        let result = self.module(module_name).ok_or_else(|| {
            SyncError::validation(format!("no analysis result for module '{module_name}'"))
        })?;

        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let suggestion = result
                .suggested_invariants
                .iter()
                .find(|s| s.id == *id)
                .ok_or_else(|| {
                    SyncError::validation(format!("unknown suggestion '{id}' in {module_name}"))
                })?;
            selected.push(suggestion.clone());
        }
        let package_id = result.package_id.clone();

        self.submit(coordinator, &package_id, module_name, selected)
            .await
    }

    /// Submit every pending suggestion of `module_name`.
    pub async fn accept_all(
        &mut self,
        coordinator: &MutationCoordinator,
        module_name: &str,
    ) -> Result<AcceptOutcome> {
        let package_id = self
            .module(module_name)
            .map(|r| r.package_id.clone())
            .ok_or_else(|| {
                SyncError::validation(format!("no analysis result for module '{module_name}'"))
            })?;
        let selected: Vec<SuggestedInvariant> =
            self.pending(module_name).into_iter().cloned().collect();

        self.submit(coordinator, &package_id, module_name, selected)
            .await
    }

    async fn submit(
        &mut self,
        coordinator: &MutationCoordinator,
        package_id: &str,
        module_name: &str,
        selected: Vec<SuggestedInvariant>,
    ) -> Result<AcceptOutcome> {
        let added = coordinator
            .add_suggested_invariants(&selected, package_id, module_name)
            .await?;

        let take = usize::try_from(added.added_count)
            .unwrap_or(usize::MAX)
            .min(selected.len());
        let marked: Vec<String> = selected[..take].iter().map(|s| s.id.clone()).collect();
        self.accepted
            .entry(module_name.to_string())
            .or_default()
            .extend(marked.iter().cloned());

        Ok(AcceptOutcome {
            submitted: selected.len(),
            added_count: added.added_count,
            marked,
            message: added.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_defaults() {
        let req = AnalyzeParams::new(" 0x2 ")
            .to_request(Network::Testnet)
            .unwrap();
        assert_eq!(req.package_id, "0x2");
        assert_eq!(req.model, "llama3.2");
        assert_eq!(req.ollama_url.as_deref(), Some(DEFAULT_OLLAMA_URL));
        assert_eq!(req.api_key, None);
        assert_eq!(req.network, Some(Network::Testnet));
    }

    #[test]
    fn openrouter_requires_key() {
        let mut params = AnalyzeParams::new("0x2");
        params.provider = LlmProvider::OpenRouter;
        assert!(matches!(
            params.to_request(Network::Mainnet),
            Err(SyncError::Validation(_))
        ));
        params.api_key = Some("sk-test".into());
        let req = params.to_request(Network::Mainnet).unwrap();
        assert_eq!(req.api_key.as_deref(), Some("sk-test"));
        assert_eq!(req.ollama_url, None);
    }

    #[test]
    fn rejects_bad_inputs() {
        let mut params = AnalyzeParams::new("0x2");
        params.ollama_url = Some("localhost:11434".into());
        assert!(params.to_request(Network::Mainnet).is_err());

        let mut params = AnalyzeParams::new("0x2");
        params.model = Some("  ".into());
        assert!(params.to_request(Network::Mainnet).is_err());

        assert!(AnalyzeParams::new("").to_request(Network::Mainnet).is_err());
    }

    #[test]
    fn blank_module_is_omitted() {
        let mut params = AnalyzeParams::new("0x2");
        params.module_name = Some(" ".into());
        assert_eq!(params.to_request(Network::Mainnet).unwrap().module_name, None);
    }
}
