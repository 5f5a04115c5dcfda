//! Typed request/response boundary to the invariant backend.
//!
//! All non-2xx responses are transport failures regardless of body. Bodies
//! are decoded into the strict types of [`crate::models`], so a shape mismatch
//! surfaces as [`SyncError::Validation`].

use crate::error::{Result, SyncError};
use crate::models::{
    AddInvariantsRequest, AddInvariantsResponse, AnalyzeRequest, AnalyzeResponse, HealthStatus,
    InvariantRecord, ModuleMetadata, MonitorRequest, MonitorResponse, MonitorStatus,
    RemoveInvariantRequest, RemoveInvariantResponse,
};
use crate::network::Network;
use crate::query::{Query, QueryData};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Read the payload behind `query` on `network`.
    async fn query(&self, network: Network, query: &Query) -> Result<QueryData>;

    async fn monitor(&self, network: Network, req: &MonitorRequest) -> Result<MonitorResponse>;

    async fn analyze(&self, network: Network, req: &AnalyzeRequest) -> Result<AnalyzeResponse>;

    async fn add_invariants(
        &self,
        network: Network,
        req: &AddInvariantsRequest,
    ) -> Result<AddInvariantsResponse>;

    async fn remove_invariant(
        &self,
        network: Network,
        req: &RemoveInvariantRequest,
    ) -> Result<RemoveInvariantResponse>;
}

/// Backend base URL per network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiEndpoints {
    pub mainnet: String,
    pub testnet: String,
}

impl ApiEndpoints {
    pub fn single(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            mainnet: base.clone(),
            testnet: base,
        }
    }

    pub fn base(&self, network: Network) -> &str {
        let url = match network {
            Network::Mainnet => &self.mainnet,
            Network::Testnet => &self.testnet,
        };
        url.trim_end_matches('/')
    }
}

pub struct HttpGateway {
    client: reqwest::Client,
    endpoints: ApiEndpoints,
}

impl HttpGateway {
    pub fn new(endpoints: ApiEndpoints, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(8)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { client, endpoints })
    }

    fn url(&self, network: Network, path: &str) -> String {
        format!("{}{}", self.endpoints.base(network), path)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        log::debug!("[gateway] GET {url}");
        let res = self.client.get(&url).send().await?;
        decode(res).await
    }

    async fn post_json<B, T>(&self, url: String, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        log::debug!("[gateway] POST {url}");
        let res = self.client.post(&url).json(body).send().await?;
        decode(res).await
    }
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T> {
    let status = res.status();
    if !status.is_success() {
        return Err(SyncError::Transport {
            message: format!(
                "API error: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string(),
            status: Some(status.as_u16()),
        });
    }
    let body = res.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn query(&self, network: Network, query: &Query) -> Result<QueryData> {
        let data = match query {
            Query::Invariants => QueryData::Invariants(
                self.get_json::<Vec<InvariantRecord>>(self.url(network, "/api/invariants"))
                    .await?,
            ),
            Query::Invariant { id } => {
                let path = format!("/api/invariants/{}", urlencoding::encode(id));
                QueryData::Invariant(self.get_json(self.url(network, &path)).await?)
            }
            Query::Status => QueryData::Status(
                self.get_json::<MonitorStatus>(self.url(network, "/api/status"))
                    .await?,
            ),
            Query::Health => QueryData::Health(
                self.get_json::<HealthStatus>(self.url(network, "/health"))
                    .await?,
            ),
            Query::ModuleMetadata {
                package_id,
                module_name,
            } => {
                let path = format!(
                    "/api/metadata/{}/{}",
                    urlencoding::encode(package_id),
                    urlencoding::encode(module_name)
                );
                QueryData::ModuleMetadata(
                    self.get_json::<ModuleMetadata>(self.url(network, &path))
                        .await?,
                )
            }
        };
        Ok(data)
    }

    async fn monitor(&self, network: Network, req: &MonitorRequest) -> Result<MonitorResponse> {
        self.post_json(self.url(network, "/api/monitor"), req).await
    }

    async fn analyze(&self, network: Network, req: &AnalyzeRequest) -> Result<AnalyzeResponse> {
        self.post_json(self.url(network, "/api/analyze"), req).await
    }

    async fn add_invariants(
        &self,
        network: Network,
        req: &AddInvariantsRequest,
    ) -> Result<AddInvariantsResponse> {
        self.post_json(self.url(network, "/api/invariants/add"), req)
            .await
    }

    async fn remove_invariant(
        &self,
        network: Network,
        req: &RemoveInvariantRequest,
    ) -> Result<RemoveInvariantResponse> {
        self.post_json(self.url(network, "/api/invariants/remove"), req)
            .await
    }
}
