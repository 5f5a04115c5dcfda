use crate::cache::CachePolicy;
use crate::gateway::ApiEndpoints;
use crate::net::Backoff;
use crate::network::Network;
use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Connection and refresh settings.
///
/// Configuration priority: CLI args > Environment variables > Defaults
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Invariant backend base URL
    #[arg(long, global = true, env = "SUIWATCH_API_URL")]
    pub api_url: Option<String>,

    /// Separate backend for testnet (defaults to --api-url)
    #[arg(long, global = true, env = "SUIWATCH_TESTNET_API_URL")]
    pub testnet_api_url: Option<String>,

    /// Network to start on: mainnet or testnet
    #[arg(short, long, global = true, env = "SUIWATCH_NETWORK")]
    pub network: Option<String>,

    /// Polling interval for subscribed views in milliseconds (1000-600000)
    #[arg(long, global = true, env = "SUIWATCH_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Age after which cached data is refetched, in milliseconds (0-600000)
    #[arg(long, global = true, env = "SUIWATCH_STALE_AFTER_MS")]
    pub stale_after_ms: Option<u64>,

    /// Idle time after which unwatched cache entries are dropped, in milliseconds (1000-3600000)
    #[arg(long, global = true, env = "SUIWATCH_EVICT_AFTER_MS")]
    pub evict_after_ms: Option<u64>,

    /// HTTP request timeout in milliseconds (1000-60000)
    #[arg(long, global = true, env = "SUIWATCH_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Retry attempts for failed reads (0-10)
    #[arg(long, global = true, env = "SUIWATCH_RETRIES")]
    pub retries: Option<u32>,

    /// Base backoff between read retries in milliseconds (1-10000)
    #[arg(long, global = true, env = "SUIWATCH_RETRY_BASE_MS")]
    pub retry_base_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub api_url: String,
    pub testnet_api_url: Option<String>,
    pub network: Network,
    pub poll_interval_ms: u64,
    pub stale_after_ms: u64,
    pub evict_after_ms: u64,
    pub request_timeout_ms: u64,
    pub retries: u32,
    pub retry_base_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            testnet_api_url: None,
            network: Network::Mainnet,
            poll_interval_ms: 10_000,
            stale_after_ms: 5_000,
            evict_after_ms: 300_000,
            request_timeout_ms: 8_000,
            retries: 3,
            retry_base_ms: 300,
        }
    }
}

/// Validate that a value is within a given range (inclusive)
fn validate_in_range<T>(val: T, min: T, max: T, name: &str) -> Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if val < min || val > max {
        Err(anyhow!("{name} must be in range [{min}, {max}], got {val}"))
    } else {
        Ok(val)
    }
}

fn validate_url(url: &str, name: &str) -> Result<()> {
    if url.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!("{name} must start with http:// or https://"))
    }
}

impl Config {
    pub fn from_args(args: ConfigArgs) -> Result<Self> {
        let defaults = Config::default();

        let api_url = args.api_url.unwrap_or(defaults.api_url);
        validate_url(&api_url, "SUIWATCH_API_URL")?;

        let testnet_api_url = args.testnet_api_url.filter(|u| !u.is_empty());
        if let Some(ref url) = testnet_api_url {
            validate_url(url, "SUIWATCH_TESTNET_API_URL")?;
        }

        let network = match args.network {
            Some(s) => s.parse().context("SUIWATCH_NETWORK")?,
            None => defaults.network,
        };

        let poll_interval_ms = validate_in_range(
            args.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            1_000,
            600_000,
            "SUIWATCH_POLL_INTERVAL_MS",
        )?;
        let stale_after_ms = validate_in_range(
            args.stale_after_ms.unwrap_or(defaults.stale_after_ms),
            0,
            600_000,
            "SUIWATCH_STALE_AFTER_MS",
        )?;
        let evict_after_ms = validate_in_range(
            args.evict_after_ms.unwrap_or(defaults.evict_after_ms),
            1_000,
            3_600_000,
            "SUIWATCH_EVICT_AFTER_MS",
        )?;
        let request_timeout_ms = validate_in_range(
            args.request_timeout_ms.unwrap_or(defaults.request_timeout_ms),
            1_000,
            60_000,
            "SUIWATCH_REQUEST_TIMEOUT_MS",
        )?;
        let retries = validate_in_range(
            args.retries.unwrap_or(defaults.retries),
            0,
            10,
            "SUIWATCH_RETRIES",
        )?;
        let retry_base_ms = validate_in_range(
            args.retry_base_ms.unwrap_or(defaults.retry_base_ms),
            1,
            10_000,
            "SUIWATCH_RETRY_BASE_MS",
        )?;

        Ok(Config {
            api_url,
            testnet_api_url,
            network,
            poll_interval_ms,
            stale_after_ms,
            evict_after_ms,
            request_timeout_ms,
            retries,
            retry_base_ms,
        })
    }

    pub fn endpoints(&self) -> ApiEndpoints {
        ApiEndpoints {
            mainnet: self.api_url.clone(),
            testnet: self
                .testnet_api_url
                .clone()
                .unwrap_or_else(|| self.api_url.clone()),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            stale_after: Duration::from_millis(self.stale_after_ms),
            evict_after: Duration::from_millis(self.evict_after_ms),
            backoff: Backoff {
                retries: self.retries,
                base: Duration::from_millis(self.retry_base_ms),
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn print_summary(&self) {
        log::debug!("suiwatch configuration:");
        log::debug!("  API: {}", self.api_url);
        if let Some(ref url) = self.testnet_api_url {
            log::debug!("  Testnet API: {url}");
        }
        log::debug!("  Network: {}", self.network);
        log::debug!("  Poll interval: {}ms", self.poll_interval_ms);
        log::debug!("  Stale after: {}ms", self.stale_after_ms);
        log::debug!("  Evict after: {}ms", self.evict_after_ms);
        log::debug!("  Request timeout: {}ms", self.request_timeout_ms);
        log::debug!(
            "  Retries: {} (base {}ms)",
            self.retries,
            self.retry_base_ms
        );
    }
}
