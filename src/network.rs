//! Network selection. Every cache key and gateway call is scoped by it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Mainnet, Network::Testnet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    pub fn rpc_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://fullnode.mainnet.sui.io:443",
            Network::Testnet => "https://fullnode.testnet.sui.io:443",
        }
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            _ => Err(anyhow!("Invalid network '{s}'. Valid options: mainnet, testnet")),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The network a piece of state belongs to, plus the switch generation it was
/// produced under. Two scopes with the same network but different epochs are
/// not interchangeable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Scope {
    pub network: Network,
    pub epoch: u64,
}

impl Scope {
    pub fn rpc_url(&self) -> &'static str {
        self.network.rpc_url()
    }
}

/// Process-wide network selection.
///
/// The context only owns the selection and its epoch counter; discarding the
/// state scoped to the previous network is driven by
/// [`Dashboard::switch_network`](crate::client::Dashboard::switch_network).
pub struct NetworkContext {
    tx: watch::Sender<Scope>,
}

impl NetworkContext {
    pub fn new(network: Network) -> Self {
        let (tx, _rx) = watch::channel(Scope { network, epoch: 0 });
        Self { tx }
    }

    pub fn current(&self) -> Scope {
        *self.tx.borrow()
    }

    pub fn network(&self) -> Network {
        self.current().network
    }

    /// Select `network`. Returns the new scope, or `None` when it was
    /// already selected (no transition, epoch unchanged).
    pub fn select(&self, network: Network) -> Option<Scope> {
        let mut next = None;
        self.tx.send_if_modified(|scope| {
            if scope.network == network {
                return false;
            }
            *scope = Scope {
                network,
                epoch: scope.epoch + 1,
            };
            next = Some(*scope);
            true
        });

        if let Some(scope) = next {
            log::info!("network switched to {} (epoch {})", scope.network, scope.epoch);
        }
        next
    }

    pub fn watch(&self) -> watch::Receiver<Scope> {
        self.tx.subscribe()
    }
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self::new(Network::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_url_is_pure_function_of_network() {
        assert_eq!(
            Network::Mainnet.rpc_url(),
            "https://fullnode.mainnet.sui.io:443"
        );
        assert_eq!(
            Network::Testnet.rpc_url(),
            "https://fullnode.testnet.sui.io:443"
        );
    }

    #[test]
    fn parse_network() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("TESTNET".parse::<Network>().unwrap(), Network::Testnet);
        assert!("devnet".parse::<Network>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(
            serde_json::to_string(&Network::Testnet).unwrap(),
            "\"testnet\""
        );
    }

    #[test]
    fn select_bumps_epoch_only_on_change() {
        let ctx = NetworkContext::new(Network::Mainnet);
        assert_eq!(ctx.current().epoch, 0);
        assert!(ctx.select(Network::Mainnet).is_none());

        let scope = ctx.select(Network::Testnet).unwrap();
        assert_eq!(scope.network, Network::Testnet);
        assert_eq!(scope.epoch, 1);

        let scope = ctx.select(Network::Mainnet).unwrap();
        assert_eq!(scope.epoch, 2);
        assert_eq!(scope.rpc_url(), Network::Mainnet.rpc_url());
    }

    #[test]
    fn watchers_see_switch() {
        let ctx = NetworkContext::default();
        let mut rx = ctx.watch();
        assert!(ctx.select(Network::Mainnet).is_none());
        assert!(!rx.has_changed().unwrap());

        ctx.select(Network::Testnet);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ctx.current());
    }

    #[test]
    fn select_without_watchers_still_switches() {
        let ctx = NetworkContext::new(Network::Mainnet);
        let scope = ctx.select(Network::Testnet).unwrap();
        assert_eq!(ctx.current(), scope);
        assert_eq!(ctx.network(), Network::Testnet);
    }
}
