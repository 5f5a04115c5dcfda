//! suiwatch - synchronization client for a Sui invariant-monitoring backend
//!
//! Keeps dashboard views of server-derived state (invariants, monitor status,
//! module metadata) in sync with a polling backend, and coordinates the writes
//! a user can issue against it: monitor an object, accept AI-suggested
//! invariants, remove an invariant, run AI analysis.
//!
//! ## Architecture
//!
//! - [`cache::QueryCache`] holds server state per `(network, query)` key with
//!   request coalescing, stale-while-revalidate and a stale-response guard.
//! - [`scheduler::PollingScheduler`] refetches subscribed queries on a timer.
//! - [`mutation::MutationCoordinator`] validates and dedups writes, then
//!   invalidates affected views after a confirmed success.
//! - [`network::NetworkContext`] holds the selected network; switching it
//!   discards every entry of the previous network.
//! - [`client::Dashboard`] wires them together.

pub mod analysis;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod mutation;
pub mod net;
pub mod network;
pub mod query;
pub mod scheduler;

pub use client::{Dashboard, Subscription};
pub use error::{Result, SyncError};
pub use network::Network;
pub use query::Query;
