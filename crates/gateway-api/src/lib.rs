//! Data Product Gateway
//!
//! Read-only HTTP gateway in front of curated warehouse views. Every data
//! request passes through authentication, per-key rate limiting, dataset
//! allow-list resolution, input validation, a stampede-safe result cache and
//! a circuit-breaker-guarded warehouse call, and leaves an audit record.

pub mod api_keys;
pub mod audit;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rate_limiting;
pub mod registry;
pub mod routes;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use config::GatewayConfig;
pub use pipeline::Pipeline;
pub use routes::{router, AppState};
