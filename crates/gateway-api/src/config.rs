//! Gateway configuration
//!
//! Each component owns a config struct with documented defaults, a
//! `from_env()` constructor, and `validate()`. [`GatewayConfig`] gathers them
//! for the binary.
//!
//! ## Environment Variables
//!
//! - `PORT`: listen port (default: 8080)
//! - `DATAPRODUCT_ENV`: `production` switches logs to JSON (default: development)
//! - `DATAPRODUCT_LOG_LEVEL`: filter used when `RUST_LOG` is unset (default: info)
//! - `DATAPRODUCT_DEFAULT_PAGE_LIMIT` / `DATAPRODUCT_MAX_PAGE_LIMIT`: pagination bounds
//! - `DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS`: outbound call timeout (default: 30)
//!
//! Component variables are listed on the component modules.

use crate::api_keys::KeyStoreConfig;
use crate::audit::AuditConfig;
use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiting::RateLimitConfig;
use crate::registry::RegistryConfig;
use dataproduct_gateway_core::env::{env_parse, env_string};
use dataproduct_gateway_core::validation::{PaginationBounds, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use std::time::Duration;

/// Default listen port
const DEFAULT_PORT: u16 = 8080;

/// Default outbound warehouse timeout in seconds
const DEFAULT_WAREHOUSE_TIMEOUT_SECS: u64 = 30;

/// Default log filter
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Everything the binary needs to assemble the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub environment: Environment,
    pub log_level: String,
    pub registry: RegistryConfig,
    pub keys: KeyStoreConfig,
    pub pagination: PaginationBounds,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub audit: AuditConfig,
    pub warehouse_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            environment: Environment::Development,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            registry: RegistryConfig::default(),
            keys: KeyStoreConfig::default(),
            pagination: PaginationBounds::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            audit: AuditConfig::default(),
            warehouse_timeout: Duration::from_secs(DEFAULT_WAREHOUSE_TIMEOUT_SECS),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            environment: Environment::parse(env_string("DATAPRODUCT_ENV").as_deref()),
            log_level: env_string("DATAPRODUCT_LOG_LEVEL")
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            registry: RegistryConfig::from_env(),
            keys: KeyStoreConfig::from_env(),
            pagination: PaginationBounds {
                default_limit: env_parse("DATAPRODUCT_DEFAULT_PAGE_LIMIT", DEFAULT_PAGE_LIMIT),
                max_limit: env_parse("DATAPRODUCT_MAX_PAGE_LIMIT", MAX_PAGE_LIMIT),
            },
            rate_limit: RateLimitConfig::from_env(),
            cache: CacheConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            audit: AuditConfig::from_env(),
            warehouse_timeout: Duration::from_secs(env_parse(
                "DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS",
                DEFAULT_WAREHOUSE_TIMEOUT_SECS,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.warehouse_timeout.is_zero() {
            return Err("warehouse_timeout must be > 0".to_string());
        }
        self.pagination.validate()?;
        self.rate_limit.validate()?;
        self.cache.validate()?;
        self.circuit_breaker.validate()?;
        self.audit.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert!(!config.environment.is_production());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("PORT", "9090");
        std::env::set_var("DATAPRODUCT_ENV", "Production");
        std::env::set_var("DATAPRODUCT_MAX_PAGE_LIMIT", "200");
        std::env::set_var("DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS", "not-a-number");

        let config = GatewayConfig::from_env();

        std::env::remove_var("PORT");
        std::env::remove_var("DATAPRODUCT_ENV");
        std::env::remove_var("DATAPRODUCT_MAX_PAGE_LIMIT");
        std::env::remove_var("DATAPRODUCT_WAREHOUSE_TIMEOUT_SECS");

        assert_eq!(config.port, 9090);
        assert!(config.environment.is_production());
        assert_eq!(config.pagination.max_limit, 200);
        assert_eq!(
            config.warehouse_timeout,
            Duration::from_secs(DEFAULT_WAREHOUSE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_invalid_pagination_rejected() {
        let config = GatewayConfig {
            pagination: PaginationBounds {
                default_limit: 500,
                max_limit: 100,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
