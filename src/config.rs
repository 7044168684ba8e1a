//! Controller configuration from `RELEASE_*` environment variables

use crate::controller::analysis::DEFAULT_QUERY_TIMEOUT;
use crate::controller::driver::DEFAULT_MAX_CONCURRENT;
use crate::controller::release::reconcile::DEFAULT_CONFLICT_RETRIES;
use crate::controller::release::validation::parse_duration;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PROMETHEUS_ADDRESS: &str = "http://prometheus.monitoring:9090";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Base URL of the Prometheus HTTP API
    pub prometheus_address: String,
    /// Deadline for a single metric query
    pub query_timeout: Duration,
    pub health_port: u16,
    pub max_concurrent_reconciles: u16,
    /// Lost status writes tolerated per tick
    pub conflict_retries: u32,
    /// Requeue interval for non-terminal releases with no timer of their own
    pub resync_interval: Duration,
    /// Namespace to watch; all namespaces when None
    pub watch_namespace: Option<String>,
    /// Reject releases that carry no signature
    pub require_signature: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            prometheus_address: DEFAULT_PROMETHEUS_ADDRESS.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            health_port: DEFAULT_HEALTH_PORT,
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            watch_namespace: None,
            require_signature: true,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup; unset or empty keys keep their default
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(address) = get("RELEASE_PROMETHEUS_ADDRESS") {
            if !address.starts_with("http://") && !address.starts_with("https://") {
                return Err(invalid(
                    "RELEASE_PROMETHEUS_ADDRESS",
                    address,
                    "must be an http(s) URL",
                ));
            }
            config.prometheus_address = address.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("RELEASE_QUERY_TIMEOUT") {
            config.query_timeout = duration("RELEASE_QUERY_TIMEOUT", v)?;
        }
        if let Some(v) = get("RELEASE_HEALTH_PORT") {
            config.health_port = match v.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(invalid("RELEASE_HEALTH_PORT", v, "must be a port in 1-65535")),
            };
        }
        if let Some(v) = get("RELEASE_MAX_CONCURRENT_RECONCILES") {
            config.max_concurrent_reconciles = match v.parse::<u16>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(invalid(
                        "RELEASE_MAX_CONCURRENT_RECONCILES",
                        v,
                        "must be a positive integer",
                    ))
                }
            };
        }
        if let Some(v) = get("RELEASE_CONFLICT_RETRIES") {
            config.conflict_retries = v.parse::<u32>().map_err(|_| {
                invalid("RELEASE_CONFLICT_RETRIES", v.clone(), "must be a non-negative integer")
            })?;
        }
        if let Some(v) = get("RELEASE_RESYNC_INTERVAL") {
            config.resync_interval = duration("RELEASE_RESYNC_INTERVAL", v)?;
        }
        config.watch_namespace = get("RELEASE_WATCH_NAMESPACE");
        if let Some(v) = get("RELEASE_REQUIRE_SIGNATURE") {
            config.require_signature = match v.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(invalid("RELEASE_REQUIRE_SIGNATURE", v, "must be true or false")),
            };
        }

        Ok(config)
    }
}

fn invalid(key: &'static str, value: String, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { key, value, reason }
}

fn duration(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    parse_duration(&value).ok_or_else(|| invalid(key, value, "must be a duration like 30s, 5m or 1h"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<ControllerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert!(config.require_signature);
        assert_eq!(config.max_concurrent_reconciles, 16);
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.query_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = from(&[
            ("RELEASE_PROMETHEUS_ADDRESS", "http://prom:9090/"),
            ("RELEASE_QUERY_TIMEOUT", "5s"),
            ("RELEASE_HEALTH_PORT", "9000"),
            ("RELEASE_MAX_CONCURRENT_RECONCILES", "4"),
            ("RELEASE_CONFLICT_RETRIES", "0"),
            ("RELEASE_RESYNC_INTERVAL", "1m"),
            ("RELEASE_WATCH_NAMESPACE", "shop"),
            ("RELEASE_REQUIRE_SIGNATURE", "false"),
        ])
        .unwrap();

        assert_eq!(config.prometheus_address, "http://prom:9090");
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.health_port, 9000);
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(config.conflict_retries, 0);
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.watch_namespace.as_deref(), Some("shop"));
        assert!(!config.require_signature);
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let config = from(&[("RELEASE_WATCH_NAMESPACE", ""), ("RELEASE_HEALTH_PORT", " ")]).unwrap();
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            ("RELEASE_PROMETHEUS_ADDRESS", "prometheus:9090"),
            ("RELEASE_QUERY_TIMEOUT", "soon"),
            ("RELEASE_HEALTH_PORT", "0"),
            ("RELEASE_HEALTH_PORT", "70000"),
            ("RELEASE_MAX_CONCURRENT_RECONCILES", "0"),
            ("RELEASE_CONFLICT_RETRIES", "-1"),
            ("RELEASE_RESYNC_INTERVAL", "0s"),
            ("RELEASE_REQUIRE_SIGNATURE", "maybe"),
        ];
        for (key, value) in cases {
            let err = from(&[(key, value)]).unwrap_err();
            let ConfigError::Invalid { key: reported, .. } = err;
            assert_eq!(reported, key, "{}={} should be rejected", key, value);
        }
    }
}
