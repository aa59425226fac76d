//! Static orchestrator configuration, loaded once at process start.
//!
//! Every section has defaults, so an empty document is a valid config.
//! Durations accept humantime strings (`"30s"`, `"5m"`) or plain seconds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::budget::BudgetLimit;
use crate::resources::ResourceRequirements;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub(crate) mod duration_human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                humantime::parse_duration(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Worker pool and result table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker slots; never more tasks than this run at once
    pub max_concurrent: usize,

    /// How long an uncollected result is kept
    #[serde(with = "duration_human")]
    pub result_ttl: Duration,

    /// Upper bound on `stop()` before in-flight tasks are cancelled
    #[serde(with = "duration_human")]
    pub shutdown_grace: Duration,

    /// Per-task execution timeout
    #[serde(with = "duration_human")]
    pub task_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            result_ttl: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
        }
    }
}

/// Port window and capacity for tenant resource bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// First port of the window
    pub base_port: u16,

    /// Number of ports in `[base_port, base_port + port_range)`
    pub port_range: u32,

    /// Requirements used when a tenant is provisioned implicitly
    pub default_requirements: ResourceRequirements,

    /// Optional memory capacity across all tenants
    pub max_memory_mb: Option<u64>,

    /// Optional CPU capacity across all tenants
    pub max_cpu_cores: Option<f64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            base_port: 8000,
            port_range: 1000,
            default_requirements: ResourceRequirements::default(),
            max_memory_mb: None,
            max_cpu_cores: None,
        }
    }
}

/// Spend limits applied to tenants without an explicit limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub default_limit: BudgetLimit,
}

/// Circuit breaker and bulkhead settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Fraction of critical components above which failing components are isolated
    pub failure_threshold: f64,

    /// Consecutive failures before a component is considered for isolation
    pub local_failure_threshold: u32,

    /// How long an isolated component is refused
    #[serde(with = "duration_human")]
    pub isolation_timeout: Duration,

    /// Concurrent calls allowed for dependencies without an explicit limit
    pub default_dependency_limit: usize,

    /// Per-dependency concurrency caps
    pub dependency_limits: BTreeMap<String, usize>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            local_failure_threshold: 5,
            isolation_timeout: Duration::from_secs(60),
            default_dependency_limit: 10,
            dependency_limits: BTreeMap::new(),
        }
    }
}

/// Health checking and gradual recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(with = "duration_human")]
    pub health_check_interval: Duration,

    /// Consecutive successful checks required before full traffic
    pub recovery_validation_attempts: u32,

    /// Pause between validation checks
    #[serde(with = "duration_human")]
    pub validation_interval: Duration,

    /// Probe recovering components with partial traffic
    pub gradual_recovery: bool,

    /// Share of traffic routed to a recovering component
    pub recovery_traffic_percentage: f64,

    /// Seed for routing decisions; random when unset
    pub routing_seed: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            recovery_validation_attempts: 3,
            validation_interval: Duration::from_secs(1),
            gradual_recovery: true,
            recovery_traffic_percentage: 0.1,
            routing_seed: None,
        }
    }
}

/// Fallback cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    #[serde(with = "duration_human")]
    pub cache_ttl: Duration,

    /// Longest continuous degraded period before errors propagate
    #[serde(with = "duration_human")]
    pub max_degradation_time: Duration,

    pub cache_capacity: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_degradation_time: Duration::from_secs(1800),
            cache_capacity: 10_000,
        }
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub queue: QueueConfig,
    pub resources: ResourceConfig,
    pub budget: BudgetConfig,
    pub cascade: CascadeConfig,
    pub recovery: RecoveryConfig,
    pub degradation: DegradationConfig,
}

impl OrchestrationConfig {
    /// Parse and validate a config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, picking the format from its extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Reject values the orchestrator cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be at least 1".into(),
            ));
        }

        let res = &self.resources;
        if res.base_port == 0 {
            return Err(ConfigError::Invalid("resources.base_port must be >= 1".into()));
        }
        if res.port_range == 0 || u32::from(res.base_port) + res.port_range > 65_536 {
            return Err(ConfigError::Invalid(format!(
                "port window [{}, {}) must be non-empty and end at or below 65536",
                res.base_port,
                u32::from(res.base_port) + res.port_range
            )));
        }

        self.budget
            .default_limit
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("budget.default_limit: {}", e)))?;

        let cascade = &self.cascade;
        if !(0.0..=1.0).contains(&cascade.failure_threshold) {
            return Err(ConfigError::Invalid(
                "cascade.failure_threshold must be within [0, 1]".into(),
            ));
        }
        if cascade.local_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "cascade.local_failure_threshold must be at least 1".into(),
            ));
        }
        if cascade.default_dependency_limit == 0
            || cascade.dependency_limits.values().any(|&limit| limit == 0)
        {
            return Err(ConfigError::Invalid(
                "dependency limits must be at least 1".into(),
            ));
        }

        let recovery = &self.recovery;
        if recovery.recovery_validation_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery.recovery_validation_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&recovery.recovery_traffic_percentage) {
            return Err(ConfigError::Invalid(
                "recovery.recovery_traffic_percentage must be within [0, 1]".into(),
            ));
        }
        if recovery.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "recovery.health_check_interval must be non-zero".into(),
            ));
        }

        if self.degradation.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "degradation.cache_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = OrchestrationConfig::from_yaml("{}").unwrap();
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.cascade.failure_threshold, 0.5);
        assert_eq!(config.cascade.default_dependency_limit, 10);
        assert_eq!(config.recovery.recovery_validation_attempts, 3);
    }

    #[test]
    fn test_humantime_and_seconds() {
        let yaml = r#"
queue:
  max_concurrent: 3
  shutdown_grace: "2s"
cascade:
  isolation_timeout: 45
  dependency_limits:
    openai: 2
degradation:
  cache_ttl: "1m 30s"
"#;
        let config = OrchestrationConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.queue.max_concurrent, 3);
        assert_eq!(config.queue.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.cascade.isolation_timeout, Duration::from_secs(45));
        assert_eq!(config.cascade.dependency_limits.get("openai"), Some(&2));
        assert_eq!(config.degradation.cache_ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_rejects_port_window_past_u16() {
        let yaml = r#"
resources:
  base_port: 65000
  port_range: 1000
"#;
        let err = OrchestrationConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = OrchestrationConfig::from_json(r#"{"queue": {"max_concurrent": 0}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_rejects_bad_traffic_percentage() {
        let mut config = OrchestrationConfig::default();
        config.recovery.recovery_traffic_percentage = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_yaml() {
        let config = OrchestrationConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = OrchestrationConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.queue.result_ttl, config.queue.result_ttl);
    }
}
