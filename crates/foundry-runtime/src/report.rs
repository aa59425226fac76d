//! Point-in-time resilience view across all components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::processor::ProcessorStats;
use crate::resilience::{AutoRecovery, CascadeProtection, ComponentSnapshot};

/// Serializable health summary of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceReport {
    /// Health of every known component
    pub components: BTreeMap<String, ComponentSnapshot>,

    /// Traffic fraction per component that has been through recovery
    pub recovery_traffic: BTreeMap<String, f64>,

    /// Completed / finished tasks
    pub success_rate: f64,

    /// Available components / known components (1.0 when none are known)
    pub availability_rate: f64,

    /// Share of components currently Critical
    pub failure_rate: f64,

    pub processor: ProcessorStats,

    pub generated_at: DateTime<Utc>,
}

impl ResilienceReport {
    pub fn collect(
        cascade: &CascadeProtection,
        recovery: &AutoRecovery,
        stats: ProcessorStats,
    ) -> Self {
        let components = cascade.snapshot();
        let available = components.values().filter(|c| c.available).count();
        let availability_rate = if components.is_empty() {
            1.0
        } else {
            available as f64 / components.len() as f64
        };

        Self {
            components,
            recovery_traffic: recovery.recovery_states(),
            success_rate: stats.success_rate,
            availability_rate,
            failure_rate: cascade.failure_rate(),
            processor: stats,
            generated_at: Utc::now(),
        }
    }

    /// Components that currently refuse traffic.
    pub fn unavailable(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| !c.available)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
