//! Cascade protection: per-component circuit breaking plus bulkheads.
//!
//! A component that keeps failing is isolated only when the failure is
//! widespread, i.e. when the share of critical components (counting the
//! one that just crossed its local threshold) exceeds `failure_threshold`.
//! The share is taken over every registered component, exercised or not.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use foundry_core::CascadeConfig;

use super::bulkhead::{Bulkhead, DependencyPermit};

/// Health of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    #[default]
    Healthy,
    Critical,
    Recovery,
}

#[derive(Debug, Clone, Default)]
struct ComponentHealth {
    state: ComponentState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    isolated_until: Option<Instant>,
}

impl ComponentHealth {
    fn isolated_at(&self, now: Instant) -> bool {
        self.isolated_until.is_some_and(|until| now < until)
    }
}

/// Point-in-time view of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub state: ComponentState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub available: bool,

    /// Remaining isolation, if any
    pub isolated_for_ms: Option<u64>,
}

/// Circuit breaker over named components with per-dependency bulkheads.
pub struct CascadeProtection {
    config: CascadeConfig,
    components: RwLock<HashMap<String, Arc<Mutex<ComponentHealth>>>>,
    bulkhead: Bulkhead,
}

impl CascadeProtection {
    pub fn new(config: CascadeConfig) -> Self {
        let bulkhead = Bulkhead::new(
            config.default_dependency_limit,
            config.dependency_limits.clone(),
        );
        Self {
            config,
            components: RwLock::new(HashMap::new()),
            bulkhead,
        }
    }

    /// Make a component known so it counts toward the failure share.
    pub fn register_component(&self, component: &str) {
        self.entry(component);
    }

    /// Whether calls to the component should be attempted.
    ///
    /// Isolation expires lazily here; the component stays Critical until a
    /// success or a recovery validation clears it.
    pub fn is_available(&self, component: &str) -> bool {
        let Some(entry) = self.components.read().get(component).cloned() else {
            return true;
        };
        let health = entry.lock();
        !health.isolated_at(Instant::now())
    }

    /// Record a failed call.
    pub fn record_failure(&self, component: &str) {
        let entry = self.entry(component);

        let crossed = {
            let mut health = entry.lock();
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.total_failures += 1;
            if health.state == ComponentState::Recovery {
                // Recovery validation owns the verdict for this component.
                return;
            }
            health.consecutive_failures >= self.config.local_failure_threshold
        };
        if !crossed {
            return;
        }

        let share = self.critical_share_with(component);
        if share <= self.config.failure_threshold {
            tracing::debug!(
                component,
                share,
                threshold = self.config.failure_threshold,
                "Component failing but cascade threshold not reached"
            );
            return;
        }

        let mut health = entry.lock();
        // A success or recovery may have landed while the share was computed.
        if health.state == ComponentState::Recovery
            || health.consecutive_failures < self.config.local_failure_threshold
        {
            return;
        }
        health.state = ComponentState::Critical;
        health.isolated_until = Some(Instant::now() + self.config.isolation_timeout);
        tracing::warn!(
            component,
            failures = health.consecutive_failures,
            share,
            timeout = ?self.config.isolation_timeout,
            "Component isolated to prevent cascade failure"
        );
    }

    /// Record a successful call.
    pub fn record_success(&self, component: &str) {
        let entry = self.entry(component);
        let mut health = entry.lock();
        health.consecutive_failures = 0;
        health.total_successes += 1;
        health.isolated_until = None;
        if health.state == ComponentState::Critical {
            health.state = ComponentState::Healthy;
            tracing::info!(component, "Component recovered on successful call");
        }
    }

    /// Current state of a component (Healthy if unknown).
    pub fn state(&self, component: &str) -> ComponentState {
        self.components
            .read()
            .get(component)
            .map(|e| e.lock().state)
            .unwrap_or_default()
    }

    /// Components currently in `state`, sorted by name.
    pub fn components_in(&self, state: ComponentState) -> Vec<String> {
        let mut names: Vec<String> = self
            .components
            .read()
            .iter()
            .filter(|(_, e)| e.lock().state == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Share of registered components that are Critical.
    pub fn failure_rate(&self) -> f64 {
        let components = self.components.read();
        if components.is_empty() {
            return 0.0;
        }
        let critical = components
            .values()
            .filter(|e| e.lock().state == ComponentState::Critical)
            .count();
        critical as f64 / components.len() as f64
    }

    /// Health of every known component.
    pub fn snapshot(&self) -> BTreeMap<String, ComponentSnapshot> {
        let now = Instant::now();
        self.components
            .read()
            .iter()
            .map(|(name, entry)| {
                let health = entry.lock();
                let remaining = health
                    .isolated_until
                    .filter(|until| now < *until)
                    .map(|until| (until - now).as_millis() as u64);
                (
                    name.clone(),
                    ComponentSnapshot {
                        state: health.state,
                        consecutive_failures: health.consecutive_failures,
                        total_failures: health.total_failures,
                        total_successes: health.total_successes,
                        available: remaining.is_none(),
                        isolated_for_ms: remaining,
                    },
                )
            })
            .collect()
    }

    /// Take a bulkhead slot. Never blocks.
    pub fn acquire_dependency_limit(&self, dependency: &str) -> bool {
        self.bulkhead.acquire(dependency)
    }

    /// Return a bulkhead slot.
    pub fn release_dependency_limit(&self, dependency: &str) {
        self.bulkhead.release(dependency)
    }

    /// Bulkhead slot released on drop.
    pub fn try_dependency_permit(&self, dependency: &str) -> Option<DependencyPermit> {
        self.bulkhead.try_permit(dependency)
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Move a Critical component into Recovery. Returns false otherwise.
    pub(crate) fn begin_recovery(&self, component: &str) -> bool {
        let Some(entry) = self.components.read().get(component).cloned() else {
            return false;
        };
        let mut health = entry.lock();
        if health.state != ComponentState::Critical {
            return false;
        }
        health.state = ComponentState::Recovery;
        health.isolated_until = None;
        true
    }

    /// Promote a recovering component to Healthy.
    pub(crate) fn complete_recovery(&self, component: &str) {
        let entry = self.entry(component);
        let mut health = entry.lock();
        health.state = ComponentState::Healthy;
        health.consecutive_failures = 0;
        health.isolated_until = None;
    }

    /// Send a recovering component back to Critical, isolated for `isolate_for`.
    pub(crate) fn fail_recovery(&self, component: &str, isolate_for: Duration) {
        let entry = self.entry(component);
        let mut health = entry.lock();
        health.state = ComponentState::Critical;
        health.isolated_until = Some(Instant::now() + isolate_for);
    }

    fn critical_share_with(&self, component: &str) -> f64 {
        let components = self.components.read();
        if components.is_empty() {
            return 0.0;
        }
        let critical = components
            .iter()
            .filter(|(name, e)| {
                name.as_str() == component || e.lock().state == ComponentState::Critical
            })
            .count();
        critical as f64 / components.len() as f64
    }

    fn entry(&self, component: &str) -> Arc<Mutex<ComponentHealth>> {
        if let Some(entry) = self.components.read().get(component) {
            return Arc::clone(entry);
        }
        Arc::clone(
            self.components
                .write()
                .entry(component.to_string())
                .or_default(),
        )
    }
}

impl Default for CascadeProtection {
    fn default() -> Self {
        Self::new(CascadeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(local: u32, timeout_secs: u64) -> CascadeConfig {
        CascadeConfig {
            local_failure_threshold: local,
            isolation_timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_isolate_component() {
        let cascade = CascadeProtection::default();

        for _ in 0..6 {
            cascade.record_failure("openai");
        }
        assert_eq!(cascade.state("openai"), ComponentState::Critical);
        assert!(!cascade.is_available("openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolation_expires_lazily() {
        let cascade = CascadeProtection::new(config(2, 60));
        cascade.record_failure("openai");
        cascade.record_failure("openai");
        assert!(!cascade.is_available("openai"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cascade.is_available("openai"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cascade.is_available("openai"));
        // Still Critical until validated or a call succeeds.
        assert_eq!(cascade.state("openai"), ComponentState::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_only_when_failure_is_widespread() {
        let cascade = CascadeProtection::new(config(2, 60));
        for name in ["a", "b", "c", "d"] {
            cascade.register_component(name);
        }

        // 1 of 4 failing is not widespread.
        cascade.record_failure("a");
        cascade.record_failure("a");
        assert!(cascade.is_available("a"));
        assert_eq!(cascade.state("a"), ComponentState::Healthy);

        // A second failing component is still counted alone while the first
        // one is not Critical.
        cascade.record_failure("b");
        cascade.record_failure("b");
        assert!(cascade.is_available("b"));

        // Drop the threshold so the next failure tips it over.
        let cascade = CascadeProtection::new(CascadeConfig {
            failure_threshold: 0.2,
            ..config(2, 60)
        });
        for name in ["a", "b", "c", "d"] {
            cascade.register_component(name);
        }
        cascade.record_failure("a");
        cascade.record_failure("a");
        assert!(!cascade.is_available("a"));
        assert!(cascade.is_available("b"));
        assert_eq!(cascade.failure_rate(), 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_isolation() {
        let cascade = CascadeProtection::new(config(1, 60));
        cascade.record_failure("templates");
        assert!(!cascade.is_available("templates"));

        cascade.record_success("templates");
        assert!(cascade.is_available("templates"));
        assert_eq!(cascade.state("templates"), ComponentState::Healthy);
        assert_eq!(cascade.snapshot()["templates"].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cascade = CascadeProtection::new(config(3, 60));
        cascade.record_failure("x");
        cascade.record_failure("x");
        cascade.record_success("x");
        cascade.record_failure("x");
        cascade.record_failure("x");
        assert!(cascade.is_available("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_expiry_reisolates() {
        let cascade = CascadeProtection::new(config(2, 10));
        cascade.record_failure("x");
        cascade.record_failure("x");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cascade.is_available("x"));

        cascade.record_failure("x");
        assert!(!cascade.is_available("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_transitions() {
        let cascade = CascadeProtection::new(config(1, 60));
        assert!(!cascade.begin_recovery("x"));

        cascade.record_failure("x");
        assert!(cascade.begin_recovery("x"));
        assert_eq!(cascade.state("x"), ComponentState::Recovery);
        assert!(cascade.is_available("x"));

        // Failures during recovery do not re-isolate on their own.
        cascade.record_failure("x");
        assert_eq!(cascade.state("x"), ComponentState::Recovery);

        cascade.fail_recovery("x", Duration::from_secs(5));
        assert_eq!(cascade.state("x"), ComponentState::Critical);
        assert!(!cascade.is_available("x"));

        cascade.complete_recovery("x");
        assert_eq!(cascade.state("x"), ComponentState::Healthy);
        assert!(cascade.is_available("x"));
    }

    #[test]
    fn test_concurrent_success_never_leaves_stale_isolation() {
        let cascade = CascadeProtection::new(config(3, 60));
        cascade.register_component("openai");

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..20_000 {
                    cascade.record_failure("openai");
                }
            });
            scope.spawn(|| {
                for _ in 0..20_000 {
                    cascade.record_success("openai");
                    let snapshot = cascade.snapshot();
                    let health = &snapshot["openai"];
                    if health.state == ComponentState::Critical {
                        assert!(health.consecutive_failures >= 3, "{:?}", health);
                    }
                }
            });
        });

        cascade.record_success("openai");
        assert_eq!(cascade.state("openai"), ComponentState::Healthy);
        assert!(cascade.is_available("openai"));
    }

    #[test]
    fn test_unknown_component_is_available() {
        let cascade = CascadeProtection::default();
        assert!(cascade.is_available("never-seen"));
        assert_eq!(cascade.state("never-seen"), ComponentState::Healthy);
        assert!(cascade.snapshot().is_empty());
    }

    #[test]
    fn test_dependency_limits() {
        let cascade = CascadeProtection::new(CascadeConfig {
            dependency_limits: BTreeMap::from([("openai".to_string(), 1)]),
            ..Default::default()
        });
        assert!(cascade.acquire_dependency_limit("openai"));
        assert!(!cascade.acquire_dependency_limit("openai"));
        cascade.release_dependency_limit("openai");
        assert!(cascade.acquire_dependency_limit("openai"));
    }
}
