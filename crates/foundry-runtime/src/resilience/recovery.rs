//! Automatic recovery of isolated components.
//!
//! A background loop health-checks every Critical component. A component
//! that answers healthy moves to Recovery and is probed with partial
//! traffic while `recovery_validation_attempts` further checks run; only
//! if all of them pass does it return to full traffic.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foundry_core::RecoveryConfig;

use super::cascade::{CascadeProtection, ComponentState};
use crate::operation::HealthCheck;

/// Result of recovering one component during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Health check still failing; component stays Critical
    StillCritical,

    /// Validation passed; component is Healthy
    Recovered,

    /// Healthy once, then a validation check failed
    ValidationFailed,
}

/// Restores Critical components once they validate as healthy.
pub struct AutoRecovery {
    config: RecoveryConfig,
    cascade: Arc<CascadeProtection>,
    health_checks: RwLock<HashMap<String, Arc<dyn HealthCheck>>>,
    traffic: RwLock<HashMap<String, f64>>,
    rng: Mutex<StdRng>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AutoRecovery {
    pub fn new(config: RecoveryConfig, cascade: Arc<CascadeProtection>) -> Self {
        let rng = match config.routing_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            cascade,
            health_checks: RwLock::new(HashMap::new()),
            traffic: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            monitor: Mutex::new(None),
        }
    }

    /// Register the health check for a component, replacing any previous one.
    pub fn register_health_check(&self, component: &str, check: Arc<dyn HealthCheck>) {
        self.cascade.register_component(component);
        self.health_checks
            .write()
            .insert(component.to_string(), check);
    }

    /// Whether a call should be routed to the component right now.
    ///
    /// Healthy always routes; Recovery routes with probability
    /// `recovery_traffic_percentage` when gradual recovery is enabled;
    /// Critical never routes.
    pub fn should_route_to_component(&self, component: &str) -> bool {
        match self.cascade.state(component) {
            ComponentState::Healthy => true,
            ComponentState::Recovery if self.config.gradual_recovery => {
                let fraction = self.traffic_fraction(component);
                self.rng.lock().gen::<f64>() < fraction
            }
            _ => false,
        }
    }

    /// Share of traffic currently allowed to the component.
    ///
    /// Follows the cascade state; the stored fraction only applies while
    /// the component is in Recovery.
    pub fn traffic_fraction(&self, component: &str) -> f64 {
        match self.cascade.state(component) {
            ComponentState::Healthy => 1.0,
            ComponentState::Recovery => self
                .traffic
                .read()
                .get(component)
                .copied()
                .unwrap_or(0.0),
            ComponentState::Critical => 0.0,
        }
    }

    /// Traffic fractions of every component recovery has touched.
    pub fn recovery_states(&self) -> BTreeMap<String, f64> {
        let names: Vec<String> = self.traffic.read().keys().cloned().collect();
        names
            .into_iter()
            .map(|name| {
                let fraction = self.traffic_fraction(&name);
                (name, fraction)
            })
            .collect()
    }

    /// One pass over all Critical components.
    pub async fn run_tick(&self) -> BTreeMap<String, RecoveryOutcome> {
        let candidates: Vec<(String, Arc<dyn HealthCheck>)> = {
            let checks = self.health_checks.read();
            self.cascade
                .components_in(ComponentState::Critical)
                .into_iter()
                .filter_map(|name| checks.get(&name).map(|c| (name, Arc::clone(c))))
                .collect()
        };

        let outcomes = join_all(
            candidates
                .iter()
                .map(|(name, check)| self.recover(name, check.as_ref())),
        )
        .await;

        candidates
            .into_iter()
            .map(|(name, _)| name)
            .zip(outcomes)
            .collect()
    }

    async fn recover(&self, component: &str, check: &dyn HealthCheck) -> RecoveryOutcome {
        if !check.check().await {
            return RecoveryOutcome::StillCritical;
        }
        if !self.cascade.begin_recovery(component) {
            return RecoveryOutcome::StillCritical;
        }

        let initial = if self.config.gradual_recovery {
            self.config.recovery_traffic_percentage
        } else {
            0.0
        };
        self.traffic.write().insert(component.to_string(), initial);
        tracing::info!(component, traffic = initial, "Component entering recovery");

        for attempt in 0..self.config.recovery_validation_attempts {
            if attempt > 0 && !self.config.validation_interval.is_zero() {
                tokio::time::sleep(self.config.validation_interval).await;
            }
            if !check.check().await {
                self.cascade
                    .fail_recovery(component, self.config.health_check_interval);
                self.traffic.write().insert(component.to_string(), 0.0);
                tracing::warn!(
                    component,
                    attempt = attempt + 1,
                    required = self.config.recovery_validation_attempts,
                    "Recovery validation failed"
                );
                return RecoveryOutcome::ValidationFailed;
            }
        }

        self.cascade.complete_recovery(component);
        self.traffic.write().insert(component.to_string(), 1.0);
        tracing::info!(component, "Component recovered and restored to full traffic");
        RecoveryOutcome::Recovered
    }

    /// Start the background health-check loop. No-op if already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let outcomes = this.run_tick().await;
                        if !outcomes.is_empty() {
                            tracing::debug!(?outcomes, "Recovery tick complete");
                        }
                    }
                }
            }
        });

        tracing::info!(interval = ?self.config.health_check_interval, "Recovery monitoring started");
        *monitor = Some((token, handle));
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let Some((token, handle)) = self.monitor.lock().take() else {
            return;
        };
        token.cancel();
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                tracing::error!(error = %err, "Recovery monitor panicked");
            }
        }
        tracing::info!("Recovery monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::health_check_fn;
    use foundry_core::CascadeConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn isolate(cascade: &CascadeProtection, component: &str) {
        for _ in 0..cascade.config().local_failure_threshold {
            cascade.record_failure(component);
        }
        assert_eq!(cascade.state(component), ComponentState::Critical);
    }

    fn setup(config: RecoveryConfig) -> (Arc<CascadeProtection>, Arc<AutoRecovery>) {
        let cascade = Arc::new(CascadeProtection::new(CascadeConfig {
            local_failure_threshold: 2,
            ..Default::default()
        }));
        let recovery = Arc::new(AutoRecovery::new(config, Arc::clone(&cascade)));
        (cascade, recovery)
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            health_check_interval: Duration::from_secs(5),
            recovery_validation_attempts: 3,
            validation_interval: Duration::ZERO,
            routing_seed: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_full_validation() {
        let (cascade, recovery) = setup(fast_config());
        recovery.register_health_check("openai", Arc::new(health_check_fn(|| true)));
        isolate(&cascade, "openai");

        let outcomes = recovery.run_tick().await;
        assert_eq!(outcomes["openai"], RecoveryOutcome::Recovered);
        assert_eq!(cascade.state("openai"), ComponentState::Healthy);
        assert!(cascade.is_available("openai"));
        assert_eq!(recovery.traffic_fraction("openai"), 1.0);
        assert!(recovery.should_route_to_component("openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reisolation_after_recovery_drops_traffic() {
        let (cascade, recovery) = setup(fast_config());
        recovery.register_health_check("openai", Arc::new(health_check_fn(|| true)));
        isolate(&cascade, "openai");
        recovery.run_tick().await;
        assert_eq!(recovery.recovery_states()["openai"], 1.0);

        isolate(&cascade, "openai");
        assert_eq!(recovery.traffic_fraction("openai"), 0.0);
        assert_eq!(recovery.recovery_states()["openai"], 0.0);
        assert!(!recovery.should_route_to_component("openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_validation_stays_critical() {
        let (cascade, recovery) = setup(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // Healthy on the first probe, failing from the second on.
        recovery.register_health_check(
            "openai",
            Arc::new(health_check_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst) == 0
            })),
        );
        isolate(&cascade, "openai");

        let outcomes = recovery.run_tick().await;
        assert_eq!(outcomes["openai"], RecoveryOutcome::ValidationFailed);
        assert_eq!(cascade.state("openai"), ComponentState::Critical);
        assert!(!cascade.is_available("openai"));
        assert_eq!(recovery.traffic_fraction("openai"), 0.0);
        assert!(!recovery.should_route_to_component("openai"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_component_untouched() {
        let (cascade, recovery) = setup(fast_config());
        recovery.register_health_check("db", Arc::new(health_check_fn(|| false)));
        isolate(&cascade, "db");

        let outcomes = recovery.run_tick().await;
        assert_eq!(outcomes["db"], RecoveryOutcome::StillCritical);
        assert_eq!(cascade.state("db"), ComponentState::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_components_without_checks_are_skipped() {
        let (cascade, recovery) = setup(fast_config());
        isolate(&cascade, "templates");
        assert!(recovery.run_tick().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gradual_traffic_during_validation() {
        let config = RecoveryConfig {
            validation_interval: Duration::from_secs(1),
            recovery_traffic_percentage: 0.25,
            ..fast_config()
        };
        let (cascade, recovery) = setup(config);
        recovery.register_health_check("openai", Arc::new(health_check_fn(|| true)));
        isolate(&cascade, "openai");

        let worker = Arc::clone(&recovery);
        let tick = tokio::spawn(async move { worker.run_tick().await });

        // Let the tick reach its first validation pause.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cascade.state("openai"), ComponentState::Recovery);
        assert_eq!(recovery.traffic_fraction("openai"), 0.25);

        let routed = (0..1000)
            .filter(|_| recovery.should_route_to_component("openai"))
            .count();
        assert!(routed > 150 && routed < 350, "routed {} of 1000", routed);

        let outcomes = tick.await.unwrap();
        assert_eq!(outcomes["openai"], RecoveryOutcome::Recovered);
        assert_eq!(recovery.traffic_fraction("openai"), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_routing_is_deterministic() {
        let decisions = |seed| async move {
            let (cascade, recovery) = setup(RecoveryConfig {
                routing_seed: Some(seed),
                ..fast_config()
            });
            isolate(&cascade, "x");
            cascade.begin_recovery("x");
            recovery.traffic.write().insert("x".to_string(), 0.5);
            (0..64)
                .map(|_| recovery.should_route_to_component("x"))
                .collect::<Vec<_>>()
        };
        assert_eq!(decisions(42).await, decisions(42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_routing_in_recovery_without_gradual_mode() {
        let (cascade, recovery) = setup(RecoveryConfig {
            gradual_recovery: false,
            ..fast_config()
        });
        isolate(&cascade, "x");
        cascade.begin_recovery("x");
        assert!(!recovery.should_route_to_component("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_loop_recovers_component() {
        let (cascade, recovery) = setup(fast_config());
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);
        recovery.register_health_check(
            "openai",
            Arc::new(health_check_fn(move || flag.load(Ordering::SeqCst))),
        );
        isolate(&cascade, "openai");

        recovery.start_monitoring();
        assert!(recovery.is_monitoring());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cascade.state("openai"), ComponentState::Critical);

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cascade.state("openai"), ComponentState::Healthy);

        recovery.stop_monitoring().await;
        assert!(!recovery.is_monitoring());
    }
}
