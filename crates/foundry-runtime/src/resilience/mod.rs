//! Resilience patterns for foundry-runtime.
//!
//! This module provides:
//! - Cascade protection (circuit breaker across components)
//! - Bulkheads capping concurrent calls per dependency
//! - Graceful degradation with a fallback cache
//! - Automatic recovery with gradual traffic ramp-up

mod bulkhead;
mod cascade;
mod degradation;
mod recovery;

pub use bulkhead::{Bulkhead, DependencyPermit};
pub use cascade::{CascadeProtection, ComponentSnapshot, ComponentState};
pub use degradation::{DegradedResponse, GracefulDegradation};
pub use recovery::{AutoRecovery, RecoveryOutcome};
