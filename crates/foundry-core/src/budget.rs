//! Spend-based admission control per tenant.
//!
//! Spend is tracked against daily, monthly and lifetime ceilings. Windows
//! follow UTC calendar days and months, and each record counts toward the
//! windows that contain its timestamp. Amounts are accumulated in integer
//! micro-units so repeated additions never drift.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Errors from the budget monitor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("Invalid spending amount: {0}")]
    InvalidAmount(f64),

    #[error("Invalid budget limit: {0}")]
    InvalidLimit(String),
}

/// Spend ceilings for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimit {
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub total_limit: f64,

    /// Utilization at which a limit is flagged, in (0, 1]
    pub warning_threshold: f64,
}

impl Default for BudgetLimit {
    fn default() -> Self {
        Self {
            daily_limit: 10.0,
            monthly_limit: 200.0,
            total_limit: 1000.0,
            warning_threshold: 0.8,
        }
    }
}

impl BudgetLimit {
    /// Limit with the same ceiling for every window.
    pub fn uniform(limit: f64) -> Self {
        Self {
            daily_limit: limit,
            monthly_limit: limit,
            total_limit: limit,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), BudgetError> {
        for (name, value) in [
            ("daily_limit", self.daily_limit),
            ("monthly_limit", self.monthly_limit),
            ("total_limit", self.total_limit),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(BudgetError::InvalidLimit(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            return Err(BudgetError::InvalidLimit(format!(
                "warning_threshold must be within (0, 1], got {}",
                self.warning_threshold
            )));
        }
        Ok(())
    }
}

/// One spend entry. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingRecord {
    pub tenant_id: String,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
}

impl SpendingRecord {
    /// Record stamped with the current time.
    pub fn new(tenant_id: impl Into<String>, amount: f64, task_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            amount,
            timestamp: Utc::now(),
            task_id: task_id.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Spend in each window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendingTotals {
    pub daily: f64,
    pub monthly: f64,
    pub total: f64,
}

/// Per-window flags (warning threshold crossed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFlags {
    pub daily: bool,
    pub monthly: bool,
    pub total: bool,
}

impl WindowFlags {
    pub fn any(&self) -> bool {
        self.daily || self.monthly || self.total
    }
}

/// Budget report for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub tenant_id: String,
    pub current_spending: SpendingTotals,
    pub limits: BudgetLimit,

    /// Spend divided by limit per window
    pub utilization: SpendingTotals,

    pub warnings: WindowFlags,

    /// Any window at or past its warning threshold
    pub warning: bool,

    /// Any window past its limit
    pub exceeded: bool,
}

#[derive(Debug, Default)]
struct TenantLedger {
    records: Vec<SpendingRecord>,
    daily: BTreeMap<NaiveDate, u64>,
    monthly: BTreeMap<(i32, u32), u64>,
    total: u64,
}

impl TenantLedger {
    fn append(&mut self, record: SpendingRecord, micros: u64) {
        let date = record.timestamp.date_naive();
        let day = self.daily.entry(date).or_default();
        *day = day.saturating_add(micros);
        let month = self.monthly.entry((date.year(), date.month())).or_default();
        *month = month.saturating_add(micros);
        self.total = self.total.saturating_add(micros);
        self.records.push(record);
    }

    fn totals_micros(&self, now: DateTime<Utc>) -> (u64, u64, u64) {
        let today = now.date_naive();
        let daily = self.daily.get(&today).copied().unwrap_or(0);
        let monthly = self
            .monthly
            .get(&(today.year(), today.month()))
            .copied()
            .unwrap_or(0);
        (daily, monthly, self.total)
    }
}

/// Tracks spend per tenant and answers admission questions.
pub struct BudgetMonitor {
    default_limit: BudgetLimit,
    limits: RwLock<HashMap<String, BudgetLimit>>,
    ledgers: RwLock<HashMap<String, Arc<Mutex<TenantLedger>>>>,
}

impl BudgetMonitor {
    /// Create a monitor applying `default_limit` to tenants without one.
    pub fn new(default_limit: BudgetLimit) -> Self {
        Self {
            default_limit,
            limits: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// Set a tenant's limits.
    pub fn set_limit(&self, tenant_id: &str, limit: BudgetLimit) -> Result<(), BudgetError> {
        limit.validate()?;
        self.limits.write().insert(tenant_id.to_string(), limit);
        Ok(())
    }

    /// Limits in force for a tenant.
    pub fn limit(&self, tenant_id: &str) -> BudgetLimit {
        self.limits
            .read()
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.default_limit.clone())
    }

    /// Whether a task with `estimated_cost` may start now.
    pub fn can_proceed(&self, tenant_id: &str, estimated_cost: f64) -> bool {
        self.can_proceed_at(tenant_id, estimated_cost, Utc::now())
    }

    /// Admission check evaluated at `now`.
    ///
    /// Each window is checked independently; breaching any one denies.
    pub fn can_proceed_at(&self, tenant_id: &str, estimated_cost: f64, now: DateTime<Utc>) -> bool {
        let Some(estimate) = to_micros(estimated_cost) else {
            return false;
        };
        let limit = self.limit(tenant_id);
        let (daily, monthly, total) = self.totals_micros(tenant_id, now);

        let fits = |spent: u64, ceiling: f64| {
            spent
                .checked_add(estimate)
                .is_some_and(|after| after <= ceiling_micros(ceiling))
        };

        fits(daily, limit.daily_limit)
            && fits(monthly, limit.monthly_limit)
            && fits(total, limit.total_limit)
    }

    /// Append a spend record for its tenant.
    pub fn record_spending(&self, record: SpendingRecord) -> Result<(), BudgetError> {
        let micros = to_micros(record.amount).ok_or(BudgetError::InvalidAmount(record.amount))?;
        let tenant_id = record.tenant_id.clone();
        let now = Utc::now();

        let was_warning = self.status_at(&tenant_id, now).warning;

        let ledger = self.ledger(&tenant_id);
        ledger.lock().append(record, micros);

        let status = self.status_at(&tenant_id, now);
        if status.warning && !was_warning {
            tracing::warn!(
                tenant = %tenant_id,
                daily = status.utilization.daily,
                monthly = status.utilization.monthly,
                total = status.utilization.total,
                "Tenant crossed budget warning threshold"
            );
        }
        Ok(())
    }

    /// Budget report for a tenant.
    pub fn status(&self, tenant_id: &str) -> BudgetStatus {
        self.status_at(tenant_id, Utc::now())
    }

    /// Budget report evaluated at `now`.
    pub fn status_at(&self, tenant_id: &str, now: DateTime<Utc>) -> BudgetStatus {
        let limits = self.limit(tenant_id);
        let (daily, monthly, total) = self.totals_micros(tenant_id, now);

        let current_spending = SpendingTotals {
            daily: from_micros(daily),
            monthly: from_micros(monthly),
            total: from_micros(total),
        };
        let utilization = SpendingTotals {
            daily: utilization(daily, limits.daily_limit),
            monthly: utilization(monthly, limits.monthly_limit),
            total: utilization(total, limits.total_limit),
        };
        let warnings = WindowFlags {
            daily: utilization.daily >= limits.warning_threshold,
            monthly: utilization.monthly >= limits.warning_threshold,
            total: utilization.total >= limits.warning_threshold,
        };
        let exceeded = daily > ceiling_micros(limits.daily_limit)
            || monthly > ceiling_micros(limits.monthly_limit)
            || total > ceiling_micros(limits.total_limit);

        BudgetStatus {
            tenant_id: tenant_id.to_string(),
            current_spending,
            limits,
            utilization,
            warning: warnings.any(),
            warnings,
            exceeded,
        }
    }

    /// All records for a tenant, oldest first.
    pub fn records(&self, tenant_id: &str) -> Vec<SpendingRecord> {
        self.ledgers
            .read()
            .get(tenant_id)
            .map(|l| l.lock().records.clone())
            .unwrap_or_default()
    }

    /// Lifetime spend across all tenants.
    pub fn total_spending(&self) -> f64 {
        let micros = self
            .ledgers
            .read()
            .values()
            .fold(0u64, |acc, l| acc.saturating_add(l.lock().total));
        from_micros(micros)
    }

    fn ledger(&self, tenant_id: &str) -> Arc<Mutex<TenantLedger>> {
        if let Some(ledger) = self.ledgers.read().get(tenant_id) {
            return Arc::clone(ledger);
        }
        Arc::clone(
            self.ledgers
                .write()
                .entry(tenant_id.to_string())
                .or_default(),
        )
    }

    fn totals_micros(&self, tenant_id: &str, now: DateTime<Utc>) -> (u64, u64, u64) {
        let ledger = self.ledgers.read().get(tenant_id).cloned();
        ledger
            .map(|l| l.lock().totals_micros(now))
            .unwrap_or((0, 0, 0))
    }
}

impl Default for BudgetMonitor {
    fn default() -> Self {
        Self::new(BudgetLimit::default())
    }
}

fn to_micros(amount: f64) -> Option<u64> {
    if amount.is_finite() && amount >= 0.0 {
        Some((amount * MICROS_PER_UNIT).round() as u64)
    } else {
        None
    }
}

fn ceiling_micros(limit: f64) -> u64 {
    (limit.max(0.0) * MICROS_PER_UNIT).round() as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

fn utilization(spent: u64, limit: f64) -> f64 {
    let ceiling = ceiling_micros(limit);
    if ceiling == 0 {
        if spent > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        spent as f64 / ceiling as f64
    }
}
