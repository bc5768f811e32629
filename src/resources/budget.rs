//! Usage Budget
//!
//! A consumable quota (e.g. model tokens) shared by every step of every
//! execution on an engine. Increments are checked and applied under one
//! lock, so concurrent steps can never overdraw the budget.

use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when an increment would push usage past the limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Budget exceeded: requested {requested}, remaining {remaining} of {limit}")]
pub struct BudgetExceeded {
    /// Amount that was asked for
    pub requested: u64,
    /// Amount left when the request was rejected
    pub remaining: u64,
    /// Configured limit
    pub limit: u64,
}

/// Window a budget's usage is accounted against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Hourly,
    #[default]
    Daily,
    Monthly,
}

impl BudgetPeriod {
    /// Returns the start of the window containing `at`.
    pub fn window_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let start = match self {
            Self::Hourly => Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0),
            Self::Daily => Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0),
            Self::Monthly => Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0),
        };
        start.single().unwrap_or(at)
    }
}

impl FromStr for BudgetPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown budget period '{}' (expected hourly, daily or monthly)", other)),
        }
    }
}

/// Snapshot of a budget.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub period: BudgetPeriod,
    /// Start of the window the current usage belongs to
    pub period_start: DateTime<Utc>,
}

impl Budget {
    fn new(limit: u64, period: BudgetPeriod, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            used: 0,
            remaining: limit,
            period,
            period_start: period.window_start(now),
        }
    }
}

/// Thread-safe budget shared across concurrently running steps.
#[derive(Debug)]
pub struct BudgetTracker {
    inner: Mutex<Budget>,
}

impl BudgetTracker {
    /// Creates a budget with the given limit and accounting period.
    pub fn new(limit: u64, period: BudgetPeriod) -> Self {
        Self {
            inner: Mutex::new(Budget::new(limit, period, Utc::now())),
        }
    }

    /// Creates a budget that never rejects.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX, BudgetPeriod::default())
    }

    /// Consumes `amount` from the budget.
    ///
    /// The check and the update happen under the same lock; a rejected
    /// request leaves `used` and `remaining` untouched.
    pub fn track_usage(&self, amount: u64) -> Result<Budget, BudgetExceeded> {
        let mut budget = self.lock();

        if budget.remaining < amount {
            warn!(
                "Budget rejected {} (used {}/{}, {:?})",
                amount, budget.used, budget.limit, budget.period
            );
            return Err(BudgetExceeded {
                requested: amount,
                remaining: budget.remaining,
                limit: budget.limit,
            });
        }

        budget.remaining -= amount;
        budget.used += amount;
        debug!("Budget used {} ({}/{})", amount, budget.used, budget.limit);

        Ok(budget.clone())
    }

    /// Returns true if `amount` would currently be accepted.
    pub fn can_afford(&self, amount: u64) -> bool {
        self.lock().remaining >= amount
    }

    /// Returns the current state of the budget.
    pub fn snapshot(&self) -> Budget {
        self.lock().clone()
    }

    /// Clears usage and starts a new window at `now`.
    pub fn reset_at(&self, now: DateTime<Utc>) {
        let mut budget = self.lock();
        *budget = Budget::new(budget.limit, budget.period, now);
        info!("Budget reset ({:?}, limit {})", budget.period, budget.limit);
    }

    /// Clears usage unconditionally.
    pub fn reset(&self) {
        self.reset_at(Utc::now());
    }

    /// Clears usage only if `now` falls into a later period window.
    ///
    /// Returns true if the budget was reset.
    pub fn reset_if_period_elapsed(&self, now: DateTime<Utc>) -> bool {
        let mut budget = self.lock();
        let window = budget.period.window_start(now);

        if window <= budget.period_start {
            return false;
        }

        *budget = Budget::new(budget.limit, budget.period, now);
        info!("Budget period rolled over to {}", window);
        true
    }

    /// Changes the limit, keeping current usage.
    pub fn set_limit(&self, limit: u64) {
        let mut budget = self.lock();
        budget.limit = limit;
        budget.remaining = limit.saturating_sub(budget.used);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Budget> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::unlimited()
    }
}
