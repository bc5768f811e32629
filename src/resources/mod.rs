//! Shared Resources Module
//!
//! State shared by every step of every execution on an engine:
//!
//! - [`budget`]: Consumable usage quota
//! - [`cache`]: LRU result cache
//! - [`optimizer`]: Memoized text transformation pipeline

pub mod budget;
pub mod cache;
pub mod optimizer;

use std::sync::Arc;

pub use budget::{Budget, BudgetExceeded, BudgetPeriod, BudgetTracker};
pub use cache::{cache_key, CacheEntry, CacheStats, ResultCache, DEFAULT_CACHE_CAPACITY};
pub use optimizer::{estimate_tokens, Optimized, Optimizer, Savings, Transform};

/// Handles to the budget and optimizer, cloned into every step context.
#[derive(Debug, Clone)]
pub struct SharedResources {
    pub budget: Arc<BudgetTracker>,
    pub optimizer: Arc<Optimizer>,
}

impl SharedResources {
    pub fn new(budget: Arc<BudgetTracker>, optimizer: Arc<Optimizer>) -> Self {
        Self { budget, optimizer }
    }

    /// The cache behind the optimizer.
    pub fn cache(&self) -> &Arc<ResultCache> {
        self.optimizer.cache()
    }
}

impl Default for SharedResources {
    fn default() -> Self {
        Self {
            budget: Arc::new(BudgetTracker::unlimited()),
            optimizer: Arc::new(Optimizer::new(Arc::new(ResultCache::default()))),
        }
    }
}
