//! Background compression maintenance
//!
//! The compression layer defers dictionary training and row migration to an
//! explicit maintenance call. This worker runs that call on a fixed period
//! with a bounded time budget, on its own store handle: writers and the
//! maintenance step only ever contend on SQLite's own transaction locking,
//! never on a shared in-process handle.

use std::time::Duration;

use crate::storage::WorkStore;

/// Tuning for the periodic maintenance task.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Sleep between maintenance invocations.
    pub interval: Duration,
    /// Wall-clock budget each invocation may spend.
    pub budget: Duration,
    /// Database-load fraction the maintenance aims for.
    pub target_load: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            budget: Duration::from_secs(60),
            target_load: 0.75,
        }
    }
}

/// Runs bounded incremental maintenance forever.
///
/// Each step runs on the blocking pool so the budget never stalls the async
/// runtime; a failed step is logged and retried on the next period.
pub async fn worker(store: WorkStore, config: MaintenanceConfig) {
    let mut store = store;
    loop {
        let budget = config.budget;
        let target_load = config.target_load;
        let step = tokio::task::spawn_blocking(move || {
            if let Err(error) = store.incremental_maintenance(budget, target_load) {
                tracing::warn!("incremental maintenance failed: {error}");
            }
            store
        })
        .await;

        match step {
            Ok(returned) => store = returned,
            Err(error) => {
                tracing::error!("maintenance task aborted: {error}");
                return;
            }
        }

        tokio::time::sleep(config.interval).await;
    }
}
