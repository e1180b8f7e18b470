//! Timeout reconciler.
//!
//! Sweeps expired watchdog deadlines and force-fails runs that never
//! left `pending`. A run that reached `processing` has a live executor
//! responsible for its terminal state and is left alone. Deadlines are
//! marked processed whatever the outcome, so a sweep never revisits them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::Result;
use crate::model::RunStatus;
use crate::store::Store;

pub const TEST_RUN_TIMEOUT_MESSAGE: &str =
    "test run exceeded its execution deadline and was failed by the watchdog";
pub const FULL_RUN_TIMEOUT_MESSAGE: &str =
    "full run exceeded its execution deadline and was failed by the watchdog";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired deadlines examined.
    pub examined: usize,
    /// Runs force-failed out of `pending`.
    pub force_failed: usize,
    /// Runs that had already reached a terminal state or were processing.
    pub left_alone: usize,
    /// Deadlines whose run row was missing.
    pub orphaned: usize,
}

/// Process every expired, unprocessed deadline as of `now`, oldest first.
pub fn sweep_once(store: &Store, now: DateTime<Utc>) -> Result<SweepStats> {
    let mut stats = SweepStats::default();

    for deadline in store.expired_unprocessed_deadlines(now)? {
        stats.examined += 1;

        match store.get_run(&deadline.run_id)? {
            None => {
                tracing::warn!(
                    "deadline {} points at missing run {}",
                    deadline.id,
                    deadline.run_id
                );
                stats.orphaned += 1;
            }
            Some(run) if run.status == RunStatus::Pending => {
                let message = if run.is_test_run {
                    TEST_RUN_TIMEOUT_MESSAGE
                } else {
                    FULL_RUN_TIMEOUT_MESSAGE
                };
                // Re-checked by the guarded update: if an executor claimed
                // or finished the run since the read, the force-fail loses.
                let applied = store.update_run_status_if(
                    &run.id,
                    &[RunStatus::Pending],
                    RunStatus::Failed,
                    Some(message),
                )?;
                if applied {
                    tracing::info!("force-failed expired run {}", run.id);
                    stats.force_failed += 1;
                } else {
                    stats.left_alone += 1;
                }
            }
            Some(_) => {
                stats.left_alone += 1;
            }
        }

        store.mark_deadline_processed(&deadline.id, now)?;
    }

    Ok(stats)
}

/// Spawn the periodic sweep until shutdown is signaled.
pub fn spawn(
    store: Arc<Store>,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "timeout reconciler started, sweeping every {}s",
            interval.as_secs()
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("timeout reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match sweep_once(&store, Utc::now()) {
                        Ok(stats) if stats.examined > 0 => {
                            tracing::info!(
                                "sweep examined {} deadline(s): {} force-failed, {} left alone, {} orphaned",
                                stats.examined,
                                stats.force_failed,
                                stats.left_alone,
                                stats.orphaned
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("timeout sweep failed: {e}");
                        }
                    }
                }
            }
        }
    })
}
