//! Run ledger: execution records with watchdog deadlines.
//!
//! Every run is created `pending` together with its deadline row in one
//! transaction. Executors claim runs with a compare-and-set transition,
//! so a run the reconciler already force-failed can never be claimed.

pub mod reconciler;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::model::{RunRecord, RunStatus, TimeoutDeadline};
use crate::store::Store;

pub struct RunLedger {
    store: Arc<Store>,
    test_run_timeout: ChronoDuration,
    full_run_timeout: ChronoDuration,
}

impl RunLedger {
    pub fn new(store: Arc<Store>, config: &PipelineConfig) -> Self {
        Self {
            store,
            test_run_timeout: ChronoDuration::from_std(config.test_run_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            full_run_timeout: ChronoDuration::from_std(config.full_run_timeout)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }

    /// Create a pending run and its deadline.
    ///
    /// A full run is only allowed once the program has a completed test
    /// run on record.
    pub fn create_run(
        &self,
        program_id: &str,
        user_id: &str,
        is_test_run: bool,
        config_snapshot: serde_json::Value,
    ) -> Result<RunRecord> {
        let program = self.store.get_program(program_id)?.ok_or_else(|| {
            PipelineError::precondition(format!("program {program_id} does not exist"))
        })?;
        if !program.is_active {
            return Err(PipelineError::precondition(format!(
                "program {program_id} is deactivated"
            )));
        }
        if !is_test_run && !self.store.has_completed_test_run(program_id)? {
            return Err(PipelineError::precondition(
                "full run requires a completed test run for this program",
            ));
        }

        let now = Utc::now();
        let timeout = if is_test_run {
            self.test_run_timeout
        } else {
            self.full_run_timeout
        };
        let run = RunRecord {
            id: Uuid::new_v4().to_string(),
            program_id: program_id.to_string(),
            user_id: user_id.to_string(),
            is_test_run,
            status: RunStatus::Pending,
            product_count: 0,
            products_created: 0,
            products_updated: 0,
            error_message: None,
            config_snapshot,
            started_at: now,
            completed_at: None,
        };
        let deadline = TimeoutDeadline {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            deadline: now + timeout,
            processed: false,
            processed_at: None,
        };
        self.store.insert_run_with_deadline(&run, &deadline)?;
        tracing::info!(
            "created {} run {} for program {program_id}, deadline {}",
            if is_test_run { "test" } else { "full" },
            run.id,
            deadline.deadline
        );
        Ok(run)
    }

    /// Claim a pending run for execution. Returns false when someone else
    /// (another executor, or the watchdog) got there first.
    pub fn claim_run(&self, run_id: &str) -> Result<bool> {
        self.store
            .update_run_status_if(run_id, &[RunStatus::Pending], RunStatus::Processing, None)
    }

    /// Mark a run completed and record its counters. Returns false when
    /// the run had already reached a terminal state.
    pub fn complete_run(
        &self,
        run_id: &str,
        product_count: u64,
        products_created: u64,
        products_updated: u64,
    ) -> Result<bool> {
        let applied = self.store.update_run_status_if(
            run_id,
            &[RunStatus::Pending, RunStatus::Processing],
            RunStatus::Completed,
            None,
        )?;
        if applied {
            self.store
                .record_run_counts(run_id, product_count, products_created, products_updated)?;
        }
        Ok(applied)
    }

    /// Mark a run failed with an operator-facing message. Returns false
    /// when the run had already reached a terminal state.
    pub fn fail_run(&self, run_id: &str, message: &str) -> Result<bool> {
        self.store.update_run_status_if(
            run_id,
            &[RunStatus::Pending, RunStatus::Processing],
            RunStatus::Failed,
            Some(message),
        )
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.store.get_run(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProgramMetadata, ScraperProgram, ScriptLanguage};

    fn ledger() -> (RunLedger, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = RunLedger::new(Arc::clone(&store), &PipelineConfig::default());
        (ledger, store)
    }

    fn insert_program(store: &Store, id: &str) {
        let now = Utc::now();
        store
            .insert_program(&ScraperProgram {
                id: id.to_string(),
                user_id: "user-1".to_string(),
                competitor_id: "comp-1".to_string(),
                name: "scraper".to_string(),
                language: ScriptLanguage::Python,
                source: "def scrape(ctx): pass".to_string(),
                metadata: ProgramMetadata::default(),
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    #[test]
    fn test_full_run_gated_on_test_run() {
        let (ledger, store) = ledger();
        insert_program(&store, "prog-1");

        let err = ledger
            .create_run("prog-1", "user-1", false, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));

        let test_run = ledger
            .create_run("prog-1", "user-1", true, serde_json::json!({}))
            .unwrap();
        assert!(ledger.claim_run(&test_run.id).unwrap());
        assert!(ledger.complete_run(&test_run.id, 5, 5, 0).unwrap());

        let full_run = ledger
            .create_run("prog-1", "user-1", false, serde_json::json!({}))
            .unwrap();
        assert!(!full_run.is_test_run);
    }

    #[test]
    fn test_missing_program_is_precondition() {
        let (ledger, _store) = ledger();
        let err = ledger
            .create_run("nope", "user-1", true, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
    }

    #[test]
    fn test_claim_then_fail_then_complete_loses() {
        let (ledger, store) = ledger();
        insert_program(&store, "prog-1");
        let run = ledger
            .create_run("prog-1", "user-1", true, serde_json::json!({}))
            .unwrap();

        assert!(ledger.claim_run(&run.id).unwrap());
        assert!(ledger.fail_run(&run.id, "site unreachable").unwrap());
        // Terminal state sticks.
        assert!(!ledger.complete_run(&run.id, 1, 1, 0).unwrap());

        let loaded = ledger.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("site unreachable"));
    }
}
