//! SQLite persistence for sessions, programs, runs, and deadlines.
//!
//! Run status transitions go through a guarded single-row UPDATE: callers
//! state which statuses they expect, and the changed-row count says whether
//! the transition won. That keeps the executor and the timeout reconciler
//! from clobbering each other without a second coordination channel.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{PipelineError, Result};
use crate::model::{
    GenerationSession, RunRecord, RunStatus, ScraperProgram, ScriptLanguage, SessionPhase,
    TimeoutDeadline,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                   TEXT PRIMARY KEY,
    user_id              TEXT NOT NULL,
    competitor_id        TEXT NOT NULL,
    url                  TEXT NOT NULL,
    current_phase        TEXT NOT NULL,
    analysis_data        TEXT,
    url_collection_data  TEXT,
    data_extraction_data TEXT,
    assembly_data        TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS programs (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    competitor_id TEXT NOT NULL,
    name          TEXT NOT NULL,
    language      TEXT NOT NULL,
    source        TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id               TEXT PRIMARY KEY,
    program_id       TEXT NOT NULL REFERENCES programs(id),
    user_id          TEXT NOT NULL,
    is_test_run      INTEGER NOT NULL,
    status           TEXT NOT NULL,
    product_count    INTEGER NOT NULL DEFAULT 0,
    products_created INTEGER NOT NULL DEFAULT 0,
    products_updated INTEGER NOT NULL DEFAULT 0,
    error_message    TEXT,
    config_snapshot  TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    completed_at     TEXT
);

CREATE TABLE IF NOT EXISTS run_timeouts (
    id           TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL REFERENCES runs(id),
    deadline     TEXT NOT NULL,
    processed    INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_program ON runs(program_id, status);
CREATE INDEX IF NOT EXISTS idx_timeouts_pending ON run_timeouts(processed, deadline);
";

/// Handle to the pipeline database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- sessions ---

    pub fn insert_session(&self, session: &GenerationSession) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, competitor_id, url, current_phase,
                analysis_data, url_collection_data, data_extraction_data, assembly_data,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id,
                session.user_id,
                session.competitor_id,
                session.url,
                session.current_phase.as_str(),
                opt_json(&session.analysis_data)?,
                opt_json(&session.url_collection_data)?,
                opt_json(&session.data_extraction_data)?,
                opt_json(&session.assembly_data)?,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persist the session's phase payloads and current phase.
    pub fn save_session(&self, session: &GenerationSession) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET current_phase = ?2, analysis_data = ?3,
                url_collection_data = ?4, data_extraction_data = ?5,
                assembly_data = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                session.id,
                session.current_phase.as_str(),
                opt_json(&session.analysis_data)?,
                opt_json(&session.url_collection_data)?,
                opt_json(&session.data_extraction_data)?,
                opt_json(&session.assembly_data)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(PipelineError::precondition(format!(
                "session {} does not exist",
                session.id
            )));
        }
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<GenerationSession>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                "SELECT id, user_id, competitor_id, url, current_phase,
                    analysis_data, url_collection_data, data_extraction_data,
                    assembly_data, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    // --- programs ---

    pub fn insert_program(&self, program: &ScraperProgram) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO programs (id, user_id, competitor_id, name, language, source,
                metadata, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                program.id,
                program.user_id,
                program.competitor_id,
                program.name,
                program.language.as_str(),
                program.source,
                serde_json::to_string(&program.metadata)?,
                program.is_active,
                program.created_at.to_rfc3339(),
                program.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_program(&self, id: &str) -> Result<Option<ScraperProgram>> {
        let conn = self.lock();
        let program = conn
            .query_row(
                "SELECT id, user_id, competitor_id, name, language, source, metadata,
                    is_active, created_at, updated_at
                 FROM programs WHERE id = ?1",
                params![id],
                row_to_program,
            )
            .optional()?;
        Ok(program)
    }

    // --- runs + deadlines ---

    /// Insert a run and its watchdog deadline in one transaction, so a run
    /// can never exist without a deadline covering it.
    pub fn insert_run_with_deadline(
        &self,
        run: &RunRecord,
        deadline: &TimeoutDeadline,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (id, program_id, user_id, is_test_run, status,
                product_count, products_created, products_updated, error_message,
                config_snapshot, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.id,
                run.program_id,
                run.user_id,
                run.is_test_run,
                run.status.as_str(),
                run.product_count,
                run.products_created,
                run.products_updated,
                run.error_message,
                serde_json::to_string(&run.config_snapshot)?,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.execute(
            "INSERT INTO run_timeouts (id, run_id, deadline, processed, processed_at)
             VALUES (?1, ?2, ?3, 0, NULL)",
            params![deadline.id, deadline.run_id, deadline.deadline.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                "SELECT id, program_id, user_id, is_test_run, status, product_count,
                    products_created, products_updated, error_message, config_snapshot,
                    started_at, completed_at
                 FROM runs WHERE id = ?1",
                params![id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Transition a run's status only if it currently holds one of the
    /// expected statuses. Returns whether the transition was applied.
    ///
    /// Terminal transitions stamp `completed_at`; a failure message (when
    /// given) replaces any previous one.
    pub fn update_run_status_if(
        &self,
        id: &str,
        expected: &[RunStatus],
        to: RunStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let placeholders = expected
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE runs SET status = ?2, error_message = COALESCE(?3, error_message),
                completed_at = CASE WHEN ?2 IN ('completed', 'failed')
                                    THEN ?{} ELSE completed_at END
             WHERE id = ?1 AND status IN ({placeholders})",
            expected.len() + 4
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(id.to_string()),
            Box::new(to.as_str()),
            Box::new(error_message.map(|s| s.to_string())),
        ];
        for status in expected {
            values.push(Box::new(status.as_str()));
        }
        values.push(Box::new(now));
        let changed = stmt.execute(rusqlite::params_from_iter(values.iter().map(|v| &**v)))?;
        Ok(changed > 0)
    }

    /// Record the outcome counters of a completed run.
    pub fn record_run_counts(
        &self,
        id: &str,
        product_count: u64,
        products_created: u64,
        products_updated: u64,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE runs SET product_count = ?2, products_created = ?3,
                products_updated = ?4
             WHERE id = ?1",
            params![id, product_count, products_created, products_updated],
        )?;
        Ok(())
    }

    /// Whether the program has at least one completed test run.
    pub fn has_completed_test_run(&self, program_id: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE program_id = ?1 AND is_test_run = 1 AND status = 'completed'",
            params![program_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Unprocessed deadlines that expired at or before `now`, oldest first.
    pub fn expired_unprocessed_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<TimeoutDeadline>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, deadline, processed, processed_at
             FROM run_timeouts
             WHERE processed = 0 AND deadline <= ?1
             ORDER BY deadline ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_deadline)?;
        let mut deadlines = Vec::new();
        for row in rows {
            deadlines.push(row?);
        }
        Ok(deadlines)
    }

    pub fn mark_deadline_processed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE run_timeouts SET processed = 1, processed_at = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    match value {
        Some(v) => Ok(Some(serde_json::to_string(v)?)),
        None => Ok(None),
    }
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> rusqlite::Result<Option<T>> {
    match raw {
        Some(s) => serde_json::from_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<GenerationSession> {
    let phase_raw: String = row.get(4)?;
    Ok(GenerationSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        competitor_id: row.get(2)?,
        url: row.get(3)?,
        current_phase: SessionPhase::parse(&phase_raw).unwrap_or(SessionPhase::Analysis),
        analysis_data: parse_json(row.get(5)?)?,
        url_collection_data: parse_json(row.get(6)?)?,
        data_extraction_data: parse_json(row.get(7)?)?,
        assembly_data: parse_json(row.get(8)?)?,
        created_at: parse_ts(row.get(9)?)?,
        updated_at: parse_ts(row.get(10)?)?,
    })
}

fn row_to_program(row: &Row<'_>) -> rusqlite::Result<ScraperProgram> {
    let language_raw: String = row.get(4)?;
    let metadata_raw: String = row.get(6)?;
    Ok(ScraperProgram {
        id: row.get(0)?,
        user_id: row.get(1)?,
        competitor_id: row.get(2)?,
        name: row.get(3)?,
        language: ScriptLanguage::parse(&language_raw).unwrap_or(ScriptLanguage::Python),
        source: row.get(5)?,
        metadata: serde_json::from_str(&metadata_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?,
        is_active: row.get(7)?,
        created_at: parse_ts(row.get(8)?)?,
        updated_at: parse_ts(row.get(9)?)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_raw: String = row.get(4)?;
    let snapshot_raw: String = row.get(9)?;
    let completed_raw: Option<String> = row.get(11)?;
    Ok(RunRecord {
        id: row.get(0)?,
        program_id: row.get(1)?,
        user_id: row.get(2)?,
        is_test_run: row.get(3)?,
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Failed),
        product_count: row.get::<_, i64>(5)? as u64,
        products_created: row.get::<_, i64>(6)? as u64,
        products_updated: row.get::<_, i64>(7)? as u64,
        error_message: row.get(8)?,
        config_snapshot: serde_json::from_str(&snapshot_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        started_at: parse_ts(row.get(10)?)?,
        completed_at: match completed_raw {
            Some(raw) => Some(parse_ts(raw)?),
            None => None,
        },
    })
}

fn row_to_deadline(row: &Row<'_>) -> rusqlite::Result<TimeoutDeadline> {
    let processed_raw: Option<String> = row.get(4)?;
    Ok(TimeoutDeadline {
        id: row.get(0)?,
        run_id: row.get(1)?,
        deadline: parse_ts(row.get(2)?)?,
        processed: row.get(3)?,
        processed_at: match processed_raw {
            Some(raw) => Some(parse_ts(raw)?),
            None => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_program(id: &str) -> ScraperProgram {
        ScraperProgram {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            competitor_id: "comp-1".to_string(),
            name: "shop.example scraper".to_string(),
            language: ScriptLanguage::Python,
            source: "print('hi')".to_string(),
            metadata: Default::default(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_run(id: &str, program_id: &str, is_test: bool) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            program_id: program_id.to_string(),
            user_id: "user-1".to_string(),
            is_test_run: is_test,
            status: RunStatus::Pending,
            product_count: 0,
            products_created: 0,
            products_updated: 0,
            error_message: None,
            config_snapshot: serde_json::json!({"timeout_secs": 60}),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn deadline_for(run_id: &str, at: DateTime<Utc>) -> TimeoutDeadline {
        TimeoutDeadline {
            id: format!("dl-{run_id}"),
            run_id: run_id.to_string(),
            deadline: at,
            processed: false,
            processed_at: None,
        }
    }

    #[test]
    fn test_run_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_program(&sample_program("prog-1")).unwrap();
        let run = sample_run("run-1", "prog-1", true);
        let dl = deadline_for("run-1", Utc::now() + ChronoDuration::seconds(60));
        store.insert_run_with_deadline(&run, &dl).unwrap();

        let loaded = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Pending);
        assert!(loaded.is_test_run);
        assert!(loaded.completed_at.is_none());
    }

    #[test]
    fn test_guarded_transition_wins_once() {
        let store = Store::open_in_memory().unwrap();
        store.insert_program(&sample_program("prog-1")).unwrap();
        let run = sample_run("run-1", "prog-1", false);
        let dl = deadline_for("run-1", Utc::now());
        store.insert_run_with_deadline(&run, &dl).unwrap();

        let first = store
            .update_run_status_if("run-1", &[RunStatus::Pending], RunStatus::Processing, None)
            .unwrap();
        assert!(first);

        // A second claim against pending must lose.
        let second = store
            .update_run_status_if("run-1", &[RunStatus::Pending], RunStatus::Processing, None)
            .unwrap();
        assert!(!second);
    }

    #[test]
    fn test_terminal_transition_stamps_completed_at() {
        let store = Store::open_in_memory().unwrap();
        store.insert_program(&sample_program("prog-1")).unwrap();
        let run = sample_run("run-1", "prog-1", false);
        let dl = deadline_for("run-1", Utc::now());
        store.insert_run_with_deadline(&run, &dl).unwrap();

        let applied = store
            .update_run_status_if(
                "run-1",
                &[RunStatus::Pending, RunStatus::Processing],
                RunStatus::Failed,
                Some("boom"),
            )
            .unwrap();
        assert!(applied);

        let loaded = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn test_expired_deadlines_oldest_first() {
        let store = Store::open_in_memory().unwrap();
        store.insert_program(&sample_program("prog-1")).unwrap();
        let now = Utc::now();

        for (run_id, offset) in [("run-a", -30), ("run-b", -90), ("run-c", 60)] {
            let run = sample_run(run_id, "prog-1", true);
            let dl = deadline_for(run_id, now + ChronoDuration::seconds(offset));
            store.insert_run_with_deadline(&run, &dl).unwrap();
        }

        let expired = store.expired_unprocessed_deadlines(now).unwrap();
        let ids: Vec<&str> = expired.iter().map(|d| d.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-b", "run-a"]);

        store.mark_deadline_processed(&expired[0].id, now).unwrap();
        let remaining = store.expired_unprocessed_deadlines(now).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].run_id, "run-a");
    }

    #[test]
    fn test_completed_test_run_gate() {
        let store = Store::open_in_memory().unwrap();
        store.insert_program(&sample_program("prog-1")).unwrap();
        assert!(!store.has_completed_test_run("prog-1").unwrap());

        let run = sample_run("run-1", "prog-1", true);
        let dl = deadline_for("run-1", Utc::now());
        store.insert_run_with_deadline(&run, &dl).unwrap();
        store
            .update_run_status_if(
                "run-1",
                &[RunStatus::Pending],
                RunStatus::Completed,
                None,
            )
            .unwrap();

        assert!(store.has_completed_test_run("prog-1").unwrap());
    }

    #[test]
    fn test_session_save_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut session = GenerationSession {
            id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            competitor_id: "comp-1".to_string(),
            url: "https://shop.example".to_string(),
            current_phase: SessionPhase::Analysis,
            analysis_data: None,
            url_collection_data: None,
            data_extraction_data: None,
            assembly_data: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_session(&session).unwrap();

        session.current_phase = SessionPhase::UrlCollection;
        store.save_session(&session).unwrap();

        let loaded = store.get_session("sess-1").unwrap().unwrap();
        assert_eq!(loaded.current_phase, SessionPhase::UrlCollection);
        assert!(loaded.analysis_data.is_none());
    }
}
