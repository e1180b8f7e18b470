//! Structured per-invocation execution log.
//!
//! Every sandbox run returns its log alongside the data so operators can
//! replay what the program did without scraping daemon output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Which stage of an execution a log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPhase {
    Setup,
    Interpreter,
    Navigation,
    Pagination,
    Extraction,
    Parsing,
    Metadata,
    Cleanup,
}

/// One timestamped entry in an execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub phase: LogPhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Accumulates entries during a single sandbox invocation.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: LogLevel, phase: LogPhase, message: impl Into<String>) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            phase,
            message: message.into(),
            data: None,
        });
    }

    pub fn push_with_data(
        &mut self,
        level: LogLevel,
        phase: LogPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            phase,
            message: message.into(),
            data: Some(data),
        });
    }

    pub fn debug(&mut self, phase: LogPhase, message: impl Into<String>) {
        self.push(LogLevel::Debug, phase, message);
    }

    pub fn info(&mut self, phase: LogPhase, message: impl Into<String>) {
        self.push(LogLevel::Info, phase, message);
    }

    pub fn warn(&mut self, phase: LogPhase, message: impl Into<String>) {
        self.push(LogLevel::Warn, phase, message);
    }

    pub fn error(&mut self, phase: LogPhase, message: impl Into<String>) {
        self.push(LogLevel::Error, phase, message);
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_accumulates_in_order() {
        let mut log = ExecutionLog::new();
        log.info(LogPhase::Setup, "script written to scratch dir");
        log.warn(LogPhase::Parsing, "line 3 skipped");
        let entries = log.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, LogPhase::Setup);
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_structured_data_rides_along() {
        let mut log = ExecutionLog::new();
        log.push_with_data(
            LogLevel::Info,
            LogPhase::Parsing,
            "parsed 3 product record(s)",
            serde_json::json!({ "records": 3, "dropped": 0 }),
        );
        let entries = log.into_entries();
        assert_eq!(entries[0].data.as_ref().unwrap()["records"], 3);
    }

    #[test]
    fn test_entry_serializes_snake_case() {
        let mut log = ExecutionLog::new();
        log.error(LogPhase::Interpreter, "python not found");
        let json = serde_json::to_string(&log.into_entries()).unwrap();
        assert!(json.contains("\"interpreter\""));
        assert!(json.contains("\"error\""));
    }
}
