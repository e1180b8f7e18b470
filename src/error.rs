//! Error taxonomy for the scraper generation and execution pipeline.
//!
//! Each variant maps to a distinct operator-facing failure class so callers
//! can tell "your script has a bug" apart from "the target site is
//! unreachable" apart from "you skipped a required approval step".

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline core.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A phase was invoked before its predecessor was approved, or a full
    /// run was requested without a completed test run. Never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The fetch, code-generation, or interpreter-launch collaborator could
    /// not be reached at all (distinct from "reached but returned garbage").
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// A collaborator responded but its output could not be parsed into the
    /// expected shape. The raw offending output is attached for debugging.
    #[error("malformed output: {reason}")]
    MalformedOutput { reason: String, raw: String },

    /// The executed program itself failed: non-zero exit, thrown exception,
    /// or a navigation timeout on a target page.
    #[error("script execution failed: {0}")]
    ScriptRuntime(String),

    /// No source text was supplied to the sandbox.
    #[error("no script source provided")]
    MissingScript,

    /// Every interpreter alias failed to start.
    #[error("no usable interpreter found (tried: {0})")]
    InterpreterUnavailable(String),

    /// The program ran and its output parsed, but zero usable records
    /// were produced.
    #[error("script produced no usable records")]
    NoResults,

    /// An execution-local or deadline-ledger timeout fired. Always terminal.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// An outbound fetch failed after bounded retries.
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Shorthand for a precondition failure.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Shorthand for a malformed-output failure with the raw text attached.
    pub fn malformed(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::MalformedOutput {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_distinct() {
        let precondition = PipelineError::precondition("analysis not approved");
        let unavailable = PipelineError::CollaboratorUnavailable("gemini".into());
        let runtime = PipelineError::ScriptRuntime("exit code 1".into());

        let texts = [
            precondition.to_string(),
            unavailable.to_string(),
            runtime.to_string(),
        ];
        for (i, a) in texts.iter().enumerate() {
            for b in texts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_malformed_keeps_raw_output() {
        let err = PipelineError::malformed("not a JSON array", "{\"oops\": 1}");
        match err {
            PipelineError::MalformedOutput { raw, .. } => {
                assert!(raw.contains("oops"));
            }
            _ => panic!("wrong variant"),
        }
    }
}
