//! Sandboxed execution of scraper programs.
//!
//! Two engines sit behind one trait: `python` runs generated scripts
//! out-of-process over a line-delimited JSON protocol, `recipe` interprets
//! declarative JSON recipes in-process. Callers pick a language and a mode;
//! everything comes back as an `ExecutionReport` with the structured log
//! attached, whether the run succeeded or not.

pub mod browser;
pub mod log;
pub mod python;
pub mod recipe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;
use crate::model::{ProgramMetadata, ScrapedProduct, ScriptLanguage};
use crate::sandbox::browser::BrowserEngine;
use crate::sandbox::log::LogEntry;
use crate::sandbox::python::PythonEngine;
use crate::sandbox::recipe::RecipeEngine;

/// What the caller wants out of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Bounded scrape plus a metadata probe; product count capped.
    Validate,
    /// Gather product URLs rather than product records.
    Collect,
    /// Extract product records from the supplied target URLs.
    Extract,
    /// Unbounded production scrape.
    Run,
}

/// Execution-scoped settings handed to the program.
///
/// Serialized to JSON and passed to subprocess scripts via `--context`;
/// the recipe engine reads it directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptContext {
    pub competitor_id: String,
    /// URLs the program should visit in extract mode.
    pub target_urls: Vec<String>,
    pub active_brand_names: Vec<String>,
    pub filter_by_active_brands: bool,
    pub own_product_eans: Vec<String>,
    pub scrape_only_own_products: bool,
    pub is_test_run: bool,
    pub is_validation: bool,
    pub run_id: Option<String>,
}

/// Outcome of one sandbox invocation.
///
/// `valid` is false when the program could not produce usable output; the
/// reason lives in `error` and the log tells the full story either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub valid: bool,
    #[serde(default)]
    pub products: Vec<ScrapedProduct>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProgramMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl ExecutionReport {
    /// A failed report carrying the error text and whatever log accumulated.
    pub fn failed(error: &PipelineError, log: Vec<LogEntry>) -> Self {
        Self {
            valid: false,
            error: Some(error.to_string()),
            log,
            ..Default::default()
        }
    }
}

/// One execution engine for one script language.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    fn language(&self) -> ScriptLanguage;

    /// Run `source` in `mode`. Engines return `Err` only for input-level
    /// problems (no source text); everything that happens once execution
    /// starts is reported through the `ExecutionReport`.
    async fn run(
        &self,
        source: &str,
        mode: ExecutionMode,
        ctx: &ScriptContext,
    ) -> Result<ExecutionReport>;
}

/// Dispatches executions to the engine for the program's language.
pub struct Sandbox {
    python: PythonEngine,
    recipe: RecipeEngine,
}

impl Sandbox {
    pub fn new(
        config: &PipelineConfig,
        fetcher: Fetcher,
        browser: Option<Arc<dyn BrowserEngine>>,
    ) -> Self {
        Self {
            python: PythonEngine::new(config),
            recipe: RecipeEngine::new(config, fetcher, browser),
        }
    }

    /// Execute a program. Missing source is the caller's mistake and comes
    /// back as `Err`; execution failures come back as an invalid report.
    pub async fn execute(
        &self,
        language: ScriptLanguage,
        source: &str,
        mode: ExecutionMode,
        ctx: &ScriptContext,
    ) -> Result<ExecutionReport> {
        if source.trim().is_empty() {
            return Err(PipelineError::MissingScript);
        }
        let engine: &dyn ScriptEngine = match language {
            ScriptLanguage::Python => &self.python,
            ScriptLanguage::Recipe => &self.recipe,
        };
        engine.run(source, mode, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_serializes_for_subprocess() {
        let ctx = ScriptContext {
            competitor_id: "comp-1".to_string(),
            target_urls: vec!["https://shop.example/p/1".to_string()],
            is_validation: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["competitor_id"], "comp-1");
        assert_eq!(json["is_validation"], true);
        assert_eq!(json["target_urls"][0], "https://shop.example/p/1");
    }

    #[test]
    fn test_failed_report_keeps_log() {
        let mut log = log::ExecutionLog::new();
        log.error(log::LogPhase::Interpreter, "python not found");
        let report = ExecutionReport::failed(
            &PipelineError::InterpreterUnavailable("python, python3".to_string()),
            log.into_entries(),
        );
        assert!(!report.valid);
        assert!(report.error.as_deref().unwrap().contains("no usable interpreter"));
        assert_eq!(report.log.len(), 1);
    }
}
