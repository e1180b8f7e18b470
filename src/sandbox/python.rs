//! Out-of-process execution of generated Python scrapers.
//!
//! The script is written into a throwaway scratch directory and invoked as
//! `<python> script.py <subcommand> --context <json>`. Interpreter aliases
//! are tried in order until one starts and produces output; a failure to
//! *start* moves on to the next alias, a failure *inside* the script is
//! terminal. Stdout carries the wire protocol: one JSON array per line.
//! The scratch directory is removed on every exit path.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::model::{ProgramMetadata, ScrapedProduct, ScriptLanguage};
use crate::sandbox::log::{ExecutionLog, LogLevel, LogPhase};
use crate::sandbox::{ExecutionMode, ExecutionReport, ScriptContext, ScriptEngine};

const SCRIPT_FILE: &str = "script.py";
const SCRATCH_PREFIX: &str = "pricewatch-";
/// Cap on captured bytes per stream, so a runaway script cannot exhaust
/// memory on the host.
const MAX_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;
const STDERR_TAIL_CHARS: usize = 2_000;

pub struct PythonEngine {
    aliases: Vec<String>,
    script_timeout: Duration,
    max_validation_products: usize,
}

enum InvokeError {
    /// The interpreter binary could not be started at all.
    NotStarted(String),
    /// The process started but the execution failed.
    Failed(PipelineError),
}

struct Captured {
    success: bool,
    stdout: String,
    stderr: String,
}

impl PythonEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            aliases: config.interpreter_aliases.clone(),
            script_timeout: config.script_timeout,
            max_validation_products: config.max_validation_products,
        }
    }

    /// Spawn one interpreter invocation and capture both streams, bounded
    /// by the wall-clock timeout. The child is killed on drop, so a
    /// timeout cannot leak a running process.
    async fn invoke(
        &self,
        alias: &str,
        scratch: &Path,
        args: &[&str],
    ) -> std::result::Result<Captured, InvokeError> {
        let binary = which::which(alias)
            .map_err(|_| InvokeError::NotStarted(format!("{alias} not on PATH")))?;

        let mut child = Command::new(binary)
            .arg(SCRIPT_FILE)
            .args(args)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvokeError::NotStarted(format!("{alias}: {e}")))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout_pipe));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe));

        let status = match tokio::time::timeout(self.script_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(InvokeError::Failed(PipelineError::ScriptRuntime(format!(
                    "wait on {alias} failed: {e}"
                ))))
            }
            Err(_) => {
                drop(child);
                return Err(InvokeError::Failed(PipelineError::Timeout(
                    self.script_timeout,
                )));
            }
        };

        let stdout = stdout_task.await.ok().unwrap_or_default();
        let stderr = stderr_task.await.ok().unwrap_or_default();
        Ok(Captured {
            success: status.success(),
            stdout,
            stderr,
        })
    }

    /// Try each alias until one starts and emits output. Returns the
    /// captured stdout and the alias that won.
    async fn run_with_fallback(
        &self,
        scratch: &Path,
        args: &[&str],
        log: &mut ExecutionLog,
    ) -> Result<(String, String)> {
        let mut any_started = false;

        for alias in &self.aliases {
            match self.invoke(alias, scratch, args).await {
                Err(InvokeError::NotStarted(reason)) => {
                    log.debug(LogPhase::Interpreter, format!("skipping {reason}"));
                    continue;
                }
                Err(InvokeError::Failed(e)) => {
                    log.error(LogPhase::Interpreter, e.to_string());
                    return Err(e);
                }
                Ok(captured) => {
                    any_started = true;
                    if !captured.success {
                        let tail = tail_of(&captured.stderr, STDERR_TAIL_CHARS);
                        log.error(
                            LogPhase::Interpreter,
                            format!("{alias} exited with failure: {tail}"),
                        );
                        return Err(PipelineError::ScriptRuntime(tail));
                    }
                    if captured.stdout.trim().is_empty() {
                        log.warn(
                            LogPhase::Interpreter,
                            format!("{alias} produced no stdout, trying next interpreter"),
                        );
                        continue;
                    }
                    log.info(LogPhase::Interpreter, format!("executed with {alias}"));
                    return Ok((captured.stdout, alias.clone()));
                }
            }
        }

        if any_started {
            Err(PipelineError::ScriptRuntime(format!(
                "script produced no output on stdout (interpreters tried: {})",
                self.aliases.join(", ")
            )))
        } else {
            Err(PipelineError::InterpreterUnavailable(
                self.aliases.join(", "),
            ))
        }
    }

    async fn fetch_metadata(
        &self,
        alias: &str,
        scratch: &Path,
        log: &mut ExecutionLog,
    ) -> Option<ProgramMetadata> {
        match self.invoke(alias, scratch, &["metadata"]).await {
            Ok(captured) if captured.success => {
                match serde_json::from_str::<ProgramMetadata>(captured.stdout.trim()) {
                    Ok(meta) => {
                        log.info(LogPhase::Metadata, format!("metadata reported: {}", meta.name));
                        Some(meta)
                    }
                    Err(e) => {
                        log.warn(LogPhase::Metadata, format!("metadata not parseable: {e}"));
                        None
                    }
                }
            }
            Ok(captured) => {
                log.warn(
                    LogPhase::Metadata,
                    format!(
                        "metadata subcommand failed: {}",
                        tail_of(&captured.stderr, STDERR_TAIL_CHARS)
                    ),
                );
                None
            }
            Err(_) => {
                log.warn(LogPhase::Metadata, "metadata subcommand did not run");
                None
            }
        }
    }
}

#[async_trait]
impl ScriptEngine for PythonEngine {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Python
    }

    async fn run(
        &self,
        source: &str,
        mode: ExecutionMode,
        ctx: &ScriptContext,
    ) -> Result<ExecutionReport> {
        let mut log = ExecutionLog::new();

        let scratch = match tempfile::Builder::new().prefix(SCRATCH_PREFIX).tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let err = PipelineError::ScriptRuntime(format!("scratch dir: {e}"));
                log.error(LogPhase::Setup, err.to_string());
                return Ok(ExecutionReport::failed(&err, log.into_entries()));
            }
        };
        if let Err(e) = std::fs::write(scratch.path().join(SCRIPT_FILE), source) {
            let err = PipelineError::ScriptRuntime(format!("write script: {e}"));
            log.error(LogPhase::Setup, err.to_string());
            return Ok(ExecutionReport::failed(&err, log.into_entries()));
        }
        log.debug(
            LogPhase::Setup,
            format!("script staged in {}", scratch.path().display()),
        );

        let mut ctx = ctx.clone();
        ctx.is_validation = mode == ExecutionMode::Validate;
        let ctx_json = serde_json::to_string(&ctx)?;

        let subcommand = match mode {
            ExecutionMode::Collect => "collect",
            _ => "scrape",
        };
        let args = [subcommand, "--context", ctx_json.as_str()];

        let (stdout, alias) = match self.run_with_fallback(scratch.path(), &args, &mut log).await {
            Ok(v) => v,
            Err(e) => return Ok(ExecutionReport::failed(&e, log.into_entries())),
        };

        let mut report = ExecutionReport {
            valid: true,
            log: Vec::new(),
            ..Default::default()
        };

        match mode {
            ExecutionMode::Collect => {
                let (urls, total) = match parse_url_lines(&stdout) {
                    Ok(v) => v,
                    Err(e) => {
                        log.error(LogPhase::Parsing, e.to_string());
                        return Ok(ExecutionReport::failed(&e, log.into_entries()));
                    }
                };
                if urls.is_empty() {
                    let err = PipelineError::NoResults;
                    log.error(LogPhase::Parsing, "no URLs collected");
                    return Ok(ExecutionReport::failed(&err, log.into_entries()));
                }
                log.push_with_data(
                    LogLevel::Info,
                    LogPhase::Parsing,
                    format!("collected {} url(s)", urls.len()),
                    serde_json::json!({ "urls": urls.len(), "total_count": total }),
                );
                report.urls = urls;
                report.total_count = total;
            }
            _ => {
                let cap = if mode == ExecutionMode::Validate {
                    Some(self.max_validation_products)
                } else {
                    None
                };
                let mut products = match parse_product_lines(&stdout, cap) {
                    Ok(v) => v,
                    Err(e) => {
                        log.error(LogPhase::Parsing, e.to_string());
                        return Ok(ExecutionReport::failed(&e, log.into_entries()));
                    }
                };
                let parsed = products.len();
                products.retain(|p| p.is_usable());
                if products.len() < parsed {
                    log.warn(
                        LogPhase::Parsing,
                        format!("dropped {} record(s) without name or price", parsed - products.len()),
                    );
                }
                if products.is_empty() {
                    let err = PipelineError::NoResults;
                    log.error(LogPhase::Parsing, "script emitted zero products");
                    return Ok(ExecutionReport::failed(&err, log.into_entries()));
                }
                log.push_with_data(
                    LogLevel::Info,
                    LogPhase::Parsing,
                    format!("parsed {} product record(s)", products.len()),
                    serde_json::json!({ "records": products.len(), "dropped": parsed - products.len() }),
                );
                report.products = products;
            }
        }

        if mode == ExecutionMode::Validate {
            report.metadata = self.fetch_metadata(&alias, scratch.path(), &mut log).await;
        }

        log.debug(LogPhase::Cleanup, "removing scratch dir");
        report.log = log.into_entries();
        Ok(report)
    }
}

async fn read_capped(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = (&mut pipe).take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn tail_of(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

/// Parse the scrape wire protocol: every non-empty stdout line is a JSON
/// array of product records. A line that is anything else poisons the
/// whole invocation.
pub(crate) fn parse_product_lines(
    stdout: &str,
    cap: Option<usize>,
) -> Result<Vec<ScrapedProduct>> {
    let mut products = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let batch: Vec<ScrapedProduct> = serde_json::from_str(line).map_err(|e| {
            PipelineError::malformed(format!("stdout line is not a product array: {e}"), line)
        })?;
        products.extend(batch);
        if let Some(cap) = cap {
            if products.len() >= cap {
                products.truncate(cap);
                break;
            }
        }
    }
    Ok(products)
}

/// Parse the collect wire protocol: JSON arrays of URL strings, plus an
/// optional single object line reporting `total_count`.
pub(crate) fn parse_url_lines(stdout: &str) -> Result<(Vec<String>, Option<u64>)> {
    let mut urls = Vec::new();
    let mut total = None;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            PipelineError::malformed(format!("stdout line is not JSON: {e}"), line)
        })?;
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    match item {
                        serde_json::Value::String(url) => urls.push(url),
                        other => {
                            return Err(PipelineError::malformed(
                                "collect batch contains a non-string entry",
                                other.to_string(),
                            ))
                        }
                    }
                }
            }
            serde_json::Value::Object(map) => match map.get("total_count").and_then(|v| v.as_u64())
            {
                Some(n) => total = Some(n),
                None => {
                    return Err(PipelineError::malformed(
                        "object line without total_count",
                        line,
                    ))
                }
            },
            other => {
                return Err(PipelineError::malformed(
                    "stdout line is neither an array nor a total_count object",
                    other.to_string(),
                ))
            }
        }
    }
    Ok((urls, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Sandbox;
    use std::os::unix::fs::PermissionsExt;

    fn engine_with_aliases(aliases: &[&str]) -> PythonEngine {
        let mut config = PipelineConfig::default();
        config.interpreter_aliases = aliases.iter().map(|s| s.to_string()).collect();
        config.script_timeout = Duration::from_secs(10);
        PythonEngine::new(&config)
    }

    /// Write a fake interpreter shell script and return its absolute path,
    /// which the engine accepts as an alias. The fake ignores the script
    /// file and prints canned stdout, which is all the line-protocol
    /// plumbing needs.
    fn install_fake_interpreter(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_parse_product_lines_concatenates_batches() {
        let stdout = "[{\"name\":\"A\",\"competitor_price\":1.0}]\n\n[{\"name\":\"B\",\"competitor_price\":2.0},{\"name\":\"C\"}]\n";
        let products = parse_product_lines(stdout, None).unwrap();
        assert_eq!(products.len(), 3);
        assert_eq!(products[1].name, "B");
    }

    #[test]
    fn test_parse_product_lines_rejects_non_array() {
        let stdout = "[{\"name\":\"A\"}]\n{\"name\":\"B\"}\n";
        let err = parse_product_lines(stdout, None).unwrap_err();
        match err {
            PipelineError::MalformedOutput { raw, .. } => assert!(raw.contains("\"B\"")),
            other => panic!("expected MalformedOutput, got {other}"),
        }
    }

    #[test]
    fn test_parse_product_lines_caps_for_validation() {
        let batch: Vec<String> = (0..8)
            .map(|i| format!("{{\"name\":\"P{i}\",\"competitor_price\":1.0}}"))
            .collect();
        let line = format!("[{}]", batch.join(","));
        let stdout = format!("{line}\n{line}\n");
        let products = parse_product_lines(&stdout, Some(10)).unwrap();
        assert_eq!(products.len(), 10);
    }

    #[test]
    fn test_parse_url_lines_with_total() {
        let stdout = "[\"https://a\",\"https://b\"]\n{\"total_count\": 400}\n";
        let (urls, total) = parse_url_lines(stdout).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(total, Some(400));
    }

    #[tokio::test]
    async fn test_all_aliases_missing_is_interpreter_unavailable() {
        let engine = engine_with_aliases(&["pricewatch-no-such-python-a", "pricewatch-no-such-python-b"]);
        let ctx = ScriptContext::default();
        let report = engine
            .run("print('x')", ExecutionMode::Validate, &ctx)
            .await
            .unwrap();
        assert!(!report.valid);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .contains("no usable interpreter"));
    }

    #[tokio::test]
    async fn test_falls_back_past_missing_alias() {
        let bin_dir = tempfile::tempdir().unwrap();
        let fake = install_fake_interpreter(
            bin_dir.path(),
            "fake-python",
            r#"case "$2" in
metadata) echo '{"name":"fake","version":"1.0","description":"","target_url":"","required_libraries":[]}' ;;
*) echo '[{"name":"Widget","competitor_price":9.99}]' ;;
esac"#,
        );

        let engine = engine_with_aliases(&["pricewatch-missing-python", &fake]);
        let ctx = ScriptContext::default();
        let report = engine
            .run("# not real python", ExecutionMode::Validate, &ctx)
            .await
            .unwrap();
        assert!(report.valid, "error: {:?}", report.error);
        assert_eq!(report.products.len(), 1);
        assert_eq!(report.products[0].name, "Widget");
        assert_eq!(report.metadata.as_ref().unwrap().name, "fake");

        // The parse entry carries its counters as structured data.
        let parse_entry = report
            .log
            .iter()
            .find(|e| e.data.is_some())
            .expect("no structured log entry");
        assert_eq!(parse_entry.data.as_ref().unwrap()["records"], 1);
    }

    #[tokio::test]
    async fn test_silent_script_is_no_output_error() {
        let bin_dir = tempfile::tempdir().unwrap();
        let silent_a = install_fake_interpreter(bin_dir.path(), "silent-a", "exit 0");
        let silent_b = install_fake_interpreter(bin_dir.path(), "silent-b", "exit 0");

        // Every alias starts cleanly but prints nothing: that is a script
        // problem, not a missing-interpreter problem.
        let engine = engine_with_aliases(&[&silent_a, &silent_b]);
        let report = engine
            .run("# src", ExecutionMode::Run, &ScriptContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        let error = report.error.as_deref().unwrap();
        assert!(error.contains("no output on stdout"), "got: {error}");
        assert!(!error.contains("no usable interpreter"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_script_error_not_retried() {
        let bin_dir = tempfile::tempdir().unwrap();
        let broken = install_fake_interpreter(
            bin_dir.path(),
            "broken-python",
            "echo 'Traceback: boom' >&2\nexit 1",
        );
        let good = install_fake_interpreter(
            bin_dir.path(),
            "good-python",
            "echo '[{\"name\":\"X\",\"competitor_price\":1.0}]'",
        );

        let engine = engine_with_aliases(&[&broken, &good]);
        let report = engine
            .run("# src", ExecutionMode::Run, &ScriptContext::default())
            .await
            .unwrap();
        // The first alias ran and crashed: that's the script's fault, so
        // the second alias must not be consulted.
        assert!(!report.valid);
        assert!(report.error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_empty_products_is_no_results() {
        let bin_dir = tempfile::tempdir().unwrap();
        let empty = install_fake_interpreter(bin_dir.path(), "empty-python", "echo '[]'");

        let engine = engine_with_aliases(&[&empty]);
        let report = engine
            .run("# src", ExecutionMode::Run, &ScriptContext::default())
            .await
            .unwrap();
        assert!(!report.valid);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .contains("no usable records"));
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_after_run() {
        let bin_dir = tempfile::tempdir().unwrap();
        let probe = bin_dir.path().join("scratch-probe");
        let pwd_python = install_fake_interpreter(
            bin_dir.path(),
            "pwd-python",
            &format!(
                "pwd > '{}'\necho '[{{\"name\":\"X\",\"competitor_price\":1.0}}]'",
                probe.display()
            ),
        );

        let engine = engine_with_aliases(&[&pwd_python]);
        let report = engine
            .run("# src", ExecutionMode::Run, &ScriptContext::default())
            .await
            .unwrap();
        assert!(report.valid);

        let scratch = std::fs::read_to_string(&probe).unwrap();
        assert!(!Path::new(scratch.trim()).exists(), "scratch dir survived");
    }

    #[tokio::test]
    async fn test_sandbox_rejects_empty_source() {
        let config = PipelineConfig::default();
        let fetcher = crate::fetch::Fetcher::new(1000);
        let sandbox = Sandbox::new(&config, fetcher, None);
        let err = sandbox
            .execute(
                ScriptLanguage::Python,
                "   ",
                ExecutionMode::Validate,
                &ScriptContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingScript));
    }
}
