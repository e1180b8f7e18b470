//! Command implementations for the pricewatch binary.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::analyzer::{AnalysisHints, SiteAnalyzer};
use crate::config::PipelineConfig;
use crate::fetch::Fetcher;
use crate::model::{ProgramMetadata, ScriptLanguage};
use crate::pipeline::assembly;
use crate::runs::{reconciler, RunLedger};
use crate::sandbox::{ExecutionMode, Sandbox, ScriptContext};
use crate::store::Store;

fn open_store(db_path: &str) -> Result<Arc<Store>> {
    let store = Store::open(db_path).with_context(|| format!("opening database {db_path}"))?;
    Ok(Arc::new(store))
}

fn build_sandbox(config: &PipelineConfig) -> Sandbox {
    let fetcher = Fetcher::new(config.fetch_timeout_ms);
    // Browser recipes need a launched Chromium; the CLI wires it lazily
    // only when such a recipe actually runs, so plain Python workflows
    // never pay the launch cost.
    Sandbox::new(config, fetcher, None)
}

/// `pricewatch analyze <url>` — run site analysis and print the result.
pub async fn analyze(
    url: &str,
    sitemap: Option<String>,
    category_page: Option<String>,
    product_page: Option<String>,
) -> Result<()> {
    let config = PipelineConfig::from_env();
    let analyzer = SiteAnalyzer::new(Fetcher::new(config.fetch_timeout_ms), &config);
    let hints = AnalysisHints {
        sitemap_url: sitemap,
        category_page,
        product_page,
    };
    let analysis = analyzer.analyze(url, &hints).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

/// `pricewatch validate <file>` — structural fix pass plus a bounded
/// sandbox execution of a candidate program.
pub async fn validate(file: &str, language: &str) -> Result<()> {
    let language = ScriptLanguage::parse(language)
        .with_context(|| format!("unknown language {language} (python|recipe)"))?;
    let source = std::fs::read_to_string(Path::new(file))
        .with_context(|| format!("reading {file}"))?;

    let config = PipelineConfig::from_env();
    let (source, applied_fixes) = match language {
        ScriptLanguage::Python => {
            let metadata = ProgramMetadata {
                name: "candidate scraper".to_string(),
                version: "0.0.0".to_string(),
                ..Default::default()
            };
            let outcome = assembly::validate_and_fix_python(&source, &metadata)?;
            (outcome.source, outcome.applied_fixes)
        }
        ScriptLanguage::Recipe => (source, Vec::new()),
    };

    let sandbox = build_sandbox(&config);
    let ctx = ScriptContext {
        is_validation: true,
        ..Default::default()
    };
    let report = sandbox
        .execute(language, &source, ExecutionMode::Validate, &ctx)
        .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "valid": report.valid,
            "error": report.error,
            "product_count": report.products.len(),
            "products": report.products,
            "metadata": report.metadata,
            "applied_fixes": applied_fixes,
            "log": report.log,
        }))?
    );
    if !report.valid {
        bail!("validation failed");
    }
    Ok(())
}

/// `pricewatch execute <program-id>` — create, claim, and execute a run.
pub async fn execute(db_path: &str, program_id: &str, full: bool) -> Result<()> {
    let config = PipelineConfig::from_env();
    let store = open_store(db_path)?;
    let ledger = RunLedger::new(Arc::clone(&store), &config);

    let program = store
        .get_program(program_id)?
        .with_context(|| format!("program {program_id} not found"))?;

    let snapshot = serde_json::json!({
        "is_test_run": !full,
        "script_timeout_secs": config.script_timeout.as_secs(),
    });
    let run = ledger.create_run(program_id, &program.user_id, !full, snapshot)?;
    if !ledger.claim_run(&run.id)? {
        bail!("run {} was claimed elsewhere", run.id);
    }

    let sandbox = build_sandbox(&config);
    let mode = if full {
        ExecutionMode::Run
    } else {
        ExecutionMode::Validate
    };
    let ctx = ScriptContext {
        competitor_id: program.competitor_id.clone(),
        is_test_run: !full,
        run_id: Some(run.id.clone()),
        ..Default::default()
    };
    let report = sandbox
        .execute(program.language, &program.source, mode, &ctx)
        .await?;

    if report.valid {
        let count = report.products.len() as u64;
        ledger.complete_run(&run.id, count, count, 0)?;
        tracing::info!("run {} completed with {count} product(s)", run.id);
        println!("{}", serde_json::to_string_pretty(&report.products)?);
    } else {
        let message = report.error.as_deref().unwrap_or("execution failed");
        ledger.fail_run(&run.id, message)?;
        bail!("run {} failed: {message}", run.id);
    }
    Ok(())
}

/// `pricewatch sweep` — one pass over expired run deadlines.
pub fn sweep(db_path: &str) -> Result<()> {
    let store = open_store(db_path)?;
    let stats = reconciler::sweep_once(&store, chrono::Utc::now())?;
    println!(
        "examined {} deadline(s): {} force-failed, {} left alone, {} orphaned",
        stats.examined, stats.force_failed, stats.left_alone, stats.orphaned
    );
    Ok(())
}

/// `pricewatch watch` — run the reconciler loop until interrupted.
pub async fn watch(db_path: &str) -> Result<()> {
    let config = PipelineConfig::from_env();
    let store = open_store(db_path)?;
    let shutdown = Arc::new(Notify::new());

    let handle = reconciler::spawn(store, config.sweep_interval, Arc::clone(&shutdown));
    tokio::signal::ctrl_c().await?;
    shutdown.notify_waiters();
    handle.await?;
    Ok(())
}
