//! Final program composition and structural validation.
//!
//! Stitches the approved collection and extraction scripts into one
//! deployable program, then runs pattern checks against the sandbox
//! contract. Fixable gaps (missing metadata entry point, missing dispatch
//! block) are patched by appending known-good blocks; every patch is
//! recorded so the operator sees what was changed. A program with no
//! `scrape` function cannot be patched and is rejected.

use chrono::Utc;

use crate::error::{PipelineError, Result};
use crate::model::{AnalysisData, ProgramMetadata};

const METADATA_TEMPLATE: &str = r#"

def get_metadata():
    import json
    return {
        "name": "__NAME__",
        "version": "1.0.0",
        "description": "__DESCRIPTION__",
        "target_url": "__TARGET_URL__",
        "required_libraries": ["requests", "beautifulsoup4"],
    }
"#;

const MAIN_TEMPLATE: &str = r#"

if __name__ == "__main__":
    import sys, json
    _args = sys.argv[1:]
    _cmd = _args[0] if _args else "scrape"
    _ctx = {}
    if "--context" in _args:
        _ctx = json.loads(_args[_args.index("--context") + 1])
    if _cmd == "metadata":
        print(json.dumps(get_metadata()))
    elif _cmd == "collect" and "collect" in dir():
        collect(_ctx)
    else:
        scrape(_ctx)
"#;

const LOG_HELPER_TEMPLATE: &str = r#"

def log_progress(message):
    import sys
    print(message, file=sys.stderr)
"#;

/// Outcome of the structural validation pass.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub source: String,
    pub applied_fixes: Vec<String>,
}

/// Check a Python program against the sandbox contract and append
/// known-good blocks for the fixable gaps.
pub fn validate_and_fix_python(source: &str, metadata: &ProgramMetadata) -> Result<FixOutcome> {
    if !source.contains("def scrape") {
        return Err(PipelineError::malformed(
            "program defines no scrape entry point",
            head(source),
        ));
    }

    let mut fixed = source.to_string();
    let mut applied_fixes = Vec::new();

    if !fixed.contains("def log_progress") && !fixed.contains("file=sys.stderr") {
        fixed.push_str(LOG_HELPER_TEMPLATE);
        applied_fixes.push("appended stderr logging helper".to_string());
    }

    if !fixed.contains("def get_metadata") {
        let block = METADATA_TEMPLATE
            .replace("__NAME__", &metadata.name)
            .replace("__DESCRIPTION__", &metadata.description.replace('"', "'"))
            .replace("__TARGET_URL__", &metadata.target_url);
        fixed.push_str(&block);
        applied_fixes.push("appended get_metadata entry point".to_string());
    }

    if !fixed.contains("__main__") {
        fixed.push_str(MAIN_TEMPLATE);
        applied_fixes.push("appended __main__ dispatch block".to_string());
    }

    Ok(FixOutcome {
        source: fixed,
        applied_fixes,
    })
}

fn head(source: &str) -> String {
    source.chars().take(200).collect()
}

/// Build the deployable program from the approved phase artifacts.
///
/// The extraction script is the base; the collection script's `collect`
/// function is appended when the base lacks one, so the final program
/// serves both subcommands.
pub fn compose_program(
    analysis: &AnalysisData,
    collection_source: &str,
    extraction_source: &str,
) -> Result<(String, ProgramMetadata, Vec<String>)> {
    let host = url::Url::parse(&analysis.url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| analysis.url.clone());

    let metadata = ProgramMetadata {
        name: format!("AI generated scraper for {host}"),
        version: "1.0.0".to_string(),
        description: analysis.strategy_description.clone(),
        target_url: analysis.url.clone(),
        required_libraries: vec!["requests".to_string(), "beautifulsoup4".to_string()],
        generated_by: Some("gemini".to_string()),
        generated_at: Some(Utc::now()),
    };

    let mut merged = format!(
        "# Scraper for {host}\n# Assembled {}\n\n{}",
        Utc::now().format("%Y-%m-%d"),
        extraction_source.trim_end()
    );
    if !merged.contains("def collect") && collection_source.contains("def collect") {
        merged.push_str("\n\n# --- URL collection ---\n");
        merged.push_str(collection_source.trim());
        merged.push('\n');
    }

    let outcome = validate_and_fix_python(&merged, &metadata)?;
    Ok((outcome.source, metadata, outcome.applied_fixes))
}
