//! End-to-end session flow against a stub generator and a fake
//! interpreter, exercising phase gating and the assembly output.

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use pricewatch::analyzer::SiteAnalyzer;
use pricewatch::config::PipelineConfig;
use pricewatch::error::{PipelineError, Result};
use pricewatch::fetch::Fetcher;
use pricewatch::llm::CodeGenerator;
use pricewatch::model::{AnalysisData, SessionPhase, Strategy};
use pricewatch::pipeline::ScraperPipeline;
use pricewatch::sandbox::Sandbox;
use pricewatch::store::Store;

/// Returns canned "generated" sources, routed on the system prompt.
struct StubGenerator;

#[async_trait]
impl CodeGenerator for StubGenerator {
    async fn generate(&self, system_prompt: &str, _user_prompt: &str) -> Result<String> {
        if system_prompt.contains("collect") {
            Ok("```python\nimport sys\n\ndef collect(context):\n    pass\n```".to_string())
        } else {
            Ok("```python\nimport sys\n\ndef scrape(context):\n    pass\n```".to_string())
        }
    }
}

/// A generator that always fails, for collaborator-outage paths.
struct DownGenerator;

#[async_trait]
impl CodeGenerator for DownGenerator {
    async fn generate(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Err(PipelineError::CollaboratorUnavailable(
            "stub generator offline".to_string(),
        ))
    }
}

/// Fake interpreter honoring the subprocess line protocol. The pipeline
/// never inspects the Python source, so a shell script standing in for
/// the interpreter exercises the full wiring.
fn install_fake_interpreter(dir: &Path) -> String {
    let path = dir.join("fake-python");
    let body = r#"#!/bin/sh
case "$2" in
collect)
    echo '["https://shop.example/p/1","https://shop.example/p/2","https://shop.example/p/3"]'
    echo '{"total_count": 42}'
    ;;
metadata)
    echo '{"name":"fake scraper","version":"1.0.0","description":"","target_url":"https://shop.example","required_libraries":[]}'
    ;;
*)
    echo '[{"name":"Widget","competitor_price":9.99,"url":"https://shop.example/p/1","currency_code":"EUR"}]'
    ;;
esac
"#;
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

/// Like the plain fake, but the scrape branch appends a line to `counter`
/// on every invocation so tests can count sandbox executions.
fn install_counting_interpreter(dir: &Path, counter: &Path) -> String {
    let path = dir.join("counting-python");
    let body = format!(
        r#"#!/bin/sh
case "$2" in
collect)
    echo '["https://shop.example/p/1","https://shop.example/p/2","https://shop.example/p/3"]'
    ;;
*)
    echo run >> '{}'
    echo '[{{"name":"Widget","competitor_price":9.99}}]'
    ;;
esac
"#,
        counter.display()
    );
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

fn approved_analysis(url: &str) -> AnalysisData {
    AnalysisData {
        url: url.to_string(),
        title: "Shop Example".to_string(),
        sitemap_urls: vec![format!("{url}/sitemap.xml")],
        brand_pages: Vec::new(),
        category_pages: Vec::new(),
        product_listing_pages: Vec::new(),
        api_endpoints: Vec::new(),
        proposed_strategy: Strategy::Scraping,
        strategy_description: "scrape rendered pages; enumerate product URLs from the sitemap"
            .to_string(),
        product_selectors: None,
        html_sample: "<html><body>sample</body></html>".to_string(),
        approved: false,
        user_feedback: None,
    }
}

fn build_pipeline(
    store: Arc<Store>,
    generator: Arc<dyn CodeGenerator>,
    interpreter: &str,
) -> ScraperPipeline {
    let mut config = PipelineConfig::default();
    config.interpreter_aliases = vec![interpreter.to_string()];
    config.script_timeout = std::time::Duration::from_secs(10);

    let fetcher = Fetcher::new(config.fetch_timeout_ms);
    let analyzer = SiteAnalyzer::new(fetcher.clone(), &config);
    let sandbox = Arc::new(Sandbox::new(&config, fetcher, None));
    ScraperPipeline::new(store, analyzer, generator, sandbox, config)
}

#[tokio::test]
async fn test_full_session_flow() {
    let bin_dir = tempfile::tempdir().unwrap();
    let interpreter = install_fake_interpreter(bin_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = build_pipeline(Arc::clone(&store), Arc::new(StubGenerator), &interpreter);

    let session = pipeline
        .create_session("user-1", "comp-1", "https://shop.example")
        .unwrap();
    assert_eq!(session.current_phase, SessionPhase::Analysis);

    // Inject the analysis result (the analyzer itself needs the network).
    let mut session = session;
    session.analysis_data = Some(approved_analysis("https://shop.example"));
    store.save_session(&session).unwrap();

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::Analysis, None)
        .unwrap();
    assert_eq!(session.current_phase, SessionPhase::UrlCollection);

    let session = pipeline.collect_urls(&session.id, None).await.unwrap();
    let collection = session.url_collection_data.as_ref().unwrap();
    assert_eq!(collection.sample_urls.len(), 3);
    assert_eq!(collection.total_count, Some(42));
    assert!(!collection.approved);

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::UrlCollection, Some("looks right".into()))
        .unwrap();
    assert_eq!(session.current_phase, SessionPhase::DataExtraction);

    let session = pipeline.extract_data(&session.id, None, None).await.unwrap();
    let extraction = session.data_extraction_data.as_ref().unwrap();
    // One product per sample URL from the fake interpreter.
    assert_eq!(extraction.products.len(), 3);
    assert_eq!(extraction.products[0].name, "Widget");

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::DataExtraction, None)
        .unwrap();
    assert_eq!(session.current_phase, SessionPhase::Assembly);

    let session = pipeline.assemble(&session.id).unwrap();
    let assembly = session.assembly_data.as_ref().unwrap();
    assert!(assembly.source.contains("def scrape"));
    assert!(assembly.source.contains("def collect"));
    assert!(assembly.source.contains("def get_metadata"));
    assert!(assembly.source.contains("__main__"));
    assert!(assembly.metadata.name.contains("shop.example"));

    let program_id = assembly.program_id.clone().unwrap();
    let program = store.get_program(&program_id).unwrap().unwrap();
    assert!(program.is_active);

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::Assembly, None)
        .unwrap();
    assert_eq!(session.current_phase, SessionPhase::Complete);

    // The saved session reflects everything.
    let reloaded = store.get_session(&session.id).unwrap().unwrap();
    assert_eq!(reloaded.current_phase, SessionPhase::Complete);
    assert!(reloaded.assembly_data.is_some());
}

#[tokio::test]
async fn test_api_strategy_extracts_in_one_batch() {
    let bin_dir = tempfile::tempdir().unwrap();
    let counter = bin_dir.path().join("scrape-calls");
    let interpreter = install_counting_interpreter(bin_dir.path(), &counter);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = build_pipeline(Arc::clone(&store), Arc::new(StubGenerator), &interpreter);

    let mut session = pipeline
        .create_session("user-1", "comp-1", "https://shop.example")
        .unwrap();
    let mut analysis = approved_analysis("https://shop.example");
    analysis.proposed_strategy = Strategy::Api;
    session.analysis_data = Some(analysis);
    store.save_session(&session).unwrap();

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::Analysis, None)
        .unwrap();
    let session = pipeline.collect_urls(&session.id, None).await.unwrap();
    let session = pipeline
        .approve_phase(&session.id, SessionPhase::UrlCollection, None)
        .unwrap();

    let session = pipeline.extract_data(&session.id, None, None).await.unwrap();
    let extraction = session.data_extraction_data.as_ref().unwrap();
    // One invocation over the whole batch, not one per sample URL.
    assert_eq!(extraction.products.len(), 1);
    let calls = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(calls.lines().count(), 1);
}

#[tokio::test]
async fn test_scraping_strategy_fans_out_per_url() {
    let bin_dir = tempfile::tempdir().unwrap();
    let counter = bin_dir.path().join("scrape-calls");
    let interpreter = install_counting_interpreter(bin_dir.path(), &counter);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = build_pipeline(Arc::clone(&store), Arc::new(StubGenerator), &interpreter);

    let mut session = pipeline
        .create_session("user-1", "comp-1", "https://shop.example")
        .unwrap();
    session.analysis_data = Some(approved_analysis("https://shop.example"));
    store.save_session(&session).unwrap();

    let session = pipeline
        .approve_phase(&session.id, SessionPhase::Analysis, None)
        .unwrap();
    let session = pipeline.collect_urls(&session.id, None).await.unwrap();
    let session = pipeline
        .approve_phase(&session.id, SessionPhase::UrlCollection, None)
        .unwrap();

    let session = pipeline.extract_data(&session.id, None, None).await.unwrap();
    let extraction = session.data_extraction_data.as_ref().unwrap();
    assert_eq!(extraction.products.len(), 3);
    let calls = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(calls.lines().count(), 3);
}

#[tokio::test]
async fn test_phases_cannot_run_out_of_order() {
    let bin_dir = tempfile::tempdir().unwrap();
    let interpreter = install_fake_interpreter(bin_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = build_pipeline(Arc::clone(&store), Arc::new(StubGenerator), &interpreter);

    let session = pipeline
        .create_session("user-1", "comp-1", "https://shop.example")
        .unwrap();

    // Collection before analysis approval.
    let err = pipeline.collect_urls(&session.id, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    // Extraction straight away.
    let err = pipeline
        .extract_data(&session.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    // Approving a phase with no payload.
    let err = pipeline
        .approve_phase(&session.id, SessionPhase::Analysis, None)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    // Approving a phase the session is not in.
    let err = pipeline
        .approve_phase(&session.id, SessionPhase::DataExtraction, None)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
}

#[tokio::test]
async fn test_generator_outage_surfaces_as_collaborator_error() {
    let bin_dir = tempfile::tempdir().unwrap();
    let interpreter = install_fake_interpreter(bin_dir.path());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = build_pipeline(Arc::clone(&store), Arc::new(DownGenerator), &interpreter);

    let mut session = pipeline
        .create_session("user-1", "comp-1", "https://shop.example")
        .unwrap();
    session.analysis_data = Some(approved_analysis("https://shop.example"));
    store.save_session(&session).unwrap();
    pipeline
        .approve_phase(&session.id, SessionPhase::Analysis, None)
        .unwrap();

    let err = pipeline.collect_urls(&session.id, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::CollaboratorUnavailable(_)));

    // The failed phase left no payload behind.
    let reloaded = store.get_session(&session.id).unwrap().unwrap();
    assert!(reloaded.url_collection_data.is_none());
    assert_eq!(reloaded.current_phase, SessionPhase::UrlCollection);
}
