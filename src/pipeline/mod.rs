//! Session lifecycle orchestration.
//!
//! Drives the four-phase generation flow: analyze, collect URLs, extract
//! data, assemble. Every phase writes its payload back to the session and
//! waits for operator approval before the next phase will run; skipping
//! ahead is a precondition failure, not a silent reorder.

pub mod assembly;
pub mod prompts;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::analyzer::{AnalysisHints, SiteAnalyzer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::llm::CodeGenerator;
use crate::model::{
    DataExtractionData, GenerationSession, ProgramMetadata, ScraperProgram, ScriptLanguage,
    SessionPhase, Strategy, UrlCollectionData,
};
use crate::sandbox::{ExecutionMode, ExecutionReport, Sandbox, ScriptContext};
use crate::store::Store;

/// Product pages sampled during the extraction phase.
const EXTRACTION_SAMPLE_URLS: usize = 10;

pub struct ScraperPipeline {
    store: Arc<Store>,
    analyzer: SiteAnalyzer,
    generator: Arc<dyn CodeGenerator>,
    sandbox: Arc<Sandbox>,
    config: PipelineConfig,
}

impl ScraperPipeline {
    pub fn new(
        store: Arc<Store>,
        analyzer: SiteAnalyzer,
        generator: Arc<dyn CodeGenerator>,
        sandbox: Arc<Sandbox>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            generator,
            sandbox,
            config,
        }
    }

    pub fn create_session(
        &self,
        user_id: &str,
        competitor_id: &str,
        url: &str,
    ) -> Result<GenerationSession> {
        let now = Utc::now();
        let session = GenerationSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            competitor_id: competitor_id.to_string(),
            url: url.to_string(),
            current_phase: SessionPhase::Analysis,
            analysis_data: None,
            url_collection_data: None,
            data_extraction_data: None,
            assembly_data: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(&session)?;
        tracing::info!("created session {} for {url}", session.id);
        Ok(session)
    }

    fn load_session(&self, session_id: &str) -> Result<GenerationSession> {
        self.store.get_session(session_id)?.ok_or_else(|| {
            PipelineError::precondition(format!("session {session_id} does not exist"))
        })
    }

    fn require_phase(session: &GenerationSession, phase: SessionPhase) -> Result<()> {
        if session.current_phase != phase {
            return Err(PipelineError::precondition(format!(
                "session is in phase {}, expected {}",
                session.current_phase.as_str(),
                phase.as_str()
            )));
        }
        Ok(())
    }

    /// Run (or re-run) the analysis phase.
    pub async fn analyze_session(
        &self,
        session_id: &str,
        hints: &AnalysisHints,
    ) -> Result<GenerationSession> {
        let mut session = self.load_session(session_id)?;
        Self::require_phase(&session, SessionPhase::Analysis)?;

        let analysis = self.analyzer.analyze(&session.url, hints).await?;
        session.analysis_data = Some(analysis);
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Approve the session's current phase and advance to the next one.
    ///
    /// Approval is only valid for the phase the session sits in, and only
    /// once that phase has produced its payload.
    pub fn approve_phase(
        &self,
        session_id: &str,
        phase: SessionPhase,
        feedback: Option<String>,
    ) -> Result<GenerationSession> {
        let mut session = self.load_session(session_id)?;
        Self::require_phase(&session, phase)?;

        match phase {
            SessionPhase::Analysis => {
                let data = session.analysis_data.as_mut().ok_or_else(|| {
                    PipelineError::precondition("analysis has not produced a result yet")
                })?;
                data.approved = true;
                data.user_feedback = feedback;
            }
            SessionPhase::UrlCollection => {
                let data = session.url_collection_data.as_mut().ok_or_else(|| {
                    PipelineError::precondition("url collection has not produced a result yet")
                })?;
                data.approved = true;
                data.user_feedback = feedback;
            }
            SessionPhase::DataExtraction => {
                let data = session.data_extraction_data.as_mut().ok_or_else(|| {
                    PipelineError::precondition("data extraction has not produced a result yet")
                })?;
                data.approved = true;
                data.user_feedback = feedback;
            }
            SessionPhase::Assembly => {
                if session.assembly_data.is_none() {
                    return Err(PipelineError::precondition(
                        "assembly has not produced a program yet",
                    ));
                }
            }
            SessionPhase::Complete => {
                return Err(PipelineError::precondition("session is already complete"));
            }
        }

        if let Some(next) = phase.next() {
            session.current_phase = next;
        }
        self.store.save_session(&session)?;
        tracing::info!(
            "session {session_id} approved {} -> {}",
            phase.as_str(),
            session.current_phase.as_str()
        );
        Ok(session)
    }

    /// Generate and execute the URL collection script.
    pub async fn collect_urls(
        &self,
        session_id: &str,
        feedback: Option<String>,
    ) -> Result<GenerationSession> {
        let mut session = self.load_session(session_id)?;
        Self::require_phase(&session, SessionPhase::UrlCollection)?;
        let analysis = session
            .analysis_data
            .clone()
            .filter(|a| a.approved)
            .ok_or_else(|| PipelineError::precondition("analysis is not approved"))?;

        let prompt = prompts::build_url_collection_prompt(&analysis, feedback.as_deref());
        let generated = self
            .generator
            .generate(prompts::URL_COLLECTION_SYSTEM_PROMPT, &prompt)
            .await?;
        let source = prompts::strip_code_fences(&generated);
        if !source.contains("def collect") {
            return Err(PipelineError::malformed(
                "generated program defines no collect entry point",
                source,
            ));
        }

        let ctx = ScriptContext {
            competitor_id: session.competitor_id.clone(),
            ..Default::default()
        };
        let report = self
            .sandbox
            .execute(ScriptLanguage::Python, &source, ExecutionMode::Collect, &ctx)
            .await?;
        if !report.valid {
            return Err(report_error(&report));
        }

        let mut sample_urls = report.urls;
        sample_urls.truncate(self.config.max_sample_urls);
        tracing::info!(
            "session {session_id} collected {} sample url(s)",
            sample_urls.len()
        );

        session.url_collection_data = Some(UrlCollectionData {
            source,
            sample_urls,
            total_count: report.total_count,
            log: report.log,
            approved: false,
            user_feedback: feedback,
        });
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Generate the extraction script and run it against sample URLs.
    ///
    /// Fan-out is per URL with bounded concurrency; individual page
    /// failures degrade the sample, and the phase only fails when every
    /// page failed.
    pub async fn extract_data(
        &self,
        session_id: &str,
        override_urls: Option<Vec<String>>,
        feedback: Option<String>,
    ) -> Result<GenerationSession> {
        let mut session = self.load_session(session_id)?;
        Self::require_phase(&session, SessionPhase::DataExtraction)?;
        let analysis = session
            .analysis_data
            .clone()
            .filter(|a| a.approved)
            .ok_or_else(|| PipelineError::precondition("analysis is not approved"))?;
        let collection = session
            .url_collection_data
            .clone()
            .filter(|c| c.approved)
            .ok_or_else(|| PipelineError::precondition("url collection is not approved"))?;

        let targets: Vec<String> = override_urls
            .unwrap_or(collection.sample_urls)
            .into_iter()
            .take(EXTRACTION_SAMPLE_URLS)
            .collect();
        if targets.is_empty() {
            return Err(PipelineError::precondition(
                "no sample URLs available for extraction",
            ));
        }

        let prompt = prompts::build_data_extraction_prompt(&analysis, &targets, feedback.as_deref());
        let generated = self
            .generator
            .generate(prompts::DATA_EXTRACTION_SYSTEM_PROMPT, &prompt)
            .await?;
        let source = prompts::strip_code_fences(&generated);
        if !source.contains("def scrape") {
            return Err(PipelineError::malformed(
                "generated program defines no scrape entry point",
                source,
            ));
        }

        // An API-strategy program pages the endpoint itself, so it gets the
        // whole batch in one invocation; markup scraping fans out per page.
        let reports: Vec<Result<ExecutionReport>> = if analysis.proposed_strategy == Strategy::Api {
            let ctx = ScriptContext {
                competitor_id: session.competitor_id.clone(),
                target_urls: targets.clone(),
                ..Default::default()
            };
            vec![
                self.sandbox
                    .execute(ScriptLanguage::Python, &source, ExecutionMode::Extract, &ctx)
                    .await,
            ]
        } else {
            stream::iter(targets.iter())
                .map(|target| {
                    let ctx = ScriptContext {
                        competitor_id: session.competitor_id.clone(),
                        target_urls: vec![target.clone()],
                        ..Default::default()
                    };
                    let sandbox = Arc::clone(&self.sandbox);
                    let source = source.clone();
                    async move {
                        sandbox
                            .execute(ScriptLanguage::Python, &source, ExecutionMode::Extract, &ctx)
                            .await
                    }
                })
                .buffer_unordered(self.config.fetch_concurrency)
                .collect()
                .await
        };

        let mut products = Vec::new();
        let mut log = Vec::new();
        let mut first_error = None;
        let mut successes = 0usize;
        for report in reports {
            let report = report?;
            if report.valid {
                successes += 1;
                products.extend(report.products);
            } else if first_error.is_none() {
                first_error = report.error.clone();
            }
            log.extend(report.log);
        }
        if successes == 0 {
            return Err(PipelineError::ScriptRuntime(
                first_error.unwrap_or_else(|| "every sample page failed".to_string()),
            ));
        }
        tracing::info!(
            "session {session_id} extracted {} product(s) from {successes}/{} page(s)",
            products.len(),
            targets.len()
        );

        session.data_extraction_data = Some(DataExtractionData {
            source,
            products,
            log,
            approved: false,
            user_feedback: feedback,
        });
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Compose the final program from the approved phase artifacts and
    /// persist it.
    pub fn assemble(&self, session_id: &str) -> Result<GenerationSession> {
        let mut session = self.load_session(session_id)?;
        Self::require_phase(&session, SessionPhase::Assembly)?;
        let analysis = session
            .analysis_data
            .clone()
            .filter(|a| a.approved)
            .ok_or_else(|| PipelineError::precondition("analysis is not approved"))?;
        let collection = session
            .url_collection_data
            .clone()
            .filter(|c| c.approved)
            .ok_or_else(|| PipelineError::precondition("url collection is not approved"))?;
        let extraction = session
            .data_extraction_data
            .clone()
            .filter(|e| e.approved)
            .ok_or_else(|| PipelineError::precondition("data extraction is not approved"))?;

        let (source, metadata, applied_fixes) =
            assembly::compose_program(&analysis, &collection.source, &extraction.source)?;

        let now = Utc::now();
        let program = ScraperProgram {
            id: Uuid::new_v4().to_string(),
            user_id: session.user_id.clone(),
            competitor_id: session.competitor_id.clone(),
            name: metadata.name.clone(),
            language: ScriptLanguage::Python,
            source: source.clone(),
            metadata: metadata.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_program(&program)?;
        tracing::info!("session {session_id} assembled program {}", program.id);

        session.assembly_data = Some(crate::model::AssemblyData {
            source,
            language: ScriptLanguage::Python,
            metadata,
            applied_fixes,
            program_id: Some(program.id),
            assembled_at: now,
        });
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Structurally fix then execute a candidate program in validate mode.
    pub async fn validate_program(
        &self,
        language: ScriptLanguage,
        source: &str,
        ctx: &ScriptContext,
    ) -> Result<(ExecutionReport, Vec<String>)> {
        let (source, applied_fixes) = match language {
            ScriptLanguage::Python => {
                let metadata = ProgramMetadata {
                    name: "candidate scraper".to_string(),
                    version: "0.0.0".to_string(),
                    ..Default::default()
                };
                let outcome = assembly::validate_and_fix_python(source, &metadata)?;
                (outcome.source, outcome.applied_fixes)
            }
            ScriptLanguage::Recipe => (source.to_string(), Vec::new()),
        };
        let report = self
            .sandbox
            .execute(language, &source, ExecutionMode::Validate, ctx)
            .await?;
        Ok((report, applied_fixes))
    }
}

fn report_error(report: &ExecutionReport) -> PipelineError {
    PipelineError::ScriptRuntime(
        report
            .error
            .clone()
            .unwrap_or_else(|| "execution failed".to_string()),
    )
}
