//! Shared data model: sessions, phase payloads, programs, runs, deadlines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sandbox::log::LogEntry;

/// The four ordered phases of a generation session, plus the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Analysis,
    UrlCollection,
    DataExtraction,
    Assembly,
    Complete,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::UrlCollection => "url_collection",
            Self::DataExtraction => "data_extraction",
            Self::Assembly => "assembly",
            Self::Complete => "complete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "analysis" => Some(Self::Analysis),
            "url_collection" => Some(Self::UrlCollection),
            "data_extraction" => Some(Self::DataExtraction),
            "assembly" => Some(Self::Assembly),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    /// The phase that follows this one, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Analysis => Some(Self::UrlCollection),
            Self::UrlCollection => Some(Self::DataExtraction),
            Self::DataExtraction => Some(Self::Assembly),
            Self::Assembly => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

/// How the final scraper will reach product data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Drive a discovered JSON API directly.
    Api,
    /// Walk pages and extract from markup.
    Scraping,
}

/// Language of a scraper program's source artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    /// A Python script run out-of-process through the subprocess engine.
    Python,
    /// A declarative JSON recipe interpreted in-process.
    Recipe,
}

impl ScriptLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Recipe => "recipe",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "python" => Some(Self::Python),
            "recipe" => Some(Self::Recipe),
            _ => None,
        }
    }
}

/// A candidate API endpoint discovered during analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Request headers the endpoint needs (auth tokens, API keys).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    /// Looks like a product list endpoint (path heuristics).
    #[serde(default)]
    pub is_product_list: bool,
    /// Looks like a single-product endpoint.
    #[serde(default)]
    pub is_product_detail: bool,
    /// Probe confirmed an HTTP 200 JSON response.
    #[serde(default)]
    pub verified_json: bool,
    /// Truncated sample of the probed response body, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_response: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// CSS selectors guessed for a product page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductSelectors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Everything the analysis phase learned about the target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisData {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sitemap_urls: Vec<String>,
    #[serde(default)]
    pub brand_pages: Vec<String>,
    #[serde(default)]
    pub category_pages: Vec<String>,
    #[serde(default)]
    pub product_listing_pages: Vec<String>,
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,
    pub proposed_strategy: Strategy,
    #[serde(default)]
    pub strategy_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_selectors: Option<ProductSelectors>,
    /// Trimmed HTML sample retained for prompt context.
    #[serde(default)]
    pub html_sample: String,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
}

/// Result of the URL collection phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlCollectionData {
    /// Generated program source that produced these URLs.
    pub source: String,
    pub sample_urls: Vec<String>,
    /// Best-effort estimate of the total catalog size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
}

/// Result of the data extraction phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataExtractionData {
    /// Generated program source that produced these records.
    pub source: String,
    pub products: Vec<ScrapedProduct>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
}

/// Result of the assembly phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyData {
    pub source: String,
    pub language: ScriptLanguage,
    pub metadata: ProgramMetadata,
    /// Structural fixes appended during validation, for operator review.
    #[serde(default)]
    pub applied_fixes: Vec<String>,
    /// Persisted program row, once saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_id: Option<String>,
    pub assembled_at: DateTime<Utc>,
}

/// A product record in the shape the sandbox wire protocol emits.
///
/// Everything except the name is optional so partially-filled records
/// survive deserialization; usability filtering happens downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapedProduct {
    pub name: String,
    pub url: Option<String>,
    pub competitor_price: Option<f64>,
    pub currency_code: Option<String>,
    pub sku: Option<String>,
    pub brand: Option<String>,
    pub ean: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub is_available: Option<bool>,
    /// Unparsed price text, kept when numeric parsing failed.
    pub raw_price: Option<String>,
}

impl ScrapedProduct {
    /// A record is usable when it names a product and carries either a
    /// parsed price or at least the raw price text.
    pub fn is_usable(&self) -> bool {
        !self.name.trim().is_empty()
            && (self.competitor_price.is_some() || self.raw_price.is_some())
    }
}

/// Descriptive metadata a program reports about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub target_url: String,
    pub required_libraries: Vec<String>,
    pub generated_by: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// A saved scraper program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperProgram {
    pub id: String,
    pub user_id: String,
    pub competitor_id: String,
    pub name: String,
    pub language: ScriptLanguage,
    pub source: String,
    pub metadata: ProgramMetadata,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a run ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution of a saved program, as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub program_id: String,
    pub user_id: String,
    pub is_test_run: bool,
    pub status: RunStatus,
    pub product_count: u64,
    pub products_created: u64,
    pub products_updated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Snapshot of the effective execution config at creation time.
    pub config_snapshot: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A watchdog deadline paired with a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutDeadline {
    pub id: String,
    pub run_id: String,
    pub deadline: DateTime<Utc>,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// An interactive scraper generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: String,
    pub user_id: String,
    pub competitor_id: String,
    /// Seed URL the whole session analyzes.
    pub url: String,
    pub current_phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_data: Option<AnalysisData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_collection_data: Option<UrlCollectionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_extraction_data: Option<DataExtractionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_data: Option<AssemblyData>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
