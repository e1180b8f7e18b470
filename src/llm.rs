//! Code-generation boundary.
//!
//! The pipeline talks to "something that turns a prompt into program text"
//! through the `CodeGenerator` trait; the Gemini REST client is the
//! production implementation and tests plug in canned generators.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PipelineError, Result};

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const GENERATION_TIMEOUT_SECS: u64 = 90;

/// Turns a system + user prompt pair into generated program text.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Gemini `generateContent` client.
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(GENERATION_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Build from `PRICEWATCH_GEMINI_API_KEY` / `PRICEWATCH_GEMINI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("PRICEWATCH_GEMINI_API_KEY").map_err(|_| {
            PipelineError::CollaboratorUnavailable(
                "PRICEWATCH_GEMINI_API_KEY is not set".to_string(),
            )
        })?;
        let model =
            std::env::var("PRICEWATCH_GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(api_key, model))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl CodeGenerator for GeminiGenerator {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!(
            "{GEMINI_BASE}/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "systemInstruction": {
                "parts": [{ "text": system_prompt }]
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": user_prompt }]
            }]
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::CollaboratorUnavailable(format!("gemini: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PipelineError::CollaboratorUnavailable(format!(
                "gemini returned HTTP {status}"
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| PipelineError::malformed(format!("gemini response: {e}"), text.clone()))?;

        let generated = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .map(|p| p.text)
            .collect::<String>();

        if generated.trim().is_empty() {
            return Err(PipelineError::malformed(
                "gemini returned an empty completion",
                text,
            ));
        }
        Ok(generated)
    }
}
