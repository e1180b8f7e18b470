//! Headless-browser page rendering for recipe programs.
//!
//! Browser recipes need rendered DOM, not raw HTTP bodies. The engine is a
//! trait so tests can feed canned HTML; production uses chromiumoxide.

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Find a Chromium/Chrome binary.
pub fn find_chromium() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("PRICEWATCH_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }
    None
}

/// Renders a URL to its post-JavaScript HTML.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn render(&self, url: &str, timeout_ms: u64) -> Result<String>;
}

/// Chromium-backed engine.
pub struct ChromiumEngine {
    browser: Browser,
}

impl ChromiumEngine {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> AnyResult<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found; set PRICEWATCH_CHROMIUM_PATH or install chrome")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self { browser })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn render(&self, url: &str, timeout_ms: u64) -> Result<String> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PipelineError::ScriptRuntime(format!("new page: {e}")))?;

        let nav = tokio::time::timeout(Duration::from_millis(timeout_ms), page.goto(url)).await;
        let html = match nav {
            Ok(Ok(_)) => {
                let _ = page.wait_for_navigation().await;
                page.evaluate("document.documentElement.outerHTML")
                    .await
                    .ok()
                    .and_then(|r| r.into_value::<String>().ok())
            }
            Ok(Err(e)) => {
                let _ = page.close().await;
                return Err(PipelineError::ScriptRuntime(format!(
                    "navigation to {url} failed: {e}"
                )));
            }
            Err(_) => {
                let _ = page.close().await;
                return Err(PipelineError::Timeout(Duration::from_millis(timeout_ms)));
            }
        };
        let _ = page.close().await;

        html.ok_or_else(|| PipelineError::ScriptRuntime(format!("no HTML rendered for {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_render_data_url() {
        let engine = ChromiumEngine::launch().await.expect("launch failed");
        let html = engine
            .render("data:text/html,<h1>Hello</h1>", 10_000)
            .await
            .expect("render failed");
        assert!(html.contains("<h1>Hello</h1>"));
    }
}
