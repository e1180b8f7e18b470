//! In-process execution of declarative scraper recipes.
//!
//! A recipe is a JSON document describing either a browser walk (selectors
//! over rendered pages) or an API walk (JSON paths over a paginated
//! endpoint). The engine interprets it natively, so these programs get the
//! same sandbox contract as Python scripts without spawning anything.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;
use crate::model::{ScrapedProduct, ScriptLanguage};
use crate::sandbox::browser::BrowserEngine;
use crate::sandbox::log::{ExecutionLog, LogPhase};
use crate::sandbox::{ExecutionMode, ExecutionReport, ScriptContext, ScriptEngine};

/// A declarative scraper program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipe {
    Browser(BrowserRecipe),
    Api(ApiRecipe),
}

/// Walk rendered pages with CSS selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserRecipe {
    pub start_urls: Vec<String>,
    /// Selector for links to individual product pages.
    pub product_link_selector: String,
    /// Selector for the "next page" link, when the site paginates.
    #[serde(default)]
    pub next_page_selector: Option<String>,
    pub fields: FieldSelectors,
    #[serde(default = "default_render_timeout_ms")]
    pub render_timeout_ms: u64,
}

/// CSS selectors for product-page fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSelectors {
    pub name: String,
    pub price: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
}

/// Page through a JSON API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRecipe {
    /// Endpoint URL; `{page}` is replaced with the page number.
    pub endpoint: String,
    #[serde(default = "default_start_page")]
    pub start_page: u64,
    /// Dot path to the item array in each response.
    pub items_path: String,
    /// Dot path to the catalog total, when the API reports one.
    #[serde(default)]
    pub total_path: Option<String>,
    pub fields: ApiFieldPaths,
}

/// Dot paths into each API item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFieldPaths {
    pub name: String,
    pub price: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

fn default_render_timeout_ms() -> u64 {
    30_000
}

fn default_start_page() -> u64 {
    1
}

/// Parse and structurally validate a recipe document.
pub fn parse_recipe(source: &str) -> Result<Recipe> {
    let recipe: Recipe = serde_json::from_str(source)
        .map_err(|e| PipelineError::malformed(format!("recipe: {e}"), source))?;
    if let Recipe::Browser(browser) = &recipe {
        check_selector(&browser.product_link_selector)?;
        if let Some(next) = &browser.next_page_selector {
            check_selector(next)?;
        }
        check_selector(&browser.fields.name)?;
        check_selector(&browser.fields.price)?;
        for opt in [&browser.fields.image, &browser.fields.sku, &browser.fields.brand] {
            if let Some(sel) = opt {
                check_selector(sel)?;
            }
        }
    }
    Ok(recipe)
}

fn check_selector(raw: &str) -> Result<()> {
    Selector::parse(raw)
        .map(|_| ())
        .map_err(|e| PipelineError::malformed(format!("invalid selector: {e}"), raw))
}

pub struct RecipeEngine {
    fetcher: Fetcher,
    browser: Option<Arc<dyn BrowserEngine>>,
    max_pages: usize,
    fetch_timeout_ms: u64,
    max_validation_products: usize,
}

impl RecipeEngine {
    pub fn new(
        config: &PipelineConfig,
        fetcher: Fetcher,
        browser: Option<Arc<dyn BrowserEngine>>,
    ) -> Self {
        Self {
            fetcher,
            browser,
            max_pages: config.max_recipe_pages,
            fetch_timeout_ms: config.fetch_timeout_ms,
            max_validation_products: config.max_validation_products,
        }
    }

    fn product_cap(&self, mode: ExecutionMode) -> Option<usize> {
        match mode {
            ExecutionMode::Validate => Some(self.max_validation_products),
            _ => None,
        }
    }

    async fn run_api(
        &self,
        recipe: &ApiRecipe,
        mode: ExecutionMode,
        log: &mut ExecutionLog,
    ) -> Result<ExecutionReport> {
        let cap = self.product_cap(mode);
        let mut products = Vec::new();
        let mut urls = Vec::new();
        let mut total = None;

        for page in recipe.start_page..recipe.start_page + self.max_pages as u64 {
            let url = recipe.endpoint.replace("{page}", &page.to_string());
            log.info(LogPhase::Pagination, format!("fetching page {page}: {url}"));
            let resp = self.fetcher.probe_json(&url, self.fetch_timeout_ms).await?;
            if !resp.is_success() {
                return Err(PipelineError::ScriptRuntime(format!(
                    "api returned HTTP {} for {url}",
                    resp.status
                )));
            }
            let body: serde_json::Value = serde_json::from_str(&resp.body).map_err(|e| {
                PipelineError::malformed(format!("api body: {e}"), truncate(&resp.body, 500))
            })?;

            if total.is_none() {
                if let Some(path) = &recipe.total_path {
                    total = json_path(&body, path).and_then(|v| v.as_u64());
                }
            }

            let items = match json_path(&body, &recipe.items_path).and_then(|v| v.as_array()) {
                Some(items) if !items.is_empty() => items.clone(),
                _ => {
                    log.info(LogPhase::Pagination, format!("page {page} empty, stopping"));
                    break;
                }
            };

            for item in &items {
                if mode == ExecutionMode::Collect {
                    if let Some(path) = &recipe.fields.url {
                        if let Some(u) = json_path(item, path).and_then(|v| v.as_str()) {
                            urls.push(u.to_string());
                        }
                    }
                } else if let Some(product) = item_to_product(item, &recipe.fields) {
                    products.push(product);
                }
            }
            log.info(
                LogPhase::Extraction,
                format!("page {page}: {} item(s)", items.len()),
            );

            if let Some(cap) = cap {
                if products.len() >= cap {
                    products.truncate(cap);
                    break;
                }
            }
            // Recipe has no pagination marker: a literal endpoint is a
            // single request, not a walk.
            if !recipe.endpoint.contains("{page}") {
                break;
            }
        }

        Ok(ExecutionReport {
            valid: true,
            products,
            urls,
            total_count: total,
            ..Default::default()
        })
    }

    async fn render(&self, url: &str, timeout_ms: u64) -> Result<String> {
        match &self.browser {
            Some(engine) => engine.render(url, timeout_ms).await,
            None => Err(PipelineError::CollaboratorUnavailable(
                "browser engine not configured".to_string(),
            )),
        }
    }

    /// Walk listing pages collecting product links, following the
    /// next-page selector up to the page budget.
    async fn collect_links(
        &self,
        recipe: &BrowserRecipe,
        log: &mut ExecutionLog,
    ) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        let mut pages_visited = 0usize;

        for start in &recipe.start_urls {
            let mut current = Some(start.clone());
            while let Some(page_url) = current.take() {
                if pages_visited >= self.max_pages {
                    break;
                }
                pages_visited += 1;
                log.info(LogPhase::Navigation, format!("rendering {page_url}"));
                let html = self.render(&page_url, recipe.render_timeout_ms).await?;
                let (links, next) = scan_listing_page(
                    &html,
                    &page_url,
                    &recipe.product_link_selector,
                    recipe.next_page_selector.as_deref(),
                );
                for link in links {
                    if seen.insert(link.clone()) {
                        collected.push(link);
                    }
                }
                current = next;
            }
        }
        Ok(collected)
    }

    async fn run_browser(
        &self,
        recipe: &BrowserRecipe,
        mode: ExecutionMode,
        ctx: &ScriptContext,
        log: &mut ExecutionLog,
    ) -> Result<ExecutionReport> {
        if mode == ExecutionMode::Collect {
            let urls = self.collect_links(recipe, log).await?;
            return Ok(ExecutionReport {
                valid: true,
                total_count: Some(urls.len() as u64),
                urls,
                ..Default::default()
            });
        }

        // Extract mode works the caller's URL list; validate/run discover
        // their own targets first.
        let targets = if mode == ExecutionMode::Extract && !ctx.target_urls.is_empty() {
            ctx.target_urls.clone()
        } else {
            self.collect_links(recipe, log).await?
        };

        let cap = self.product_cap(mode);
        let mut products = Vec::new();
        for target in &targets {
            if let Some(cap) = cap {
                if products.len() >= cap {
                    break;
                }
            }
            log.info(LogPhase::Navigation, format!("rendering {target}"));
            let html = self.render(target, recipe.render_timeout_ms).await?;
            match extract_product(&html, target, &recipe.fields) {
                Some(product) => products.push(product),
                None => log.warn(
                    LogPhase::Extraction,
                    format!("no product fields matched on {target}"),
                ),
            }
        }

        Ok(ExecutionReport {
            valid: true,
            products,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ScriptEngine for RecipeEngine {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Recipe
    }

    async fn run(
        &self,
        source: &str,
        mode: ExecutionMode,
        ctx: &ScriptContext,
    ) -> Result<ExecutionReport> {
        let mut log = ExecutionLog::new();

        let recipe = match parse_recipe(source) {
            Ok(recipe) => recipe,
            Err(e) => {
                log.error(LogPhase::Setup, e.to_string());
                return Ok(ExecutionReport::failed(&e, log.into_entries()));
            }
        };

        let outcome = match &recipe {
            Recipe::Api(api) => self.run_api(api, mode, &mut log).await,
            Recipe::Browser(browser) => self.run_browser(browser, mode, ctx, &mut log).await,
        };

        let mut report = match outcome {
            Ok(report) => report,
            Err(e) => {
                log.error(LogPhase::Extraction, e.to_string());
                return Ok(ExecutionReport::failed(&e, log.into_entries()));
            }
        };

        report.products.retain(|p| p.is_usable());
        let empty = match mode {
            ExecutionMode::Collect => report.urls.is_empty(),
            _ => report.products.is_empty(),
        };
        if empty {
            let err = PipelineError::NoResults;
            log.error(LogPhase::Extraction, "recipe produced no records");
            return Ok(ExecutionReport::failed(&err, log.into_entries()));
        }

        report.log = log.into_entries();
        Ok(report)
    }
}

/// Pull product links and the next-page link out of one rendered listing
/// page. Synchronous on purpose: `Html` is not `Send` and must not live
/// across an await.
fn scan_listing_page(
    html: &str,
    base: &str,
    link_selector: &str,
    next_selector: Option<&str>,
) -> (Vec<String>, Option<String>) {
    let doc = Html::parse_document(html);
    let links = match Selector::parse(link_selector) {
        Ok(sel) => doc
            .select(&sel)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| resolve_url(base, href))
            .collect(),
        Err(_) => Vec::new(),
    };
    let next = next_selector
        .and_then(|raw| Selector::parse(raw).ok())
        .and_then(|sel| {
            doc.select(&sel)
                .filter_map(|el| el.value().attr("href"))
                .filter_map(|href| resolve_url(base, href))
                .next()
        });
    (links, next)
}

fn extract_product(html: &str, url: &str, fields: &FieldSelectors) -> Option<ScrapedProduct> {
    let doc = Html::parse_document(html);
    let name = select_text(&doc, &fields.name)?;
    let price_text = select_text(&doc, &fields.price);
    let price = price_text.as_deref().and_then(parse_price);
    if price.is_none() && price_text.is_none() {
        return None;
    }
    Some(ScrapedProduct {
        name,
        url: Some(url.to_string()),
        competitor_price: price,
        raw_price: price_text,
        sku: fields.sku.as_deref().and_then(|s| select_text(&doc, s)),
        brand: fields.brand.as_deref().and_then(|s| select_text(&doc, s)),
        image_url: fields
            .image
            .as_deref()
            .and_then(|s| select_attr(&doc, s, "src"))
            .and_then(|src| resolve_url(url, &src)),
        is_available: Some(true),
        ..Default::default()
    })
}

fn select_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text = doc
        .select(&sel)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn select_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()?
        .value()
        .attr(attr)
        .map(|s| s.to_string())
}

fn resolve_url(base: &str, href: &str) -> Option<String> {
    Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

/// Walk a dot path into a JSON value.
fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = current.get(segment)?;
    }
    Some(current)
}

fn item_to_product(item: &serde_json::Value, fields: &ApiFieldPaths) -> Option<ScrapedProduct> {
    let name = json_path(item, &fields.name)?.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let price_value = json_path(item, &fields.price);
    let price = price_value.and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(parse_price))
    });
    let raw_price = price_value.and_then(|v| v.as_str()).map(|s| s.to_string());

    let path_str = |opt: &Option<String>| {
        opt.as_deref()
            .and_then(|p| json_path(item, p))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    Some(ScrapedProduct {
        name,
        competitor_price: price,
        raw_price,
        url: path_str(&fields.url),
        sku: path_str(&fields.sku),
        brand: path_str(&fields.brand),
        ean: path_str(&fields.ean),
        image_url: path_str(&fields.image),
        currency_code: path_str(&fields.currency),
        is_available: Some(true),
        ..Default::default()
    })
}

/// Parse a price out of display text. Handles currency symbols, thousands
/// separators, and decimal commas.
pub(crate) fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        // Both present: the later one is the decimal separator.
        (Some(d), Some(c)) if d > c => cleaned.replace(',', ""),
        (Some(_), Some(_)) => cleaned.replace('.', "").replace(',', "."),
        // Comma only: decimal comma unless it reads like a thousands group.
        (None, Some(c)) => {
            let after = cleaned.len() - c - 1;
            if after == 3 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };
    normalized.parse::<f64>().ok()
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
