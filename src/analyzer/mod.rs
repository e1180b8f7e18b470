//! Target-site analysis.
//!
//! One pass over a storefront produces everything later phases need:
//! sitemaps, classified navigation links, probed API endpoints, guessed
//! product selectors, and a proposed scraping strategy. Every sub-step
//! degrades gracefully — only an unreachable seed page fails the phase.

pub mod endpoints;
pub mod links;
pub mod selectors;
pub mod sitemap;

use scraper::{Html, Selector};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::model::{AnalysisData, ApiEndpoint, Strategy};

/// Kept from the seed page for prompt context.
const HTML_SAMPLE_CHARS: usize = 3_000;

/// Operator-supplied starting points that skip discovery guesswork.
#[derive(Debug, Clone, Default)]
pub struct AnalysisHints {
    pub sitemap_url: Option<String>,
    pub category_page: Option<String>,
    pub product_page: Option<String>,
}

pub struct SiteAnalyzer {
    fetcher: Fetcher,
    fetch_timeout_ms: u64,
    probe_timeout_ms: u64,
}

impl SiteAnalyzer {
    pub fn new(fetcher: Fetcher, config: &PipelineConfig) -> Self {
        Self {
            fetcher,
            fetch_timeout_ms: config.fetch_timeout_ms,
            probe_timeout_ms: config.probe_timeout_ms,
        }
    }

    /// Analyze the site behind `url`.
    pub async fn analyze(&self, url: &str, hints: &AnalysisHints) -> Result<AnalysisData> {
        tracing::info!("analyzing {url}");
        let seed = self.fetcher.get(url, self.fetch_timeout_ms).await?;
        let html = seed.body;
        let base_url = seed.final_url;

        let title = page_title(&html);
        let sitemap_urls = sitemap::discover_sitemaps(
            &self.fetcher,
            &base_url,
            hints.sitemap_url.as_deref(),
            self.fetch_timeout_ms,
        )
        .await;
        tracing::info!("found {} sitemap(s)", sitemap_urls.len());

        let mut classified = links::classify_links(&html, &base_url);
        if let Some(category) = &hints.category_page {
            if !classified.category_pages.contains(category) {
                classified.category_pages.insert(0, category.clone());
            }
        }

        let mut api_endpoints = endpoints::extract_inline_endpoints(&html, &base_url);
        let from_bundles = endpoints::extract_bundle_endpoints(
            &self.fetcher,
            &html,
            &base_url,
            self.fetch_timeout_ms,
        )
        .await;
        for endpoint in from_bundles {
            if !api_endpoints.iter().any(|e| e.url == endpoint.url) {
                api_endpoints.push(endpoint);
            }
        }
        endpoints::probe_endpoints(&self.fetcher, &mut api_endpoints, self.probe_timeout_ms).await;
        tracing::info!(
            "discovered {} endpoint candidate(s), {} verified",
            api_endpoints.len(),
            api_endpoints.iter().filter(|e| e.verified_json).count()
        );

        let sample_product_url = hints
            .product_page
            .clone()
            .or_else(|| classified.product_listing_pages.first().cloned());
        let product_selectors = match sample_product_url {
            Some(sample_url) => match self.fetcher.get(&sample_url, self.fetch_timeout_ms).await {
                Ok(resp) if resp.is_success() => Some(selectors::identify_selectors(&resp.body)),
                Ok(resp) => {
                    tracing::debug!("selector sample {sample_url} returned HTTP {}", resp.status);
                    None
                }
                Err(e) => {
                    tracing::debug!("selector sample fetch failed: {e}");
                    None
                }
            },
            None => None,
        };

        let (proposed_strategy, strategy_description) = decide_strategy(
            &api_endpoints,
            &sitemap_urls,
            &classified.brand_pages,
            &classified.category_pages,
            &classified.product_listing_pages,
        );

        Ok(AnalysisData {
            url: base_url,
            title,
            sitemap_urls,
            brand_pages: classified.brand_pages,
            category_pages: classified.category_pages,
            product_listing_pages: classified.product_listing_pages,
            api_endpoints,
            proposed_strategy,
            strategy_description,
            product_selectors,
            html_sample: html.chars().take(HTML_SAMPLE_CHARS).collect(),
            approved: false,
            user_feedback: None,
        })
    }
}

/// Pick the scraping strategy from the analysis evidence.
///
/// `api` requires at least one product-flagged endpoint that answered a
/// probe with real JSON; anything less means markup scraping, with the
/// entry point chosen in the order sitemap, brand index, category tree,
/// product listings.
pub fn decide_strategy(
    api_endpoints: &[ApiEndpoint],
    sitemap_urls: &[String],
    brand_pages: &[String],
    category_pages: &[String],
    product_listing_pages: &[String],
) -> (Strategy, String) {
    let verified_product_api = api_endpoints
        .iter()
        .find(|e| (e.is_product_list || e.is_product_detail) && e.verified_json);

    if let Some(endpoint) = verified_product_api {
        return (
            Strategy::Api,
            format!(
                "drive the verified JSON product API directly, starting from {}",
                endpoint.url
            ),
        );
    }

    let entry = if !sitemap_urls.is_empty() {
        "enumerate product URLs from the sitemap"
    } else if !brand_pages.is_empty() {
        "walk the brand index pages"
    } else if !category_pages.is_empty() {
        "walk the category tree"
    } else if !product_listing_pages.is_empty() {
        "walk the product listing pages"
    } else {
        "crawl from the start page"
    };
    (
        Strategy::Scraping,
        format!("scrape rendered pages; {entry}"),
    )
}

fn page_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("title") else {
        return String::new();
    };
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}
