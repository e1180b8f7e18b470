//! API endpoint discovery.
//!
//! Scans inline scripts and same-origin JavaScript bundles for URL string
//! literals that look like API calls, then verifies candidates with a live
//! JSON probe. Best-effort enrichment: sites with opaque bundles simply
//! produce an empty candidate list.

use regex::Regex;
use std::collections::HashSet;
use url::Url;

use crate::fetch::Fetcher;
use crate::model::ApiEndpoint;

/// Cap on bundle files fetched per analysis.
const MAX_SCRIPTS: usize = 5;
/// Bundles larger than this are skipped.
const MAX_SCRIPT_SIZE: usize = 5 * 1024 * 1024;
/// Cap on endpoint candidates probed.
const MAX_PROBES: usize = 10;
/// Probed response sample kept in the analysis payload.
const SAMPLE_CHARS: usize = 500;

/// Extract endpoint candidates from a page's inline scripts.
pub fn extract_inline_endpoints(html: &str, base_url: &str) -> Vec<ApiEndpoint> {
    let script_re =
        Regex::new(r"(?s)<script[^>]*>(.*?)</script>").expect("valid regex");
    let mut candidates = Vec::new();
    for cap in script_re.captures_iter(html) {
        if let Some(body) = cap.get(1) {
            candidates.extend(endpoints_from_js(body.as_str(), base_url));
        }
    }
    dedup_endpoints(candidates)
}

/// Fetch same-origin bundles referenced by the page and mine them too.
pub async fn extract_bundle_endpoints(
    fetcher: &Fetcher,
    html: &str,
    base_url: &str,
    timeout_ms: u64,
) -> Vec<ApiEndpoint> {
    let script_urls: Vec<String> = extract_script_urls(html, base_url)
        .into_iter()
        .take(MAX_SCRIPTS)
        .collect();
    if script_urls.is_empty() {
        return Vec::new();
    }

    let responses = fetcher.get_many(&script_urls, MAX_SCRIPTS, timeout_ms).await;
    let mut candidates = Vec::new();
    for resp in responses.into_iter().flatten() {
        if resp.status != 200 || resp.body.len() > MAX_SCRIPT_SIZE {
            continue;
        }
        candidates.extend(endpoints_from_js(&resp.body, base_url));
    }
    dedup_endpoints(candidates)
}

/// Mine one JavaScript text for API-looking URL literals.
pub fn endpoints_from_js(js: &str, base_url: &str) -> Vec<ApiEndpoint> {
    let patterns = [
        // Absolute or rooted paths under an api-ish prefix.
        Regex::new(r#"["'](/(?:api|rest|graphql|ajax)/[^"'\s<>]*)["']"#).expect("valid regex"),
        // fetch("...") and axios.get("...") style calls.
        Regex::new(r#"fetch\(\s*["']([^"'\s<>]+)["']"#).expect("valid regex"),
        Regex::new(r#"axios\.(?:get|post)\(\s*["']([^"'\s<>]+)["']"#).expect("valid regex"),
        // Fully-qualified URLs that mention /api/.
        Regex::new(r#"["'](https?://[^"'\s<>]*/api/[^"'\s<>]*)["']"#).expect("valid regex"),
    ];

    let mut endpoints = Vec::new();
    for pattern in &patterns {
        for cap in pattern.captures_iter(js) {
            let Some(raw) = cap.get(1) else { continue };
            let Some(resolved) = resolve_candidate(raw.as_str(), base_url) else {
                continue;
            };
            endpoints.push(classify_endpoint(resolved));
        }
    }
    endpoints
}

fn resolve_candidate(raw: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(raw).ok()?;
    if resolved.host_str() != base.host_str() {
        return None;
    }
    // Template placeholders in minified code are noise.
    if resolved.as_str().contains("${") || resolved.as_str().contains("{{") {
        return None;
    }
    let path = resolved.path().to_lowercase();
    let api_like = ["/api/", "/rest/", "/graphql", "/ajax/"]
        .iter()
        .any(|p| path.contains(p));
    if !api_like {
        return None;
    }
    Some(resolved.to_string())
}

fn classify_endpoint(url: String) -> ApiEndpoint {
    let lower = url.to_lowercase();
    let is_product_list = ["/products", "/items", "/catalog", "/search", "/articles"]
        .iter()
        .any(|p| lower.contains(p));
    let is_product_detail = !is_product_list
        && ["/product/", "/item/", "/article/"]
            .iter()
            .any(|p| lower.contains(p));
    let description = if is_product_list {
        "candidate product list endpoint".to_string()
    } else if is_product_detail {
        "candidate product detail endpoint".to_string()
    } else {
        "discovered in page scripts".to_string()
    };
    ApiEndpoint {
        url,
        method: "GET".to_string(),
        params: Default::default(),
        headers: Default::default(),
        description,
        is_product_list,
        is_product_detail,
        verified_json: false,
        sample_response: None,
    }
}

fn dedup_endpoints(endpoints: Vec<ApiEndpoint>) -> Vec<ApiEndpoint> {
    let mut seen = HashSet::new();
    endpoints
        .into_iter()
        .filter(|e| seen.insert(e.url.clone()))
        .collect()
}

/// Probe candidates with a short-timeout GET; mark the ones that answer
/// with parseable JSON and keep a truncated sample for prompt context.
pub async fn probe_endpoints(
    fetcher: &Fetcher,
    endpoints: &mut [ApiEndpoint],
    timeout_ms: u64,
) {
    for endpoint in endpoints.iter_mut().take(MAX_PROBES) {
        match fetcher.probe_json(&endpoint.url, timeout_ms).await {
            Ok(resp) if resp.is_success() && resp.is_json() => {
                if serde_json::from_str::<serde_json::Value>(&resp.body).is_ok() {
                    endpoint.verified_json = true;
                    endpoint.sample_response =
                        Some(resp.body.chars().take(SAMPLE_CHARS).collect());
                }
            }
            Ok(resp) => {
                tracing::debug!(
                    "endpoint probe {} answered HTTP {} ({})",
                    endpoint.url,
                    resp.status,
                    resp.content_type.as_deref().unwrap_or("no content type")
                );
            }
            Err(e) => {
                tracing::debug!("endpoint probe {} failed: {e}", endpoint.url);
            }
        }
    }
}

/// Extract same-origin `<script src>` URLs, skipping analytics and CDNs.
pub fn extract_script_urls(html: &str, base_url: &str) -> Vec<String> {
    let re = Regex::new(r#"<script[^>]+src\s*=\s*["']([^"']+)["']"#).expect("valid regex");
    let base = match Url::parse(base_url) {
        Ok(u) => u,
        Err(_) => return Vec::new(),
    };

    let mut urls = Vec::new();
    for cap in re.captures_iter(html) {
        let Some(src) = cap.get(1) else { continue };
        let Ok(resolved) = base.join(src.as_str()) else {
            continue;
        };
        let resolved = resolved.to_string();
        if is_analytics_or_cdn(&resolved) {
            continue;
        }
        if Url::parse(&resolved)
            .map(|u| u.host_str() != base.host_str())
            .unwrap_or(true)
        {
            continue;
        }
        urls.push(resolved);
    }
    urls
}

fn is_analytics_or_cdn(url: &str) -> bool {
    const SKIP_PATTERNS: &[&str] = &[
        "google-analytics.com",
        "googletagmanager.com",
        "googlesyndication.com",
        "gstatic.com",
        "facebook.net",
        "connect.facebook.net",
        "hotjar.com",
        "segment.com",
        "analytics.",
        "cdnjs.cloudflare.com",
        "unpkg.com",
        "cdn.jsdelivr.net",
        "ajax.googleapis.com",
        "code.jquery.com",
        "sentry.io",
        "mixpanel.com",
        "clarity.ms",
        "doubleclick.net",
        "intercom.io",
        "zendesk.com",
    ];
    let lower = url.to_lowercase();
    SKIP_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_endpoint_discovery() {
        let html = r#"
            <script>
                fetch("/api/products?page=1").then(r => r.json());
                const detail = "/api/product/123";
            </script>
        "#;
        let endpoints = extract_inline_endpoints(html, "https://shop.example/");
        assert_eq!(endpoints.len(), 2);
        let list = endpoints
            .iter()
            .find(|e| e.url.contains("/api/products"))
            .unwrap();
        assert!(list.is_product_list);
        let detail = endpoints
            .iter()
            .find(|e| e.url.contains("/api/product/123"))
            .unwrap();
        assert!(detail.is_product_detail);
        assert!(!detail.is_product_list);
    }

    #[test]
    fn test_cross_origin_candidates_dropped() {
        let js = r#"fetch("https://tracker.example/api/products")"#;
        let endpoints = endpoints_from_js(js, "https://shop.example/");
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_template_literals_dropped() {
        let js = r#"const u = "/api/products/${id}";"#;
        let endpoints = endpoints_from_js(js, "https://shop.example/");
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_non_api_paths_ignored() {
        let js = r#"fetch("/assets/logo.png")"#;
        let endpoints = endpoints_from_js(js, "https://shop.example/");
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_dedup_by_url() {
        let js = r#"
            fetch("/api/products");
            axios.get("/api/products");
        "#;
        let endpoints = dedup_endpoints(endpoints_from_js(js, "https://shop.example/"));
        assert_eq!(endpoints.len(), 1);
    }

    #[test]
    fn test_script_url_extraction_filters() {
        let html = r#"
            <script src="/js/app.js"></script>
            <script src="https://www.google-analytics.com/analytics.js"></script>
            <script src="https://cdn.other.example/lib.js"></script>
            <script>inline()</script>
        "#;
        let urls = extract_script_urls(html, "https://shop.example/");
        assert_eq!(urls, vec!["https://shop.example/js/app.js"]);
    }
}
