//! Sitemap discovery and parsing.
//!
//! Discovery order: operator hint, robots.txt `Sitemap:` lines, then
//! common well-known paths. Index files are expanded one level with a
//! bounded fetch budget; a site with a pathological sitemap tree still
//! finishes in bounded time.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashSet;

use crate::error::{PipelineError, Result};
use crate::fetch::Fetcher;

/// Well-known sitemap locations probed when robots.txt is silent.
const COMMON_SITEMAP_PATHS: &[&str] = &[
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemap-index.xml",
    "/wp-sitemap.xml",
    "/sitemap/sitemap.xml",
];

/// Cap on sitemap documents fetched during discovery.
const MAX_SITEMAP_FETCHES: usize = 10;

/// Parsed content of one sitemap document.
#[derive(Debug, Clone, Default)]
pub struct SitemapScan {
    /// Page URLs from `<url><loc>` entries.
    pub page_urls: Vec<String>,
    /// Child sitemap URLs from `<sitemap><loc>` entries (index files).
    pub child_sitemaps: Vec<String>,
}

/// Parse a sitemap XML document, handling both urlset and index forms.
pub fn parse_sitemap(xml: &str) -> Result<SitemapScan> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut scan = SitemapScan::default();
    let mut buf = Vec::new();

    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;
    let mut current_loc = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                match e.local_name().as_ref() {
                    b"url" => {
                        in_url = true;
                        current_loc.clear();
                    }
                    b"sitemap" => {
                        in_sitemap = true;
                        current_loc.clear();
                    }
                    b"loc" => in_loc = true,
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" if in_url => {
                    if !current_loc.is_empty() {
                        scan.page_urls.push(current_loc.clone());
                    }
                    in_url = false;
                }
                b"sitemap" if in_sitemap => {
                    if !current_loc.is_empty() {
                        scan.child_sitemaps.push(current_loc.clone());
                    }
                    in_sitemap = false;
                }
                b"loc" => in_loc = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_loc && (in_url || in_sitemap) {
                    current_loc = e.unescape().unwrap_or_default().trim().to_string();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PipelineError::malformed(
                    format!("sitemap XML: {e}"),
                    truncated(xml),
                ))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(scan)
}

fn truncated(xml: &str) -> String {
    xml.chars().take(300).collect()
}

/// Extract `Sitemap:` directives from a robots.txt body.
pub fn sitemaps_from_robots(robots: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .strip_prefix("Sitemap:")
                .or_else(|| line.strip_prefix("sitemap:"))?;
            let url = rest.trim();
            if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            }
        })
        .collect()
}

/// Discover the site's sitemap documents, expanding index files one level.
///
/// Returns confirmed sitemap URLs (ones that fetched and parsed) in
/// discovery order. Errors on individual documents degrade to skips.
pub async fn discover_sitemaps(
    fetcher: &Fetcher,
    base_url: &str,
    hint: Option<&str>,
    timeout_ms: u64,
) -> Vec<String> {
    let origin = origin_of(base_url);
    let mut queue: Vec<String> = Vec::new();

    if let Some(hint) = hint {
        queue.push(hint.to_string());
    }

    if let Ok(resp) = fetcher.get(&format!("{origin}/robots.txt"), timeout_ms).await {
        if resp.is_success() {
            queue.extend(sitemaps_from_robots(&resp.body));
        }
    }

    if queue.is_empty() {
        let candidates: Vec<String> = COMMON_SITEMAP_PATHS
            .iter()
            .map(|p| format!("{origin}{p}"))
            .collect();
        let probes = fetcher.head_many(&candidates, 4).await;
        for probe in probes.into_iter().flatten() {
            if probe.status == 200 {
                queue.push(probe.url);
            }
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut confirmed = Vec::new();
    let mut fetches = 0usize;
    let mut index = 0usize;

    while index < queue.len() && fetches < MAX_SITEMAP_FETCHES {
        let url = queue[index].clone();
        index += 1;
        if !visited.insert(url.clone()) {
            continue;
        }
        fetches += 1;

        let resp = match fetcher.get(&url, timeout_ms).await {
            Ok(resp) if resp.is_success() => resp,
            Ok(resp) => {
                tracing::debug!("sitemap candidate {url} returned HTTP {}", resp.status);
                continue;
            }
            Err(e) => {
                tracing::debug!("sitemap candidate {url} failed: {e}");
                continue;
            }
        };
        match parse_sitemap(&resp.body) {
            Ok(scan) => {
                confirmed.push(url);
                queue.extend(scan.child_sitemaps);
            }
            Err(e) => {
                tracing::debug!("sitemap candidate did not parse: {e}");
            }
        }
    }

    confirmed
}

fn origin_of(base_url: &str) -> String {
    match url::Url::parse(base_url) {
        Ok(u) => format!(
            "{}://{}",
            u.scheme(),
            u.host_str().unwrap_or_default()
        ),
        Err(_) => base_url.trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <url><loc>https://shop.example/</loc></url>
          <url><loc>https://shop.example/p/kettle</loc><lastmod>2026-01-15</lastmod></url>
        </urlset>"#;
        let scan = parse_sitemap(xml).unwrap();
        assert_eq!(scan.page_urls.len(), 2);
        assert!(scan.child_sitemaps.is_empty());
        assert_eq!(scan.page_urls[1], "https://shop.example/p/kettle");
    }

    #[test]
    fn test_parse_sitemap_index() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <sitemap><loc>https://shop.example/sitemap-products.xml</loc></sitemap>
          <sitemap><loc>https://shop.example/sitemap-brands.xml</loc></sitemap>
        </sitemapindex>"#;
        let scan = parse_sitemap(xml).unwrap();
        assert!(scan.page_urls.is_empty());
        assert_eq!(scan.child_sitemaps.len(), 2);
    }

    #[test]
    fn test_robots_sitemap_lines() {
        let robots = "User-agent: *\nDisallow: /cart\nSitemap: https://shop.example/sitemap.xml\nsitemap: https://shop.example/sitemap-extra.xml\n";
        let urls = sitemaps_from_robots(robots);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], "https://shop.example/sitemap.xml");
    }

    /// Parser must never panic on arbitrary input.
    #[test]
    fn test_fuzz_sitemap_parser() {
        let fuzz_inputs = [
            "",
            "not xml at all",
            "<",
            "<url>",
            "<url><loc>",
            "<<<>>>",
            "<urlset><url></url></urlset>",
            "<urlset><url><loc></loc></url></urlset>",
            &"<url>".repeat(10_000),
            "\x00\x01\x02\x03",
            "<sitemapindex></sitemapindex>",
        ];
        for input in &fuzz_inputs {
            let _ = parse_sitemap(input);
        }
    }
}
