//! Navigation link classification.
//!
//! Buckets same-origin links from a storefront page into brand pages,
//! category pages, and product listing pages, using multilingual path
//! pattern tables. Webshops in this market are frequently Dutch, German,
//! French, or Scandinavian, so the tables carry those variants too.

use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

const BRAND_PATTERNS: &[&str] = &[
    "/brand",
    "/brands",
    "/merk",
    "/merken",
    "/marque",
    "/marques",
    "/marke",
    "/marken",
    "/varumarke",
    "/varumarken",
    "/maerker",
];

const CATEGORY_PATTERNS: &[&str] = &[
    "/category",
    "/categories",
    "/collection",
    "/collections",
    "/shop/",
    "/categorie",
    "/categorieen",
    "/kategorie",
    "/kategorien",
    "/kategori",
    "/afdeling",
];

const PRODUCT_LIST_PATTERNS: &[&str] = &[
    "/product",
    "/products",
    "/producten",
    "/produkte",
    "/produkter",
    "/item",
    "/items",
    "/artikel",
    "/p/",
];

/// Per-class cap, so one mega-menu cannot flood the analysis payload.
const MAX_LINKS_PER_CLASS: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct ClassifiedLinks {
    pub brand_pages: Vec<String>,
    pub category_pages: Vec<String>,
    pub product_listing_pages: Vec<String>,
}

/// Classify every same-origin link on the page.
pub fn classify_links(html: &str, base_url: &str) -> ClassifiedLinks {
    let doc = Html::parse_document(html);
    let Ok(anchor) = Selector::parse("a[href]") else {
        return ClassifiedLinks::default();
    };
    let base = Url::parse(base_url).ok();

    let mut result = ClassifiedLinks::default();
    let mut seen: HashSet<String> = HashSet::new();

    for element in doc.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(resolved) = resolve_same_origin(&base, href) else {
            continue;
        };
        if !seen.insert(resolved.clone()) {
            continue;
        }

        let path = path_of(&resolved);
        if matches_any(&path, BRAND_PATTERNS) {
            push_capped(&mut result.brand_pages, resolved);
        } else if matches_any(&path, CATEGORY_PATTERNS) {
            push_capped(&mut result.category_pages, resolved);
        } else if matches_any(&path, PRODUCT_LIST_PATTERNS) {
            push_capped(&mut result.product_listing_pages, resolved);
        }
    }

    // Second chance for brand pages: footers often hold the brand index
    // under a link whose path says nothing useful.
    if result.brand_pages.is_empty() {
        result.brand_pages = footer_brand_links(&doc, &base);
    }

    result
}

fn footer_brand_links(doc: &Html, base: &Option<Url>) -> Vec<String> {
    const BRAND_WORDS: &[&str] = &["brands", "brand", "merken", "marques", "marken", "varumarken"];
    let Ok(footer_anchor) = Selector::parse("footer a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();
    for element in doc.select(&footer_anchor) {
        let text = element.text().collect::<String>().to_lowercase();
        if !BRAND_WORDS.iter().any(|w| text.trim() == *w) {
            continue;
        }
        if let Some(href) = element.value().attr("href") {
            if let Some(resolved) = resolve_same_origin(base, href) {
                push_capped(&mut links, resolved);
            }
        }
    }
    links
}

fn resolve_same_origin(base: &Option<Url>, href: &str) -> Option<String> {
    let base = base.as_ref()?;
    let resolved = base.join(href).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    if resolved.host_str() != base.host_str() {
        return None;
    }
    Some(resolved.to_string())
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase())
}

fn matches_any(path: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| path.contains(p))
}

fn push_capped(list: &mut Vec<String>, url: String) {
    if list.len() < MAX_LINKS_PER_CLASS {
        list.push(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_by_path_pattern() {
        let html = r#"
            <nav>
                <a href="/merken/philips">Philips</a>
                <a href="/categorieen/keuken">Keuken</a>
                <a href="/products/blenders">Blenders</a>
                <a href="/about">About us</a>
            </nav>
        "#;
        let links = classify_links(html, "https://shop.example/");
        assert_eq!(links.brand_pages, vec!["https://shop.example/merken/philips"]);
        assert_eq!(
            links.category_pages,
            vec!["https://shop.example/categorieen/keuken"]
        );
        assert_eq!(
            links.product_listing_pages,
            vec!["https://shop.example/products/blenders"]
        );
    }

    #[test]
    fn test_drops_cross_origin_links() {
        let html = r#"<a href="https://other.example/brands/x">elsewhere</a>"#;
        let links = classify_links(html, "https://shop.example/");
        assert!(links.brand_pages.is_empty());
    }

    #[test]
    fn test_footer_fallback_finds_brand_index() {
        let html = r#"
            <a href="/info">Info</a>
            <footer>
                <a href="/a-z">Merken</a>
                <a href="/contact">Contact</a>
            </footer>
        "#;
        let links = classify_links(html, "https://shop.example/");
        assert_eq!(links.brand_pages, vec!["https://shop.example/a-z"]);
    }

    #[test]
    fn test_dedup_and_cap() {
        let mut html = String::new();
        for i in 0..80 {
            html.push_str(&format!("<a href=\"/products/item-{i}\">x</a>"));
            html.push_str("<a href=\"/products/item-0\">dup</a>");
        }
        let links = classify_links(&html, "https://shop.example/");
        assert_eq!(links.product_listing_pages.len(), MAX_LINKS_PER_CLASS);
    }

    #[test]
    fn test_empty_page() {
        let links = classify_links("", "https://shop.example/");
        assert!(links.brand_pages.is_empty());
        assert!(links.category_pages.is_empty());
        assert!(links.product_listing_pages.is_empty());
    }
}
