//! Product-page selector probing.
//!
//! Tries ordered candidate tables against a sample product page and keeps
//! the first selector per field that actually matches. A price selector
//! only counts when the matched text contains a digit.

use scraper::{Html, Selector};

use crate::model::ProductSelectors;

const NAME_CANDIDATES: &[&str] = &[
    "h1.product-title",
    "h1.product-name",
    "h1[itemprop=\"name\"]",
    ".product-title h1",
    ".product__title",
    ".product-info h1",
    "h1",
];

const PRICE_CANDIDATES: &[&str] = &[
    "[itemprop=\"price\"]",
    ".product-price",
    ".price__current",
    ".product__price",
    "span.price",
    ".price",
    "span.amount",
];

const IMAGE_CANDIDATES: &[&str] = &[
    "img[itemprop=\"image\"]",
    ".product-image img",
    ".product__media img",
    ".product-gallery img",
    "img.product-image",
];

/// Probe the candidate tables against a product page.
pub fn identify_selectors(html: &str) -> ProductSelectors {
    let doc = Html::parse_document(html);
    ProductSelectors {
        name: first_with_text(&doc, NAME_CANDIDATES, false),
        price: first_with_text(&doc, PRICE_CANDIDATES, true),
        image: first_with_src(&doc, IMAGE_CANDIDATES),
    }
}

fn first_with_text(doc: &Html, candidates: &[&str], require_digit: bool) -> Option<String> {
    for candidate in candidates {
        let Ok(sel) = Selector::parse(candidate) else {
            continue;
        };
        if let Some(element) = doc.select(&sel).next() {
            let text = element.text().collect::<String>();
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if require_digit && !text.chars().any(|c| c.is_ascii_digit()) {
                continue;
            }
            return Some(candidate.to_string());
        }
    }
    None
}

fn first_with_src(doc: &Html, candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        let Ok(sel) = Selector::parse(candidate) else {
            continue;
        };
        if doc
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("src"))
            .is_some()
        {
            return Some(candidate.to_string());
        }
    }
    None
}
