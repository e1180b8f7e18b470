//! Prompt construction for the code-generation phases.
//!
//! The prompts pin down the wire protocol the sandbox expects: a Python
//! script with `collect`/`scrape` subcommands that prints one JSON array
//! per line on stdout and nothing else.

use crate::model::AnalysisData;

pub const URL_COLLECTION_SYSTEM_PROMPT: &str = "\
You write production Python 3 web scrapers for e-commerce sites. \
Output ONLY Python source code, no explanations and no markdown fences. \
The script must be runnable as `python script.py collect --context <json>` \
and must define `def collect(context):` plus a `__main__` block that \
dispatches on sys.argv[1]. It may only use the requests and \
beautifulsoup4 libraries. Progress goes to stderr. On stdout print \
batches of discovered product-page URLs, each batch a single-line JSON \
array of strings, and optionally one final JSON object line \
{\"total_count\": N} with the estimated catalog size.";

pub const DATA_EXTRACTION_SYSTEM_PROMPT: &str = "\
You write production Python 3 web scrapers for e-commerce sites. \
Output ONLY Python source code, no explanations and no markdown fences. \
The script must be runnable as `python script.py scrape --context <json>` \
and must define `def scrape(context):` plus a `__main__` block that \
dispatches on sys.argv[1]. The context JSON carries `target_urls`, the \
product pages to extract. It may only use the requests and \
beautifulsoup4 libraries. Progress goes to stderr. On stdout print \
batches of product records, each batch a single-line JSON array of \
objects with keys: name, url, competitor_price (number or null), \
currency_code, sku, brand, ean, description, image_url, is_available, \
raw_price. Omit nothing; use null for unknown fields.";

/// Render the URL collection task from the approved analysis.
pub fn build_url_collection_prompt(analysis: &AnalysisData, feedback: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Target site: {} ({})\nProposed strategy: {}\n",
        analysis.url,
        analysis.title,
        analysis.strategy_description
    ));
    push_list(&mut prompt, "Sitemaps", &analysis.sitemap_urls);
    push_list(&mut prompt, "Brand pages", &analysis.brand_pages);
    push_list(&mut prompt, "Category pages", &analysis.category_pages);
    push_list(
        &mut prompt,
        "Product listing pages",
        &analysis.product_listing_pages,
    );
    push_endpoints(&mut prompt, analysis);
    prompt.push_str(
        "\nWrite the collect script. Gather as many distinct product-page \
         URLs as the entry points allow, deduplicated.\n",
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\nOperator feedback from the previous attempt:\n{feedback}\n"));
    }
    prompt
}

/// Render the data extraction task from the approved analysis and the
/// collected sample URLs.
pub fn build_data_extraction_prompt(
    analysis: &AnalysisData,
    sample_urls: &[String],
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Target site: {} ({})\nStrategy: {}\n",
        analysis.url,
        analysis.title,
        analysis.strategy_description
    ));
    if let Some(selectors) = &analysis.product_selectors {
        prompt.push_str("Selectors observed on a sample product page:\n");
        if let Some(name) = &selectors.name {
            prompt.push_str(&format!("  name: {name}\n"));
        }
        if let Some(price) = &selectors.price {
            prompt.push_str(&format!("  price: {price}\n"));
        }
        if let Some(image) = &selectors.image {
            prompt.push_str(&format!("  image: {image}\n"));
        }
    }
    push_endpoints(&mut prompt, analysis);
    push_list(&mut prompt, "Sample product URLs", sample_urls);
    prompt.push_str("\nHTML sample from the site:\n");
    prompt.push_str(&analysis.html_sample);
    prompt.push_str(
        "\n\nWrite the scrape script. Extract one record per product page \
         in context['target_urls'].\n",
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\nOperator feedback from the previous attempt:\n{feedback}\n"));
    }
    prompt
}

fn push_list(prompt: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    prompt.push_str(&format!("{label}:\n"));
    for item in items.iter().take(10) {
        prompt.push_str(&format!("  - {item}\n"));
    }
}

fn push_endpoints(prompt: &mut String, analysis: &AnalysisData) {
    let verified: Vec<_> = analysis
        .api_endpoints
        .iter()
        .filter(|e| e.verified_json)
        .collect();
    if verified.is_empty() {
        return;
    }
    prompt.push_str("Verified JSON API endpoints:\n");
    for endpoint in verified.iter().take(5) {
        prompt.push_str(&format!("  - {} {}", endpoint.method, endpoint.url));
        if !endpoint.headers.is_empty() {
            let mut headers: Vec<String> = endpoint
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect();
            headers.sort();
            prompt.push_str(&format!(" (required headers: {})", headers.join(", ")));
        }
        if let Some(sample) = &endpoint.sample_response {
            prompt.push_str(&format!(" (sample: {sample})"));
        }
        prompt.push('\n');
    }
}

/// Strip markdown code fences a model wraps around generated source.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiEndpoint, Strategy};

    fn analysis() -> AnalysisData {
        AnalysisData {
            url: "https://shop.example".to_string(),
            title: "Shop Example".to_string(),
            sitemap_urls: vec!["https://shop.example/sitemap.xml".to_string()],
            brand_pages: Vec::new(),
            category_pages: Vec::new(),
            product_listing_pages: Vec::new(),
            api_endpoints: Vec::new(),
            proposed_strategy: Strategy::Scraping,
            strategy_description: "scrape rendered pages".to_string(),
            product_selectors: None,
            html_sample: "<html></html>".to_string(),
            approved: true,
            user_feedback: None,
        }
    }

    #[test]
    fn test_collection_prompt_carries_entry_points() {
        let prompt = build_url_collection_prompt(&analysis(), Some("skip the blog"));
        assert!(prompt.contains("sitemap.xml"));
        assert!(prompt.contains("skip the blog"));
    }

    #[test]
    fn test_extraction_prompt_carries_samples() {
        let samples = vec!["https://shop.example/p/1".to_string()];
        let prompt = build_data_extraction_prompt(&analysis(), &samples, None);
        assert!(prompt.contains("/p/1"));
        assert!(prompt.contains("<html>"));
    }

    #[test]
    fn test_endpoint_headers_reach_the_prompt() {
        let mut analysis = analysis();
        analysis.api_endpoints.push(ApiEndpoint {
            url: "https://shop.example/api/products".to_string(),
            method: "GET".to_string(),
            params: Default::default(),
            headers: [("x-api-key".to_string(), "k123".to_string())]
                .into_iter()
                .collect(),
            description: String::new(),
            is_product_list: true,
            is_product_detail: false,
            verified_json: true,
            sample_response: None,
        });
        let prompt = build_data_extraction_prompt(&analysis, &[], None);
        assert!(prompt.contains("required headers: x-api-key: k123"));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(
            strip_code_fences("```python\ndef scrape():\n    pass\n```"),
            "def scrape():\n    pass"
        );
        assert_eq!(strip_code_fences("def f(): pass"), "def f(): pass");
        assert_eq!(strip_code_fences("```\nx = 1\n```"), "x = 1");
    }
}
