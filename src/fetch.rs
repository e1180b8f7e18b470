//! Async HTTP client wrapping reqwest.
//!
//! Plain HTTP only — no browser. Handles redirects, timeouts, retry on
//! 5xx, backoff on 429, and an HTTP/1.1 fallback for sites that reject
//! HTTP/2. The analyzer and the recipe engine both go through this.

use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Response from an HTTP GET request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Original requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("application/json") || ct.contains("+json"))
            .unwrap_or(false)
    }
}

/// Result of a lightweight HEAD probe.
#[derive(Debug, Clone)]
pub struct HeadProbe {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
}

/// HTTP client shared across the analyzer and sandbox.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback for CDNs with broken HTTP/2.
    h1_client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout_ms: u64) -> Self {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                  AppleWebKit/537.36 (KHTML, like Gecko) \
                  Chrome/131.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .build()
            .unwrap_or_default();

        let h1_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .http1_only()
            .build()
            .unwrap_or_default();

        Self { client, h1_client }
    }

    /// GET with retry on 5xx and backoff on 429, falling back to HTTP/1.1
    /// on protocol errors.
    pub async fn get(&self, url: &str, timeout_ms: u64) -> Result<FetchResponse> {
        match self.get_inner(&self.client, url, timeout_ms, None).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    self.get_inner(&self.h1_client, url, timeout_ms, None).await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// GET with an `Accept: application/json` header and no retry loop,
    /// used for API endpoint verification probes.
    pub async fn probe_json(&self, url: &str, timeout_ms: u64) -> Result<FetchResponse> {
        let resp = self
            .client
            .get(url)
            .header("accept", "application/json")
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| PipelineError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = header_string(resp.headers(), "content-type");
        let body = resp.text().await.unwrap_or_default();

        Ok(FetchResponse {
            url: url.to_string(),
            final_url,
            status,
            content_type,
            body,
        })
    }

    async fn get_inner(
        &self,
        client: &reqwest::Client,
        url: &str,
        timeout_ms: u64,
        accept: Option<&str>,
    ) -> Result<FetchResponse> {
        let mut retries = 0u32;
        let max_retries = 2;

        loop {
            let mut builder = client.get(url).timeout(Duration::from_millis(timeout_ms));
            if let Some(accept) = accept {
                builder = builder.header("accept", accept);
            }

            match builder.send().await {
                Ok(r) => {
                    let status = r.status().as_u16();
                    let final_url = r.url().to_string();

                    if status >= 500 && retries < max_retries {
                        retries += 1;
                        let delay = Duration::from_millis(500 * 2u64.pow(retries - 1));
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if status == 429 && retries < max_retries {
                        retries += 1;
                        let retry_after = r
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(2);
                        tokio::time::sleep(Duration::from_secs(retry_after.min(10))).await;
                        continue;
                    }

                    let content_type = header_string(r.headers(), "content-type");
                    let body = r.text().await.unwrap_or_default();

                    return Ok(FetchResponse {
                        url: url.to_string(),
                        final_url,
                        status,
                        content_type,
                        body,
                    });
                }
                Err(e) => {
                    if retries < max_retries {
                        retries += 1;
                        let delay = Duration::from_millis(500 * 2u64.pow(retries - 1));
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(PipelineError::Fetch {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Parallel GETs with bounded concurrency; per-URL results.
    pub async fn get_many(
        &self,
        urls: &[String],
        concurrency: usize,
        timeout_ms: u64,
    ) -> Vec<Result<FetchResponse>> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter())
            .map(|url| {
                let client = self.clone();
                let u = url.clone();
                async move { client.get(&u, timeout_ms).await }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// Parallel HEAD probes, used for cheap existence checks.
    pub async fn head_many(&self, urls: &[String], concurrency: usize) -> Vec<Result<HeadProbe>> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter())
            .map(|url| {
                let client = self.client.clone();
                let u = url.clone();
                async move {
                    let resp = client
                        .head(&u)
                        .timeout(Duration::from_secs(10))
                        .send()
                        .await
                        .map_err(|e| PipelineError::Fetch {
                            url: u.clone(),
                            reason: e.to_string(),
                        })?;
                    Ok(HeadProbe {
                        url: u,
                        status: resp.status().as_u16(),
                        content_type: header_string(resp.headers(), "content-type"),
                    })
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_content_type_detection() {
        let resp = FetchResponse {
            url: "https://shop.example/api".to_string(),
            final_url: "https://shop.example/api".to_string(),
            status: 200,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: "[]".to_string(),
        };
        assert!(resp.is_json());
        assert!(resp.is_success());

        let html = FetchResponse {
            content_type: Some("text/html".to_string()),
            ..resp.clone()
        };
        assert!(!html.is_json());
    }
}
