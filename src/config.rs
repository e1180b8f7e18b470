//! Environment-driven pipeline configuration.
//!
//! Every knob has a sensible default and a `PRICEWATCH_*` override so
//! deployments can tune timeouts without a rebuild.

use std::time::Duration;

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TEST_RUN_TIMEOUT_SECS: u64 = 60;
const DEFAULT_FULL_RUN_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_SAMPLE_URLS: usize = 50;
const DEFAULT_MAX_VALIDATION_PRODUCTS: usize = 10;
const DEFAULT_MAX_RECIPE_PAGES: usize = 20;
const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Tunables shared across the analyzer, sandbox, and run ledger.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Timeout for ordinary page/sitemap fetches.
    pub fetch_timeout_ms: u64,
    /// Shorter timeout for API endpoint verification probes.
    pub probe_timeout_ms: u64,
    /// Wall-clock cap on a single sandboxed script invocation.
    pub script_timeout: Duration,
    /// Deadline offset for test runs in the run ledger.
    pub test_run_timeout: Duration,
    /// Deadline offset for full runs in the run ledger.
    pub full_run_timeout: Duration,
    /// How often the background reconciler sweeps expired deadlines.
    pub sweep_interval: Duration,
    /// Cap on URLs kept from a collection pass.
    pub max_sample_urls: usize,
    /// Product cap applied during validation-mode executions.
    pub max_validation_products: usize,
    /// Page budget for declarative recipe pagination walks.
    pub max_recipe_pages: usize,
    /// Bounded concurrency for parallel fetches and extraction fan-out.
    pub fetch_concurrency: usize,
    /// Interpreter aliases tried in order by the subprocess engine.
    pub interpreter_aliases: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            script_timeout: Duration::from_secs(DEFAULT_SCRIPT_TIMEOUT_SECS),
            test_run_timeout: Duration::from_secs(DEFAULT_TEST_RUN_TIMEOUT_SECS),
            full_run_timeout: Duration::from_secs(DEFAULT_FULL_RUN_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            max_sample_urls: DEFAULT_MAX_SAMPLE_URLS,
            max_validation_products: DEFAULT_MAX_VALIDATION_PRODUCTS,
            max_recipe_pages: DEFAULT_MAX_RECIPE_PAGES,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            interpreter_aliases: default_interpreter_aliases(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fetch_timeout_ms: read_env_u64("PRICEWATCH_FETCH_TIMEOUT_MS", defaults.fetch_timeout_ms),
            probe_timeout_ms: read_env_u64("PRICEWATCH_PROBE_TIMEOUT_MS", defaults.probe_timeout_ms),
            script_timeout: Duration::from_secs(
                read_env_u64("PRICEWATCH_SCRIPT_TIMEOUT_SECS", DEFAULT_SCRIPT_TIMEOUT_SECS).max(1),
            ),
            test_run_timeout: Duration::from_secs(
                read_env_u64(
                    "PRICEWATCH_TEST_RUN_TIMEOUT_SECS",
                    DEFAULT_TEST_RUN_TIMEOUT_SECS,
                )
                .max(1),
            ),
            full_run_timeout: Duration::from_secs(
                read_env_u64(
                    "PRICEWATCH_FULL_RUN_TIMEOUT_SECS",
                    DEFAULT_FULL_RUN_TIMEOUT_SECS,
                )
                .max(60),
            ),
            sweep_interval: Duration::from_secs(
                read_env_u64("PRICEWATCH_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).max(5),
            ),
            max_sample_urls: read_env_usize("PRICEWATCH_MAX_SAMPLE_URLS", defaults.max_sample_urls)
                .max(1),
            max_validation_products: read_env_usize(
                "PRICEWATCH_MAX_VALIDATION_PRODUCTS",
                defaults.max_validation_products,
            )
            .max(1),
            max_recipe_pages: read_env_usize(
                "PRICEWATCH_MAX_RECIPE_PAGES",
                defaults.max_recipe_pages,
            )
            .max(1),
            fetch_concurrency: read_env_usize(
                "PRICEWATCH_FETCH_CONCURRENCY",
                defaults.fetch_concurrency,
            )
            .max(1),
            interpreter_aliases: read_env_string("PRICEWATCH_PYTHON_ALIASES")
                .filter(|v| !v.is_empty())
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(default_interpreter_aliases),
        }
    }
}

fn default_interpreter_aliases() -> Vec<String> {
    vec!["python".to_string(), "python3".to_string(), "py".to_string()]
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.test_run_timeout, Duration::from_secs(60));
        assert_eq!(cfg.full_run_timeout, Duration::from_secs(86_400));
        assert_eq!(cfg.max_validation_products, 10);
        assert_eq!(
            cfg.interpreter_aliases,
            vec!["python", "python3", "py"]
        );
    }
}
