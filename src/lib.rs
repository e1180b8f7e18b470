// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pricewatch pipeline library — AI-assisted competitor scraper
//! generation and sandboxed execution.
//!
//! This library crate exposes the core modules for integration testing.

pub mod analyzer;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod runs;
pub mod sandbox;
pub mod store;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::ScraperPipeline;
pub use runs::reconciler::sweep_once;
pub use runs::RunLedger;
