// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pricewatch::cli;

#[derive(Parser)]
#[command(
    name = "pricewatch",
    about = "Pricewatch — AI-assisted competitor scraper pipeline",
    version
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path to the pipeline database
    #[arg(long, global = true, default_value = "pricewatch.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a competitor site and print the analysis payload
    Analyze {
        /// Seed URL of the storefront
        url: String,
        /// Known sitemap URL, skipping discovery
        #[arg(long)]
        sitemap: Option<String>,
        /// Known category page to seed classification
        #[arg(long)]
        category_page: Option<String>,
        /// Known product page to seed selector probing
        #[arg(long)]
        product_page: Option<String>,
    },
    /// Validate a candidate scraper program file
    Validate {
        /// Path to the program source
        file: String,
        /// Program language (python, recipe)
        #[arg(long, default_value = "python")]
        language: String,
    },
    /// Execute a saved program through the run ledger
    Execute {
        /// Program id
        program_id: String,
        /// Full production run instead of a bounded test run
        #[arg(long)]
        full: bool,
    },
    /// Sweep expired run deadlines once
    Sweep,
    /// Run the timeout reconciler until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Analyze {
            url,
            sitemap,
            category_page,
            product_page,
        } => cli::analyze(&url, sitemap, category_page, product_page).await,
        Commands::Validate { file, language } => cli::validate(&file, &language).await,
        Commands::Execute { program_id, full } => {
            cli::execute(&cli.db, &program_id, full).await
        }
        Commands::Sweep => cli::sweep(&cli.db),
        Commands::Watch => cli::watch(&cli.db).await,
    };

    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    result
}
