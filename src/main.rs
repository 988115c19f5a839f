mod batch;
mod browser;
mod error;
mod extract;
mod output;
mod parser;
mod settings;
mod source;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use browser::BrowserSession;
use extract::{Extractor, LoopConfig, RunSummary, Termination};
use output::BatchWriter;
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "catalog_scraper",
    about = "Log in, open the product catalog and extract it in batches"
)]
struct Cli {
    /// Settings file (default: catalog_scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in, navigate to the catalog and extract every product
    Run {
        #[command(flatten)]
        session: SessionArgs,
        /// Products per batch file
        #[arg(short = 'b', long)]
        batch_size: Option<usize>,
        /// Stop once more than this many products are loaded
        #[arg(long)]
        max_products: Option<usize>,
        /// Directory for batch folders and the final file
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Log in, navigate to the catalog and report selector counts
    Probe {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Parse a saved catalog page and print its products as JSON
    Parse {
        /// HTML file saved from the catalog page
        path: PathBuf,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Application base URL
    #[arg(long)]
    base_url: Option<String>,
    /// Show the browser window
    #[arg(long)]
    headed: bool,
    /// Ignore the saved session and log in again
    #[arg(long)]
    fresh_login: bool,
}

impl SessionArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.base_url {
            settings.base_url = url.clone();
        }
        if self.headed {
            settings.headless = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let fresh_login = match &cli.command {
        Commands::Run {
            session,
            batch_size,
            max_products,
            output_dir,
        } => {
            session.apply(&mut settings);
            if let Some(n) = batch_size {
                settings.batch_size = *n;
            }
            if let Some(n) = max_products {
                settings.max_products = *n;
            }
            if let Some(dir) = output_dir {
                settings.output_dir = dir.clone();
            }
            session.fresh_login
        }
        Commands::Probe { session } => {
            session.apply(&mut settings);
            session.fresh_login
        }
        Commands::Parse { .. } => false,
    };
    settings.normalize();
    settings.validate()?;

    init_tracing(settings.log_file.as_deref())?;
    info!(settings = ?settings, "Starting catalog_scraper");

    let t0 = Instant::now();
    let result = match cli.command {
        Commands::Run { .. } => {
            let summary = run_extraction(&settings, fresh_login).await?;
            print_summary(&summary, &settings);
            Ok(())
        }
        Commands::Probe { .. } => {
            let counts = probe(&settings, fresh_login).await?;
            println!("{:>8} | Selector", "Count");
            println!("{}", "-".repeat(48));
            for (selector, n) in counts {
                println!("{:>8} | {}", n, selector);
            }
            Ok(())
        }
        Commands::Parse { path } => {
            let html = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let products = parser::parse_products(&html, Utc::now());
            println!("{}", serde_json::to_string_pretty(&products)?);
            eprintln!("{} products", products.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn run_extraction(settings: &Settings, fresh_login: bool) -> Result<RunSummary> {
    let mut session = BrowserSession::launch(settings).await?;
    let result = extract_with(&mut session, settings, fresh_login).await;
    session.close().await;
    result
}

async fn extract_with(
    session: &mut BrowserSession,
    settings: &Settings,
    fresh_login: bool,
) -> Result<RunSummary> {
    session.ensure_logged_in(fresh_login).await?;
    session.launch_challenge().await?;
    session.navigate_to_products().await?;

    let writer = BatchWriter::create(
        &settings.output_dir,
        Local::now(),
        &settings.base_url,
        settings.batch_size,
    )?;
    let interrupt = interrupt_flag();
    let summary = Extractor::new(session, writer, LoopConfig::from(settings), interrupt)
        .run()
        .await;
    Ok(summary)
}

async fn probe(settings: &Settings, fresh_login: bool) -> Result<Vec<(String, usize)>> {
    let session = BrowserSession::launch(settings).await?;
    let result = async {
        session.ensure_logged_in(fresh_login).await?;
        session.launch_challenge().await?;
        session.navigate_to_products().await?;
        session.probe().await
    }
    .await;
    session.close().await;
    result
}

/// Set on Ctrl-C; the extraction loop checks it between polls.
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let on_signal = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current poll");
            on_signal.store(true, Ordering::SeqCst);
        }
    });
    flag
}

fn print_summary(summary: &RunSummary, settings: &Settings) {
    println!();
    println!("{}", "=".repeat(60));
    match summary.termination {
        Termination::Interrupted => println!(" EXTRACTION INTERRUPTED"),
        _ => println!(" BATCH EXTRACTION COMPLETED"),
    }
    println!("{}", "=".repeat(60));
    println!(" Total products extracted: {}", summary.total_products);
    println!(" Total batches written:    {}", summary.total_batches);
    if summary.failed_batches > 0 {
        println!(" Batches failed to write:  {}", summary.failed_batches);
    }
    println!(" Polls:                    {}", summary.polls);
    if summary.source_errors > 0 {
        println!(" Page errors (logged):     {}", summary.source_errors);
    }
    println!(" Batch folder:             {}", summary.batch_folder.display());
    match &summary.final_output {
        Some(path) => println!(" Final output file:        {}", path.display()),
        None => println!(" Final output file:        (not written)"),
    }
    println!(" Session file:             {}", settings.session_file.display());
    println!("{}", "=".repeat(60));
    if summary.termination == Termination::Interrupted {
        println!(" Partial data is available in the batch folder.");
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
