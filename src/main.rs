//! Command-line driver for VRMAcquire.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vrmacquire::classify::Classifier;
use vrmacquire::config::{self, Settings, DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL_SECS};
use vrmacquire::crawler::{CrawlOptions, Crawler};
use vrmacquire::credentials::CredentialStore;
use vrmacquire::models::SourceId;
use vrmacquire::repository::{create_pool, ModelRepository};
use vrmacquire::sources::{
    DeviantArtSource, GitHubSource, HttpClient, RateLimiter, SketchfabSource, SourceAdapter,
    VroidHubSource,
};

#[derive(Parser)]
#[command(
    name = "vrma",
    version,
    about = "3D avatar model acquisition and cataloging"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one crawl pass over the enabled sources.
    Crawl {
        /// Search keywords.
        keywords: Vec<String>,

        /// Maximum acquisitions per source.
        #[arg(short, long, default_value_t = 100)]
        max: usize,

        /// Restrict the pass to specific sources (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Crawl continuously in batches until interrupted.
    Watch {
        /// Search keywords.
        keywords: Vec<String>,

        /// Acquisitions per source per batch.
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch: usize,

        /// Seconds between batches.
        #[arg(short, long, default_value_t = DEFAULT_INTERVAL_SECS)]
        interval: u64,

        /// Restrict to specific sources (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// List cataloged models, newest first.
    List {
        /// Filter by source.
        #[arg(long)]
        source: Option<String>,

        /// Maximum rows to print.
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Show catalog statistics.
    Stats,

    /// Export the full catalog to a JSON file.
    Export { path: PathBuf },

    /// Import records from a JSON export, skipping duplicates.
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut settings = config::load_settings(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    settings.ensure_directories()?;

    let pool = create_pool(&settings.database_path())
        .context("could not open the catalog database")?;
    let repo = ModelRepository::new(pool);
    repo.ensure_schema().await?;

    match cli.command {
        Command::Crawl {
            keywords,
            max,
            sources,
        } => {
            let opts = crawl_options(&settings, keywords, max);
            let mut crawler = build_crawler(&settings, repo, &sources).await?;
            let cancel = cancel_on_ctrl_c();

            let pb = spinner("crawling sources".to_string());
            let report = crawler.crawl_once(&opts, &cancel).await?;
            pb.finish_and_clear();

            println!("{report}");
            Ok(if report.has_fatal() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Command::Watch {
            keywords,
            batch,
            interval,
            sources,
        } => {
            let opts = crawl_options(&settings, keywords, batch);
            let mut crawler = build_crawler(&settings, repo, &sources).await?;
            let cancel = cancel_on_ctrl_c();

            info!(
                "Starting continuous crawl: batch size {}, interval {}s",
                batch, interval
            );
            let batches = crawler
                .crawl_continuous(&opts, Duration::from_secs(interval), cancel)
                .await?;
            println!("Stopped after {batches} batch(es)");
            Ok(ExitCode::SUCCESS)
        }

        Command::List { source, limit } => {
            let source = parse_source(source.as_deref())?;
            let records = repo.query(source, limit).await?;
            for record in &records {
                println!(
                    "{:<12} {:<28} {:>6} {:>10}  {}{}",
                    record.source.as_str(),
                    truncate(&record.source_model_id, 28),
                    record.file_type,
                    record.size_bytes,
                    record.name,
                    record
                        .artist
                        .as_deref()
                        .map(|a| format!(" - {a}"))
                        .unwrap_or_default(),
                );
            }
            println!("{} record(s)", records.len());
            Ok(ExitCode::SUCCESS)
        }

        Command::Stats => {
            let total = repo.count().await?;
            let by_source = repo.count_by_source().await?;
            println!("Total models: {total}");
            let mut sources: Vec<_> = by_source.into_iter().collect();
            sources.sort();
            for (source, count) in sources {
                println!("  {source:<12} {count}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Export { path } => {
            let pb = spinner(format!("exporting to {}", path.display()));
            let count = repo.export_json(&path).await?;
            pb.finish_and_clear();
            println!("Exported {count} record(s) to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Import { path } => {
            let pb = spinner(format!("importing from {}", path.display()));
            let count = repo.import_json(&path).await?;
            pb.finish_and_clear();
            println!("Imported {count} new record(s) from {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn crawl_options(settings: &Settings, keywords: Vec<String>, max_per_source: usize) -> CrawlOptions {
    let keywords = if keywords.is_empty() {
        settings.keywords.clone()
    } else {
        keywords
    };
    CrawlOptions {
        keywords,
        max_per_source,
    }
}

/// Assemble adapters for the enabled, credentialed sources.
async fn build_crawler(
    settings: &Settings,
    repo: ModelRepository,
    selected: &[String],
) -> anyhow::Result<Crawler> {
    let limiter = RateLimiter::new(Duration::from_millis(settings.request_delay_ms));
    let cred_store = CredentialStore::new(settings.credentials_dir());
    let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();

    for source in SourceId::ALL {
        if !selected.is_empty() && !selected.iter().any(|s| s == source.as_str()) {
            continue;
        }
        if !settings.source_enabled(source) {
            info!("Source {} disabled by configuration", source);
            continue;
        }

        limiter
            .set_delay(source.as_str(), settings.source_delay(source))
            .await;
        let http = HttpClient::new(source, settings.request_timeout(), limiter.clone());
        let source_config = settings.source_config(source);

        match source {
            SourceId::VroidHub | SourceId::DeviantArt => {
                let Some(mut creds) = cred_store.load(source)? else {
                    info!(
                        "No stored credentials for {}; run the authorization flow first",
                        source
                    );
                    continue;
                };
                // Config may carry the application id/secret; the credential
                // file wins when both are present.
                if creds.client_id.is_empty() {
                    if let Some(id) = source_config.and_then(|c| c.client_id.clone()) {
                        creds.client_id = id;
                    }
                }
                if creds.client_secret.is_empty() {
                    if let Some(secret) = source_config.and_then(|c| c.client_secret.clone()) {
                        creds.client_secret = secret;
                    }
                }

                if source == SourceId::VroidHub {
                    adapters.push(Box::new(VroidHubSource::new(
                        http,
                        creds,
                        cred_store.clone(),
                    )));
                } else {
                    adapters.push(Box::new(DeviantArtSource::new(
                        http,
                        creds,
                        cred_store.clone(),
                    )));
                }
            }
            SourceId::Sketchfab => {
                let Some(token) = source_config.and_then(|c| c.api_token.clone()) else {
                    info!("No Sketchfab API token configured; skipping");
                    continue;
                };
                adapters.push(Box::new(SketchfabSource::new(http, token)));
            }
            SourceId::GitHub => {
                // Works without a token, just at the lower anonymous ceiling.
                let token = source_config.and_then(|c| c.api_token.clone());
                adapters.push(Box::new(GitHubSource::new(http, token)));
            }
        }
    }

    if adapters.is_empty() {
        warn!("No sources available to crawl");
    }

    let classifier = Classifier::new(&settings.data_dir);
    Ok(Crawler::new(adapters, repo, classifier, limiter))
}

/// Cancellation flag flipped by Ctrl-C; checked between candidates and
/// raced against continuous-mode sleeps.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current candidate");
            let _ = tx.send(true);
        }
    });
    rx
}

fn parse_source(source: Option<&str>) -> anyhow::Result<Option<SourceId>> {
    match source {
        None => Ok(None),
        Some(name) => SourceId::from_str(name)
            .with_context(|| format!("unknown source '{name}'"))
            .map(Some),
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]").expect("valid template"));
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(message);
    pb
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
