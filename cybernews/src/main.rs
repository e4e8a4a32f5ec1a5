/*
cybernews - single-binary main.rs
Fetches cybersecurity feeds, scores new articles in batches with an AI model
(falling back across models, then API keys, on rate limits) and publishes the
approved ones to Telegram. Runs once, or repeatedly with --watch-minutes.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cybernews::credentials::CredentialPool;
use cybernews::ingestion::{build_client, ArticleSource, RssSource};
use cybernews::llm::remote::{RemoteLlmProvider, DEFAULT_API_URL};
use cybernews::llm::LlmProvider;
use cybernews::pipeline::{run_once, RunOptions};
use cybernews::publisher::{load_bots, TelegramPublisher};
use cybernews::rotation::{FallbackController, FallbackSettings};
use cybernews::scorer::{BatchScorer, ScorerSettings};
use cybernews::storage::ArticleStore;

#[derive(Parser, Debug)]
#[command(name = "cybernews", about = "Cybersecurity news aggregator with AI batch scoring")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Score articles but neither publish nor save the approved ones
    #[arg(long)]
    dry_run: bool,

    /// Skip AI scoring; nothing gets approved
    #[arg(long)]
    no_ai: bool,

    /// Repeat the run every N minutes until Ctrl-C
    #[arg(long, value_name = "N")]
    watch_minutes: Option<u64>,
}

/// Everything the scorer needs to be rebuilt for a fresh cycle.
struct ScoringSetup {
    pool: CredentialPool,
    provider: Arc<dyn LlmProvider>,
    fallback: FallbackSettings,
    settings: ScorerSettings,
}

impl ScoringSetup {
    /// Each cycle starts from the first key and model.
    fn scorer(&self) -> BatchScorer {
        BatchScorer::new(
            FallbackController::new(self.pool.clone(), self.provider.clone(), self.fallback.clone()),
            self.settings.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets may live in a .env file
    dotenv::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    // Load configuration with defaults
    let mut config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    config.database = config
        .database
        .clone()
        .with_enabled_override(std::env::var("ENABLE_DATABASE").ok().as_deref());

    let client = build_client(&config.fetch())?;

    let sources: Vec<Box<dyn ArticleSource>> = config
        .sources
        .iter()
        .map(|s| Box::new(RssSource::from_config(s, client.clone())) as Box<dyn ArticleSource>)
        .collect();
    if sources.is_empty() {
        warn!("no [[sources]] configured; nothing will be fetched");
    }

    let mut store = ArticleStore::open(&config.database)
        .await
        .context("failed to open article store")?;

    let scoring = if args.no_ai {
        warn!("AI scoring disabled via CLI (--no-ai)");
        None
    } else {
        Some(scoring_setup(&config)?)
    };

    let bots = load_bots(|name| std::env::var(name).ok());
    let publisher = TelegramPublisher::new(client.clone(), bots, &config.telegram());

    let options = RunOptions { dry_run: args.dry_run };
    if options.dry_run {
        info!("Dry run: approved articles will not be published");
    }

    let mut cycle = 0u64;
    loop {
        cycle += 1;
        info!(cycle, "Starting Cyber-NEWS run");

        let mut scorer = scoring.as_ref().map(ScoringSetup::scorer);
        let result = run_once(&sources, &mut store, scorer.as_mut(), &publisher, &client, options).await;

        let Some(minutes) = args.watch_minutes else {
            result?;
            break;
        };
        if let Err(e) = result {
            error!(cycle, "run failed: {:#}", e);
        }

        info!("Next run in {} minute(s)", minutes);
        tokio::select! {
            _ = tokio::time::sleep(watch_interval(minutes)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, stopping");
                break;
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Pause between watch cycles; absurd values saturate instead of overflowing.
fn watch_interval(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

/// Validate `[ai]` and read the API keys. Missing keys stop the program.
fn scoring_setup(config: &Config) -> Result<ScoringSetup> {
    let ai = config.ai();
    let settings = ScorerSettings::from_config(&ai).context("invalid [ai] configuration")?;
    let pool = CredentialPool::from_config(&ai, |name| std::env::var(name).ok())
        .context("AI scoring needs at least one API key (or run with --no-ai)")?;

    let api_url = ai.api_url.clone().unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let provider = RemoteLlmProvider::new(api_url).with_defaults(
        ai.timeout_seconds.unwrap_or(60),
        ai.max_tokens.unwrap_or(2048),
        ai.temperature.unwrap_or(0.2),
    );

    info!(
        "Scoring with {} API key(s) x {} model(s), batch size {}, threshold {}",
        pool.keys().len(),
        pool.models().len(),
        settings.batch_size,
        settings.approval_threshold
    );

    Ok(ScoringSetup {
        pool,
        provider: Arc::new(provider),
        fallback: FallbackSettings::from_config(&ai),
        settings,
    })
}
