/*!
common/src/lib.rs

Shared configuration types and DB helper functions for cybernews.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default config file with an override file
- A helper to open the SQLite database used for article deduplication
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/news.db")
    pub path: String,
    /// When false, deduplication only lasts for the current run (in-memory)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "news.db".to_string(),
            enabled: true,
        }
    }
}

impl DatabaseConfig {
    /// Apply an ENABLE_DATABASE style switch: "true", "1" or "yes" enable
    /// the database, any other value disables it, no value changes nothing.
    pub fn with_enabled_override(mut self, value: Option<&str>) -> Self {
        if let Some(v) = value {
            self.enabled = matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes");
        }
        self
    }
}

fn default_true() -> bool {
    true
}

/// One scoring model with its published rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// Requests per minute
    pub rpm: Option<u32>,
    /// Requests per day
    pub rpd: Option<u32>,
}

/// AI scoring configuration. Keys are never stored here, only the
/// environment variable prefix they are read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    /// OpenAI-compatible chat completions endpoint
    pub api_url: Option<String>,
    /// Base env var name; keys are read from NAME, NAME_2 .. NAME_10
    pub api_key_env: Option<String>,
    /// Models in priority order. Empty means the built-in list.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    pub batch_size: Option<usize>,
    pub approval_threshold: Option<f64>,
    pub max_transient_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Characters of excerpt sent per article
    pub excerpt_chars: Option<usize>,
    /// Skip (key, model) pairs whose local request counters hit their limits
    pub enforce_local_limits: Option<bool>,
}

/// A news source, fetched as RSS/Atom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
}

/// Telegram publishing knobs. Tokens and chat ids come from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub api_base: Option<String>,
    pub message_delay_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

/// HTTP fetching configuration for sources and enrichment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub ai: Option<AiConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub telegram: Option<TelegramConfig>,
    pub fetch: Option<FetchConfig>,
}

impl Config {
    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn ai(&self) -> AiConfig {
        self.ai.clone().unwrap_or_default()
    }

    pub fn telegram(&self) -> TelegramConfig {
        self.telegram.clone().unwrap_or_default()
    }

    pub fn fetch(&self) -> FetchConfig {
        self.fetch.clone().unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a pool in WAL mode.
/// The run is sequential, so a single connection is plenty.
///
/// Example:
///   let pool = init_db_pool("data/news.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
