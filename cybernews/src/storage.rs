use anyhow::{Context, Result};
use chrono::Utc;
use common::{init_db_pool, DatabaseConfig};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::info;

use crate::models::Article;

/// Seen-article store used for deduplication across runs.
///
/// With the database disabled, hashes are only remembered for the current run.
pub struct ArticleStore {
    backend: Backend,
}

enum Backend {
    Sqlite(SqlitePool),
    Memory(HashSet<String>),
}

/// Create the articles table if it does not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            content_hash TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            source TEXT NOT NULL,
            published_at TIMESTAMP,
            score REAL,
            approved BOOLEAN NOT NULL DEFAULT FALSE,
            posted BOOLEAN NOT NULL DEFAULT FALSE,
            first_seen_at TIMESTAMP NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create articles table")?;
    Ok(())
}

impl ArticleStore {
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        if !config.enabled {
            info!("Database disabled - using in-memory deduplication for this run only");
            return Ok(Self::in_memory());
        }
        let pool = init_db_pool(&config.path).await?;
        let store = Self::from_pool(pool).await?;
        info!(db_path = %config.path, "Database enabled");
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        ensure_schema(&pool).await?;
        Ok(Self {
            backend: Backend::Sqlite(pool),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(HashSet::new()),
        }
    }

    pub async fn exists(&self, content_hash: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(seen) => Ok(seen.contains(content_hash)),
            Backend::Sqlite(pool) => {
                let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM articles WHERE content_hash = ?")
                    .bind(content_hash)
                    .fetch_optional(pool)
                    .await
                    .context("failed to check existing article")?;
                Ok(found.is_some())
            }
        }
    }

    /// Record an article. An existing row is left as it is.
    pub async fn save(&mut self, article: &Article) -> Result<()> {
        match &mut self.backend {
            Backend::Memory(seen) => {
                seen.insert(article.content_hash.clone());
                Ok(())
            }
            Backend::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO articles
                    (content_hash, title, url, source, published_at, score, approved, first_seen_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&article.content_hash)
                .bind(&article.title)
                .bind(&article.url)
                .bind(&article.source)
                .bind(article.published_at)
                .bind(article.score)
                .bind(article.approved)
                .bind(Utc::now())
                .execute(&*pool)
                .await
                .with_context(|| format!("failed to save article {}", article.url))?;
                Ok(())
            }
        }
    }

    pub async fn mark_posted(&mut self, content_hash: &str) -> Result<()> {
        match &mut self.backend {
            Backend::Memory(_) => Ok(()),
            Backend::Sqlite(pool) => {
                sqlx::query("UPDATE articles SET posted = TRUE WHERE content_hash = ?")
                    .bind(content_hash)
                    .execute(&*pool)
                    .await
                    .context("failed to mark article as posted")?;
                Ok(())
            }
        }
    }
}
