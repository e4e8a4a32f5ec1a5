use anyhow::Result;
use reqwest::Client;
use std::collections::HashSet;
use tracing::{error, info, warn};

use crate::ingestion::{collect_articles, ArticleSource};
use crate::models::Article;
use crate::publisher::Publisher;
use crate::scorer::{BatchScorer, Verdict};
use crate::scraping::enrich_article;
use crate::storage::ArticleStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Score only. Approved articles are neither published nor saved, so a
    /// later real run still sees them as new.
    pub dry_run: bool,
}

/// Counters for one pass over the sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: usize,
    pub new_articles: usize,
    pub scored: usize,
    pub approved: usize,
    pub published: usize,
    pub failed_batches: usize,
}

/// Remove articles already in the store and repeats within `articles`.
pub async fn filter_new(store: &ArticleStore, articles: Vec<Article>) -> Result<Vec<Article>> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::with_capacity(articles.len());
    for article in articles {
        if !seen.insert(article.content_hash.clone()) {
            continue;
        }
        if store.exists(&article.content_hash).await? {
            continue;
        }
        fresh.push(article);
    }
    Ok(fresh)
}

/// Fetch, dedup, score and publish once.
///
/// Without a scorer nothing is approved and nothing is saved, so the same
/// articles are picked up again by a later run that can score them.
pub async fn run_once(
    sources: &[Box<dyn ArticleSource>],
    store: &mut ArticleStore,
    scorer: Option<&mut BatchScorer>,
    publisher: &dyn Publisher,
    client: &Client,
    options: RunOptions,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    let articles = collect_articles(sources).await;
    summary.fetched = articles.len();

    let articles = filter_new(store, articles).await?;
    summary.new_articles = articles.len();
    info!(
        "{} new article(s) out of {} fetched",
        summary.new_articles, summary.fetched
    );
    if articles.is_empty() {
        return Ok(summary);
    }

    let Some(scorer) = scorer else {
        warn!("AI scoring disabled; {} article(s) left unapproved", articles.len());
        return Ok(summary);
    };

    let report = scorer.score_batch(articles).await;
    summary.failed_batches = report.failures.len();
    for failure in &report.failures {
        error!(
            batch = failure.batch,
            "{} article(s) will be retried next run: {}", failure.articles, failure.reason
        );
    }

    for result in report.results {
        if result.verdict == Verdict::BatchFailed {
            continue;
        }
        summary.scored += 1;

        let mut article = result.article;
        if !result.approved {
            store.save(&article).await?;
            continue;
        }
        summary.approved += 1;

        enrich_article(client, &mut article).await;

        if options.dry_run {
            info!("[dry run] would publish '{}' ({:?})", article.title, article.score);
            continue;
        }
        store.save(&article).await?;

        match publisher.publish(&article).await {
            Ok(0) => warn!("'{}' reached no destination; not marked posted", article.title),
            Ok(_) => {
                store.mark_posted(&article.content_hash).await?;
                summary.published += 1;
            }
            Err(e) => error!("Failed to publish '{}': {:#}", article.title, e),
        }
    }

    info!(
        fetched = summary.fetched,
        new = summary.new_articles,
        scored = summary.scored,
        approved = summary.approved,
        published = summary.published,
        failed_batches = summary.failed_batches,
        "run complete"
    );
    Ok(summary)
}
