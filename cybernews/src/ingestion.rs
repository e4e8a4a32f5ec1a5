use anyhow::{Context, Result};
use chrono::Utc;
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::Article;
use common::{FetchConfig, SourceConfig};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; cybernews/0.1)";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// Something that yields candidate articles for a run.
#[async_trait::async_trait]
pub trait ArticleSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_articles(&self) -> Result<Vec<Article>>;
}

/// Build the HTTP client shared by sources and enrichment.
pub fn build_client(fetch: &FetchConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(
            fetch.timeout_seconds.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        ))
        .user_agent(fetch.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
        .build()
        .context("failed to build reqwest client")
}

/// Fetches a feed from the given URL and parses it.
/// Server errors, 429 and network errors are retried with a short backoff.
pub async fn fetch_and_parse_feed(client: &Client, url: &str) -> Result<Feed> {
    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2)); // 1s, 2s
            info!("Retrying feed fetch for {} (attempt {}/{}) after {:?}...", url, attempt, max_retries, backoff);
            tokio::time::sleep(backoff).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read response body")?;
                    let feed = parser::parse(bytes.as_ref()).context("failed to parse feed")?;
                    return Ok(feed);
                } else if status.is_server_error() {
                    last_error = Some(anyhow::anyhow!("server error: {}", status));
                    continue;
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                    continue;
                } else {
                    // Client error (4xx) - likely permanent, don't retry
                    return Err(anyhow::anyhow!("feed fetch failed with status: {}", status));
                }
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}

/// An RSS/Atom feed source.
pub struct RssSource {
    name: String,
    url: String,
    client: Client,
}

impl RssSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    pub fn from_config(source: &SourceConfig, client: Client) -> Self {
        Self::new(source.name.clone(), source.url.clone(), client)
    }
}

#[async_trait::async_trait]
impl ArticleSource for RssSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_articles(&self) -> Result<Vec<Article>> {
        let feed = fetch_and_parse_feed(&self.client, &self.url)
            .await
            .with_context(|| format!("failed to fetch feed for {}", self.name))?;
        let articles = entries_to_articles(&self.name, &feed.entries);
        info!("{}: {} entries, {} usable articles", self.name, feed.entries.len(), articles.len());
        Ok(articles)
    }
}

/// Convert feed entries to articles, skipping entries without a link or title.
pub fn entries_to_articles(source: &str, entries: &[Entry]) -> Vec<Article> {
    let mut articles = Vec::with_capacity(entries.len());

    for entry in entries {
        let title = entry
            .title
            .as_ref()
            .map(|t| collapse_whitespace(&t.content))
            .unwrap_or_default();
        // Use the first link as the URL
        let url = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();

        if url.is_empty() || title.is_empty() {
            debug!("Skipping entry without URL or title: {:?}", entry.id);
            continue;
        }

        let excerpt = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .map(|html| html_to_text(&html))
            .unwrap_or_default();

        let published = entry.published.or(entry.updated);
        if published.is_none() {
            debug!("No publish date for {}, leaving it empty", url);
        }

        articles.push(Article::new(url, title, excerpt, source, published));
    }

    articles
}

/// Strip markup from a feed description.
pub fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), 10_000) {
        Ok(text) => collapse_whitespace(&text),
        Err(e) => {
            warn!("failed to convert feed HTML to text: {}", e);
            collapse_whitespace(html)
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fetch every source in order. A failing source is logged and skipped.
pub async fn collect_articles(sources: &[Box<dyn ArticleSource>]) -> Vec<Article> {
    let started = Utc::now();
    let mut all = Vec::new();

    for source in sources {
        info!("Running source: {}", source.name());
        match source.fetch_articles().await {
            Ok(articles) => {
                info!("Found {} articles from {}", articles.len(), source.name());
                all.extend(articles);
            }
            Err(e) => warn!("Source {} failed: {:#}", source.name(), e),
        }
    }

    info!(
        "collected {} articles from {} sources in {}s",
        all.len(),
        sources.len(),
        (Utc::now() - started).num_seconds()
    );
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Security Feed</title>
    <link>https://sec.example</link>
    <description>test</description>
    <item>
      <title>Critical RCE in  VPN gateway</title>
      <link>https://sec.example/rce</link>
      <description>&lt;p&gt;Attackers are &lt;b&gt;actively&lt;/b&gt; exploiting it.&lt;/p&gt;</description>
      <pubDate>Mon, 05 Jan 2026 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>No link here</title>
      <description>dropped</description>
    </item>
    <item>
      <title>Patch Tuesday roundup</title>
      <link>https://sec.example/patch</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn converts_entries_and_skips_linkless() {
        let feed = parser::parse(RSS.as_bytes()).expect("parse rss");
        let articles = entries_to_articles("Sec", &feed.entries);

        assert_eq!(articles.len(), 2);
        let first = &articles[0];
        assert_eq!(first.title, "Critical RCE in VPN gateway");
        assert_eq!(first.url, "https://sec.example/rce");
        assert_eq!(first.source, "Sec");
        assert!(first.excerpt.contains("actively"));
        assert!(!first.excerpt.contains("<b>"));
        assert!(first.published_at.is_some());
        assert_eq!(articles[1].excerpt, "");
        assert_eq!(articles[1].score, None);
    }

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(collapse_whitespace("  a \n\t b  "), "a b");
    }
}
