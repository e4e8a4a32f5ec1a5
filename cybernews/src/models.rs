use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A news article as it moves through the run: fetched, scored, published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// Canonical URL, also the identity of the article
    pub url: String,
    pub title: String,
    /// Short description taken from the feed (plain text)
    pub excerpt: String,
    /// Full text, filled in by enrichment
    pub content: Option<String>,
    /// Display name of the source it came from
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Dedup key: hex SHA-256 of the URL
    pub content_hash: String,
    /// None until scored
    pub score: Option<f64>,
    pub approved: bool,
}

impl Article {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        excerpt: impl Into<String>,
        source: impl Into<String>,
        published_at: Option<DateTime<Utc>>,
    ) -> Self {
        let url = url.into();
        let content_hash = content_hash(&url);
        Self {
            url,
            title: title.into(),
            excerpt: excerpt.into(),
            content: None,
            source: source.into(),
            published_at,
            content_hash,
            score: None,
            approved: false,
        }
    }

    /// Excerpt as sent to the scoring model; falls back to the title when
    /// the feed gave no description.
    pub fn prompt_excerpt(&self, max_chars: usize) -> String {
        let text = self.excerpt.trim();
        if text.is_empty() {
            return truncate_chars(&self.title, max_chars);
        }
        truncate_chars(text, max_chars)
    }

    /// Best available body for publishing.
    pub fn body(&self) -> &str {
        match self.content.as_deref() {
            Some(content) if !content.trim().is_empty() => content,
            _ => &self.excerpt,
        }
    }
}

pub fn content_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
