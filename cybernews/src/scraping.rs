use anyhow::{Context, Result};
use reqwest::Client;
use std::io::Cursor;
use tracing::{info, warn};

use crate::models::Article;

/// Scrapes the content of an article from the given URL.
/// Returns the extracted text content, or an empty string when readability
/// finds nothing usable.
pub async fn scrape_article_content(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await.context("failed to fetch article page")?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow::anyhow!("article fetch failed with status: {}", status));
    }

    // Readability requires a Reader, so we fetch bytes
    let bytes = response.bytes().await.context("failed to read response body")?;
    let mut reader = Cursor::new(bytes);

    // Relative links are resolved against the article URL
    let url_obj = url::Url::parse(url).context("failed to parse article URL")?;

    match readability::extractor::extract(&mut reader, &url_obj) {
        Ok(product) => match html2text::from_read(product.content.as_bytes(), 120) {
            Ok(text) => {
                info!("scraping: readability extracted {} chars from {}", text.len(), url);
                Ok(text.trim().to_string())
            }
            Err(e) => {
                warn!("scraping: failed to convert extracted HTML to text: {}", e);
                Ok(product.text.trim().to_string())
            }
        },
        Err(e) => {
            warn!("scraping: readability failed for {}: {}", url, e);
            Ok(String::new())
        }
    }
}

/// Fill `article.content` with the full text if it is missing.
/// Failures leave the article untouched; publishing falls back to the excerpt.
pub async fn enrich_article(client: &Client, article: &mut Article) {
    if article.content.as_deref().map_or(false, |c| !c.trim().is_empty()) {
        return;
    }

    info!("Enriching article: {}", article.title);
    match scrape_article_content(client, &article.url).await {
        Ok(text) if !text.is_empty() => {
            if article.excerpt.trim().is_empty() {
                article.excerpt = crate::models::truncate_chars(&text, 500);
            }
            article.content = Some(text);
        }
        Ok(_) => warn!("No readable content for {}, keeping excerpt", article.url),
        Err(e) => warn!("Failed to enrich article {}: {:#}", article.url, e),
    }
}
