use anyhow::{Context, Result};
use common::TelegramConfig;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::{truncate_chars, Article};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
pub const MAX_MESSAGE_CHARS: usize = 4096;
/// Room left for title, source, score and link
pub const MAX_CONTENT_CHARS: usize = 3800;
const DEFAULT_MESSAGE_DELAY_SECS: u64 = 3;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_FLOOD_WAIT_SECS: u64 = 30;

/// Where approved articles go.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one article; returns how many destinations accepted it.
    async fn publish(&self, article: &Article) -> Result<usize>;
}

/// One bot token and the chats it posts to.
#[derive(Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub token: String,
    pub chat_ids: Vec<String>,
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("chat_ids", &self.chat_ids)
            .finish()
    }
}

fn split_chat_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read bot configuration from the environment through `lookup`.
///
/// Numbered bots (TELEGRAM_BOT_TOKEN_1 + TELEGRAM_CHAT_IDS_1, ...) win; the
/// single TELEGRAM_BOT_TOKEN + TELEGRAM_CHAT_ID pair is the fallback.
pub fn load_bots<F>(lookup: F) -> Vec<BotConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut bots = Vec::new();
    let mut n = 1;
    while let Some(token) = lookup(&format!("TELEGRAM_BOT_TOKEN_{}", n)).filter(|t| !t.trim().is_empty()) {
        match lookup(&format!("TELEGRAM_CHAT_IDS_{}", n)).map(|raw| split_chat_ids(&raw)) {
            Some(chat_ids) if !chat_ids.is_empty() => {
                debug!("Bot {}: {} group(s)", n, chat_ids.len());
                bots.push(BotConfig {
                    token: token.trim().to_string(),
                    chat_ids,
                });
            }
            _ => warn!(
                "TELEGRAM_BOT_TOKEN_{} found but TELEGRAM_CHAT_IDS_{} is missing. Skipping bot {}.",
                n, n, n
            ),
        }
        n += 1;
    }
    if !bots.is_empty() {
        return bots;
    }

    let token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty());
    let chat_ids = lookup("TELEGRAM_CHAT_ID").map(|raw| split_chat_ids(&raw)).unwrap_or_default();
    match token {
        Some(token) if !chat_ids.is_empty() => vec![BotConfig {
            token: token.trim().to_string(),
            chat_ids,
        }],
        _ => Vec::new(),
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

pub struct TelegramPublisher {
    client: Client,
    api_base: String,
    bots: Vec<BotConfig>,
    message_delay: Duration,
    max_retries: u32,
    flood_padding: Duration,
}

impl TelegramPublisher {
    pub fn new(client: Client, bots: Vec<BotConfig>, config: &TelegramConfig) -> Self {
        if bots.is_empty() {
            warn!("No Telegram credentials found. Publishing disabled.");
        } else {
            info!("Loaded {} bot configuration(s)", bots.len());
        }
        Self {
            client,
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            bots,
            message_delay: Duration::from_secs(
                config.message_delay_seconds.unwrap_or(DEFAULT_MESSAGE_DELAY_SECS),
            ),
            max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            flood_padding: Duration::from_secs(5),
        }
    }

    /// Extra wait added to Telegram's retry_after hint.
    pub fn with_flood_padding(mut self, padding: Duration) -> Self {
        self.flood_padding = padding;
        self
    }

    pub fn destinations(&self) -> usize {
        self.bots.iter().map(|b| b.chat_ids.len()).sum()
    }

    async fn send(&self, bot: &BotConfig, chat_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, bot.token);
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        for attempt in 1..=self.max_retries {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .context("Telegram request failed")?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let reply = response.json::<TelegramReply>().await.ok();
            let description = reply
                .as_ref()
                .and_then(|r| r.description.clone())
                .unwrap_or_else(|| status.to_string());

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let wait = reply
                    .and_then(|r| r.parameters)
                    .and_then(|p| p.retry_after)
                    .map(|secs| Duration::from_secs(secs) + self.flood_padding)
                    .unwrap_or(Duration::from_secs(DEFAULT_FLOOD_WAIT_SECS));
                warn!(
                    "Rate limit hit. Waiting {:?} before retry {}/{}...",
                    wait, attempt, self.max_retries
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            anyhow::bail!("Telegram API error {}: {}", status, description);
        }

        anyhow::bail!("Telegram rate limit persisted after {} attempts", self.max_retries)
    }
}

#[async_trait::async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(&self, article: &Article) -> Result<usize> {
        if self.bots.is_empty() {
            warn!("No Telegram bots configured. Skipping publish.");
            return Ok(0);
        }

        let message = format_message(article);
        let total = self.destinations();
        let mut delivered = 0;

        for (bot_idx, bot) in self.bots.iter().enumerate() {
            for chat_id in &bot.chat_ids {
                match self.send(bot, chat_id, &message).await {
                    Ok(()) => {
                        delivered += 1;
                        info!("Published '{}' to bot {}, group {}", article.title, bot_idx + 1, chat_id);
                        if !self.message_delay.is_zero() {
                            tokio::time::sleep(self.message_delay).await;
                        }
                    }
                    Err(e) => error!("Error publishing to bot {}, group {}: {:#}", bot_idx + 1, chat_id, e),
                }
            }
        }

        if delivered > 0 {
            info!("Article '{}' published to {}/{} group(s)", article.title, delivered, total);
        } else {
            error!("Article '{}' failed to publish to any group", article.title);
        }
        Ok(delivered)
    }
}

/// Escape text for Telegram's HTML parse mode, quotes included so the
/// result is also safe inside attribute values.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\b[\w\s-]{1,50}?)\s*\((https?://[^)\s]+)\)").expect("valid link regex")
    })
}

/// Turn "some words (https://...)" into an anchor over the words.
pub fn convert_links_to_html(text: &str) -> String {
    link_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            format!(r#"<a href="{}">{}</a>"#, &caps[2], caps[1].trim())
        })
        .into_owned()
}

fn render(article: &Article, content: &str) -> String {
    let score = article
        .score
        .map(|s| format!("{:.1}", s))
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "<b>{}</b>\n\n{}\n\n<i>Source: {}</i>\n<i>Score: {}/10</i>\n\n<a href='{}'>Article Link</a>",
        escape_html(&article.title),
        convert_links_to_html(&escape_html(content)),
        escape_html(&article.source),
        score,
        escape_html(&article.url)
    )
}

/// Telegram message for an article, at most 4096 characters.
pub fn format_message(article: &Article) -> String {
    let clean = article.body().replace(['\u{200b}', '\u{feff}'], "");
    let clean = clean.trim();

    let content = if clean.chars().count() > MAX_CONTENT_CHARS {
        format!("{}...", truncate_chars(clean, MAX_CONTENT_CHARS))
    } else {
        clean.to_string()
    };

    let message = render(article, &content);
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message;
    }

    // Escaping grew the text; shrink the body until it fits.
    let overhead = message.chars().count() - escape_html(&content).chars().count();
    let mut budget = MAX_MESSAGE_CHARS.saturating_sub(overhead + 3);
    loop {
        let content = format!("{}...", truncate_chars(clean, budget));
        let message = render(article, &content);
        if message.chars().count() <= MAX_MESSAGE_CHARS || budget == 0 {
            return message;
        }
        budget = budget.saturating_sub(message.chars().count() - MAX_MESSAGE_CHARS);
    }
}
