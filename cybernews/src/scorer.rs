use anyhow::{bail, Result};
use common::AiConfig;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::llm::{extract_json_from_text, LlmError, LlmRequest, LlmResponse};
use crate::models::Article;
use crate::rotation::{FallbackController, ScoringError};

pub const DEFAULT_BATCH_SIZE: usize = 40;
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 6.0;
pub const DEFAULT_EXCERPT_CHARS: usize = 150;
pub const MAX_SCORE: f64 = 10.0;

/// Validated scoring knobs, built once from `[ai]`.
#[derive(Debug, Clone)]
pub struct ScorerSettings {
    pub batch_size: usize,
    pub approval_threshold: f64,
    pub excerpt_chars: usize,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            max_tokens: None,
            temperature: None,
            timeout_seconds: None,
        }
    }
}

impl ScorerSettings {
    pub fn from_config(ai: &AiConfig) -> Result<Self> {
        let settings = Self {
            batch_size: ai.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            approval_threshold: ai.approval_threshold.unwrap_or(DEFAULT_APPROVAL_THRESHOLD),
            excerpt_chars: ai.excerpt_chars.unwrap_or(DEFAULT_EXCERPT_CHARS),
            max_tokens: ai.max_tokens,
            temperature: ai.temperature,
            timeout_seconds: ai.timeout_seconds,
        };

        if settings.batch_size == 0 {
            bail!("ai.batch_size must be at least 1");
        }
        if !(0.0..=MAX_SCORE).contains(&settings.approval_threshold) {
            bail!(
                "ai.approval_threshold must be within 0..=10, got {}",
                settings.approval_threshold
            );
        }
        if settings.excerpt_chars == 0 {
            bail!("ai.excerpt_chars must be at least 1");
        }
        Ok(settings)
    }
}

/// How an article's score was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The model returned a usable score
    Scored,
    /// The model's response left this article out, or its entry was unusable
    Missing,
    /// Every key/model pair failed for this article's batch
    BatchFailed,
}

#[derive(Debug, Clone)]
pub struct ScoredArticle {
    pub article: Article,
    pub approved: bool,
    /// 0.0 unless the verdict is `Scored`
    pub score: f64,
    pub verdict: Verdict,
}

/// A batch that got no answer at all.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// 1-based batch number
    pub batch: usize,
    pub articles: usize,
    pub reason: String,
}

/// A batch whose response covered only part of its articles.
#[derive(Debug, Clone)]
pub struct MalformedBatch {
    pub batch: usize,
    pub missing: usize,
    pub invalid_entries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScoreReport {
    /// Same order as the input
    pub results: Vec<ScoredArticle>,
    pub batches: usize,
    pub failures: Vec<BatchFailure>,
    pub malformed: Vec<MalformedBatch>,
}

impl ScoreReport {
    pub fn approved(&self) -> impl Iterator<Item = &ScoredArticle> {
        self.results.iter().filter(|r| r.approved)
    }

    pub fn approved_count(&self) -> usize {
        self.approved().count()
    }
}

/// One entry of the model's answer after validation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoreEntry {
    score: f64,
    model_approved: Option<bool>,
}

/// The model's answer for a batch, keyed by 1-based article id.
#[derive(Debug, Clone, Default)]
struct ParsedBatch {
    entries: HashMap<usize, ScoreEntry>,
    invalid_entries: usize,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default, alias = "scores")]
    articles: Option<Vec<Value>>,
}

pub struct BatchScorer {
    controller: FallbackController,
    settings: ScorerSettings,
}

impl BatchScorer {
    pub fn new(controller: FallbackController, settings: ScorerSettings) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub fn controller(&self) -> &FallbackController {
        &self.controller
    }

    /// Score `articles` in fixed-size batches, one request per batch,
    /// strictly in order. Never fails: exhausted batches are reported and
    /// their articles come back unapproved.
    pub async fn score_batch(&mut self, articles: Vec<Article>) -> ScoreReport {
        let mut report = ScoreReport::default();
        if articles.is_empty() {
            return report;
        }

        let batch_size = self.settings.batch_size;
        let total = articles.len();
        let mut remaining = articles.into_iter().peekable();
        let mut batch_no = 0;

        while remaining.peek().is_some() {
            batch_no += 1;
            let batch: Vec<Article> = remaining.by_ref().take(batch_size).collect();
            let scored = self.score_chunk(batch_no, batch, &mut report).await;
            report.results.extend(scored);
        }
        report.batches = batch_no;

        info!(
            "scored {} articles in {} batch(es): {} approved, {} failed batch(es)",
            total,
            report.batches,
            report.approved_count(),
            report.failures.len()
        );
        report
    }

    async fn score_chunk(
        &mut self,
        batch_no: usize,
        batch: Vec<Article>,
        report: &mut ScoreReport,
    ) -> Vec<ScoredArticle> {
        let request = LlmRequest {
            prompt: build_prompt(&batch, self.settings.excerpt_chars),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            timeout_seconds: self.settings.timeout_seconds,
        };
        let batch_len = batch.len();

        match self
            .controller
            .execute(&request, |response| parse_response(response, batch_len))
            .await
        {
            Ok(done) => {
                let parsed = done.value;
                let scored = apply_scores(batch, &parsed, self.settings.approval_threshold);
                let missing = scored.iter().filter(|s| s.verdict == Verdict::Missing).count();
                if missing > 0 || parsed.invalid_entries > 0 {
                    warn!(
                        batch = batch_no,
                        "response covered {}/{} articles ({} invalid entries); the rest stay unapproved",
                        batch_len - missing,
                        batch_len,
                        parsed.invalid_entries
                    );
                    report.malformed.push(MalformedBatch {
                        batch: batch_no,
                        missing,
                        invalid_entries: parsed.invalid_entries,
                    });
                }
                info!(
                    batch = batch_no,
                    "approved {}/{} articles via {} / {} ({} tokens)",
                    scored.iter().filter(|s| s.approved).count(),
                    batch_len,
                    done.key,
                    done.model.id,
                    done.usage.total_tokens
                );
                scored
            }
            Err(e @ ScoringError::PoolExhausted { .. }) => {
                error!(batch = batch_no, "batch of {} articles not scored: {}", batch_len, e);
                report.failures.push(BatchFailure {
                    batch: batch_no,
                    articles: batch_len,
                    reason: e.to_string(),
                });
                batch
                    .into_iter()
                    .map(|mut article| {
                        article.score = None;
                        article.approved = false;
                        ScoredArticle {
                            article,
                            approved: false,
                            score: 0.0,
                            verdict: Verdict::BatchFailed,
                        }
                    })
                    .collect()
            }
        }
    }
}

fn build_prompt(batch: &[Article], excerpt_chars: usize) -> String {
    let mut article_list = String::new();
    for (idx, article) in batch.iter().enumerate() {
        article_list.push_str(&format!(
            "{}. [{}] {}\n   Summary: {}\n",
            idx + 1,
            article.source,
            article.title,
            article.prompt_excerpt(excerpt_chars)
        ));
    }

    format!(
        r#"You are a Cybersecurity News Filter & Scorer. Review these {count} articles and score each one 0.0-10.0.

**Scoring Guidelines:**
- 9-10: Critical 0-day exploits, major breaches affecting millions, industry-shifting events
- 7-8: Important security patches, new attack vectors, notable research/reports, CVEs
- 5-6: Routine security updates, vendor news, moderate interest
- <5: Marketing fluff, basic tips, opinion pieces, event announcements

**Articles:**
{article_list}
**Instructions:**
Reply with ONLY a JSON object. Key "articles" contains one object for EVERY article above, with
"id" (1-{count}), "approved" (true if worth publishing) and "score" (float 0.0-10.0).
Example: {{"articles": [{{"id": 1, "approved": true, "score": 7.5}}, {{"id": 2, "approved": false, "score": 3.0}}]}}
"#,
        count = batch.len(),
        article_list = article_list
    )
}

/// Parse the model's answer. A body with no JSON object, or without an
/// article list, is an `InvalidResponse` so the controller retries it;
/// individual bad entries are only counted.
fn parse_response(response: &LlmResponse, batch_len: usize) -> Result<ParsedBatch, LlmError> {
    let json = extract_json_from_text(&response.content)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in scoring response".to_string()))?;

    let raw: RawBatch = serde_json::from_str(&json)
        .map_err(|e| LlmError::InvalidResponse(format!("scoring response is not valid JSON: {}", e)))?;

    let items = raw
        .articles
        .ok_or_else(|| LlmError::InvalidResponse("scoring response has no \"articles\" list".to_string()))?;

    let mut parsed = ParsedBatch::default();
    for item in &items {
        match parse_entry(item, batch_len) {
            Some((id, entry)) => {
                if parsed.entries.contains_key(&id) {
                    debug!(id, "duplicate score entry ignored");
                    parsed.invalid_entries += 1;
                } else {
                    parsed.entries.insert(id, entry);
                }
            }
            None => parsed.invalid_entries += 1,
        }
    }
    Ok(parsed)
}

fn parse_entry(item: &Value, batch_len: usize) -> Option<(usize, ScoreEntry)> {
    let id = number_field(item.get("id")?)?;
    if id.fract() != 0.0 || id < 1.0 || id > batch_len as f64 {
        return None;
    }
    let score = number_field(item.get("score")?)?;
    if !score.is_finite() {
        return None;
    }
    let model_approved = item.get("approved").and_then(Value::as_bool);

    Some((
        id as usize,
        ScoreEntry {
            score: score.clamp(0.0, MAX_SCORE),
            model_approved,
        },
    ))
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Apply parsed scores to the batch, in input order. The score decides
/// approval; the model's own flag only matters for logging.
fn apply_scores(batch: Vec<Article>, parsed: &ParsedBatch, threshold: f64) -> Vec<ScoredArticle> {
    batch
        .into_iter()
        .enumerate()
        .map(|(idx, mut article)| match parsed.entries.get(&(idx + 1)) {
            Some(entry) => {
                let approved = entry.score >= threshold;
                if let Some(model_approved) = entry.model_approved {
                    if model_approved != approved {
                        debug!(
                            "'{}': model said approved={} but score {} decides approved={}",
                            article.title, model_approved, entry.score, approved
                        );
                    }
                }
                article.score = Some(entry.score);
                article.approved = approved;
                ScoredArticle {
                    article,
                    approved,
                    score: entry.score,
                    verdict: Verdict::Scored,
                }
            }
            None => {
                article.score = None;
                article.approved = false;
                ScoredArticle {
                    article,
                    approved: false,
                    score: 0.0,
                    verdict: Verdict::Missing,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKey, CredentialPool, ModelSpec};
    use crate::llm::{LlmProvider, UsageMetadata};
    use crate::rotation::FallbackSettings;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Rate limits the first `fail_first` calls, then scores every article
    /// of the prompt 8.0.
    struct CountingProvider {
        fail_first: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for CountingProvider {
        async fn generate(
            &self,
            _key: &ApiKey,
            model: &ModelSpec,
            request: LlmRequest,
        ) -> Result<LlmResponse, LlmError> {
            {
                let mut left = self.fail_first.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(LlmError::RateLimited {
                        status: 429,
                        message: "quota".into(),
                    });
                }
            }
            let count = request.prompt.matches("\n   Summary: ").count();
            let entries: Vec<String> = (1..=count)
                .map(|id| format!(r#"{{"id": {}, "score": 8.0}}"#, id))
                .collect();
            Ok(LlmResponse {
                content: format!(r#"{{"articles": [{}]}}"#, entries.join(",")),
                usage: UsageMetadata::default(),
                model: model.id.clone(),
            })
        }
    }

    fn scorer(fail_first: usize) -> BatchScorer {
        let pool = CredentialPool::new(vec!["k1".into()], vec![ModelSpec::new("m1", None, None, 0)])
            .expect("pool");
        let provider = Arc::new(CountingProvider {
            fail_first: Mutex::new(fail_first),
        });
        let settings = FallbackSettings {
            max_transient_retries: 0,
            retry_backoff: Duration::ZERO,
            enforce_local_limits: false,
        };
        BatchScorer::new(
            FallbackController::new(pool, provider, settings),
            ScorerSettings::default(),
        )
    }

    fn articles(n: usize) -> Vec<Article> {
        (1..=n)
            .map(|i| {
                Article::new(
                    format!("https://news.example/{}", i),
                    format!("Title {}", i),
                    format!("Excerpt {}", i),
                    "Example",
                    None,
                )
            })
            .collect()
    }

    fn response(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            usage: UsageMetadata::default(),
            model: "m".to_string(),
        }
    }

    #[test]
    fn threshold_decides_approval() {
        let parsed = parse_response(
            &response(
                r#"{"articles": [
                    {"id": 1, "approved": true, "score": 9},
                    {"id": 2, "approved": true, "score": 7},
                    {"id": 3, "approved": false, "score": 6.0},
                    {"id": 4, "approved": true, "score": 5.9},
                    {"id": 5, "approved": false, "score": 3}
                ]}"#,
            ),
            5,
        )
        .expect("parse");

        let scored = apply_scores(articles(5), &parsed, 6.0);
        let approved: Vec<bool> = scored.iter().map(|s| s.approved).collect();
        assert_eq!(approved, vec![true, true, true, false, false]);
        assert!(scored.iter().all(|s| s.verdict == Verdict::Scored));
        assert_eq!(scored[3].article.score, Some(5.9));
    }

    // The model's own flag disagreeing with the score: the score wins both ways.
    #[test]
    fn score_overrides_model_flag() {
        let parsed = parse_response(
            &response(r#"{"articles": [{"id": 1, "approved": false, "score": 8.5}, {"id": 2, "approved": true, "score": 2}]}"#),
            2,
        )
        .expect("parse");
        let scored = apply_scores(articles(2), &parsed, 6.0);
        assert!(scored[0].approved);
        assert!(scored[0].article.approved);
        assert!(!scored[1].approved);
    }

    #[test]
    fn missing_articles_are_unapproved() {
        let parsed = parse_response(&response(r#"{"articles": [{"id": 2, "score": 9.1}]}"#), 3).expect("parse");
        let scored = apply_scores(articles(3), &parsed, 6.0);
        assert_eq!(scored.len(), 3);
        assert_eq!(scored[0].verdict, Verdict::Missing);
        assert!(!scored[0].approved);
        assert_eq!(scored[0].article.score, None);
        assert!(scored[1].approved);
        assert_eq!(scored[2].verdict, Verdict::Missing);
        assert_eq!(scored[2].article.title, "Title 3");
    }

    #[test]
    fn bad_entries_are_counted_not_fatal() {
        let parsed = parse_response(
            &response(
                r#"```json
                {"articles": [
                    {"id": 0, "score": 9},
                    {"id": 7, "score": 9},
                    {"id": "2", "score": "7.5"},
                    {"id": 1, "score": "high"},
                    {"id": 2, "score": 1},
                    {"score": 4},
                    {"id": 3, "score": 42}
                ]}
                ```"#,
            ),
            3,
        )
        .expect("parse");
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.invalid_entries, 5);
        assert_eq!(parsed.entries[&2].score, 7.5);
        assert_eq!(parsed.entries[&3].score, 10.0);
    }

    #[test]
    fn scores_alias_is_accepted() {
        let parsed = parse_response(&response(r#"{"scores": [{"id": 1, "score": 6.5}]}"#), 1).expect("parse");
        assert_eq!(parsed.entries[&1].score, 6.5);
    }

    #[test]
    fn unusable_bodies_are_invalid_responses() {
        for body in ["I cannot help with that", r#"{"result": "ok"}"#, "{not json}"] {
            let err = parse_response(&response(body), 3).unwrap_err();
            assert!(matches!(err, LlmError::InvalidResponse(_)), "{}", body);
        }
    }

    #[test]
    fn prompt_numbers_every_article() {
        let prompt = build_prompt(&articles(3), 150);
        assert!(prompt.contains("1. [Example] Title 1"));
        assert!(prompt.contains("3. [Example] Title 3\n   Summary: Excerpt 3"));
        assert!(prompt.contains("\"id\" (1-3)"));
    }

    #[tokio::test]
    async fn batch_count_is_ceiling_and_order_is_kept() {
        for n in [0usize, 1, 39, 40, 41, 80, 81] {
            let input = articles(n);
            let expected: Vec<String> = input.iter().map(|a| a.url.clone()).collect();

            let report = scorer(0).score_batch(input).await;

            assert_eq!(report.batches, (n + DEFAULT_BATCH_SIZE - 1) / DEFAULT_BATCH_SIZE, "n = {}", n);
            let urls: Vec<String> = report.results.iter().map(|r| r.article.url.clone()).collect();
            assert_eq!(urls, expected, "n = {}", n);
            assert_eq!(report.approved_count(), n);
        }
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_later_batches() {
        let mut scorer = scorer(1);
        let report = scorer.score_batch(articles(45)).await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch, 1);
        assert_eq!(report.failures[0].articles, 40);
        assert_eq!(report.results.len(), 45);

        for (idx, result) in report.results.iter().enumerate() {
            assert_eq!(result.article.url, format!("https://news.example/{}", idx + 1));
        }
        assert!(report.results[..40]
            .iter()
            .all(|r| r.verdict == Verdict::BatchFailed && !r.approved));
        assert!(report.results[40..]
            .iter()
            .all(|r| r.verdict == Verdict::Scored && r.approved));
        assert_eq!(report.approved_count(), 5);
    }

    #[test]
    fn settings_validation() {
        let ok = ScorerSettings::from_config(&AiConfig::default()).expect("defaults");
        assert_eq!(ok.batch_size, 40);
        assert_eq!(ok.approval_threshold, 6.0);

        let zero = AiConfig {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(ScorerSettings::from_config(&zero).is_err());

        let high = AiConfig {
            approval_threshold: Some(11.0),
            ..Default::default()
        };
        assert!(ScorerSettings::from_config(&high).is_err());
    }
}
