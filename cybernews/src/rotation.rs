//! Rate-limit fallback across models, then keys.
//!
//! Each scoring request walks the same ladder: try the current (key, model)
//! pair; on a rate limit move to the next model for the same key; when the
//! key's models run out move to the next key and start again from the first
//! model; when keys run out the request is exhausted. Other failures are
//! retried a few times on the same pair before they count as a rate limit.
//!
//! The cursor survives between requests of the same run, so a batch starts
//! where the previous one succeeded. A request that started past the first
//! pair wraps around to the pairs before it, so every request visits all
//! K x M pairs before it is exhausted. After an exhaustion the cursor goes
//! back to the first pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use common::AiConfig;

use crate::credentials::{ApiKey, CredentialPool, ModelSpec};
use crate::llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

pub const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ScoringError {
    /// Every (key, model) pair failed for this request
    #[error("all {pairs} key/model pairs exhausted after {attempts} attempts (last error: {last_error})")]
    PoolExhausted {
        attempts: usize,
        pairs: usize,
        last_error: String,
    },
}

/// States of a single request walking the rotation ladder. Indexes point
/// into the [`CredentialPool`] lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Attempt { key: usize, model: usize },
    AdvanceModel { key: usize, model: usize },
    AdvanceKey { key: usize },
    Exhausted,
    Success { key: usize, model: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The attempt returned a usable response
    Succeeded,
    /// The attempt was rate limited, or failed often enough to count as such
    RateLimited,
    /// Move an advance state along
    Proceed,
}

/// Pure transition function of the ladder.
pub fn transition(state: FallbackState, event: Event, pool: &CredentialPool) -> FallbackState {
    use FallbackState::*;

    match (state, event) {
        (Attempt { key, model }, Event::Succeeded) => Success { key, model },
        (Attempt { key, model }, Event::RateLimited) => AdvanceModel { key, model },
        (Attempt { .. }, Event::Proceed) => state,
        (AdvanceModel { key, model }, _) => {
            let next = pool
                .key(key)
                .zip(pool.model(model))
                .and_then(|(k, m)| pool.next_model(k, m));
            match next {
                Some(next) => Attempt {
                    key,
                    model: next.priority,
                },
                None => AdvanceKey { key },
            }
        }
        (AdvanceKey { key }, _) => match pool.key(key).and_then(|k| pool.next_key(k)) {
            Some(next) => Attempt {
                key: next.ordinal(),
                model: 0,
            },
            None => Exhausted,
        },
        (Exhausted, _) | (Success { .. }, _) => state,
    }
}

/// Requests issued on one (key, model) pair in the current minute and day.
#[derive(Debug, Clone)]
struct UsageWindow {
    minute_start: DateTime<Utc>,
    minute_count: u32,
    day_start: DateTime<Utc>,
    day_count: u32,
}

impl UsageWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute_start: now,
            minute_count: 0,
            day_start: now,
            day_count: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.minute_start >= chrono::Duration::minutes(1) {
            self.minute_start = now;
            self.minute_count = 0;
        }
        if now - self.day_start >= chrono::Duration::days(1) {
            self.day_start = now;
            self.day_count = 0;
        }
    }
}

/// Cursor and request counters for one run. Only the controller mutates it.
#[derive(Debug, Clone, Default)]
pub struct RotationState {
    key_index: usize,
    model_index: usize,
    usage: HashMap<(usize, usize), UsageWindow>,
}

impl RotationState {
    pub fn cursor(&self) -> (usize, usize) {
        (self.key_index, self.model_index)
    }

    fn set_cursor(&mut self, key: usize, model: usize) {
        self.key_index = key;
        self.model_index = model;
    }

    fn reset_cursor(&mut self) {
        self.set_cursor(0, 0);
    }

    fn record(&mut self, key: usize, model: usize, now: DateTime<Utc>) {
        let window = self
            .usage
            .entry((key, model))
            .or_insert_with(|| UsageWindow::new(now));
        window.roll(now);
        window.minute_count += 1;
        window.day_count += 1;
    }

    /// (minute, day) request counts for a pair as of `now`
    pub fn requests_in_window(&self, key: usize, model: usize, now: DateTime<Utc>) -> (u32, u32) {
        match self.usage.get(&(key, model)) {
            Some(window) => {
                let mut window = window.clone();
                window.roll(now);
                (window.minute_count, window.day_count)
            }
            None => (0, 0),
        }
    }

    fn within_limits(&self, key: usize, spec: &ModelSpec, now: DateTime<Utc>) -> bool {
        let (minute, day) = self.requests_in_window(key, spec.priority, now);
        spec.rpm.map_or(true, |limit| minute < limit) && spec.rpd.map_or(true, |limit| day < limit)
    }
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Extra attempts on the same pair for non rate-limit failures
    pub max_transient_retries: u32,
    pub retry_backoff: Duration,
    /// Treat a pair as rate limited once its local counters reach its limits
    pub enforce_local_limits: bool,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            enforce_local_limits: false,
        }
    }
}

impl FallbackSettings {
    pub fn from_config(ai: &AiConfig) -> Self {
        Self {
            max_transient_retries: ai
                .max_transient_retries
                .unwrap_or(DEFAULT_MAX_TRANSIENT_RETRIES),
            retry_backoff: Duration::from_millis(
                ai.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            enforce_local_limits: ai.enforce_local_limits.unwrap_or(false),
        }
    }
}

/// A successful request and the pair that served it.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub key: ApiKey,
    pub model: ModelSpec,
    /// Provider calls spent on this request, including failed ones
    pub attempts: usize,
    pub usage: UsageMetadata,
}

pub struct FallbackController {
    pool: CredentialPool,
    provider: Arc<dyn LlmProvider>,
    settings: FallbackSettings,
    rotation: RotationState,
}

impl FallbackController {
    pub fn new(
        pool: CredentialPool,
        provider: Arc<dyn LlmProvider>,
        settings: FallbackSettings,
    ) -> Self {
        info!(
            keys = pool.keys().len(),
            models = pool.models().len(),
            "fallback controller ready, starting at {} / {}",
            pool.first_key(),
            pool.first_model().id
        );
        Self {
            pool,
            provider,
            settings,
            rotation: RotationState::default(),
        }
    }

    pub fn rotation(&self) -> &RotationState {
        &self.rotation
    }

    /// Send `request`, walking the ladder until `parse` accepts a response
    /// or every pair has failed.
    ///
    /// A `parse` error counts like any other non rate-limit failure.
    pub async fn execute<T, F>(
        &mut self,
        request: &LlmRequest,
        mut parse: F,
    ) -> Result<Attempted<T>, ScoringError>
    where
        F: FnMut(&LlmResponse) -> Result<T, LlmError>,
    {
        let (key, model) = self.rotation.cursor();
        let mut state = FallbackState::Attempt { key, model };
        let mut attempts = 0usize;
        let mut failures_on_pair = 0u32;
        let mut pairs_left = self.pool.pair_count();
        let mut last_error = String::from("none");

        loop {
            let (key_idx, model_idx) = match state {
                FallbackState::Attempt { key, model } => (key, model),
                FallbackState::AdvanceModel { .. } | FallbackState::AdvanceKey { .. } => {
                    if pairs_left == 0 {
                        break;
                    }
                    let next = match transition(state, Event::Proceed, &self.pool) {
                        // Pairs before the starting cursor are still untried
                        FallbackState::Exhausted => {
                            debug!("end of the ladder with {} pair(s) untried, wrapping to key #1", pairs_left);
                            FallbackState::Attempt { key: 0, model: 0 }
                        }
                        next => next,
                    };
                    if let FallbackState::Attempt { key, model } = next {
                        if let FallbackState::AdvanceKey { key: from } = state {
                            warn!("all models exhausted on key #{}, rotating to key #{}", from + 1, key + 1);
                        }
                        debug!(key = key + 1, model = %self.pool.models()[model].id, "trying next pair");
                    }
                    state = next;
                    failures_on_pair = 0;
                    continue;
                }
                FallbackState::Success { .. } | FallbackState::Exhausted => break,
            };

            let api_key = self.pool.keys()[key_idx].clone();
            let model = self.pool.models()[model_idx].clone();
            let now = Utc::now();

            if self.settings.enforce_local_limits && !self.rotation.within_limits(key_idx, &model, now) {
                debug!("{} / {} at its local request limit, skipping", api_key, model.id);
                last_error = format!("local limit reached for {} / {}", api_key, model.id);
                pairs_left -= 1;
                state = transition(state, Event::RateLimited, &self.pool);
                continue;
            }

            attempts += 1;
            self.rotation.record(key_idx, model_idx, now);

            let result = match self.provider.generate(&api_key, &model, request.clone()).await {
                Ok(response) => parse(&response).map(|value| (value, response.usage)),
                Err(e) => Err(e),
            };

            match result {
                Ok((value, usage)) => {
                    let done = transition(state, Event::Succeeded, &self.pool);
                    if let FallbackState::Success { key, model } = done {
                        self.rotation.set_cursor(key, model);
                    }
                    if attempts > 1 {
                        info!("request served by {} / {} after {} attempts", api_key, model.id, attempts);
                    }
                    return Ok(Attempted {
                        value,
                        key: api_key,
                        model,
                        attempts,
                        usage,
                    });
                }
                Err(e) if e.advances_rotation() => {
                    warn!("{} / {}: {}, trying next model", api_key, model.id, e);
                    last_error = e.to_string();
                    pairs_left -= 1;
                    state = transition(state, Event::RateLimited, &self.pool);
                }
                Err(e) => {
                    failures_on_pair += 1;
                    last_error = e.to_string();
                    if failures_on_pair > self.settings.max_transient_retries {
                        warn!(
                            "{} / {} failed {} times ({}), treating as rate limited",
                            api_key, model.id, failures_on_pair, e
                        );
                        pairs_left -= 1;
                        state = transition(state, Event::RateLimited, &self.pool);
                    } else {
                        warn!(
                            "{} / {} failed: {}, retry {}/{}",
                            api_key, model.id, e, failures_on_pair, self.settings.max_transient_retries
                        );
                        let backoff = self.settings.retry_backoff * failures_on_pair;
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }

        self.rotation.reset_cursor();
        Err(ScoringError::PoolExhausted {
            attempts,
            pairs: self.pool.pair_count(),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn pool(keys: usize, models: usize) -> CredentialPool {
        let secrets = (1..=keys).map(|i| format!("k{}", i)).collect();
        let models = (1..=models)
            .map(|i| ModelSpec::new(format!("m{}", i), Some(2), Some(3), 0))
            .collect();
        CredentialPool::new(secrets, models).expect("pool")
    }

    /// Replays scripted results and records which pairs were called.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for Scripted {
        async fn generate(
            &self,
            key: &ApiKey,
            model: &ModelSpec,
            _request: LlmRequest,
        ) -> Result<LlmResponse, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((key.secret().to_string(), model.id.clone()));
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(rate_limited()));
            next.map(|content| LlmResponse {
                content,
                usage: UsageMetadata::default(),
                model: model.id.clone(),
            })
        }
    }

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            status: 429,
            message: "quota".into(),
        }
    }

    fn settings() -> FallbackSettings {
        FallbackSettings {
            max_transient_retries: 2,
            retry_backoff: Duration::ZERO,
            enforce_local_limits: false,
        }
    }

    fn accept(response: &LlmResponse) -> Result<String, LlmError> {
        Ok(response.content.clone())
    }

    #[test]
    fn transitions_walk_models_then_keys() {
        let pool = pool(2, 2);
        let mut state = FallbackState::Attempt { key: 0, model: 0 };
        let mut visited = vec![state];
        loop {
            state = match state {
                FallbackState::Attempt { .. } => transition(state, Event::RateLimited, &pool),
                _ => transition(state, Event::Proceed, &pool),
            };
            visited.push(state);
            if state == FallbackState::Exhausted {
                break;
            }
        }
        use FallbackState::*;
        assert_eq!(
            visited,
            vec![
                Attempt { key: 0, model: 0 },
                AdvanceModel { key: 0, model: 0 },
                Attempt { key: 0, model: 1 },
                AdvanceModel { key: 0, model: 1 },
                AdvanceKey { key: 0 },
                Attempt { key: 1, model: 0 },
                AdvanceModel { key: 1, model: 0 },
                Attempt { key: 1, model: 1 },
                AdvanceModel { key: 1, model: 1 },
                AdvanceKey { key: 1 },
                Exhausted,
            ]
        );
        assert_eq!(transition(Exhausted, Event::Proceed, &pool), Exhausted);
        assert_eq!(
            transition(Attempt { key: 1, model: 1 }, Event::Succeeded, &pool),
            Success { key: 1, model: 1 }
        );
    }

    #[tokio::test]
    async fn exhausts_after_exactly_k_times_m_attempts() {
        let provider = Scripted::new(vec![]);
        let mut controller = FallbackController::new(pool(3, 4), provider.clone(), settings());

        let err = controller
            .execute(&LlmRequest::new("p"), accept)
            .await
            .unwrap_err();

        let ScoringError::PoolExhausted { attempts, pairs, .. } = err;
        assert_eq!(attempts, 12);
        assert_eq!(pairs, 12);
        let calls = provider.calls();
        assert_eq!(calls.len(), 12);
        assert_eq!(calls[0], ("k1".to_string(), "m1".to_string()));
        assert_eq!(calls[4], ("k2".to_string(), "m1".to_string()));
        assert_eq!(calls[11], ("k3".to_string(), "m4".to_string()));
        assert_eq!(controller.rotation().cursor(), (0, 0));
    }

    #[tokio::test]
    async fn rate_limit_moves_to_second_model_same_key() {
        let provider = Scripted::new(vec![Err(rate_limited()), Ok("ok".into())]);
        let mut controller = FallbackController::new(pool(2, 3), provider.clone(), settings());

        let done = controller.execute(&LlmRequest::new("p"), accept).await.expect("success");

        assert_eq!(done.key.secret(), "k1");
        assert_eq!(done.model.id, "m2");
        assert_eq!(done.attempts, 2);
        assert_eq!(controller.rotation().cursor(), (0, 1));
    }

    #[tokio::test]
    async fn exhausted_key_is_never_called_again() {
        let provider = Scripted::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Ok("first".into()),
            Ok("second".into()),
        ]);
        let mut controller = FallbackController::new(pool(2, 2), provider.clone(), settings());

        let first = controller.execute(&LlmRequest::new("p"), accept).await.expect("first");
        assert_eq!((first.key.secret(), first.model.id.as_str()), ("k2", "m1"));

        let second = controller.execute(&LlmRequest::new("p"), accept).await.expect("second");
        assert_eq!(second.value, "second");

        let calls = provider.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[2..].iter().all(|(key, _)| key == "k2"));
    }

    #[tokio::test]
    async fn carried_cursor_still_tries_every_pair_before_exhaustion() {
        let provider = Scripted::new(vec![Err(rate_limited()), Err(rate_limited()), Ok("first".into())]);
        let mut controller = FallbackController::new(pool(2, 2), provider.clone(), settings());

        let first = controller.execute(&LlmRequest::new("p"), accept).await.expect("first");
        assert_eq!((first.key.secret(), first.model.id.as_str()), ("k2", "m1"));
        assert_eq!(controller.rotation().cursor(), (1, 0));

        // Script is empty now: every further call is rate limited
        let err = controller
            .execute(&LlmRequest::new("p"), accept)
            .await
            .unwrap_err();
        let ScoringError::PoolExhausted { attempts, pairs, .. } = err;
        assert_eq!((attempts, pairs), (4, 4));

        let calls: Vec<(String, String)> = provider.calls()[3..].to_vec();
        let pair = |k: &str, m: &str| (k.to_string(), m.to_string());
        assert_eq!(
            calls,
            vec![pair("k2", "m1"), pair("k2", "m2"), pair("k1", "m1"), pair("k1", "m2")]
        );
        assert_eq!(controller.rotation().cursor(), (0, 0));
    }

    #[tokio::test]
    async fn wrapped_request_succeeds_on_earlier_pair() {
        let provider = Scripted::new(vec![
            Err(rate_limited()),
            Ok("first".into()),
            Err(rate_limited()),
            Ok("second".into()),
        ]);
        let mut controller = FallbackController::new(pool(1, 2), provider.clone(), settings());

        let first = controller.execute(&LlmRequest::new("p"), accept).await.expect("first");
        assert_eq!(first.model.id, "m2");

        let second = controller.execute(&LlmRequest::new("p"), accept).await.expect("second");
        assert_eq!(second.model.id, "m1");
        assert_eq!(second.attempts, 2);
        assert_eq!(controller.rotation().cursor(), (0, 0));
    }

    #[tokio::test]
    async fn transient_errors_retry_then_advance() {
        let transport = || Err(LlmError::Transport("connection reset".into()));
        let provider = Scripted::new(vec![transport(), transport(), transport(), Ok("ok".into())]);
        let mut controller = FallbackController::new(pool(1, 2), provider.clone(), settings());

        let done = controller.execute(&LlmRequest::new("p"), accept).await.expect("success");

        let calls = provider.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|(_, model)| model == "m1"));
        assert_eq!(done.model.id, "m2");
    }

    #[tokio::test]
    async fn transient_error_recovers_on_same_pair() {
        let provider = Scripted::new(vec![
            Err(LlmError::Transport("timeout".into())),
            Ok("ok".into()),
        ]);
        let mut controller = FallbackController::new(pool(1, 2), provider.clone(), settings());

        let done = controller.execute(&LlmRequest::new("p"), accept).await.expect("success");
        assert_eq!(done.model.id, "m1");
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn parse_failures_count_as_transient() {
        let provider = Scripted::new(vec![Ok("bad".into()), Ok("good".into())]);
        let mut controller = FallbackController::new(pool(1, 1), provider.clone(), settings());

        let done = controller
            .execute(&LlmRequest::new("p"), |r| {
                if r.content == "good" {
                    Ok(r.content.clone())
                } else {
                    Err(LlmError::InvalidResponse("not json".into()))
                }
            })
            .await
            .expect("success");
        assert_eq!(done.value, "good");
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn unknown_model_is_skipped_without_retries() {
        let provider = Scripted::new(vec![Err(LlmError::ModelNotFound("m1".into())), Ok("ok".into())]);
        let mut controller = FallbackController::new(pool(1, 2), provider.clone(), settings());

        let done = controller.execute(&LlmRequest::new("p"), accept).await.expect("success");
        assert_eq!(done.model.id, "m2");
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_resets_cursor_for_next_request() {
        let mut script: Vec<Result<String, LlmError>> = (0..4).map(|_| Err(rate_limited())).collect();
        script.push(Ok("fresh".into()));
        let provider = Scripted::new(script);
        let mut controller = FallbackController::new(pool(2, 2), provider.clone(), settings());

        assert!(controller.execute(&LlmRequest::new("p"), accept).await.is_err());
        let done = controller.execute(&LlmRequest::new("p"), accept).await.expect("success");
        assert_eq!((done.key.secret(), done.model.id.as_str()), ("k1", "m1"));
    }

    #[tokio::test]
    async fn local_limits_skip_pairs_without_calling() {
        let provider = Scripted::new(vec![Ok("a".into()), Ok("b".into()), Ok("c".into())]);
        let mut settings = settings();
        settings.enforce_local_limits = true;
        // rpm = 2 per pair
        let mut controller = FallbackController::new(pool(1, 2), provider.clone(), settings);

        for _ in 0..3 {
            controller.execute(&LlmRequest::new("p"), accept).await.expect("success");
        }

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].1, "m2");
        let (minute, day) = controller.rotation().requests_in_window(0, 0, Utc::now());
        assert_eq!((minute, day), (2, 2));
    }
}
