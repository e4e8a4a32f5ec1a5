//! Ordered API keys and ordered scoring models.
//!
//! The pool is read-only after startup. Cursors live in
//! [`crate::rotation::RotationState`]; the pool only answers "what comes
//! after this one", in configuration order, never wrapping around.

use std::fmt;

use common::{AiConfig, ModelConfig};
use thiserror::Error;

pub const DEFAULT_KEY_ENV: &str = "GEMINI_API_KEY";
pub const MAX_API_KEYS: usize = 10;

/// Free-tier models in fallback order: (id, requests/minute, requests/day)
pub const DEFAULT_MODELS: &[(&str, u32, u32)] = &[
    ("gemini-2.5-flash", 10, 20),
    ("gemini-2.5-flash-lite", 15, 1000),
    ("gemini-2.5-pro", 5, 100),
    ("gemini-3-flash-preview", 15, 1000),
    ("gemini-2.0-flash", 15, 200),
    ("gemini-2.0-flash-lite", 30, 1000),
    ("gemma-3-27b-it", 30, 14400),
    ("gemma-3-12b-it", 30, 14400),
    ("gemma-3-4b-it", 30, 14400),
    ("gemma-3n-e4b-it", 30, 14400),
    ("gemma-3n-e2b-it", 30, 14400),
    ("gemma-3-1b-it", 30, 14400),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no API keys configured (set {0})")]
    NoKeys(String),
    #[error("no scoring models configured")]
    NoModels,
    #[error("too many API keys: {0} (max 10)")]
    TooManyKeys(usize),
}

/// An opaque credential and its position in the configured order.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    secret: String,
    ordinal: usize,
}

impl ApiKey {
    pub fn new(secret: impl Into<String>, ordinal: usize) -> Self {
        Self {
            secret: secret.into(),
            ordinal,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Zero-based position in the pool
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(#{}, <redacted>)", self.ordinal + 1)
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key #{}", self.ordinal + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    /// Requests per minute, if known
    pub rpm: Option<u32>,
    /// Requests per day, if known
    pub rpd: Option<u32>,
    /// Zero-based priority; lower is tried first
    pub priority: usize,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, rpm: Option<u32>, rpd: Option<u32>, priority: usize) -> Self {
        Self {
            id: id.into(),
            rpm,
            rpd,
            priority,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialPool {
    keys: Vec<ApiKey>,
    models: Vec<ModelSpec>,
}

impl CredentialPool {
    pub fn new(secrets: Vec<String>, models: Vec<ModelSpec>) -> Result<Self, CredentialError> {
        if secrets.is_empty() {
            return Err(CredentialError::NoKeys(DEFAULT_KEY_ENV.to_string()));
        }
        if secrets.len() > MAX_API_KEYS {
            return Err(CredentialError::TooManyKeys(secrets.len()));
        }
        if models.is_empty() {
            return Err(CredentialError::NoModels);
        }

        let keys = secrets
            .into_iter()
            .enumerate()
            .map(|(i, s)| ApiKey::new(s, i))
            .collect();
        // Priorities follow list position, whatever the caller passed.
        let models = models
            .into_iter()
            .enumerate()
            .map(|(i, m)| ModelSpec { priority: i, ..m })
            .collect();

        Ok(Self { keys, models })
    }

    /// Build the pool from the `[ai]` section, reading keys through `lookup`
    /// (normally `std::env::var`).
    pub fn from_config<F>(ai: &AiConfig, lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = ai.api_key_env.as_deref().unwrap_or(DEFAULT_KEY_ENV);
        let secrets = load_api_keys(base, lookup);
        Self::new(secrets, models_from_config(&ai.models)).map_err(|e| match e {
            CredentialError::NoKeys(_) => CredentialError::NoKeys(base.to_string()),
            other => other,
        })
    }

    pub fn keys(&self) -> &[ApiKey] {
        &self.keys
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn first_key(&self) -> &ApiKey {
        &self.keys[0]
    }

    pub fn first_model(&self) -> &ModelSpec {
        &self.models[0]
    }

    pub fn key(&self, index: usize) -> Option<&ApiKey> {
        self.keys.get(index)
    }

    pub fn model(&self, index: usize) -> Option<&ModelSpec> {
        self.models.get(index)
    }

    /// Model after `current` for the same key, or None when the list is exhausted.
    /// Every key shares the same model list.
    pub fn next_model(&self, _key: &ApiKey, current: &ModelSpec) -> Option<&ModelSpec> {
        self.models.get(current.priority + 1)
    }

    /// Key after `current`, or None after the last key.
    pub fn next_key(&self, current: &ApiKey) -> Option<&ApiKey> {
        self.keys.get(current.ordinal + 1)
    }

    /// Number of distinct (key, model) pairs
    pub fn pair_count(&self) -> usize {
        self.keys.len() * self.models.len()
    }
}

/// Read NAME, NAME_2, .. NAME_10 in order, skipping unset or blank values.
pub fn load_api_keys<F>(base: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    (1..=MAX_API_KEYS)
        .filter_map(|i| {
            let name = if i == 1 {
                base.to_string()
            } else {
                format!("{}_{}", base, i)
            };
            lookup(&name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .collect()
}

/// Configured models, or the built-in list when none are configured.
pub fn models_from_config(models: &[ModelConfig]) -> Vec<ModelSpec> {
    if models.is_empty() {
        return DEFAULT_MODELS
            .iter()
            .enumerate()
            .map(|(i, (id, rpm, rpd))| ModelSpec::new(*id, Some(*rpm), Some(*rpd), i))
            .collect();
    }
    models
        .iter()
        .enumerate()
        .map(|(i, m)| ModelSpec::new(m.id.clone(), m.rpm, m.rpd, i))
        .collect()
}
