//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    base::prompts,
    collector::{BatchLimits, CollectorOptions},
};

use super::types::{Res, Void};

/// Default quiet window after the most recent message of a burst.
fn default_debounce_window_ms() -> u64 {
    3_000
}

/// Default maximum age of an open batch.
fn default_max_batch_age_ms() -> u64 {
    30_000
}

/// Default maximum number of messages in one batch.
fn default_max_batch_size() -> usize {
    20
}

/// Default upper bound on a single response generator call.
fn default_generator_timeout_ms() -> u64 {
    120_000
}

/// Default idle time before a conversation's in-memory state is dropped.
fn default_idle_eviction_secs() -> u64 {
    3_600
}

/// Default interval between idle sweeps.
fn default_sweep_interval_secs() -> u64 {
    60
}

/// Default number of earlier messages given to the model.
fn default_history_length() -> usize {
    16
}

/// Default OpenAI model to use
fn default_openai_model() -> String {
    "gpt-4.1".to_string()
}

/// Default sampling temperature for the OpenAI model
fn default_openai_temperature() -> f32 {
    0.7
}

/// Default max output tokens for OpenAI model
fn default_openai_max_tokens() -> u32 {
    4096
}

/// Default per-attempt timeout of an OpenAI request, short enough for retries to fit
/// within the default generator timeout.
fn default_openai_request_timeout_secs() -> u64 {
    25
}

/// Longest accepted debounce window or batch age.
const MAX_BATCH_WINDOW_MS: u64 = 86_400_000;

/// Default system directive for the reply agent.
fn default_system_directive() -> String {
    prompts::SYSTEM_DIRECTIVE.to_string()
}

fn default_db_endpoint() -> String {
    "mem://".to_string()
}

fn default_db_namespace() -> String {
    "collector_bot".to_string()
}

fn default_db_database() -> String {
    "collector_bot".to_string()
}

/// Configuration for the collector-bot application.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigInner {
    /// Quiet window after the latest message before a batch closes (`DEBOUNCE_WINDOW_MS`).
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,
    /// Hard cap on how long a batch may stay open, measured from its first message (`MAX_BATCH_AGE_MS`).
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
    /// Hard cap on the number of messages in one batch (`MAX_BATCH_SIZE`).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Timeout for a single response generator call, `0` disables it (`GENERATOR_TIMEOUT_MS`).
    #[serde(default = "default_generator_timeout_ms")]
    pub generator_timeout_ms: u64,
    /// Notice posted to the conversation when a reply could not be generated (`FALLBACK_MESSAGE`).
    #[serde(default)]
    pub fallback_message: Option<String>,
    /// Idle time after which a conversation's state is evicted, `0` disables eviction (`IDLE_EVICTION_SECS`).
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
    /// How often idle conversations are swept (`SWEEP_INTERVAL_SECS`).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Number of earlier recorded messages given to the model as context (`HISTORY_LENGTH`).
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    /// OpenAI API key (`OPENAI_API_KEY`).
    pub openai_api_key: String,
    /// OpenAI model to use (`OPENAI_MODEL`).
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Sampling temperature to use for the OpenAI model (`OPENAI_TEMPERATURE`).
    /// Value between 0 and 2. Higher values like 0.8 make output more random,
    /// while lower values like 0.2 make it more focused and deterministic.
    #[serde(default = "default_openai_temperature")]
    pub openai_temperature: f32,
    /// Max output tokens for OpenAI model (`OPENAI_MAX_TOKENS`).
    #[serde(default = "default_openai_max_tokens")]
    pub openai_max_tokens: u32,
    /// Timeout of a single OpenAI request attempt; failed attempts are retried (`OPENAI_REQUEST_TIMEOUT_SECS`).
    #[serde(default = "default_openai_request_timeout_secs")]
    pub openai_request_timeout_secs: u64,
    /// Optional custom system directive to override the default (`SYSTEM_DIRECTIVE`).
    #[serde(default = "default_system_directive")]
    pub system_directive: String,
    /// Slack app token (`SLACK_APP_TOKEN`).
    pub slack_app_token: String,
    /// Slack bot token (`SLACK_BOT_TOKEN`).
    pub slack_bot_token: String,
    /// Database endpoint URL, `mem://` for an in-memory store (`DB_ENDPOINT`).
    #[serde(default = "default_db_endpoint")]
    pub db_endpoint: String,
    /// Database username (`DB_USERNAME`).
    #[serde(default)]
    pub db_username: String,
    /// Database password (`DB_PASSWORD`).
    #[serde(default)]
    pub db_password: String,
    /// Database namespace (`DB_NAMESPACE`).
    #[serde(default = "default_db_namespace")]
    pub db_namespace: String,
    /// Database name (`DB_DATABASE`).
    #[serde(default = "default_db_database")]
    pub db_database: String,
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(config::Environment::default().prefix("COLLECTOR_BOT"));

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    /// Checks the loaded values for consistency.
    pub fn validate(&self) -> Void {
        if !(1..=MAX_BATCH_WINDOW_MS).contains(&self.debounce_window_ms) {
            return Err(anyhow::anyhow!("Debounce window must be between 1ms and {MAX_BATCH_WINDOW_MS}ms."));
        }

        if !(1..=MAX_BATCH_WINDOW_MS).contains(&self.max_batch_age_ms) {
            return Err(anyhow::anyhow!("Max batch age must be between 1ms and {MAX_BATCH_WINDOW_MS}ms."));
        }

        if self.max_batch_size < 1 {
            return Err(anyhow::anyhow!("Max batch size must be at least 1."));
        }

        if self.sweep_interval_secs < 1 {
            return Err(anyhow::anyhow!("Sweep interval must be at least 1s."));
        }

        if self.openai_temperature < 0.0 || self.openai_temperature > 2.0 {
            return Err(anyhow::anyhow!("OpenAI temperature must be between 0 and 2."));
        }

        if self.openai_max_tokens < 1 || self.openai_max_tokens > 128000 {
            return Err(anyhow::anyhow!("OpenAI max tokens must be between 1 and 128000."));
        }

        if self.openai_request_timeout_secs < 1 {
            return Err(anyhow::anyhow!("OpenAI request timeout must be at least 1s."));
        }

        if self.generator_timeout_ms > 0 && self.openai_request_timeout_secs.saturating_mul(1_000) >= self.generator_timeout_ms {
            return Err(anyhow::anyhow!("OpenAI request timeout must be shorter than the generator timeout."));
        }

        Ok(())
    }

    /// The batch thresholds handed to the collector.
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            debounce_window: Duration::from_millis(self.debounce_window_ms),
            max_batch_age: Duration::from_millis(self.max_batch_age_ms),
            max_batch_size: self.max_batch_size,
        }
    }

    /// The dispatch and retention options handed to the collector.
    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            generator_timeout: (self.generator_timeout_ms > 0).then(|| Duration::from_millis(self.generator_timeout_ms)),
            fallback_message: self.fallback_message.clone().filter(|m| !m.trim().is_empty()),
            idle_eviction: (self.idle_eviction_secs > 0).then(|| Duration::from_secs(self.idle_eviction_secs)),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

// Tests.
