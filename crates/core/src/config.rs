use crate::chunking::ChunkingConfig;
use crate::enrichment::FieldLimits;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Exponential backoff with jitter for calls to external capabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)` capped at
    /// `max_delay`, plus up to 25% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        let jitter_cap = capped.as_millis() as u64 / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        capped + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub embeddings_enabled: bool,
    pub llm_metadata_enabled: bool,
    pub cache_ttl: Duration,
    pub enrichment_batch_size: usize,
    pub embedding_batch_size: usize,
    pub batch_delay: Duration,
    pub retry: RetryPolicy,
    pub chunking: ChunkingConfig,
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub embedding_endpoint: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub max_prompt_chars: usize,
    pub max_topical_chunks: usize,
    /// Caps applied to each list field of a metadata record.
    pub metadata_limits: FieldLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embeddings_enabled: true,
            llm_metadata_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            enrichment_batch_size: DEFAULT_BATCH_SIZE,
            embedding_batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(1_000),
            retry: RetryPolicy::default(),
            chunking: ChunkingConfig::default(),
            llm_endpoint: None,
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            llm_temperature: 0.1,
            embedding_endpoint: None,
            embedding_api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1_536,
            max_prompt_chars: 8_000,
            max_topical_chunks: 2_000,
            metadata_limits: FieldLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `KB_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = env_bool("KB_EMBEDDINGS_ENABLED") {
            config.embeddings_enabled = enabled;
        }
        if let Some(enabled) = env_bool("KB_LLM_METADATA_ENABLED") {
            config.llm_metadata_enabled = enabled;
        }
        if let Some(secs) = env_parse::<u64>("KB_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("KB_BATCH_SIZE").filter(|size| *size > 0) {
            config.enrichment_batch_size = size;
            config.embedding_batch_size = size;
        }
        if let Some(ms) = env_parse::<u64>("KB_BATCH_DELAY_MS") {
            config.batch_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("KB_RETRY_ATTEMPTS").filter(|n| *n > 0) {
            config.retry.max_attempts = attempts;
        }

        config.llm_endpoint = env_string("KB_LLM_ENDPOINT");
        config.llm_api_key = env_string("KB_LLM_API_KEY");
        if let Some(model) = env_string("KB_LLM_MODEL") {
            config.llm_model = model;
        }
        if let Some(temperature) = env_parse::<f32>("KB_LLM_TEMPERATURE").filter(|t| (0.0..=2.0).contains(t)) {
            config.llm_temperature = temperature;
        }
        config.embedding_endpoint = env_string("KB_EMBEDDING_ENDPOINT");
        config.embedding_api_key = env_string("KB_EMBEDDING_API_KEY").or_else(|| config.llm_api_key.clone());
        if let Some(model) = env_string("KB_EMBEDDING_MODEL") {
            config.embedding_model = model;
        }
        if let Some(dimensions) = env_parse::<usize>("KB_EMBEDDING_DIMENSIONS").filter(|d| *d > 0) {
            config.embedding_dimensions = dimensions;
        }

        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|value| parse_flag(&value))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
