use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::broker::retry::RetryPolicy;
use crate::broker::BrokerSettings;
use crate::cache::CacheSettings;
use crate::fetcher::FetcherSettings;
use crate::llm_client::LlmSettings;

/// Which key-value backend holds the cache, sessions, tasks and the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Process-local store; state does not survive a restart. Local runs only.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("STORE_BACKEND must be 'redis' or 'memory', got '{other}'"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub cloudconvert_api_key: String,
    pub cloudconvert_base_url: String,
    pub job_source_base_url: String,

    pub llm_model_name: String,
    pub llm_temperature: f32,
    pub llm_scoring_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_top_p: f32,

    pub cache_llm_responses: bool,
    pub cache_scraper_responses: bool,
    pub llm_cache_ttl: Duration,
    pub scraper_cache_ttl: Duration,
    pub cache_claim_ttl: Duration,

    pub worker_concurrency: usize,
    pub task_max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub task_result_ttl: Duration,

    pub fetch_concurrency: usize,
    pub external_timeout: Duration,
    pub max_extracted_chars: usize,

    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let store_backend: StoreBackend = optional_env("STORE_BACKEND", StoreBackend::Redis)?;
        // The memory backend needs no Redis; everything else stays required.
        let redis_url = match store_backend {
            StoreBackend::Redis => require_env("REDIS_URL")?,
            StoreBackend::Memory => std::env::var("REDIS_URL").unwrap_or_default(),
        };

        Ok(Config {
            store_backend,
            redis_url,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            openai_api_key: require_env("OPENAI_API_KEY")?,
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            cloudconvert_api_key: require_env("CLOUDCONVERT_API_KEY")?,
            cloudconvert_base_url: std::env::var("CLOUDCONVERT_BASE_URL")
                .unwrap_or_else(|_| "https://api.cloudconvert.com/v2".to_string()),
            job_source_base_url: std::env::var("JOB_SOURCE_BASE_URL")
                .unwrap_or_else(|_| "https://www.linkedin.com".to_string()),

            llm_model_name: std::env::var("LLM_MODEL_NAME")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_temperature: optional_env("LLM_TEMPERATURE", 0.7)?,
            llm_scoring_temperature: optional_env("LLM_SCORING_TEMPERATURE", 0.1)?,
            llm_max_tokens: optional_env("LLM_MAX_TOKENS", 3000)?,
            llm_top_p: optional_env("LLM_TOP_P", 1.0)?,

            cache_llm_responses: flag_env("CACHE_LLM_RESPONSES", true),
            cache_scraper_responses: flag_env("CACHE_SCRAPER_RESPONSES", true),
            llm_cache_ttl: seconds_env("LLM_CACHE_TTL_SECONDS", 86_400)?,
            scraper_cache_ttl: seconds_env("SCRAPER_CACHE_TTL_SECONDS", 3_600)?,
            cache_claim_ttl: seconds_env("CACHE_CLAIM_TTL_SECONDS", 300)?,

            worker_concurrency: optional_env("WORKER_CONCURRENCY", 4)?,
            task_max_retries: optional_env("TASK_MAX_RETRIES", 3)?,
            retry_base_delay: seconds_env("RETRY_BASE_DELAY_SECONDS", 2)?,
            retry_max_delay: seconds_env("RETRY_MAX_DELAY_SECONDS", 60)?,
            task_result_ttl: seconds_env("TASK_RESULT_TTL_SECONDS", 86_400)?,

            fetch_concurrency: optional_env("FETCH_CONCURRENCY", 8)?,
            external_timeout: seconds_env("EXTERNAL_TIMEOUT_SECONDS", 120)?,
            max_extracted_chars: optional_env("MAX_EXTRACTED_CHARS", 10_000)?,

            port: optional_env("PORT", 8080)
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            max_retries: self.task_max_retries,
            retry: RetryPolicy::new(self.retry_base_delay, self.retry_max_delay),
            task_ttl: self.task_result_ttl,
            ..BrokerSettings::default()
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            llm_enabled: self.cache_llm_responses,
            scraper_enabled: self.cache_scraper_responses,
            llm_ttl: self.llm_cache_ttl,
            scraper_ttl: self.scraper_cache_ttl,
            claim_ttl: self.cache_claim_ttl,
            ..CacheSettings::default()
        }
    }

    pub fn fetcher_settings(&self) -> FetcherSettings {
        FetcherSettings {
            base_url: self.job_source_base_url.clone(),
            concurrency: self.fetch_concurrency,
            timeout: self.external_timeout,
            max_chars: self.max_extracted_chars,
        }
    }

    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            model: self.llm_model_name.clone(),
            temperature: self.llm_temperature,
            scoring_temperature: self.llm_scoring_temperature,
            max_tokens: self.llm_max_tokens,
            top_p: self.llm_top_p,
        }
    }
}

#[cfg(test)]
impl Config {
    /// Memory store and placeholder credentials; no environment access.
    pub fn for_tests() -> Self {
        Config {
            store_backend: StoreBackend::Memory,
            redis_url: String::new(),
            s3_bucket: "resumeflow-test".to_string(),
            s3_endpoint: "http://localhost:9000".to_string(),
            aws_access_key_id: "test".to_string(),
            aws_secret_access_key: "test".to_string(),
            openai_api_key: "test".to_string(),
            openai_base_url: "http://localhost:1/v1".to_string(),
            cloudconvert_api_key: "test".to_string(),
            cloudconvert_base_url: "http://localhost:1/v2".to_string(),
            job_source_base_url: "http://localhost:1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.7,
            llm_scoring_temperature: 0.1,
            llm_max_tokens: 3000,
            llm_top_p: 1.0,
            cache_llm_responses: true,
            cache_scraper_responses: true,
            llm_cache_ttl: Duration::from_secs(86_400),
            scraper_cache_ttl: Duration::from_secs(3_600),
            cache_claim_ttl: Duration::from_secs(300),
            worker_concurrency: 1,
            task_max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            task_result_ttl: Duration::from_secs(86_400),
            fetch_concurrency: 8,
            external_timeout: Duration::from_secs(5),
            max_extracted_chars: 10_000,
            port: 8080,
            rust_log: "info".to_string(),
        }
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Environment variable '{key}' is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn seconds_env(key: &str, default_secs: u64) -> Result<Duration> {
    optional_env(key, default_secs).map(Duration::from_secs)
}

fn flag_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "t"))
        .unwrap_or(default)
}
