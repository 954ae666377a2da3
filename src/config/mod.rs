use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::pipeline::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Worker HTTP bind address (health, metrics, job submission).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Required by the worker.
    pub database_url: Option<String>,

    /// Redis connection string for the username queue. Required by the worker.
    pub redis_url: Option<String>,

    /// Base URL of the scraping API (e.g. "https://api.apify.com")
    #[serde(default = "default_scraper_api_url")]
    pub scraper_api_url: String,

    /// Scraping API token
    pub scraper_api_token: String,

    /// Scraper actor that lists a profile's videos
    #[serde(default = "default_scraper_actor_id")]
    pub scraper_actor_id: String,

    /// Age/gender model server base URL
    pub predictor_url: String,

    /// S3-compatible bucket for input lists and reports. Optional.
    pub s3_bucket: Option<String>,

    pub s3_endpoint: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    /// Local username list for one-shot runs
    #[serde(default = "default_input_file")]
    pub input_file: String,

    /// Object key (under `input/`) to download when `input_file` is missing locally
    pub input_key: Option<String>,

    /// JSON-lines report path; defaults to `data/output/results_<run_id>.jsonl`
    pub output_file: Option<String>,

    /// Worker sleep between queue rounds when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_fetch_attempts: u32,

    #[serde(default = "default_max_attempts")]
    pub max_infer_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_delay_ceiling_ms")]
    pub retry_delay_ceiling_ms: u64,

    #[serde(default)]
    pub retry_jitter: bool,

    #[serde(default = "default_rate_limit_backoff_factor")]
    pub rate_limit_backoff_factor: u32,

    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_infer_timeout_ms")]
    pub infer_timeout_ms: u64,

    #[serde(default = "default_thumbnails_per_user")]
    pub thumbnails_per_user: usize,

    #[serde(default = "default_max_consecutive_batch_failures")]
    pub max_consecutive_batch_failures: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_scraper_api_url() -> String {
    "https://api.apify.com".to_string()
}

fn default_scraper_actor_id() -> String {
    "0FXVyOXXEmdGcV88a".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_input_file() -> String {
    "data/input/usernames.csv".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    16
}

fn default_batch_max_wait_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

fn default_retry_delay_ceiling_ms() -> u64 {
    60_000
}

fn default_rate_limit_backoff_factor() -> u32 {
    4
}

fn default_fetch_concurrency() -> usize {
    8
}

fn default_fetch_timeout_ms() -> u64 {
    60_000
}

fn default_infer_timeout_ms() -> u64 {
    30_000
}

fn default_thumbnails_per_user() -> usize {
    10
}

fn default_max_consecutive_batch_failures() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            batch_max_wait: Duration::from_millis(self.batch_max_wait_ms),
            max_fetch_attempts: self.max_fetch_attempts,
            max_infer_attempts: self.max_infer_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_delay_ceiling: Duration::from_millis(self.retry_delay_ceiling_ms),
            retry_jitter: self.retry_jitter,
            rate_limit_backoff_factor: self.rate_limit_backoff_factor,
            fetch_concurrency: self.fetch_concurrency,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            infer_timeout: Duration::from_millis(self.infer_timeout_ms),
            thumbnails_per_user: self.thumbnails_per_user,
            max_consecutive_batch_failures: self.max_consecutive_batch_failures,
        }
    }
}

/// Knobs consumed by the pipeline core.
#[derive(Debug, Clone, Validate)]
pub struct PipelineConfig {
    #[garde(range(min = 1))]
    pub batch_size: usize,

    #[garde(custom(non_zero_duration))]
    pub batch_max_wait: Duration,

    #[garde(range(min = 1))]
    pub max_fetch_attempts: u32,

    #[garde(range(min = 1))]
    pub max_infer_attempts: u32,

    #[garde(skip)]
    pub retry_base_delay: Duration,

    #[garde(custom(ceiling_not_below_base(&self.retry_base_delay)))]
    pub retry_delay_ceiling: Duration,

    #[garde(skip)]
    pub retry_jitter: bool,

    #[garde(range(min = 1))]
    pub rate_limit_backoff_factor: u32,

    #[garde(range(min = 1))]
    pub fetch_concurrency: usize,

    #[garde(custom(non_zero_duration))]
    pub fetch_timeout: Duration,

    #[garde(custom(non_zero_duration))]
    pub infer_timeout: Duration,

    #[garde(range(min = 1))]
    pub thumbnails_per_user: usize,

    #[garde(range(min = 1))]
    pub max_consecutive_batch_failures: u32,
}

fn non_zero_duration(value: &Duration, _ctx: &()) -> garde::Result {
    if value.is_zero() {
        return Err(garde::Error::new("must be greater than zero"));
    }
    Ok(())
}

fn ceiling_not_below_base(base: &Duration) -> impl FnOnce(&Duration, &()) -> garde::Result + '_ {
    move |ceiling, _| {
        if ceiling < base {
            return Err(garde::Error::new("must not be below the retry base delay"));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_fetch_attempts: self.max_fetch_attempts,
            max_infer_attempts: self.max_infer_attempts,
            base_delay: self.retry_base_delay,
            delay_ceiling: self.retry_delay_ceiling,
            rate_limit_factor: self.rate_limit_backoff_factor,
            jitter: self.retry_jitter,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_max_wait: Duration::from_millis(default_batch_max_wait_ms()),
            max_fetch_attempts: default_max_attempts(),
            max_infer_attempts: default_max_attempts(),
            retry_base_delay: Duration::from_millis(default_retry_base_delay_ms()),
            retry_delay_ceiling: Duration::from_millis(default_retry_delay_ceiling_ms()),
            retry_jitter: false,
            rate_limit_backoff_factor: default_rate_limit_backoff_factor(),
            fetch_concurrency: default_fetch_concurrency(),
            fetch_timeout: Duration::from_millis(default_fetch_timeout_ms()),
            infer_timeout: Duration::from_millis(default_infer_timeout_ms()),
            thumbnails_per_user: default_thumbnails_per_user(),
            max_consecutive_batch_failures: default_max_consecutive_batch_failures(),
        }
    }
}
