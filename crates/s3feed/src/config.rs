//! Configuration management
//!
//! Scalars come from the environment (after loading `.env`), structured
//! items such as file selectors from an optional TOML file. Environment
//! values override the file.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::aws::{bucket_arn, bucket_name_from_arn, S3ClientConfig};
use crate::object::{FileSelector, LineTerminator, ReaderConfig};
use crate::poller::{PollerConfig, PollingStrategy};

// ============================================================================
// Input Configuration Constants
// ============================================================================

/// Default time between two bucket scans, in seconds.
pub const DEFAULT_BUCKET_LIST_INTERVAL_SECS: u64 = 120;

/// Default number of poller workers.
pub const DEFAULT_NUMBER_OF_WORKERS: usize = 5;

/// Default number of queue messages in flight.
pub const DEFAULT_MAX_NUMBER_OF_MESSAGES: usize = 5;

/// Default queue visibility timeout in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;

/// Upper bound the queue accepts for a visibility timeout (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 12 * 60 * 60;

/// Default receive count after which a failing message is deleted.
pub const DEFAULT_SQS_MAX_RECEIVE_COUNT: i64 = 5;

/// Default timeout of a single API call in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 120;

/// Default number of keys kept in lexicographic mode.
pub const DEFAULT_LEXICOGRAPHICAL_LOOKBACK_KEYS: usize = 100;

/// Default consecutive listing failures before a scan is abandoned.
pub const DEFAULT_BUCKET_LIST_FAILURE_THRESHOLD: u32 = 5;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default state file location.
pub const DEFAULT_STATE_PATH: &str = "data/s3feed-state.json";

/// Default window during which an identical failure is logged once, in seconds.
pub const DEFAULT_ERROR_LOG_WINDOW_SECS: u64 = 60;

/// Command line arguments of the `s3feed` binary
#[derive(Parser, Debug)]
#[command(name = "s3feed")]
#[command(author, version, about = "Ingest objects from an S3 bucket as JSON records", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "S3FEED_CONFIG")]
    pub config: Option<PathBuf>,

    /// State file location (overrides the configuration)
    #[arg(long, env = "S3FEED_STATE_PATH")]
    pub state_path: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Reader settings of the objects whose key matches `regex`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileSelectorConfig {
    /// Unset matches every key
    pub regex: Option<String>,
    pub content_type: Option<String>,
    pub expand_event_list_from_field: Option<String>,
    pub include_s3_metadata: Vec<String>,
    pub line_terminator: LineTerminator,
}

impl FileSelectorConfig {
    fn build(&self) -> anyhow::Result<FileSelector> {
        let regex = self
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("invalid file selector regex {:?}", self.regex))?;
        Ok(FileSelector {
            regex,
            reader: ReaderConfig {
                content_type: self.content_type.clone(),
                expand_event_list_from_field: self.expand_event_list_from_field.clone(),
                include_s3_metadata: self
                    .include_s3_metadata
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect(),
                line_terminator: self.line_terminator,
                decoder: None,
            },
        })
    }
}

/// Input configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue_url: Option<String>,
    pub bucket_arn: Option<String>,
    pub bucket_list_prefix: String,
    pub bucket_list_interval_secs: u64,
    pub number_of_workers: usize,
    pub max_number_of_messages: usize,
    pub visibility_timeout_secs: u64,
    /// Zero or negative disables the limit
    pub sqs_max_receive_count: i64,
    pub api_timeout_secs: u64,
    pub ignore_older_secs: Option<u64>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub lexicographical_ordering: bool,
    pub lexicographical_lookback_keys: usize,
    pub bucket_list_failure_threshold: u32,
    pub region: String,
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub state_path: PathBuf,
    pub error_log_window_secs: u64,
    pub file_selectors: Vec<FileSelectorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_url: None,
            bucket_arn: None,
            bucket_list_prefix: String::new(),
            bucket_list_interval_secs: DEFAULT_BUCKET_LIST_INTERVAL_SECS,
            number_of_workers: DEFAULT_NUMBER_OF_WORKERS,
            max_number_of_messages: DEFAULT_MAX_NUMBER_OF_MESSAGES,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            sqs_max_receive_count: DEFAULT_SQS_MAX_RECEIVE_COUNT,
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            ignore_older_secs: None,
            start_timestamp: None,
            lexicographical_ordering: false,
            lexicographical_lookback_keys: DEFAULT_LEXICOGRAPHICAL_LOOKBACK_KEYS,
            bucket_list_failure_threshold: DEFAULT_BUCKET_LIST_FAILURE_THRESHOLD,
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            path_style: false,
            access_key_id: None,
            secret_access_key: None,
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            error_log_window_secs: DEFAULT_ERROR_LOG_WINDOW_SECS,
            file_selectors: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the optional TOML file, then the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `S3FEED_*` environment overrides
    pub fn merge_env(mut self) -> anyhow::Result<Self> {
        if let Some(v) = env_string("S3FEED_QUEUE_URL") {
            self.queue_url = Some(v);
        }
        if let Some(v) = env_string("S3FEED_BUCKET_ARN") {
            self.bucket_arn = Some(v);
        }
        if let Some(v) = env_string("S3FEED_BUCKET_LIST_PREFIX") {
            self.bucket_list_prefix = v;
        }
        if let Some(v) = env_parse("S3FEED_BUCKET_LIST_INTERVAL_SECS")? {
            self.bucket_list_interval_secs = v;
        }
        if let Some(v) = env_parse("S3FEED_NUMBER_OF_WORKERS")? {
            self.number_of_workers = v;
        }
        if let Some(v) = env_parse("S3FEED_MAX_NUMBER_OF_MESSAGES")? {
            self.max_number_of_messages = v;
        }
        if let Some(v) = env_parse("S3FEED_VISIBILITY_TIMEOUT_SECS")? {
            self.visibility_timeout_secs = v;
        }
        if let Some(v) = env_parse("S3FEED_SQS_MAX_RECEIVE_COUNT")? {
            self.sqs_max_receive_count = v;
        }
        if let Some(v) = env_parse("S3FEED_API_TIMEOUT_SECS")? {
            self.api_timeout_secs = v;
        }
        if let Some(v) = env_parse("S3FEED_IGNORE_OLDER_SECS")? {
            self.ignore_older_secs = Some(v);
        }
        if let Some(v) = env_string("S3FEED_START_TIMESTAMP") {
            let ts = DateTime::parse_from_rfc3339(&v)
                .with_context(|| format!("S3FEED_START_TIMESTAMP is not RFC 3339: {v}"))?;
            self.start_timestamp = Some(ts.with_timezone(&Utc));
        }
        if let Some(v) = env_parse("S3FEED_LEXICOGRAPHICAL_ORDERING")? {
            self.lexicographical_ordering = v;
        }
        if let Some(v) = env_parse("S3FEED_LEXICOGRAPHICAL_LOOKBACK_KEYS")? {
            self.lexicographical_lookback_keys = v;
        }
        if let Some(v) = env_parse("S3FEED_BUCKET_LIST_FAILURE_THRESHOLD")? {
            self.bucket_list_failure_threshold = v;
        }
        if let Some(v) = env_string("AWS_REGION") {
            self.region = v;
        }
        if let Some(v) = env_string("S3FEED_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = env_parse("S3FEED_PATH_STYLE")? {
            self.path_style = v;
        }
        if let Some(v) = env_string("AWS_ACCESS_KEY_ID") {
            self.access_key_id = Some(v);
        }
        if let Some(v) = env_string("AWS_SECRET_ACCESS_KEY") {
            self.secret_access_key = Some(v);
        }
        if let Some(v) = env_string("S3FEED_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.queue_url, &self.bucket_arn) {
            (None, None) => anyhow::bail!("one of queue_url or bucket_arn must be set"),
            (Some(_), Some(_)) => anyhow::bail!("queue_url and bucket_arn cannot both be set"),
            _ => {}
        }

        if self.number_of_workers == 0 {
            anyhow::bail!("number_of_workers must be greater than 0");
        }
        if self.max_number_of_messages == 0 {
            anyhow::bail!("max_number_of_messages must be greater than 0");
        }
        if self.visibility_timeout_secs == 0 {
            anyhow::bail!("visibility_timeout must be greater than 0");
        }
        if self.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
            anyhow::bail!(
                "visibility_timeout must not exceed {MAX_VISIBILITY_TIMEOUT_SECS} seconds"
            );
        }
        if self.api_timeout_secs == 0 {
            anyhow::bail!("api_timeout must be greater than 0");
        }
        if self.bucket_arn.is_some() && self.bucket_list_interval_secs == 0 {
            anyhow::bail!("bucket_list_interval must be greater than 0");
        }
        if self.lexicographical_ordering && self.lexicographical_lookback_keys == 0 {
            anyhow::bail!("lexicographical_lookback_keys must be greater than 0");
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            anyhow::bail!("access key id and secret access key must be set together");
        }

        for selector in &self.file_selectors {
            selector.build()?;
        }
        Ok(())
    }

    pub fn file_selectors(&self) -> anyhow::Result<Vec<FileSelector>> {
        self.file_selectors.iter().map(FileSelectorConfig::build).collect()
    }

    /// Receive count limit; 0 when disabled
    pub fn max_receive_count(&self) -> u32 {
        u32::try_from(self.sqs_max_receive_count.max(0)).unwrap_or(u32::MAX)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn error_log_window(&self) -> Duration {
        Duration::from_secs(self.error_log_window_secs)
    }

    pub fn s3_client_config(&self) -> S3ClientConfig {
        S3ClientConfig {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            path_style: self.path_style,
            access_key: self.access_key_id.clone(),
            secret_key: self.secret_access_key.clone(),
            api_timeout: self.api_timeout(),
        }
    }

    pub fn polling_strategy(&self) -> PollingStrategy {
        if self.lexicographical_ordering {
            PollingStrategy::Lexicographic {
                lookback_keys: self.lexicographical_lookback_keys,
            }
        } else {
            PollingStrategy::Normal
        }
    }

    /// Poller settings, when polling a bucket
    pub fn poller_config(&self) -> Option<PollerConfig> {
        let bucket = self.bucket_arn.as_deref()?;
        Some(PollerConfig {
            bucket_name: bucket_name_from_arn(bucket).to_string(),
            bucket_arn: bucket_arn(bucket),
            region: self.region.clone(),
            list_prefix: self.bucket_list_prefix.clone(),
            interval: Duration::from_secs(self.bucket_list_interval_secs),
            number_of_workers: self.number_of_workers,
            ignore_older: self.ignore_older_secs.map(Duration::from_secs),
            start_timestamp: self.start_timestamp,
            failure_threshold: self.bucket_list_failure_threshold,
            strategy: self.polling_strategy(),
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))
        })
        .transpose()
}
