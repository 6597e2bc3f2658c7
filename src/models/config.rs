//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::FeedSource;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Message broker connection and queue settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Feed polling settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Batching and flush policy
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Batch object destination
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply deployment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("AMQP_URI") {
            self.broker.uri = Some(uri);
        }
        if let Some(host) = lookup("AMQP_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("AMQP_PORT").and_then(|p| p.parse().ok()) {
            self.broker.port = port;
        }
        if let Some(username) = lookup("AMQP_USERNAME") {
            self.broker.username = username;
        }
        if let Some(password) = lookup("AMQP_PASSWORD") {
            self.broker.password = password;
        }
        if let Some(queue) = lookup("QUEUE_NAME") {
            self.broker.queue = queue;
        }
        if let Some(bucket) = lookup("S3_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
        if let Some(prefix) = lookup("S3_PREFIX").or_else(|| lookup("STORAGE_ROOT")) {
            self.storage.root = prefix;
        }
        if let Some(path) = lookup("DEDUP_FILE") {
            self.producer.dedup_file = PathBuf::from(path);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.queue.trim().is_empty() {
            return Err(AppError::validation("broker.queue is empty"));
        }
        if broker.uri.is_none() && broker.host.trim().is_empty() {
            return Err(AppError::validation("broker.host is empty"));
        }
        if broker.retry_interval_secs == 0 {
            return Err(AppError::validation(
                "broker.retry_interval_secs must be > 0",
            ));
        }
        if broker.retry_multiplier < 1.0 {
            return Err(AppError::validation(
                "broker.retry_multiplier must be >= 1.0",
            ));
        }
        if !matches!(broker.stream_offset.as_str(), "first" | "last" | "next") {
            return Err(AppError::validation(
                "broker.stream_offset must be one of first, last, next",
            ));
        }

        let producer = &self.producer;
        if producer.feeds.is_empty() {
            return Err(AppError::validation("No feeds defined"));
        }
        for feed in &producer.feeds {
            url::Url::parse(&feed.url).map_err(|e| {
                AppError::validation(format!("feed url {:?} is invalid: {}", feed.url, e))
            })?;
        }
        if producer.poll_interval_secs == 0 {
            return Err(AppError::validation(
                "producer.poll_interval_secs must be > 0",
            ));
        }
        if producer.timeout_secs == 0 {
            return Err(AppError::validation("producer.timeout_secs must be > 0"));
        }
        if producer.max_concurrent == 0 {
            return Err(AppError::validation("producer.max_concurrent must be > 0"));
        }

        let consumer = &self.consumer;
        if consumer.batch_size == 0 {
            return Err(AppError::validation("consumer.batch_size must be > 0"));
        }
        if consumer.flush_interval_secs == 0 {
            return Err(AppError::validation(
                "consumer.flush_interval_secs must be > 0",
            ));
        }
        if consumer.object_prefix.trim().is_empty() {
            return Err(AppError::validation("consumer.object_prefix is empty"));
        }
        // Unacked deliveries stop at the prefetch window, so a batch larger
        // than the window would never fill.
        if consumer.ack_mode == AckMode::AfterUpload
            && usize::from(broker.prefetch) < consumer.batch_size
        {
            return Err(AppError::validation(
                "broker.prefetch must be >= consumer.batch_size when ack_mode = \"after_upload\"",
            ));
        }

        if self.storage.backend == StorageBackend::S3
            && self.storage.bucket.as_deref().is_none_or(str::is_empty)
        {
            return Err(AppError::validation(
                "storage.bucket is required for the s3 backend",
            ));
        }

        Ok(())
    }
}

/// Broker connection and queue declaration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Full AMQP URI; overrides host/port/credentials when set
    #[serde(default)]
    pub uri: Option<String>,

    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default = "defaults::vhost")]
    pub vhost: String,

    #[serde(default = "defaults::username")]
    pub username: String,

    #[serde(default = "defaults::password")]
    pub password: String,

    /// Durable stream queue name
    #[serde(default = "defaults::queue")]
    pub queue: String,

    /// AMQP heartbeat in seconds
    #[serde(default = "defaults::heartbeat")]
    pub heartbeat_secs: u16,

    /// Delay before the first reconnect attempt
    #[serde(default = "defaults::retry_interval")]
    pub retry_interval_secs: u64,

    /// Upper bound for the reconnect delay (raised to the interval if lower)
    #[serde(default = "defaults::retry_interval")]
    pub max_retry_interval_secs: u64,

    /// Growth factor for the reconnect delay (1.0 = fixed)
    #[serde(default = "defaults::retry_multiplier")]
    pub retry_multiplier: f64,

    /// Unacknowledged deliveries allowed in flight
    #[serde(default = "defaults::prefetch")]
    pub prefetch: u16,

    /// Where a new subscription starts reading the stream
    #[serde(default = "defaults::stream_offset")]
    pub stream_offset: String,
}

impl BrokerConfig {
    /// Build the AMQP URI, percent-encoding the credentials and vhost.
    pub fn amqp_uri(&self) -> Result<String> {
        if let Some(uri) = &self.uri {
            return Ok(uri.clone());
        }
        let mut uri = url::Url::parse(&format!("amqp://{}:{}", self.host, self.port))?;
        uri.set_username(&self.username)
            .and_then(|_| uri.set_password(Some(&self.password)))
            .map_err(|_| AppError::config("broker credentials cannot be set on the URI"))?;
        let vhost: String = url::form_urlencoded::byte_serialize(self.vhost.as_bytes()).collect();
        uri.set_path(&format!("/{}", vhost));
        uri.set_query(Some(&format!("heartbeat={}", self.heartbeat_secs)));
        Ok(uri.to_string())
    }

    /// Broker address without credentials, for log lines.
    pub fn display_addr(&self) -> String {
        match &self.uri {
            Some(uri) => url::Url::parse(uri)
                .ok()
                .and_then(|u| {
                    u.host_str()
                        .map(|h| format!("{}:{}", h, u.port().unwrap_or(5672)))
                })
                .unwrap_or_else(|| "<uri>".to_string()),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: defaults::host(),
            port: defaults::port(),
            vhost: defaults::vhost(),
            username: defaults::username(),
            password: defaults::password(),
            queue: defaults::queue(),
            heartbeat_secs: defaults::heartbeat(),
            retry_interval_secs: defaults::retry_interval(),
            max_retry_interval_secs: defaults::retry_interval(),
            retry_multiplier: defaults::retry_multiplier(),
            prefetch: defaults::prefetch(),
            stream_offset: defaults::stream_offset(),
        }
    }
}

/// Feed polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "defaults::feeds")]
    pub feeds: Vec<FeedSource>,

    /// Sleep between fetch cycles
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_secs: u64,

    /// JSON file holding already published links
    #[serde(default = "defaults::dedup_file")]
    pub dedup_file: PathBuf,

    /// User-Agent header for feed requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Maximum feeds fetched at once
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,
}

impl ProducerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            feeds: defaults::feeds(),
            poll_interval_secs: defaults::poll_interval(),
            dedup_file: defaults::dedup_file(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_concurrent: defaults::max_concurrent(),
        }
    }
}

/// When the consumer acknowledges a delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack as soon as the message is buffered. A crash before the next
    /// flush loses the buffered messages.
    #[default]
    OnReceipt,
    /// Ack only once the batch holding the message is uploaded. A crash
    /// leads to redelivery instead of loss.
    AfterUpload,
}

/// Batching and flush policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Flush as soon as the buffer holds this many messages
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Flush whatever is buffered after this long without a flush
    #[serde(default = "defaults::flush_interval")]
    pub flush_interval_secs: u64,

    /// How often the flush interval is checked
    #[serde(default = "defaults::flush_check")]
    pub flush_check_millis: u64,

    /// Object name prefix: `<prefix>_<YYYYMMDDTHHMMSS>_part<N>.json`
    #[serde(default = "defaults::object_prefix")]
    pub object_prefix: String,

    #[serde(default)]
    pub ack_mode: AckMode,

    #[serde(default = "defaults::consumer_tag")]
    pub consumer_tag: String,

    /// Local directory for batches that could not be uploaded at shutdown
    #[serde(default = "defaults::spill_dir")]
    pub spill_dir: PathBuf,
}

impl ConsumerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn flush_check(&self) -> Duration {
        Duration::from_millis(self.flush_check_millis.max(1))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            flush_interval_secs: defaults::flush_interval(),
            flush_check_millis: defaults::flush_check(),
            object_prefix: defaults::object_prefix(),
            ack_mode: AckMode::default(),
            consumer_tag: defaults::consumer_tag(),
            spill_dir: defaults::spill_dir(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

/// Batch object destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root folder inside the bucket or local directory
    #[serde(default = "defaults::storage_root")]
    pub root: String,

    /// Base directory for the local backend
    #[serde(default = "defaults::local_dir")]
    pub local_dir: PathBuf,

    /// Bucket for the s3 backend
    #[serde(default)]
    pub bucket: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: defaults::storage_root(),
            local_dir: defaults::local_dir(),
            bucket: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    use crate::models::FeedSource;

    // Broker defaults
    pub fn host() -> String {
        "localhost".into()
    }
    pub fn port() -> u16 {
        5672
    }
    pub fn vhost() -> String {
        "/".into()
    }
    pub fn username() -> String {
        "guest".into()
    }
    pub fn password() -> String {
        "guest".into()
    }
    pub fn queue() -> String {
        "RSS_FEED_QUEUE".into()
    }
    pub fn heartbeat() -> u16 {
        60
    }
    pub fn retry_interval() -> u64 {
        5
    }
    pub fn retry_multiplier() -> f64 {
        1.0
    }
    pub fn prefetch() -> u16 {
        100
    }
    pub fn stream_offset() -> String {
        "next".into()
    }

    // Producer defaults
    pub fn poll_interval() -> u64 {
        15 * 60
    }
    pub fn dedup_file() -> PathBuf {
        PathBuf::from("processed_rss_links.json")
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; feed-ingest/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn max_concurrent() -> usize {
        5
    }
    pub fn feeds() -> Vec<FeedSource> {
        [
            "https://openai.com/blog/rss/",
            "https://medium.com/feed/topic/artificial-intelligence",
            "https://ai.googleblog.com/feeds/posts/default",
            "https://techcrunch.com/feed/",
            "https://www.bbc.co.uk/feeds/rss/world.xml",
            "https://www.theverge.com/rss/index.xml",
            "https://www.wired.com/feed/rss",
            "https://thenextweb.com/feed/",
            "https://arxiv.org/rss/cs.AI",
            "https://arxiv.org/rss/cs.LG",
            "https://arxiv.org/rss/cs.CV",
            "https://towardsdatascience.com/feed",
            "https://deepmind.com/blog/rss.xml",
            "https://venturebeat.com/category/ai/feed/",
            "https://www.forbes.com/ai/feed2/",
            "https://www.techradar.com/rss",
            "https://analyticsindiamag.com/feed/",
            "https://www.kdnuggets.com/feed",
            "https://www.infoq.com/ai-ml/news/rss",
            "https://machinelearningmastery.com/blog/feed/",
        ]
        .into_iter()
        .map(FeedSource::from)
        .collect()
    }

    // Consumer defaults
    pub fn batch_size() -> usize {
        100
    }
    pub fn flush_interval() -> u64 {
        15 * 60
    }
    pub fn flush_check() -> u64 {
        1000
    }
    pub fn object_prefix() -> String {
        "rss_batch".into()
    }
    pub fn consumer_tag() -> String {
        "feed-ingest-consumer".into()
    }
    pub fn spill_dir() -> PathBuf {
        PathBuf::from("spill")
    }

    // Storage defaults
    pub fn storage_root() -> String {
        "raw_rss_feed".into()
    }
    pub fn local_dir() -> PathBuf {
        PathBuf::from("storage")
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
