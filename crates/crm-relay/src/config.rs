//! Configuration for the CRM relay.
//!
//! Every setting has a default and can be overridden through a `RELAY_*`
//! environment variable. The batch section can also come from a JSON file
//! (`RELAY_BATCH_CONFIG`); individual batch variables take precedence over
//! the file.

use crate::error::{RelayError, RelayResult};
use batch_delivery_engine::{backoff_delay, BatchConfig};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_REDIS_URL: &str = "RELAY_REDIS_URL";
pub const ENV_STREAM: &str = "RELAY_STREAM";
pub const ENV_DEAD_LETTER_STREAM: &str = "RELAY_DEAD_LETTER_STREAM";
pub const ENV_CONSUMER_GROUP: &str = "RELAY_CONSUMER_GROUP";
pub const ENV_CONSUMER_NAME: &str = "RELAY_CONSUMER_NAME";
pub const ENV_BLOCK_MS: &str = "RELAY_BLOCK_MS";
pub const ENV_READ_COUNT: &str = "RELAY_READ_COUNT";
pub const ENV_CLAIM_MIN_IDLE_MS: &str = "RELAY_CLAIM_MIN_IDLE_MS";
pub const ENV_CLAIM_INTERVAL_MS: &str = "RELAY_CLAIM_INTERVAL_MS";
pub const ENV_CRM_API_URL: &str = "RELAY_CRM_API_URL";
pub const ENV_CRM_API_TOKEN: &str = "RELAY_CRM_API_TOKEN";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "RELAY_HTTP_TIMEOUT_SECS";
pub const ENV_BATCH_CONFIG: &str = "RELAY_BATCH_CONFIG";
pub const ENV_MAX_BATCH_SIZE: &str = "RELAY_MAX_BATCH_SIZE";
pub const ENV_FLUSH_INTERVAL_MS: &str = "RELAY_FLUSH_INTERVAL_MS";
pub const ENV_MAX_RETRIES: &str = "RELAY_MAX_RETRIES";
pub const ENV_BASE_DELAY_MS: &str = "RELAY_BASE_DELAY_MS";
pub const ENV_SEND_TIMEOUT_MS: &str = "RELAY_SEND_TIMEOUT_MS";

/// CRM relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Stream the CRM events are read from
    pub stream: String,

    /// Stream that receives dead-lettered events
    pub dead_letter_stream: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Consumer name (unique per instance)
    pub consumer_name: String,

    /// XREADGROUP block timeout in milliseconds
    pub block_ms: u64,

    /// Maximum messages per XREADGROUP
    pub read_count: usize,

    /// Pending messages idle at least this long are claimed with XAUTOCLAIM,
    /// whichever consumer they were delivered to
    pub claim_min_idle: Duration,

    /// Time between XAUTOCLAIM sweeps (the first one runs at startup)
    pub claim_interval: Duration,

    /// CRM API endpoint receiving one event per POST
    pub crm_api_url: String,

    /// Bearer token for the CRM API
    pub crm_api_token: Option<String>,

    /// HTTP request timeout
    pub http_timeout: Duration,

    /// Batching and retry settings for the delivery engine
    pub batch: BatchConfig,
}

impl RelayConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_batch = match lookup(ENV_BATCH_CONFIG) {
            Some(path) => load_batch_file(Path::new(&path))?,
            None => BatchConfig::default(),
        };

        let batch = BatchConfig {
            max_batch_size: parse_or(&lookup, ENV_MAX_BATCH_SIZE, file_batch.max_batch_size)?,
            flush_interval_ms: parse_or(
                &lookup,
                ENV_FLUSH_INTERVAL_MS,
                file_batch.flush_interval_ms,
            )?,
            max_retries: parse_or(&lookup, ENV_MAX_RETRIES, file_batch.max_retries)?,
            base_delay_ms: parse_or(&lookup, ENV_BASE_DELAY_MS, file_batch.base_delay_ms)?,
            send_timeout_ms: match parse::<u64, _>(&lookup, ENV_SEND_TIMEOUT_MS)? {
                Some(ms) => Some(ms),
                None => file_batch.send_timeout_ms,
            },
        };

        let config = Self {
            redis_url: lookup(ENV_REDIS_URL)
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            stream: lookup(ENV_STREAM).unwrap_or_else(|| "crm:events".to_string()),
            dead_letter_stream: lookup(ENV_DEAD_LETTER_STREAM)
                .unwrap_or_else(|| "crm:events:dlq".to_string()),
            consumer_group: lookup(ENV_CONSUMER_GROUP).unwrap_or_else(|| "crm-relay".to_string()),
            consumer_name: lookup(ENV_CONSUMER_NAME)
                .unwrap_or_else(|| format!("crm-relay-{}", uuid::Uuid::new_v4())),
            block_ms: parse_or(&lookup, ENV_BLOCK_MS, 5000)?,
            read_count: parse_or(&lookup, ENV_READ_COUNT, 10)?,
            claim_min_idle: Duration::from_millis(parse_or(
                &lookup,
                ENV_CLAIM_MIN_IDLE_MS,
                300_000,
            )?),
            claim_interval: Duration::from_millis(parse_or(
                &lookup,
                ENV_CLAIM_INTERVAL_MS,
                60_000,
            )?),
            crm_api_url: lookup(ENV_CRM_API_URL)
                .unwrap_or_else(|| "http://127.0.0.1:8080/crm/events".to_string()),
            crm_api_token: lookup(ENV_CRM_API_TOKEN).filter(|token| !token.is_empty()),
            http_timeout: Duration::from_secs(parse_or(&lookup, ENV_HTTP_TIMEOUT_SECS, 30)?),
            batch,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values the engine does not cover.
    pub fn validate(&self) -> RelayResult<()> {
        if self.read_count == 0 {
            return Err(RelayError::Config(format!(
                "{} must be at least 1",
                ENV_READ_COUNT
            )));
        }
        if self.stream == self.dead_letter_stream {
            return Err(RelayError::Config(
                "dead-letter stream must differ from the source stream".to_string(),
            ));
        }
        if self.claim_interval.is_zero() {
            return Err(RelayError::Config(format!(
                "{} must be at least 1",
                ENV_CLAIM_INTERVAL_MS
            )));
        }
        self.batch.validate()?;

        let residency = self.max_residency();
        if self.claim_min_idle <= residency {
            return Err(RelayError::Config(format!(
                "{} ({}ms) must exceed the time a message can spend in the engine ({}ms)",
                ENV_CLAIM_MIN_IDLE_MS,
                self.claim_min_idle.as_millis(),
                residency.as_millis()
            )));
        }
        Ok(())
    }

    /// Longest time a message normally stays unacknowledged inside the
    /// engine: one flush interval, one send and the backoff delay per
    /// attempt. Messages idle for less than this are never claimed.
    pub fn max_residency(&self) -> Duration {
        let send = match self.batch.send_timeout() {
            Some(limit) => limit.min(self.http_timeout),
            None => self.http_timeout,
        };
        let per_attempt = self.batch.flush_interval().saturating_add(send);
        let attempts = self.batch.max_retries.saturating_add(1);

        (0..self.batch.max_retries).fold(
            per_attempt.saturating_mul(attempts),
            |total, retry_count| {
                total.saturating_add(backoff_delay(self.batch.base_delay(), retry_count))
            },
        )
    }
}

/// Read a batch section from a JSON file. Missing keys keep their defaults.
pub fn load_batch_file(path: &Path) -> RelayResult<BatchConfig> {
    let contents = std::fs::read_to_string(path)?;
    let batch: BatchConfig = serde_json::from_str(&contents)?;
    Ok(batch)
}

fn parse<T, F>(lookup: &F, key: &str) -> RelayResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RelayError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> RelayResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse(lookup, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.stream, "crm:events");
        assert_eq!(config.dead_letter_stream, "crm:events:dlq");
        assert_eq!(config.consumer_group, "crm-relay");
        assert!(config.consumer_name.starts_with("crm-relay-"));
        assert_eq!(config.block_ms, 5000);
        assert_eq!(config.read_count, 10);
        assert_eq!(config.crm_api_token, None);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.claim_min_idle, Duration::from_secs(300));
        assert_eq!(config.claim_interval, Duration::from_secs(60));
        assert_eq!(config.batch, BatchConfig::default());
    }

    #[test]
    fn test_max_residency_covers_every_attempt() {
        let config = RelayConfig::from_lookup(lookup_from(&[])).unwrap();

        // 4 attempts of (10s interval + 30s send) plus 1s + 2s + 4s backoff.
        assert_eq!(config.max_residency(), Duration::from_secs(167));

        let config = RelayConfig::from_lookup(lookup_from(&[(ENV_SEND_TIMEOUT_MS, "5000")]))
            .unwrap();
        assert_eq!(config.max_residency(), Duration::from_secs(67));
    }

    #[test]
    fn test_claim_idle_below_residency_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[(ENV_CLAIM_MIN_IDLE_MS, "60000")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(ref msg) if msg.contains(ENV_CLAIM_MIN_IDLE_MS)));

        let err = RelayConfig::from_lookup(lookup_from(&[(ENV_CLAIM_INTERVAL_MS, "0")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            (ENV_REDIS_URL, "redis://cache:6380"),
            (ENV_STREAM, "leads"),
            (ENV_DEAD_LETTER_STREAM, "leads:dead"),
            (ENV_CONSUMER_NAME, "relay-1"),
            (ENV_CRM_API_TOKEN, "secret"),
            (ENV_MAX_BATCH_SIZE, "20"),
            (ENV_FLUSH_INTERVAL_MS, "2500"),
            (ENV_MAX_RETRIES, "5"),
            (ENV_BASE_DELAY_MS, "200"),
            (ENV_SEND_TIMEOUT_MS, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.stream, "leads");
        assert_eq!(config.dead_letter_stream, "leads:dead");
        assert_eq!(config.consumer_name, "relay-1");
        assert_eq!(config.crm_api_token.as_deref(), Some("secret"));
        assert_eq!(config.batch.max_batch_size, 20);
        assert_eq!(config.batch.flush_interval_ms, 2500);
        assert_eq!(config.batch.max_retries, 5);
        assert_eq!(config.batch.base_delay_ms, 200);
        assert_eq!(config.batch.send_timeout_ms, Some(1500));
    }

    #[test]
    fn test_unparseable_number_is_config_error() {
        let err = RelayConfig::from_lookup(lookup_from(&[(ENV_MAX_RETRIES, "three")]))
            .unwrap_err();

        assert!(matches!(err, RelayError::Config(ref msg) if msg.contains(ENV_MAX_RETRIES)));
    }

    #[test]
    fn test_invalid_batch_values_are_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[(ENV_MAX_BATCH_SIZE, "0")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::Delivery(_)));

        let err = RelayConfig::from_lookup(lookup_from(&[(ENV_READ_COUNT, "0")])).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_same_stream_for_dead_letters_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[
            (ENV_STREAM, "events"),
            (ENV_DEAD_LETTER_STREAM, "events"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_batch_file_with_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_batch_size": 50, "max_retries": 1}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = RelayConfig::from_lookup(lookup_from(&[
            (ENV_BATCH_CONFIG, path.as_str()),
            (ENV_MAX_RETRIES, "4"),
        ]))
        .unwrap();

        assert_eq!(config.batch.max_batch_size, 50);
        assert_eq!(config.batch.max_retries, 4);
        assert_eq!(config.batch.flush_interval_ms, 10_000);
    }

    #[test]
    fn test_missing_batch_file_is_io_error() {
        let err = load_batch_file(Path::new("/nonexistent/batch.json")).unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
