//! Runtime configuration, read from the Lambda environment

use std::time::Duration;

use crate::errors::{Error, Result};

const SCAN_QUEUE_URL_ENV: &str = "SCAN_QUEUE_URL";
const LOOKUP_TABLE_ENV: &str = "LOOKUP_TABLE";
const INTEGRATIONS_TABLE_ENV: &str = "INTEGRATIONS_TABLE";
const INVENTORY_API_URL_ENV: &str = "INVENTORY_API_URL";
const SCAN_REGIONS_ENV: &str = "SCAN_REGIONS";
const DIRECTORY_TTL_ENV: &str = "DIRECTORY_TTL_SECONDS";
const MAX_DELETE_BATCH_ENV: &str = "MAX_DELETE_BATCH";
const MAX_ADD_BATCH_ENV: &str = "MAX_ADD_BATCH";
const MAX_MESSAGE_BYTES_ENV: &str = "MAX_MESSAGE_BYTES";
const MAX_RETRY_ATTEMPTS_ENV: &str = "MAX_RETRY_ATTEMPTS";
const LOOKUP_TTL_HOURS_ENV: &str = "LOOKUP_TTL_HOURS";

const DEFAULT_LOOKUP_TABLE: &str = "snapshot-scan-lookup";
const DEFAULT_INTEGRATIONS_TABLE: &str = "snapshot-integrations";
const DEFAULT_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-northeast-1",
    "ap-southeast-2",
];

/// SQS rejects any single message or batch above 256 KiB
pub const SQS_MAX_MESSAGE_BYTES: usize = 256 * 1024;
/// SQS accepts at most ten entries per SendMessageBatch
pub const SQS_MAX_BATCH_ENTRIES: usize = 10;
/// SQS caps DelaySeconds at fifteen minutes
pub const SQS_MAX_DELAY_SECONDS: u32 = 900;

#[derive(Debug, Clone)]
pub struct Config {
    pub scan_queue_url: String,
    pub lookup_table: String,
    pub integrations_table: String,
    pub inventory_api_url: String,
    /// Regions polled when a scan does not name one
    pub scan_regions: Vec<String>,
    pub directory_ttl: Duration,
    pub max_delete_batch: usize,
    pub max_add_batch: usize,
    /// Inline ScanMsg bodies above this size go through the lookup table
    pub max_message_bytes: usize,
    pub max_retry_attempts: u32,
    pub lookup_ttl_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_queue_url: String::new(),
            lookup_table: DEFAULT_LOOKUP_TABLE.to_string(),
            integrations_table: DEFAULT_INTEGRATIONS_TABLE.to_string(),
            inventory_api_url: String::new(),
            scan_regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            directory_ttl: Duration::from_secs(60),
            max_delete_batch: 500,
            max_add_batch: 500,
            max_message_bytes: 256_000,
            max_retry_attempts: 5,
            lookup_ttl_hours: 24,
        }
    }
}

impl Config {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let scan_regions = match get(SCAN_REGIONS_ENV) {
            Some(v) => v
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            None => defaults.scan_regions,
        };

        let config = Config {
            scan_queue_url: get(SCAN_QUEUE_URL_ENV).unwrap_or_default(),
            lookup_table: get(LOOKUP_TABLE_ENV).unwrap_or(defaults.lookup_table),
            integrations_table: get(INTEGRATIONS_TABLE_ENV).unwrap_or(defaults.integrations_table),
            inventory_api_url: get(INVENTORY_API_URL_ENV).unwrap_or_default(),
            scan_regions,
            directory_ttl: Duration::from_secs(parse_or(&get, DIRECTORY_TTL_ENV, 60)?),
            max_delete_batch: parse_or(&get, MAX_DELETE_BATCH_ENV, defaults.max_delete_batch)?,
            max_add_batch: parse_or(&get, MAX_ADD_BATCH_ENV, defaults.max_add_batch)?,
            max_message_bytes: parse_or(&get, MAX_MESSAGE_BYTES_ENV, defaults.max_message_bytes)?,
            max_retry_attempts: parse_or(&get, MAX_RETRY_ATTEMPTS_ENV, defaults.max_retry_attempts)?,
            lookup_ttl_hours: parse_or(&get, LOOKUP_TTL_HOURS_ENV, defaults.lookup_ttl_hours)?,
        };

        if config.scan_regions.is_empty() {
            return Err(Error::Config(format!("{} must name at least one region", SCAN_REGIONS_ENV)));
        }
        if config.max_add_batch == 0 || config.max_delete_batch == 0 {
            return Err(Error::Config("batch sizes must be > 0".to_string()));
        }

        Ok(config)
    }

    /// Fails unless the endpoints both handlers talk to are present
    pub fn require_endpoints(&self) -> Result<()> {
        if self.scan_queue_url.is_empty() {
            return Err(Error::Config(format!("{} is not set", SCAN_QUEUE_URL_ENV)));
        }
        if self.inventory_api_url.is_empty() {
            return Err(Error::Config(format!("{} is not set", INVENTORY_API_URL_ENV)));
        }
        Ok(())
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}
