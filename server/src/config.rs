//! Server configuration parsed from environment variables.
//!
//! Numeric settings fall back to their defaults when unset or unparsable.
//! Structured settings (`STORAGE_*`, `DEV_USERS`) are rejected at startup
//! when malformed.

use std::time::Duration;

use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_REGISTRY_SHARDS: usize = 16;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: i64 = 25 * 1024 * 1024;
pub const DEFAULT_SEND_RATE_LIMIT: usize = 30;
pub const DEFAULT_SEND_RATE_WINDOW_SECS: u64 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Connection and delivery tuning shared by the registry and ws tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub send_queue_capacity: usize,
    pub registry_shards: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

/// Payload limits enforced by the router and the upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_content_chars: usize,
    pub max_attachment_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRateConfig {
    pub limit: usize,
    pub window: Duration,
}

/// Object-storage collaborator used by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub base_url: String,
    pub bucket: String,
    pub api_key: String,
    /// Prefix for the URLs handed back to clients.
    pub public_url: String,
}

/// A seeded user for development mode (`DEV_USERS=token:uuid:name,...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevUser {
    pub token: String,
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub channel: ChannelConfig,
    pub limits: PayloadLimits,
    pub send_rate: SendRateConfig,
    pub storage: Option<StorageConfig>,
    pub dev_users: Vec<DevUser>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            registry_shards: DEFAULT_REGISTRY_SHARDS,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self { max_content_chars: DEFAULT_MAX_CONTENT_CHARS, max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES }
    }
}

impl Default for SendRateConfig {
    fn default() -> Self {
        Self { limit: DEFAULT_SEND_RATE_LIMIT, window: Duration::from_secs(DEFAULT_SEND_RATE_WINDOW_SECS) }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            port: DEFAULT_PORT,
            channel: ChannelConfig::default(),
            limits: PayloadLimits::default(),
            send_rate: SendRateConfig::default(),
            storage: None,
            dev_users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Build typed server config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `STORAGE_*` is partially set or `DEV_USERS` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Tests pass a map here
    /// instead of mutating the process environment.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let channel = ChannelConfig {
            send_queue_capacity: env_parse(&lookup, "SEND_QUEUE_CAPACITY", DEFAULT_SEND_QUEUE_CAPACITY).max(1),
            registry_shards: env_parse(&lookup, "REGISTRY_SHARDS", DEFAULT_REGISTRY_SHARDS).max(1),
            heartbeat_interval: secs(&lookup, "HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS),
            idle_timeout: secs(&lookup, "IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: secs(&lookup, "SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        };
        let limits = PayloadLimits {
            max_content_chars: env_parse(&lookup, "MAX_CONTENT_CHARS", DEFAULT_MAX_CONTENT_CHARS),
            max_attachment_bytes: env_parse(&lookup, "MAX_ATTACHMENT_BYTES", DEFAULT_MAX_ATTACHMENT_BYTES),
        };
        let send_rate = SendRateConfig {
            limit: env_parse(&lookup, "SEND_RATE_LIMIT", DEFAULT_SEND_RATE_LIMIT),
            window: secs(&lookup, "SEND_RATE_WINDOW_SECS", DEFAULT_SEND_RATE_WINDOW_SECS),
        };

        Ok(Self {
            database_url: parse("DATABASE_URL"),
            db_max_connections: env_parse(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            port: env_parse(&lookup, "PORT", DEFAULT_PORT),
            channel,
            limits,
            send_rate,
            storage: storage_config(&parse)?,
            dev_users: parse("DEV_USERS").map_or_else(|| Ok(Vec::new()), |raw| parse_dev_users(&raw))?,
        })
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(lookup, key, default).max(1))
}

fn storage_config(parse: &impl Fn(&str) -> Option<String>) -> Result<Option<StorageConfig>, ConfigError> {
    let base_url = parse("STORAGE_BASE_URL");
    let bucket = parse("STORAGE_BUCKET");
    let api_key = parse("STORAGE_API_KEY");
    let public_url = parse("STORAGE_PUBLIC_URL");

    match (base_url, bucket, api_key) {
        (None, None, None) => Ok(None),
        (Some(base_url), Some(bucket), Some(api_key)) => {
            let base_url = base_url.trim_end_matches('/').to_string();
            let public_url = public_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("{base_url}/object/public/{bucket}"));
            Ok(Some(StorageConfig { base_url, bucket, api_key, public_url }))
        }
        _ => Err(ConfigError::Invalid {
            key: "STORAGE_*",
            reason: "STORAGE_BASE_URL, STORAGE_BUCKET and STORAGE_API_KEY must be set together".into(),
        }),
    }
}

/// Parse `token:uuid:name` entries separated by commas.
///
/// # Errors
///
/// Returns an error naming the first malformed entry.
pub fn parse_dev_users(raw: &str) -> Result<Vec<DevUser>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = |reason: &str| ConfigError::Invalid { key: "DEV_USERS", reason: format!("{entry:?}: {reason}") };
            let mut parts = entry.splitn(3, ':');
            let (Some(token), Some(id), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(invalid("expected token:uuid:name"));
            };
            if token.is_empty() || name.is_empty() {
                return Err(invalid("token and name must be non-empty"));
            }
            let id = id.parse::<Uuid>().map_err(|e| invalid(&e.to_string()))?;
            Ok(DevUser { token: token.to_string(), id, name: name.to_string() })
        })
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
