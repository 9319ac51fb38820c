//! Pipeline configuration
//!
//! Everything is loadable from environment variables (a `.env` file is
//! honored if present). Values are parsed with type coercion and range
//! checks at startup; the two binaries layer CLI flags on top. The
//! README documents every variable.

use crate::breaker::BreakerConfig;
use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default stream, group, and DLQ names.
pub const DEFAULT_STREAM: &str = "email_ingestion_stream";
pub const DEFAULT_GROUP: &str = "email_processor_group";
pub const DEFAULT_DLQ_STREAM: &str = "email_ingestion_dlq";

/// Which OAuth2 provider backs the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gmail,
    Outlook,
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "microsoft" => Ok(Self::Outlook),
            other => Err(Error::Config(format!(
                "unknown provider '{other}' (expected gmail or outlook)"
            ))),
        }
    }
}

/// Log store location plus stream naming.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    pub dlq_stream: String,
    pub max_stream_length: usize,
}

impl StreamConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            redis_url: require("REDIS_URL")?,
            stream: var_or("STREAM_NAME", DEFAULT_STREAM),
            group: var_or("CONSUMER_GROUP", DEFAULT_GROUP),
            dlq_stream: var_or("DLQ_STREAM_NAME", DEFAULT_DLQ_STREAM),
            max_stream_length: parse_or("MAX_STREAM_LENGTH", 10_000)?,
        };
        if config.max_stream_length == 0 {
            return Err(Error::Config("MAX_STREAM_LENGTH must be positive".into()));
        }
        Ok(config)
    }
}

/// IMAP endpoint and mailbox selection.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub mailbox: String,
    /// Accept self-signed certificates (test servers, local bridges).
    pub accept_invalid_certs: bool,
}

impl ImapConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: require("IMAP_HOST")?,
            port: parse_or("IMAP_PORT", 993)?,
            username: require("IMAP_USERNAME")?,
            mailbox: var_or("IMAP_MAILBOX", "INBOX"),
            accept_invalid_certs: parse_or("IMAP_ACCEPT_INVALID_CERTS", false)?,
        })
    }
}

/// OAuth2 provider identifiers and the token file location.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub provider: Provider,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub microsoft_client_id: Option<String>,
    pub microsoft_tenant: String,
    pub token_file: PathBuf,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let provider: Provider = var_or("AUTH_PROVIDER", "gmail").parse()?;
        let config = Self {
            provider,
            google_client_id: env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: env::var("GOOGLE_CLIENT_SECRET").ok(),
            microsoft_client_id: env::var("MS_CLIENT_ID").ok(),
            microsoft_tenant: var_or("MS_TENANT_ID", "common"),
            token_file: PathBuf::from(var_or("TOKEN_FILE", ".mailstream-tokens.json")),
        };
        match provider {
            Provider::Gmail if config.google_client_id.is_none() => {
                Err(Error::Config("GOOGLE_CLIENT_ID not set".into()))
            }
            Provider::Outlook if config.microsoft_client_id.is_none() => {
                Err(Error::Config("MS_CLIENT_ID not set".into()))
            }
            _ => Ok(config),
        }
    }
}

/// Retry shape for the worker's backoff controller.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_retries: parse_or("MAX_RETRIES", defaults.max_retries)?,
            initial: Duration::from_millis(parse_or("RETRY_INITIAL_MS", 1_000u64)?),
            multiplier: parse_or("RETRY_MULTIPLIER", defaults.multiplier)?,
            max_delay: Duration::from_secs(parse_or("RETRY_MAX_DELAY_SECS", 60u64)?),
        };
        if config.multiplier < 1.0 {
            return Err(Error::Config("RETRY_MULTIPLIER must be >= 1.0".into()));
        }
        Ok(config)
    }
}

/// Orphan-recovery sweep parameters.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub min_idle: Duration,
    pub interval: Duration,
    pub max_claim: usize,
    pub max_delivery: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_idle: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            max_claim: 100,
            max_delivery: 10,
        }
    }
}

impl RecoveryConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            min_idle: Duration::from_millis(parse_or("MIN_IDLE_MS", 60_000u64)?),
            interval: Duration::from_secs(parse_or("RECOVERY_INTERVAL_SECS", 30u64)?),
            max_claim: parse_or("MAX_CLAIM", defaults.max_claim)?,
            max_delivery: parse_or("MAX_DELIVERY_COUNT", defaults.max_delivery)?,
        })
    }
}

/// Everything the producer role needs.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub imap: ImapConfig,
    pub auth: AuthConfig,
    pub streams: StreamConfig,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub body_preview_bytes: usize,
    pub health_port: u16,
    pub metrics_port: u16,
    pub metrics_update_interval: Duration,
    pub shutdown_timeout: Duration,
    pub breaker: BreakerConfig,
    pub dry_run: bool,
}

impl ProducerConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            imap: ImapConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            streams: StreamConfig::from_env()?,
            batch_size: parse_or("PRODUCER_BATCH_SIZE", 50)?,
            poll_interval: Duration::from_secs(parse_or("POLL_INTERVAL_SECS", 60u64)?),
            body_preview_bytes: parse_or("BODY_PREVIEW_BYTES", 2_048)?,
            health_port: parse_or("PRODUCER_HEALTH_PORT", 8080)?,
            metrics_port: parse_or("PRODUCER_METRICS_PORT", 9090)?,
            metrics_update_interval: Duration::from_secs(parse_or(
                "METRICS_UPDATE_INTERVAL_SECS",
                15u64,
            )?),
            shutdown_timeout: Duration::from_secs(parse_or("SHUTDOWN_TIMEOUT_SECS", 30u64)?),
            breaker: breaker_from_env()?,
            dry_run: false,
        };
        if config.batch_size == 0 {
            return Err(Error::Config("PRODUCER_BATCH_SIZE must be positive".into()));
        }
        Ok(config)
    }
}

/// Everything the worker role needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub streams: StreamConfig,
    pub consumer: String,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub idempotency_ttl: Option<Duration>,
    pub health_port: u16,
    pub metrics_port: u16,
    pub metrics_update_interval: Duration,
    pub shutdown_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            streams: StreamConfig::from_env()?,
            consumer: var_or("CONSUMER_NAME", &default_consumer_name()),
            batch_size: parse_or("WORKER_BATCH_SIZE", 10)?,
            block_timeout: Duration::from_millis(parse_or("BLOCK_TIMEOUT_MS", 5_000u64)?),
            retry: RetryConfig::from_env()?,
            recovery: RecoveryConfig::from_env()?,
            idempotency_ttl: env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .map(|v| {
                    v.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| Error::Config(format!("invalid IDEMPOTENCY_TTL_SECS: {e}")))
                })
                .transpose()?,
            health_port: parse_or("WORKER_HEALTH_PORT", 8081)?,
            metrics_port: parse_or("WORKER_METRICS_PORT", 9091)?,
            metrics_update_interval: Duration::from_secs(parse_or(
                "METRICS_UPDATE_INTERVAL_SECS",
                15u64,
            )?),
            shutdown_timeout: Duration::from_secs(parse_or("SHUTDOWN_TIMEOUT_SECS", 30u64)?),
            breaker: breaker_from_env()?,
        };
        if config.batch_size == 0 {
            return Err(Error::Config("WORKER_BATCH_SIZE must be positive".into()));
        }
        Ok(config)
    }
}

fn default_consumer_name() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

fn breaker_from_env() -> Result<BreakerConfig> {
    let defaults = BreakerConfig::default();
    Ok(BreakerConfig {
        failure_threshold: parse_or("BREAKER_FAILURE_THRESHOLD", defaults.failure_threshold)?,
        recovery_timeout: Duration::from_secs(parse_or("BREAKER_RECOVERY_TIMEOUT_SECS", 30u64)?),
        success_threshold: parse_or("BREAKER_SUCCESS_THRESHOLD", defaults.success_threshold)?,
    })
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{name} not set")))
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
