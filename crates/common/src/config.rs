use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the API server binds to (default: 0.0.0.0:3000)
    pub api_listen_addr: String,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Hex-encoded 32-byte master key used to derive per-organization secret keys
    pub webhook_encryption_key: String,

    /// Max attempts for new endpoints that don't specify `retry_count` (default: 5)
    pub webhook_default_retry_count: i32,

    /// Per-attempt timeout for new endpoints that don't specify one (default: 30)
    pub webhook_default_timeout_seconds: i32,

    /// First retry delay in seconds; doubles per attempt (default: 30)
    pub webhook_retry_base_seconds: u64,

    /// Upper bound on the retry delay in seconds (default: 3600)
    pub webhook_retry_cap_seconds: u64,

    /// Maximum concurrent delivery attempts per worker process (default: 16)
    pub worker_concurrency: usize,

    /// Maximum deliveries claimed per poll (default: 32)
    pub worker_batch_size: usize,

    /// Poll interval in milliseconds (default: 2000)
    pub worker_poll_interval_ms: u64,

    /// Interval of the orphaned-delivery sweep in seconds (default: 30)
    pub worker_sweep_interval_seconds: u64,

    /// How long shutdown waits for in-flight attempts (default: 30)
    pub worker_shutdown_timeout_seconds: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 20)?,
            api_listen_addr: std::env::var("API_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_or("JWT_EXPIRY_HOURS", 24)?,
            webhook_encryption_key: std::env::var("WEBHOOK_ENCRYPTION_KEY").map_err(|_| {
                anyhow::anyhow!("WEBHOOK_ENCRYPTION_KEY environment variable is required")
            })?,
            webhook_default_retry_count: parse_or("WEBHOOK_DEFAULT_RETRY_COUNT", 5)?,
            webhook_default_timeout_seconds: parse_or("WEBHOOK_DEFAULT_TIMEOUT_SECONDS", 30)?,
            webhook_retry_base_seconds: parse_or("WEBHOOK_RETRY_BASE_SECONDS", 30)?,
            webhook_retry_cap_seconds: parse_or("WEBHOOK_RETRY_CAP_SECONDS", 3600)?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 16)?,
            worker_batch_size: parse_or("WORKER_BATCH_SIZE", 32)?,
            worker_poll_interval_ms: parse_or("WORKER_POLL_INTERVAL_MS", 2000)?,
            worker_sweep_interval_seconds: parse_or("WORKER_SWEEP_INTERVAL_SECONDS", 30)?,
            worker_shutdown_timeout_seconds: parse_or("WORKER_SHUTDOWN_TIMEOUT_SECONDS", 30)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the delivery pipeline misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.encryption_key_bytes()?;
        if self.webhook_default_retry_count < 1 {
            anyhow::bail!("WEBHOOK_DEFAULT_RETRY_COUNT must be at least 1");
        }
        if self.webhook_default_timeout_seconds < 1 {
            anyhow::bail!("WEBHOOK_DEFAULT_TIMEOUT_SECONDS must be at least 1");
        }
        if self.webhook_retry_base_seconds == 0
            || self.webhook_retry_cap_seconds < self.webhook_retry_base_seconds
        {
            anyhow::bail!(
                "WEBHOOK_RETRY_BASE_SECONDS must be > 0 and <= WEBHOOK_RETRY_CAP_SECONDS"
            );
        }
        if self.worker_concurrency == 0 || self.worker_batch_size == 0 {
            anyhow::bail!("WORKER_CONCURRENCY and WORKER_BATCH_SIZE must be at least 1");
        }
        Ok(())
    }

    /// Decode the master encryption key.
    pub fn encryption_key_bytes(&self) -> anyhow::Result<[u8; 32]> {
        let bytes = hex::decode(self.webhook_encryption_key.trim())
            .map_err(|_| anyhow::anyhow!("WEBHOOK_ENCRYPTION_KEY must be hex-encoded"))?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("WEBHOOK_ENCRYPTION_KEY must decode to exactly 32 bytes"))
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
