//! Worker configuration

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Every ten seconds (tokio-cron-scheduler takes a seconds field)
pub const DEFAULT_INBOX_POLL_SCHEDULE: &str = "*/10 * * * * *";
pub const DEFAULT_DRIFT_CHECK_SCHEDULE: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub inbox_poll_schedule: String,
    pub inbox_batch_size: i64,
    /// Seconds a failed or abandoned inbox event waits before it is claimed again
    pub inbox_retry_delay_secs: i64,
    pub drift_check_schedule: String,
    pub log_json: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let inbox_batch_size = parse_or(&lookup, "INBOX_BATCH_SIZE", 10)?;
        if inbox_batch_size <= 0 {
            return Err(ConfigError::Invalid {
                name: "INBOX_BATCH_SIZE",
                value: inbox_batch_size.to_string(),
            });
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            inbox_poll_schedule: lookup("INBOX_POLL_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_INBOX_POLL_SCHEDULE.to_string()),
            inbox_batch_size,
            inbox_retry_delay_secs: parse_or(&lookup, "INBOX_RETRY_DELAY_SECS", 300)?,
            drift_check_schedule: lookup("DRIFT_CHECK_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_DRIFT_CHECK_SCHEDULE.to_string()),
            log_json: lookup("WORKER_LOG_JSON")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
