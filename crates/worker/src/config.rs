//! Worker configuration from the environment

use clubhouse_shared::PoolSettings;

pub const DEFAULT_RECURRING_SCHEDULE: &str = "0 0 * * * *";
pub const DEFAULT_INVARIANTS_SCHEDULE: &str = "0 30 4 * * *";
pub const HEARTBEAT_SCHEDULE: &str = "0 */5 * * * *";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Replica for reads; the primary is used when unset
    pub database_read_url: Option<String>,
    pub pool: PoolSettings,
    pub run_migrations: bool,
    /// Six-field cron expressions (seconds first)
    pub recurring_schedule: String,
    pub invariants_schedule: String,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = non_empty("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let mut pool = PoolSettings::default();
        if let Some(value) = non_empty("DATABASE_MAX_CONNECTIONS") {
            let max_connections = value.parse::<u32>().map_err(|_| ConfigError::Invalid {
                name: "DATABASE_MAX_CONNECTIONS",
                value,
            })?;
            pool = pool.with_max_connections(max_connections);
        }

        let run_migrations = match non_empty("RUN_MIGRATIONS") {
            Some(value) => parse_bool(&value).ok_or(ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                value,
            })?,
            None => false,
        };

        Ok(Self {
            database_url,
            database_read_url: non_empty("DATABASE_READ_URL"),
            pool,
            run_migrations,
            recurring_schedule: non_empty("BILLING_RECURRING_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_RECURRING_SCHEDULE.to_string()),
            invariants_schedule: non_empty("BILLING_INVARIANTS_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_INVARIANTS_SCHEDULE.to_string()),
            log_format: log_format_from_env(),
        })
    }
}

fn log_format_from_env() -> LogFormat {
    match non_empty("LOG_FORMAT").map(|v| v.to_lowercase()).as_deref() {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
