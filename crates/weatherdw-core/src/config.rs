use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::{LoadError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Tuning knobs for a load run. Deserializable from TOML; every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Fact rows per insert/commit. Trades memory for round trips.
    pub batch_size: usize,
    /// Field delimiter of the source file.
    pub delimiter: char,
    /// Continue an unfinished run of the same source file from its last committed batch.
    pub resume: bool,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delimiter: ',',
            resume: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LoadError::Config("batch_size must be at least 1".into()));
        }
        self.delimiter_byte()?;
        self.retry.validate()
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(|b| b.is_ascii() && *b != b'"' && *b != b'\n' && *b != b'\r')
            .ok_or_else(|| {
                LoadError::Config(format!(
                    "delimiter {:?} must be a single ASCII character other than a quote or newline",
                    self.delimiter
                ))
            })
    }
}

/// Bounded exponential backoff for transient connection failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LoadError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(LoadError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Where the warehouse lives. Either a full URL or discrete fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub charset: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            database: "weather_warehouse".into(),
            charset: "utf8".into(),
        }
    }
}

impl ConnectionSettings {
    /// Reads `DATABASE_URL` (or `WEATHERDW_DATABASE_URL`) and the `WEATHERDW_DB_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let port = match lookup("WEATHERDW_DB_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| LoadError::Config(format!("WEATHERDW_DB_PORT {raw:?} is not a port")))?,
            None => defaults.port,
        };

        let settings = Self {
            database_url: lookup("DATABASE_URL").or_else(|| lookup("WEATHERDW_DATABASE_URL")),
            host: lookup("WEATHERDW_DB_HOST").unwrap_or(defaults.host),
            port,
            user: lookup("WEATHERDW_DB_USER").unwrap_or(defaults.user),
            password: lookup("WEATHERDW_DB_PASSWORD"),
            database: lookup("WEATHERDW_DB_NAME").unwrap_or(defaults.database),
            charset: lookup("WEATHERDW_DB_CHARSET").unwrap_or(defaults.charset),
        };
        settings.check_charset()?;
        Ok(settings)
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        self.check_charset()?;

        if let Some(url) = &self.database_url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|err| LoadError::Config(format!("invalid database URL: {err}")));
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    // The Postgres driver always speaks UTF-8 on the wire.
    fn check_charset(&self) -> Result<()> {
        match self.charset.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" | "utf8mb4" => Ok(()),
            other => Err(LoadError::Config(format!(
                "unsupported character encoding {other:?}; only UTF-8 is supported"
            ))),
        }
    }
}
