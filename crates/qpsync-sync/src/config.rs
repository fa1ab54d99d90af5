//! Run configuration, read once from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use qpsync_adapters::DEFAULT_TIMEZONE_MARKER;
use qpsync_core::IdentitySource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// String that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Secret,
    pub table_name: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Used both as the connect timeout and the session `statement_timeout`.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: Secret,
    pub survey_id: String,
    pub api_env: String,
    pub identity: IdentitySource,
    pub timezone_marker: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub artifacts_dir: PathBuf,
    pub db: DatabaseConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let db = DatabaseConfig {
            host: get("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(get("DB_PORT"), "DB_PORT", 5432)?,
            database: get("DB_NAME").unwrap_or_else(|| "surveys".to_string()),
            user: required("DB_USER")?,
            password: Secret::new(required("DB_PASSWORD")?),
            table_name: get("DB_TABLE").unwrap_or_else(|| "survey_responses".to_string()),
            max_attempts: parse_or(get("DB_MAX_RETRIES"), "DB_MAX_RETRIES", 10)?,
            base_delay: Duration::from_secs(parse_or(
                get("DB_BASE_DELAY_SECS"),
                "DB_BASE_DELAY_SECS",
                1,
            )?),
            timeout: Duration::from_secs(parse_or(get("DB_TIMEOUT_SECS"), "DB_TIMEOUT_SECS", 60)?),
        };

        Ok(Self {
            api_key: Secret::new(required("QP_API_KEY")?),
            survey_id: required("QP_SURVEY_ID")?,
            api_env: get("QP_ENV").unwrap_or_else(|| "questionpro.com".to_string()),
            identity: parse_or(get("QP_IDENTITY_SOURCE"), "QP_IDENTITY_SOURCE", IdentitySource::default())?,
            timezone_marker: lookup("QP_TIMEZONE_MARKER")
                .unwrap_or_else(|| DEFAULT_TIMEZONE_MARKER.to_string()),
            http_timeout_secs: parse_or(get("QP_HTTP_TIMEOUT_SECS"), "QP_HTTP_TIMEOUT_SECS", 30)?,
            user_agent: get("QPSYNC_USER_AGENT").unwrap_or_else(|| "qpsync/0.1".to_string()),
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            db,
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("QP_API_KEY", "key-123"),
        ("QP_SURVEY_ID", "998877"),
        ("DB_USER", "etl"),
        ("DB_PASSWORD", "hunter2"),
    ];

    #[test]
    fn defaults_fill_everything_optional() {
        let config = SyncConfig::from_lookup(lookup_from(REQUIRED)).expect("config");

        assert_eq!(config.api_env, "questionpro.com");
        assert_eq!(config.identity, IdentitySource::Timestamp);
        assert_eq!(config.timezone_marker, " ART");
        assert_eq!(config.db.host, "localhost");
        assert_eq!(config.db.port, 5432);
        assert_eq!(config.db.max_attempts, 10);
        assert_eq!(config.db.base_delay, Duration::from_secs(1));
        assert_eq!(config.db.timeout, Duration::from_secs(60));
        assert_eq!(config.db.table_name, "survey_responses");
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let err = SyncConfig::from_lookup(lookup_from(&[("QP_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DB_USER")));
    }

    #[test]
    fn malformed_numbers_and_identity_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("DB_MAX_RETRIES", "lots"));
        let err = SyncConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DB_MAX_RETRIES", .. }));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("QP_IDENTITY_SOURCE", "email"));
        let err = SyncConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "QP_IDENTITY_SOURCE", .. }));
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let config = SyncConfig::from_lookup(lookup_from(REQUIRED)).expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("key-123"));
        assert_eq!(config.db.password.expose(), "hunter2");
    }
}
