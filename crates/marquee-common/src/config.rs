use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Identity, Role};

/// Upper bound on how long a cached role may outlive a revocation.
pub const MAX_ROLE_CACHE_TTL_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub access: AccessConfig,
    pub sync: SyncConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub jwt_secret: String,
    pub issuer: Option<String>,
    pub leeway_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: Some("marquee".to_string()),
            leeway_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// 0 disables role caching; every verification reads the role store.
    pub role_cache_ttl_ms: u64,
}

impl AccessConfig {
    pub fn role_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.role_cache_ttl_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub retry_interval_secs: u64,
}

impl SyncConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SeedConfig {
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SeedUser {
    pub identity: Identity,
    pub role: Role,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("session.jwt_secret must not be empty")]
    MissingSecret,
    #[error("access.role_cache_ttl_ms is {0}, maximum is {MAX_ROLE_CACHE_TTL_MS}")]
    RoleCacheTtlTooLong(u64),
    #[error("sync.retry_interval_secs must be positive")]
    ZeroRetryInterval,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        if !path.exists() {
            tracing::warn!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.jwt_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.access.role_cache_ttl_ms > MAX_ROLE_CACHE_TTL_MS {
            return Err(ConfigError::RoleCacheTtlTooLong(self.access.role_cache_ttl_ms));
        }
        if self.sync.retry_interval_secs == 0 {
            return Err(ConfigError::ZeroRetryInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.access.role_cache_ttl_ms, 0);
        assert_eq!(config.sync.retry_interval_secs, 30);
        assert_eq!(config.validate(), Err(ConfigError::MissingSecret));
    }

    #[test]
    fn test_full_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [session]
            jwt_secret = "s3cret"

            [access]
            role_cache_ttl_ms = 250

            [[seed.users]]
            identity = "u-admin"
            role = "SUPER_ADMIN"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.session.issuer.as_deref(), Some("marquee"));
        assert_eq!(config.seed.users.len(), 1);
        assert_eq!(config.seed.users[0].role, Role::SuperAdmin);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_cache_ttl_is_bounded() {
        let mut config = Config::default();
        config.session.jwt_secret = "x".into();
        config.access.role_cache_ttl_ms = MAX_ROLE_CACHE_TTL_MS + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::RoleCacheTtlTooLong(MAX_ROLE_CACHE_TTL_MS + 1))
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marquee.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\njson = true").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }
}
