//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use jsonwebtoken::Algorithm;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 8000,
        }
    }
}

/// Query engine database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Without a URL the gateway starts with no execution engine attached
    pub url: Option<String>,
    pub max_pool_size: usize,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_pool_size: 10,
            query_timeout_secs: 30,
        }
    }
}

/// Shared counter store. In-memory counters when unset.
#[derive(Debug, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub access_token_minutes: i64,
    pub refresh_token_days: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "governed-query-dev-secret-change-in-production".to_string(),
            algorithm: Algorithm::HS256,
            access_token_minutes: 30,
            refresh_token_days: 7,
        }
    }
}

/// Per-minute request budgets per endpoint class
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub auth_per_window: u64,
    pub query_per_window: u64,
    pub general_per_window: u64,
    pub sensitive_per_window: u64,
    pub window_secs: u64,
    /// Peers whose `X-Forwarded-For` header names the real client
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_per_window: 5,
            query_per_window: 10,
            general_per_window: 100,
            sensitive_per_window: 10,
            window_secs: 60,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub password_min_length: usize,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            password_min_length: 12,
            bootstrap_admin_email: None,
            bootstrap_admin_password: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub daily_query_budget: u64,
    pub approval_ttl_hours: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            daily_query_budget: 500,
            approval_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceConfig {
    pub signing_key: String,
    pub bucket: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            signing_key: "governed-query-dev-evidence-key".to_string(),
            bucket: "governed-query-evidence".to_string(),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub rate_limits: RateLimitConfig,
    pub security: SecurityConfig,
    pub policy: PolicyConfig,
    pub evidence: EvidenceConfig,
    pub cors: CorsConfig,
    /// JSON dataset catalog. The built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
}

/// Read an optional variable, failing on values that do not parse
fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", name, raw))),
        _ => Ok(None),
    }
}

fn string_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Comma-separated IP addresses, empty when unset
fn parse_ip_list(name: &str) -> Result<Vec<IpAddr>, ConfigError> {
    let Some(raw) = string_var(name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| ConfigError::InvalidValue(format!("{}: '{}' is not an IP address", name, s)))
        })
        .collect()
}

fn parse_algorithm(raw: &str) -> Result<Algorithm, ConfigError> {
    match raw.trim().to_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(ConfigError::InvalidValue(format!(
            "JWT_ALGORITHM={} (expected HS256, HS384 or HS512)",
            other
        ))),
    }
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let defaults = Settings::default();

        let server = ServerConfig {
            host: parse_var("HOST")?.unwrap_or(defaults.server.host),
            port: parse_var("PORT")?.unwrap_or(defaults.server.port),
        };

        let database = DatabaseConfig {
            url: string_var("DATABASE_URL"),
            max_pool_size: parse_var("DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database.max_pool_size),
            query_timeout_secs: parse_var("QUERY_TIMEOUT_SECS")?
                .unwrap_or(defaults.database.query_timeout_secs),
        };
        if let Some(url) = &database.url {
            Self::check_database_url(url)?;
        }

        let jwt = JwtConfig {
            secret: string_var("JWT_SECRET").unwrap_or(defaults.jwt.secret),
            algorithm: match string_var("JWT_ALGORITHM") {
                Some(raw) => parse_algorithm(&raw)?,
                None => defaults.jwt.algorithm,
            },
            access_token_minutes: parse_var("JWT_ACCESS_TOKEN_EXPIRE_MINUTES")?
                .unwrap_or(defaults.jwt.access_token_minutes),
            refresh_token_days: parse_var("JWT_REFRESH_TOKEN_EXPIRE_DAYS")?
                .unwrap_or(defaults.jwt.refresh_token_days),
        };

        let rate_limits = RateLimitConfig {
            auth_per_window: parse_var("RATE_LIMIT_AUTH_PER_MINUTE")?
                .unwrap_or(defaults.rate_limits.auth_per_window),
            query_per_window: parse_var("RATE_LIMIT_QUERIES_PER_MINUTE")?
                .unwrap_or(defaults.rate_limits.query_per_window),
            general_per_window: parse_var("RATE_LIMIT_GENERAL_PER_MINUTE")?
                .unwrap_or(defaults.rate_limits.general_per_window),
            sensitive_per_window: parse_var("RATE_LIMIT_SENSITIVE_PER_MINUTE")?
                .unwrap_or(defaults.rate_limits.sensitive_per_window),
            window_secs: defaults.rate_limits.window_secs,
            trusted_proxies: parse_ip_list("TRUSTED_PROXIES")?,
        };

        let security = SecurityConfig {
            password_min_length: parse_var("PASSWORD_MIN_LENGTH")?
                .unwrap_or(defaults.security.password_min_length),
            bootstrap_admin_email: string_var("BOOTSTRAP_ADMIN_EMAIL"),
            bootstrap_admin_password: string_var("BOOTSTRAP_ADMIN_PASSWORD"),
        };

        let policy = PolicyConfig {
            daily_query_budget: parse_var("DAILY_QUERY_BUDGET")?
                .unwrap_or(defaults.policy.daily_query_budget),
            approval_ttl_hours: parse_var("APPROVAL_TTL_HOURS")?
                .unwrap_or(defaults.policy.approval_ttl_hours),
        };

        let evidence = EvidenceConfig {
            signing_key: string_var("EVIDENCE_SIGNING_KEY").unwrap_or(defaults.evidence.signing_key),
            bucket: string_var("EVIDENCE_BUCKET").unwrap_or(defaults.evidence.bucket),
        };

        let cors = CorsConfig {
            allowed_origins: string_var("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors.allowed_origins),
        };

        let settings = Self {
            server,
            database,
            redis: RedisConfig {
                url: string_var("REDIS_URL"),
            },
            jwt,
            rate_limits,
            security,
            policy,
            evidence,
            cors,
            catalog_path: string_var("DATASET_CATALOG_PATH").map(PathBuf::from),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.len() < 16 {
            return Err(ConfigError::InvalidValue(
                "JWT_SECRET must be at least 16 characters".to_string(),
            ));
        }
        if self.evidence.signing_key.is_empty() {
            return Err(ConfigError::MissingVar("EVIDENCE_SIGNING_KEY".to_string()));
        }
        if self.jwt.access_token_minutes <= 0 || self.jwt.refresh_token_days <= 0 {
            return Err(ConfigError::InvalidValue(
                "JWT token lifetimes must be positive".to_string(),
            ));
        }
        if self.policy.approval_ttl_hours <= 0 {
            return Err(ConfigError::InvalidValue(
                "APPROVAL_TTL_HOURS must be positive".to_string(),
            ));
        }
        if self.database.query_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "QUERY_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.security.bootstrap_admin_email.is_some()
            != self.security.bootstrap_admin_password.is_some()
        {
            return Err(ConfigError::InvalidValue(
                "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_PASSWORD must be set together"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// DATABASE_URL must look like postgresql://user@host/db
    fn check_database_url(url: &str) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidValue(
                "Missing host in DATABASE_URL".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn test_default_rate_limits() {
        let limits = RateLimitConfig::default();
        assert_eq!(limits.auth_per_window, 5);
        assert_eq!(limits.query_per_window, 10);
        assert_eq!(limits.general_per_window, 100);
        assert_eq!(limits.sensitive_per_window, 10);
        assert_eq!(limits.window_secs, 60);
        assert!(limits.trusted_proxies.is_empty());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let mut settings = Settings::default();
        settings.jwt.secret = "short".to_string();
        assert!(matches!(settings.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_bootstrap_admin_requires_both_values() {
        let mut settings = Settings::default();
        settings.security.bootstrap_admin_email = Some("root@bank.example".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(parse_algorithm("hs512").unwrap(), Algorithm::HS512);
        assert!(parse_algorithm("RS256").is_err());
    }

    #[test]
    fn test_database_url_checked() {
        assert!(Settings::check_database_url("postgresql://app@db.internal:5432/warehouse").is_ok());
        assert!(Settings::check_database_url("mysql://app@db/warehouse").is_err());
        assert!(Settings::check_database_url("not a url").is_err());
    }
}
