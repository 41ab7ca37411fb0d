//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "art.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://art.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Outbound HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// TTL for cached remote actor documents, in seconds
    #[serde(default = "default_actor_cache_ttl")]
    pub actor_cache_ttl_seconds: u64,
    /// TTL for cached capability check results, in seconds
    #[serde(default = "default_capability_cache_ttl")]
    pub capability_cache_ttl_seconds: u64,
    /// Delay before each retry, indexed by the attempt that failed.
    /// Clamped to the last entry for later attempts.
    #[serde(default = "default_retry_schedule")]
    pub retry_schedule_seconds: Vec<u64>,
    /// Total delivery attempts per job before the record is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Maximum concurrently executing delivery attempts
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    /// Maximum records re-queued by one retry-all-failed invocation
    #[serde(default = "default_retry_batch_limit")]
    pub retry_batch_limit: u32,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            actor_cache_ttl_seconds: default_actor_cache_ttl(),
            capability_cache_ttl_seconds: default_capability_cache_ttl(),
            retry_schedule_seconds: default_retry_schedule(),
            max_attempts: default_max_attempts(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            retry_batch_limit: default_retry_batch_limit(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_actor_cache_ttl() -> u64 {
    3600
}

fn default_capability_cache_ttl() -> u64 {
    3600
}

fn default_retry_schedule() -> Vec<u64> {
    // Short-then-long: absorb transient blips quickly without hammering
    // an instance that is genuinely down.
    vec![60, 300, 1800, 7200]
}

fn default_max_attempts() -> u32 {
    4
}

fn default_max_concurrent_deliveries() -> usize {
    10
}

fn default_retry_batch_limit() -> u32 {
    100
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (INKFED_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (INKFED_*)
            .add_source(
                Environment::with_prefix("INKFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.federation.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.federation.retry_schedule_seconds.is_empty() {
            return Err(crate::error::AppError::Config(
                "federation.retry_schedule_seconds must not be empty".to_string(),
            ));
        }

        if self.federation.max_concurrent_deliveries == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_concurrent_deliveries must be at least 1".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
