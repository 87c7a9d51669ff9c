use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use crate::auth::provider::ProviderEndpoints;
use crate::auth::AuthSettings;
use crate::gate::GateRoutes;

/// Credential Gate - backend credential lifecycle service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// API key protecting the cache and session routes
    #[arg(short = 'k', long, env = "CACHE_API_KEY")]
    pub api_key: Option<String>,

    /// Remote cache endpoint; the built-in cache is used when unset
    #[arg(long, env = "CACHE_URL")]
    pub cache_url: Option<String>,

    /// Refresh endpoint of the primary backend
    #[arg(
        long,
        env = "PRIMARY_REFRESH_URL",
        default_value = "http://127.0.0.1:8080/api/token/refresh/"
    )]
    pub primary_refresh_url: String,

    /// Refresh endpoint of the secondary provider
    #[arg(
        long,
        env = "SECONDARY_REFRESH_URL",
        default_value = "http://127.0.0.1:8081/api/token/refresh/"
    )]
    pub secondary_refresh_url: String,

    /// Endpoint used to validate credentials
    #[arg(long, env = "WHOAMI_URL", default_value = "http://127.0.0.1:8080/api/users/me/")]
    pub whoami_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Endpoint calls per token refresh
    #[arg(long, env = "REFRESH_MAX_ATTEMPTS", default_value = "3")]
    pub refresh_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Cache
    pub cache_api_key: String,
    pub cache_url: Option<String>,

    // Upstream endpoints
    pub primary_refresh_url: String,
    pub secondary_refresh_url: String,
    pub whoami_url: String,

    // Token lifecycle
    pub expiry_buffer_ms: i64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_base_ms: u64,

    // Gate
    pub login_path: String,
    pub landing_path: String,
    pub redirect_throttle_ms: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            cache_api_key: args
                .api_key
                .context("CACHE_API_KEY is required (use -k or set CACHE_API_KEY env var)")?,
            cache_url: args.cache_url.filter(|s| !s.trim().is_empty()),

            primary_refresh_url: args.primary_refresh_url,
            secondary_refresh_url: args.secondary_refresh_url,
            whoami_url: args.whoami_url,

            expiry_buffer_ms: env_or("EXPIRY_BUFFER_MS", 30_000),
            refresh_max_attempts: args.refresh_attempts,
            refresh_backoff_base_ms: env_or("REFRESH_BACKOFF_BASE_MS", 250),

            login_path: std::env::var("LOGIN_PATH").unwrap_or_else(|_| "/login".to_string()),
            landing_path: std::env::var("LANDING_PATH").unwrap_or_else(|_| "/".to_string()),
            redirect_throttle_ms: env_or("REDIRECT_THROTTLE_MS", 1500),

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_api_key.is_empty() {
            anyhow::bail!("CACHE_API_KEY cannot be empty");
        }

        let mut urls = vec![
            ("PRIMARY_REFRESH_URL", &self.primary_refresh_url),
            ("SECONDARY_REFRESH_URL", &self.secondary_refresh_url),
            ("WHOAMI_URL", &self.whoami_url),
        ];
        if let Some(ref cache_url) = self.cache_url {
            urls.push(("CACHE_URL", cache_url));
        }
        for (name, value) in urls {
            url::Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
        }

        if self.refresh_max_attempts == 0 {
            anyhow::bail!("REFRESH_MAX_ATTEMPTS must be at least 1");
        }
        if self.expiry_buffer_ms < 0 {
            anyhow::bail!("EXPIRY_BUFFER_MS cannot be negative");
        }
        if !self.login_path.starts_with('/') || !self.landing_path.starts_with('/') {
            anyhow::bail!("LOGIN_PATH and LANDING_PATH must be absolute paths");
        }

        Ok(())
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            endpoints: ProviderEndpoints {
                primary_refresh_url: self.primary_refresh_url.clone(),
                secondary_refresh_url: self.secondary_refresh_url.clone(),
            },
            whoami_url: self.whoami_url.clone(),
            expiry_buffer_ms: self.expiry_buffer_ms,
            refresh_max_attempts: self.refresh_max_attempts,
            refresh_backoff_base_ms: self.refresh_backoff_base_ms,
        }
    }

    pub fn gate_routes(&self) -> GateRoutes {
        GateRoutes {
            login_path: self.login_path.clone(),
            landing_path: self.landing_path.clone(),
        }
    }

    pub fn redirect_throttle_window(&self) -> Duration {
        Duration::from_millis(self.redirect_throttle_ms)
    }
}

/// Parse an optional environment variable, falling back to `default`
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            cache_api_key: "secret".to_string(),
            cache_url: None,
            primary_refresh_url: "http://127.0.0.1:8080/api/token/refresh/".to_string(),
            secondary_refresh_url: "http://127.0.0.1:8081/api/token/refresh/".to_string(),
            whoami_url: "http://127.0.0.1:8080/api/users/me/".to_string(),
            expiry_buffer_ms: 30_000,
            refresh_max_attempts: 3,
            refresh_backoff_base_ms: 250,
            login_path: "/login".to_string(),
            landing_path: "/".to_string(),
            redirect_throttle_ms: 1500,
            http_max_connections: 20,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut config = test_config();
        config.whoami_url = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("WHOAMI_URL"));

        let mut config = test_config();
        config.cache_url = Some("::".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_refresh_attempts_rejected() {
        let mut config = test_config();
        config.refresh_max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_routes_rejected() {
        let mut config = test_config();
        config.login_path = "login".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = test_config();
        let settings = config.auth_settings();
        assert_eq!(settings.refresh_max_attempts, 3);
        assert_eq!(settings.endpoints.primary_refresh_url, config.primary_refresh_url);
        assert_eq!(config.gate_routes(), GateRoutes::default());
        assert_eq!(config.redirect_throttle_window(), Duration::from_millis(1500));
    }

    #[test]
    fn test_env_or_fallback() {
        assert_eq!(env_or("CREDENTIAL_GATE_TEST_UNSET_VAR", 42u64), 42);
    }
}
