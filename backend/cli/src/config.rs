use std::path::PathBuf;

use kapi_chat::DEFAULT_MODEL;
use kapi_llm::providers::openrouter::DEFAULT_BASE_URL;

pub const DEFAULT_JWT_SECRET: &str = "default-secret";

/// Kapi server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address
    pub bind_address: String,
    /// HTTP server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// OpenRouter API key
    pub openrouter_api_key: Option<String>,
    /// OpenRouter API base URL
    pub openrouter_url: String,
    /// Model used when a request does not name one
    pub default_model: String,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    /// Log level
    pub log_level: String,
    /// Directory for rolling NDJSON log files
    pub log_dir: Option<PathBuf>,
    /// Console output as JSON
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            db_path: "kapi.db".to_string(),
            openrouter_api_key: None,
            openrouter_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        Self {
            bind_address: non_empty("KAPI_BIND").unwrap_or(defaults.bind_address),
            port: non_empty("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            db_path: non_empty("KAPI_DB").unwrap_or(defaults.db_path),
            openrouter_api_key: non_empty("OPENROUTER_API_KEY"),
            openrouter_url: non_empty("OPENROUTER_URL").unwrap_or(defaults.openrouter_url),
            default_model: non_empty("KAPI_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            jwt_secret: non_empty("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            log_level: non_empty("RUST_LOG").unwrap_or(defaults.log_level),
            log_dir: non_empty("KAPI_LOG_DIR").map(PathBuf::from),
            log_json: non_empty("KAPI_LOG_JSON")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.log_json),
        }
    }

    pub fn uses_default_jwt_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.default_model, "google/gemini-2.0-flash-lite-001");
        assert!(config.openrouter_api_key.is_none());
        assert!(config.uses_default_jwt_secret());
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "9090"),
            ("OPENROUTER_API_KEY", "sk-or-test"),
            ("JWT_SECRET", "s3cret"),
            ("KAPI_LOG_DIR", "/var/log/kapi"),
            ("KAPI_LOG_JSON", "true"),
        ]);
        assert_eq!(config.port, 9090);
        assert_eq!(config.openrouter_api_key.as_deref(), Some("sk-or-test"));
        assert!(!config.uses_default_jwt_secret());
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/kapi")));
        assert!(config.log_json);
    }

    #[test]
    fn test_bad_port_and_blank_values_fall_back() {
        let config = config_from(&[("PORT", "eighty"), ("OPENROUTER_API_KEY", "  ")]);
        assert_eq!(config.port, 8080);
        assert!(config.openrouter_api_key.is_none());
    }
}
