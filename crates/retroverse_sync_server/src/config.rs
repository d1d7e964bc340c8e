use std::env;
use std::path::PathBuf;
use std::time::Duration;

use retroverse_core::{DataDictionary, RetroverseConfig};

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3040)
    pub port: u16,
    /// JSON schema catalog (default: ./schema.json)
    pub schema_path: PathBuf,
    /// Directory holding the data stores and the users database (default: ./data)
    pub data_dir: PathBuf,
    /// Lock store shared by every server process (default: <data_dir>/locks.db)
    pub lock_database_path: PathBuf,
    /// Long-poll wait before an empty response (default: 30)
    pub long_poll_seconds: u64,
    /// Idle time after which a session is dropped (default: 180)
    pub session_idle_seconds: u64,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// API token registered for a `dev` user at startup
    pub dev_user_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = var("PORT")
            .unwrap_or_else(|| "3040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let schema_path = PathBuf::from(var("SCHEMA_PATH").unwrap_or_else(|| "./schema.json".to_string()));
        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".to_string()));
        let lock_database_path = var("LOCK_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("locks.db"));

        let long_poll_seconds = var("LONG_POLL_SECONDS")
            .unwrap_or_else(|| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("LONG_POLL_SECONDS"))?;
        let session_idle_seconds = var("SESSION_IDLE_SECONDS")
            .unwrap_or_else(|| "180".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("SESSION_IDLE_SECONDS"))?;

        let cors_origins = var("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5174".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let dev_user_token = var("DEV_USER_TOKEN").filter(|t| !t.is_empty());

        Ok(Config {
            host,
            port,
            schema_path,
            data_dir,
            lock_database_path,
            long_poll_seconds,
            session_idle_seconds,
            cors_origins,
            dev_user_token,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine timings, starting from the engine defaults
    pub fn retroverse_config(&self) -> RetroverseConfig {
        RetroverseConfig {
            long_poll_timeout: Duration::from_secs(self.long_poll_seconds),
            session_idle: Duration::from_secs(self.session_idle_seconds),
            ..RetroverseConfig::default()
        }
    }

    /// Read and parse the schema catalog
    pub fn load_schema(&self) -> Result<DataDictionary, ConfigError> {
        let text = std::fs::read_to_string(&self.schema_path)
            .map_err(|e| ConfigError::Schema(format!("{}: {}", self.schema_path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ConfigError::Schema(format!("{}: {}", self.schema_path.display(), e)))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidNumber(&'static str),
    Schema(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidNumber(name) => write!(f, "Invalid {} environment variable", name),
            ConfigError::Schema(reason) => write!(f, "Could not load schema: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3040");
        assert_eq!(config.lock_database_path, PathBuf::from("./data").join("locks.db"));
        assert_eq!(config.retroverse_config().long_poll_timeout, Duration::from_secs(30));
        assert!(config.dev_user_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "8080"),
            ("DATA_DIR", "/srv/retro"),
            ("SESSION_IDLE_SECONDS", "60"),
            ("CORS_ORIGINS", "https://a.example, https://b.example"),
            ("DEV_USER_TOKEN", "secret"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.lock_database_path, PathBuf::from("/srv/retro/locks.db"));
        assert_eq!(config.retroverse_config().session_idle, Duration::from_secs(60));
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(config.dev_user_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(matches!(config(&[("PORT", "x")]), Err(ConfigError::InvalidPort)));
        assert!(matches!(
            config(&[("LONG_POLL_SECONDS", "-1")]),
            Err(ConfigError::InvalidNumber("LONG_POLL_SECONDS"))
        ));
    }

    #[test]
    fn test_example_schema_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(&path, include_str!("../schema.example.json")).unwrap();
        let config = config(&[("SCHEMA_PATH", path.to_str().unwrap())]).unwrap();
        let schema = config.load_schema().unwrap();
        assert!(schema.find_def("Customer").is_some());
        assert!(!schema.find_def("CustomerList").unwrap().is_persiston);
    }
}
