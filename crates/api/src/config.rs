//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub allowed_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Admin endpoints are disabled when no token is configured
    pub admin_api_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),

            admin_api_token: match env::var("ADMIN_API_TOKEN") {
                Ok(token) if token.len() < 32 => {
                    return Err(ConfigError::WeakSecret(
                        "ADMIN_API_TOKEN must be at least 32 characters",
                    ))
                }
                Ok(token) => Some(token),
                Err(_) => None,
            },
        })
    }

    /// Configuration for in-process tests and local runs without a database
    pub fn for_tests() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            allowed_origins: Vec::new(),
            database_url: String::new(),
            database_max_connections: 1,
            run_migrations: false,
            admin_api_token: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
