use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use dotenvy::dotenv;

use crate::token::MIN_SECRET_LEN;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_APPROVAL_WINDOW_HOURS: i64 = 48;
pub const DEFAULT_CAS_RETRY_LIMIT: usize = 16;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub token_secret: Vec<u8>,
    pub base_url: String,
    pub approval_window_hours: i64,
    pub notify_initiator: bool,
    pub cas_retry_limit: usize,
}

impl Config {
    /// Defaults for everything but the two required settings
    pub fn new(db_path: impl Into<PathBuf>, token_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            db_path: db_path.into(),
            token_secret: token_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            approval_window_hours: DEFAULT_APPROVAL_WINDOW_HOURS,
            notify_initiator: true,
            cas_retry_limit: DEFAULT_CAS_RETRY_LIMIT,
        }
    }

    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let secret_hex =
            env::var("SANCTION_TOKEN_SECRET").context("SANCTION_TOKEN_SECRET must be set")?;
        let token_secret =
            hex::decode(secret_hex.trim()).context("SANCTION_TOKEN_SECRET must be hex encoded")?;
        if token_secret.len() < MIN_SECRET_LEN {
            anyhow::bail!("SANCTION_TOKEN_SECRET must decode to at least {MIN_SECRET_LEN} bytes");
        }

        Ok(Self {
            db_path: env::var("SANCTION_DB_PATH")
                .context("SANCTION_DB_PATH must be set")?
                .into(),
            token_secret,
            base_url: env::var("SANCTION_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            approval_window_hours: env::var("SANCTION_APPROVAL_WINDOW_HOURS")
                .unwrap_or_else(|_| DEFAULT_APPROVAL_WINDOW_HOURS.to_string())
                .parse()
                .context("SANCTION_APPROVAL_WINDOW_HOURS must be a whole number of hours")?,
            notify_initiator: env::var("SANCTION_NOTIFY_INITIATOR")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("SANCTION_NOTIFY_INITIATOR must be true or false")?,
            cas_retry_limit: env::var("SANCTION_CAS_RETRY_LIMIT")
                .unwrap_or_else(|_| DEFAULT_CAS_RETRY_LIMIT.to_string())
                .parse()
                .context("SANCTION_CAS_RETRY_LIMIT must be a positive number")?,
        })
    }

    pub fn approval_window(&self) -> Duration {
        Duration::hours(self.approval_window_hours)
    }

    pub fn open_db(&self) -> Result<sled::Db> {
        sled::open(&self.db_path)
            .with_context(|| format!("failed to open sanction db at {}", self.db_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_defaults() {
        let config = Config::new("/tmp/sanctions.db", vec![1u8; 32]);

        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.approval_window().num_hours(), 48);
        assert!(config.notify_initiator);
        assert_eq!(config.cas_retry_limit, DEFAULT_CAS_RETRY_LIMIT);
    }
}
