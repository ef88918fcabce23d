use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub admin_email: String,
    pub history_window: usize,
    pub stream_timeout: Duration,
    pub inference_base_url: String,
    pub inference_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path = match std::env::var("CHATDESK_DB") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                // We use ~/.chatdesk/chatdesk.db
                let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home_dir).join(".chatdesk").join("chatdesk.db")
            }
        };

        let history_window = match std::env::var("CHATDESK_HISTORY_WINDOW") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .context("CHATDESK_HISTORY_WINDOW must be a non-negative integer")?,
            Err(_) => 10,
        };

        let stream_timeout_secs = match std::env::var("CHATDESK_STREAM_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .context("CHATDESK_STREAM_TIMEOUT_SECS must be a number of seconds")?,
            Err(_) => 120,
        };

        Ok(Self {
            db_path,
            bind_addr: std::env::var("CHATDESK_BIND").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            admin_email: std::env::var("CHATDESK_ADMIN_EMAIL")
                .unwrap_or_else(|_| "admin@example.com".into()),
            history_window,
            stream_timeout: Duration::from_secs(stream_timeout_secs),
            inference_base_url: std::env::var("INFERENCE_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            inference_api_key: std::env::var("INFERENCE_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
        })
    }
}
