use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the hosted backend, e.g. https://xyz.supabase.co
    pub backend_url: String,
    /// Public (anon) API key sent with every request
    pub anon_key: String,
    pub session_file: PathBuf,
    pub toast_ttl: Duration,
    pub log_dir: String,

    // Optional credentials for the driver binary
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let backend_url = env::var("PORTAL_BACKEND_URL").context("PORTAL_BACKEND_URL must be set")?;
        let anon_key = env::var("PORTAL_ANON_KEY").context("PORTAL_ANON_KEY must be set")?;

        let toast_ttl_ms: u64 = env::var("PORTAL_TOAST_TTL_MS")
            .unwrap_or_else(|_| "5000".to_string()) // default 5 s
            .parse()
            .context("PORTAL_TOAST_TTL_MS must be a number of milliseconds")?;

        Ok(Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            anon_key,
            session_file: env::var("PORTAL_SESSION_FILE")
                .unwrap_or_else(|_| ".portal/session.json".to_string())
                .into(),
            toast_ttl: Duration::from_millis(toast_ttl_ms),
            log_dir: env::var("PORTAL_LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
            email: env::var("PORTAL_EMAIL").ok(),
            password: env::var("PORTAL_PASSWORD").ok(),
        })
    }
}
