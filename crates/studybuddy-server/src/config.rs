use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "changeme",
];

const DEFAULT_STORAGE_URL: &str = "http://127.0.0.1:9000/studybuddy";
const DEFAULT_AI_URL: &str = "https://api.openai.com/v1/studybuddy";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub auth_secret: String,
    pub storage_url: String,
    pub storage_public_url: String,
    pub storage_token: Option<String>,
    pub ai_url: String,
    pub default_page_size: u32,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let auth_secret = lookup("STUDYBUDDY_AUTH_SECRET").unwrap_or_default();
        if auth_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&auth_secret.as_str()) {
            bail!(
                "STUDYBUDDY_AUTH_SECRET is unset or still a placeholder; \
                 it must match the auth provider's signing secret"
            );
        }

        let port = var("STUDYBUDDY_PORT", "3000")
            .parse()
            .context("STUDYBUDDY_PORT must be a port number")?;

        let default_page_size: u32 = var("STUDYBUDDY_DEFAULT_PAGE_SIZE", "20")
            .parse()
            .context("STUDYBUDDY_DEFAULT_PAGE_SIZE must be a positive integer")?;
        if default_page_size == 0 {
            bail!("STUDYBUDDY_DEFAULT_PAGE_SIZE must be a positive integer");
        }

        let storage_url = var("STUDYBUDDY_STORAGE_URL", DEFAULT_STORAGE_URL);
        let storage_public_url = lookup("STUDYBUDDY_STORAGE_PUBLIC_URL").unwrap_or_else(|| storage_url.clone());

        Ok(Self {
            host: var("STUDYBUDDY_HOST", "0.0.0.0"),
            port,
            db_path: var("STUDYBUDDY_DB_PATH", "studybuddy.db").into(),
            auth_secret,
            storage_url,
            storage_public_url,
            storage_token: lookup("STUDYBUDDY_STORAGE_TOKEN").filter(|t| !t.is_empty()),
            ai_url: var("STUDYBUDDY_AI_URL", DEFAULT_AI_URL),
            default_page_size,
        })
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
