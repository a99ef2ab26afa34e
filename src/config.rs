use anyhow::{bail, Context, Result};
use std::env;

/// Lessons assumed for a course whose progress record has no usable total.
pub const DEFAULT_TOTAL_LESSONS: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub base_url: String,
    pub token_url: String,
    pub api_key: String,
    pub request_uri: String,
    pub facebook_graph_url: String,
    pub github_api_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_filter: String,
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub default_total_lessons: i32,
    /// Start every identity from the sample catalog (memory backend only).
    pub seed_sample_data: bool,
    pub auth: AuthConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port = match get("PORT") {
            Some(p) => p.parse().with_context(|| format!("PORT is not a port number: {p}"))?,
            None => 8081,
        };

        let backend = match or("STORE_BACKEND", "postgres").to_ascii_lowercase().as_str() {
            "postgres" => BackendKind::Postgres,
            "memory" => BackendKind::Memory,
            other => bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"),
        };

        let database_url = get("DATABASE_URL");
        if backend == BackendKind::Postgres && database_url.is_none() {
            bail!("DATABASE_URL not set");
        }

        let default_total_lessons = match get("DEFAULT_TOTAL_LESSONS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("DEFAULT_TOTAL_LESSONS is not an integer: {v}"))?,
            None => DEFAULT_TOTAL_LESSONS,
        };
        if default_total_lessons <= 0 {
            bail!("DEFAULT_TOTAL_LESSONS must be positive, got {default_total_lessons}");
        }

        let seed_sample_data = match or("SEED_SAMPLE_DATA", "false").to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => bail!("SEED_SAMPLE_DATA must be true or false, got '{other}'"),
        };

        Ok(Self {
            port,
            log_filter: or("RUST_LOG", "coursesync=info,axum=info"),
            backend,
            database_url,
            default_total_lessons,
            seed_sample_data,
            auth: AuthConfig {
                base_url: or("AUTH_BASE_URL", "https://identitytoolkit.googleapis.com"),
                token_url: or("AUTH_TOKEN_URL", "https://securetoken.googleapis.com"),
                api_key: or("AUTH_API_KEY", ""),
                request_uri: or("AUTH_REQUEST_URI", "http://localhost"),
                facebook_graph_url: or("FACEBOOK_GRAPH_URL", "https://graph.facebook.com"),
                github_api_url: or("GITHUB_API_URL", "https://api.github.com"),
            },
        })
    }
}
