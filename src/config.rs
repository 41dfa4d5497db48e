use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

/// Default upstream channel host.
pub const DEFAULT_UPSTREAM_URL: &str = "https://conda.anaconda.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub workers: usize,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub rate_limit_ms: u64,
    pub upstream_url: String,
    /// Secondary base URL tried once when the primary returns 404 for an
    /// archive. Unset by default.
    pub fallback_url: Option<String>,
    pub registry_user: Option<String>,
    pub registry_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_ms: 500,
            retry_attempts: 5,
            rate_limit_ms: 250,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            fallback_url: None,
            registry_user: get_envvars(&["GHA_USER", "GITHUB_USER", "ORAS_USER"]),
            registry_token: get_envvars(&["GHA_PAT", "GITHUB_TOKEN", "ORAS_PASS"]),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Basic-auth credentials for registry token issuance, if both parts
    /// are available.
    pub fn registry_auth(&self) -> Option<(String, String)> {
        match (&self.registry_user, &self.registry_token) {
            (Some(user), Some(token)) => Some((user.clone(), token.clone())),
            _ => None,
        }
    }
}

fn get_envvars(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}
