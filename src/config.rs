use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

pub const BASE_URL_ENV: &str = "DIVE_BASE_URL";
pub const API_PREFIX_ENV: &str = "DIVE_API_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Timeout for abort/respond/callback/load calls. Chat streams never time out.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            request_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Base URL joined with the API prefix, e.g. `http://localhost:61990/api`
    pub fn api_base(&self) -> String {
        let prefix = self.api_prefix.trim_matches('/');
        let base = self.base_url.trim_end_matches('/');
        if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, prefix)
        }
    }

    /// Apply `DIVE_BASE_URL` / `DIVE_API_PREFIX` from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(BASE_URL_ENV).ok(),
            std::env::var(API_PREFIX_ENV).ok(),
        )
    }

    fn with_overrides(mut self, base_url: Option<String>, api_prefix: Option<String>) -> Self {
        if let Some(base_url) = base_url.filter(|v| !v.trim().is_empty()) {
            self.base_url = base_url;
        }
        if let Some(api_prefix) = api_prefix {
            self.api_prefix = api_prefix;
        }
        self
    }
}

fn default_base_url() -> String {
    "http://localhost:61990".to_string()
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("ai", "dive", "dive-chat") else {
        return Path::new("dive-chat.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

/// Missing or unreadable files yield the defaults
pub fn load_config(path: &Path) -> EngineConfig {
    let Ok(bytes) = fs::read(path) else {
        return EngineConfig::default();
    };
    serde_json::from_slice::<EngineConfig>(&bytes).unwrap_or_default()
}

pub fn save_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json)?;
    Ok(())
}

/// `.env`, then the config file (or the default location), then environment overrides
pub fn resolve_config(path: Option<&Path>) -> Result<EngineConfig> {
    let _ = dotenvy::dotenv();
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let config = load_config(&path).with_env_overrides();
    if reqwest::Url::parse(&config.base_url).is_err() {
        return Err(ChatError::Config(format!(
            "invalid base URL '{}'",
            config.base_url
        )));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_point_at_local_host() {
        let config = EngineConfig::default();
        assert_eq!(config.api_base(), "http://localhost:61990/api");
        assert_eq!(config.request_timeout_secs, None);
    }

    #[test]
    fn test_api_base_trims_slashes() {
        let config = EngineConfig {
            base_url: "https://dive.example.com/".into(),
            api_prefix: "api/".into(),
            request_timeout_secs: None,
        };
        assert_eq!(config.api_base(), "https://dive.example.com/api");

        let bare = EngineConfig {
            api_prefix: String::new(),
            ..config
        };
        assert_eq!(bare.api_base(), "https://dive.example.com");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = EngineConfig {
            base_url: "http://10.0.0.2:9000".into(),
            api_prefix: "/v2".into(),
            request_timeout_secs: Some(30),
        };
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn test_missing_or_corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert_eq!(load_config(&missing), EngineConfig::default());

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, b"{not json").unwrap();
        assert_eq!(load_config(&corrupt), EngineConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, br#"{"base_url": "http://remote:1"}"#).unwrap();
        let config = load_config(&path);
        assert_eq!(config.base_url, "http://remote:1");
        assert_eq!(config.api_prefix, "/api");
    }

    #[test]
    fn test_overrides_ignore_blank_base_url() {
        let config = EngineConfig::default().with_overrides(Some("  ".into()), Some("/v3".into()));
        assert_eq!(config.base_url, "http://localhost:61990");
        assert_eq!(config.api_prefix, "/v3");
    }
}
