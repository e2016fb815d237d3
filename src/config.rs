use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::keyring;

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Runtime config. The token is always a plain String in memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub app_id: String,
    pub person_key: String,
    pub token: String,
    pub request_timeout_secs: u64,
    pub image_cache_capacity: usize,
    pub persist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: String::new(),
            app_id: String::new(),
            person_key: String::new(),
            token: String::new(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            image_cache_capacity: crate::core::images::DEFAULT_CAPACITY,
            persist: true,
        }
    }
}

/// On-disk representation. The token is either a keyring reference or plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub api_url: String,
    pub app_id: String,
    pub person_key: String,
    pub token: TokenBackend,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub image_cache_capacity: Option<usize>,
    #[serde(default)]
    pub persist: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend")]
pub enum TokenBackend {
    #[serde(rename = "keyring")]
    Keyring,
    #[serde(rename = "plaintext")]
    Plaintext { value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration: set INBOX_API_URL, INBOX_APP_ID, INBOX_PERSON_KEY and INBOX_TOKEN or write {}", config_path().display())]
    Missing,

    #[error("config file: {0}")]
    File(String),

    #[error("token unavailable from keyring: {0}")]
    Keyring(String),
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("inbox-sync")
        .join("config.json")
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig =
            serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }
}

impl Config {
    /// Try env vars. Returns None if any required var is missing.
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let defaults = Config::default();
        Some(Config {
            api_url: var("INBOX_API_URL")?,
            app_id: var("INBOX_APP_ID")?,
            person_key: var("INBOX_PERSON_KEY")?,
            token: var("INBOX_TOKEN")?,
            request_timeout_secs: var("INBOX_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_secs),
            image_cache_capacity: var("INBOX_IMAGE_CACHE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.image_cache_capacity),
            persist: var("INBOX_PERSIST")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.persist),
        })
    }

    /// Build runtime Config from a FileConfig + resolved token string.
    pub fn from_file_config(fc: &FileConfig, token: String) -> Self {
        let defaults = Config::default();
        Config {
            api_url: fc.api_url.clone(),
            app_id: fc.app_id.clone(),
            person_key: fc.person_key.clone(),
            token,
            request_timeout_secs: fc
                .request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
            image_cache_capacity: fc
                .image_cache_capacity
                .unwrap_or(defaults.image_cache_capacity),
            persist: fc.persist.unwrap_or(defaults.persist),
        }
    }

    /// Resolution order: env vars → config file + keyring → Err.
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Some(config) = Self::from_env() {
            log::info!("Config loaded from environment variables");
            return Ok(config);
        }

        let fc = match FileConfig::load() {
            Ok(Some(fc)) => fc,
            Ok(None) => {
                log::info!("No config file found");
                return Err(ConfigError::Missing);
            }
            Err(e) => {
                log::warn!("Config file error: {}", e);
                return Err(ConfigError::File(e));
            }
        };

        match &fc.token {
            TokenBackend::Plaintext { value } => {
                log::info!("Config loaded from file (plaintext token)");
                Ok(Self::from_file_config(&fc, value.clone()))
            }
            TokenBackend::Keyring => match keyring::get_token(&fc.app_id, &fc.person_key) {
                Ok(token) => {
                    log::info!("Config loaded from file + keyring");
                    Ok(Self::from_file_config(&fc, token))
                }
                Err(e) => {
                    log::warn!("Keyring lookup failed: {}", e);
                    Err(ConfigError::Keyring(e))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("INBOX_API_URL", "https://api.example.com"),
        ("INBOX_APP_ID", "APP"),
        ("INBOX_PERSON_KEY", "p1"),
        ("INBOX_TOKEN", "t0k"),
    ];

    #[test]
    fn env_requires_all_identity_vars() {
        assert!(Config::from_vars(vars(&REQUIRED[..3])).is_none());

        let config = Config::from_vars(vars(&REQUIRED)).unwrap();
        assert_eq!(config.app_id, "APP");
        assert_eq!(config.token, "t0k");
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.image_cache_capacity, 64);
        assert!(config.persist);
    }

    #[test]
    fn env_overrides_tunables() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("INBOX_TIMEOUT_SECS", "12"),
            ("INBOX_IMAGE_CACHE", "8"),
            ("INBOX_PERSIST", "false"),
        ]);
        let config = Config::from_vars(vars(&pairs)).unwrap();
        assert_eq!(config.request_timeout_secs, 12);
        assert_eq!(config.image_cache_capacity, 8);
        assert!(!config.persist);
    }

    #[test]
    fn unparseable_tunable_falls_back() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("INBOX_TIMEOUT_SECS", "soon"));
        let config = Config::from_vars(vars(&pairs)).unwrap();
        assert_eq!(config.request_timeout_secs, 5);
    }

    #[test]
    fn file_config_with_plaintext_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(FileConfig::load_from(&path).unwrap().is_none());

        let fc = FileConfig {
            api_url: "https://api.example.com".into(),
            app_id: "APP".into(),
            person_key: "p1".into(),
            token: TokenBackend::Plaintext {
                value: "secret".into(),
            },
            request_timeout_secs: Some(9),
            image_cache_capacity: None,
            persist: None,
        };
        fs::write(&path, serde_json::to_string_pretty(&fc).unwrap()).unwrap();

        let loaded = FileConfig::load_from(&path).unwrap().unwrap();
        let TokenBackend::Plaintext { value } = &loaded.token else {
            panic!("expected plaintext token");
        };
        let config = Config::from_file_config(&loaded, value.clone());
        assert_eq!(config.token, "secret");
        assert_eq!(config.request_timeout_secs, 9);
        assert_eq!(config.image_cache_capacity, 64);
        assert!(config.persist);
    }

    #[test]
    fn keyring_backend_parses_from_json() {
        let fc: FileConfig = serde_json::from_str(
            r#"{"api_url":"u","app_id":"a","person_key":"p","token":{"backend":"keyring"}}"#,
        )
        .unwrap();
        assert!(matches!(fc.token, TokenBackend::Keyring));
        assert_eq!(fc.persist, None);
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(FileConfig::load_from(&path).is_err());
    }
}
