use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub throttle: ThrottleConfig,
    pub import: ImportConfig,
    pub log: LogConfig,
}

/// Where the bulk-download gateway lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Name of the environment variable holding the bearer token.
    pub token_env: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            timeout_secs: 30,
            token_env: Some("INVOICE_SYNC_TOKEN".into()),
        }
    }
}

impl GatewayConfig {
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Zero disables throttling.
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            burst: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    pub concurrency: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Config file path: `~/.config/invoice-sync/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("invoice-sync").join("config.toml"))
}

/// Database path: `store.path` if set, otherwise `~/.cache/invoice-sync/sync.db`.
pub fn store_path(config: &AppConfig) -> Result<PathBuf> {
    if let Some(path) = &config.store.path {
        return Ok(path.clone());
    }
    let base = dirs::cache_dir().context("could not determine cache directory")?;
    Ok(base.join("invoice-sync").join("sync.db"))
}

/// Load config from `explicit`, or from the default location.
///
/// An explicit file must exist and parse. The default file falls back to
/// defaults when missing or broken.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        return toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()));
    }

    if let Some(path) = config_path()
        && let Ok(contents) = std::fs::read_to_string(&path)
    {
        if let Ok(config) = toml::from_str::<AppConfig>(&contents) {
            return Ok(config);
        }
        eprintln!(
            "warning: failed to parse config at {}, using defaults",
            path.display()
        );
    }

    Ok(AppConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.throttle.requests_per_minute, 30);
        assert_eq!(config.import.concurrency, 4);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_str = r#"
[gateway]
base_url = "https://gateway.example.com/v1"

[throttle]
requests_per_minute = 0
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.base_url, "https://gateway.example.com/v1");
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.gateway.token_env.as_deref(), Some("INVOICE_SYNC_TOKEN"));
        assert_eq!(config.throttle.requests_per_minute, 0);
        assert_eq!(config.throttle.burst, 1);
    }

    #[test]
    fn store_path_prefers_configured_value() {
        let config: AppConfig = toml::from_str(
            r#"
[store]
path = "/var/lib/invoice-sync/sync.db"
"#,
        )
        .unwrap();
        assert_eq!(
            store_path(&config).unwrap(),
            PathBuf::from("/var/lib/invoice-sync/sync.db")
        );
    }

    #[test]
    fn missing_token_variable_means_no_token() {
        let gateway = GatewayConfig {
            token_env: Some("INVOICE_SYNC_TEST_TOKEN_THAT_IS_NEVER_SET".into()),
            ..GatewayConfig::default()
        };
        assert_eq!(gateway.token(), None);

        let gateway = GatewayConfig {
            token_env: None,
            ..GatewayConfig::default()
        };
        assert_eq!(gateway.token(), None);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("invoice-sync-no-such-config.toml");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = std::env::temp_dir().join(format!(
            "invoice-sync-config-{}",
            invoice_sync::RequestId::generate()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[import]\nconcurrency = 8\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.import.concurrency, 8);

        let _ = std::fs::remove_dir_all(dir);
    }
}
