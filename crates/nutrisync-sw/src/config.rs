//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::registry::GenerationKind;
use crate::storage;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "nutrisync";

/// Config file name
const CONFIG_FILE: &str = "gateway.json";

/// Errors loading or validating a [`GatewayConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Origin the application is served from. Anything else is cross-origin.
    pub origin: Url,

    /// Prefix shared by every generation name
    pub cache_prefix: String,

    /// Version token embedded in generation names; bump on deploy
    pub version: String,

    /// Path prefix of backend inference traffic
    pub api_prefix: String,

    /// Port of backend inference traffic
    pub api_port: Option<u16>,

    /// Root-relative paths precached at install
    pub static_assets: Vec<String>,

    /// Document served to navigations when the network is down
    pub offline_fallback: String,

    /// Tag of the background reconciliation signal
    pub sync_tag: String,

    /// Directory for persisted cache generations
    pub storage_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:5173/").expect("static origin is valid"),
            cache_prefix: APP_NAME.to_string(),
            version: "v1".to_string(),
            api_prefix: "/api/".to_string(),
            api_port: Some(8001),
            static_assets: [
                "/",
                "/index.html",
                "/manifest.json",
                "/favicon.ico",
                "/icon-192.png",
                "/icon-512.png",
                "/apple-touch-icon.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_fallback: "/index.html".to_string(),
            sync_tag: "background-sync".to_string(),
            storage_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_NAME),
        }
    }
}

impl GatewayConfig {
    /// Create a default config for `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Set the version token.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Self>(&contents)?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::Invalid("could not find config directory".into()))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Reject configurations the gateway cannot route with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.origin.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "origin has no host: {}",
                self.origin
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version token is empty".into()));
        }
        if self.cache_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("cache prefix is empty".into()));
        }
        for kind in [GenerationKind::Static, GenerationKind::Dynamic] {
            storage::validate_name(&self.generation_name(kind))
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api prefix must be root-relative: {}",
                self.api_prefix
            )));
        }
        if let Some(bad) = self
            .static_assets
            .iter()
            .chain(std::iter::once(&self.offline_fallback))
            .find(|p| !p.starts_with('/'))
        {
            return Err(ConfigError::Invalid(format!(
                "asset path must be root-relative: {bad}"
            )));
        }
        Ok(())
    }

    /// Name of the current generation of `kind`.
    pub fn generation_name(&self, kind: GenerationKind) -> String {
        format!("{}-{}-{}", self.cache_prefix, kind.as_str(), self.version)
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.origin
            .join(path)
            .map_err(|e| ConfigError::Invalid(format!("{path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_generation_names() {
        let config = GatewayConfig::default();
        assert_eq!(
            config.generation_name(GenerationKind::Static),
            "nutrisync-static-v1"
        );
        assert_eq!(
            config.generation_name(GenerationKind::Dynamic),
            "nutrisync-dynamic-v1"
        );
    }

    #[test]
    fn test_default_manifest() {
        let config = GatewayConfig::default();
        assert_eq!(config.static_assets.len(), 7);
        assert_eq!(config.static_assets[0], "/");
        assert!(config.static_assets.contains(&"/icon-192.png".to_string()));
        assert_eq!(config.api_port, Some(8001));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_version_bump_changes_names() {
        let v2 = GatewayConfig::default().with_version("v2");
        assert_eq!(v2.generation_name(GenerationKind::Static), "nutrisync-static-v2");
    }

    #[test]
    fn test_validate_rejects_relative_asset() {
        let mut config = GatewayConfig::default();
        config.static_assets.push("icon.png".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let config = GatewayConfig::default().with_version("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unstorable_generation_name() {
        let config = GatewayConfig::default().with_version("2024.10 hotfix");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(ref m)) if m.contains("nutrisync-static-2024.10 hotfix")));

        let mut config = GatewayConfig::default();
        config.cache_prefix = "nutri/sync".to_string();
        assert!(config.validate().is_err());

        assert!(GatewayConfig::default().with_version("2024.10-hotfix").validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.json");

        let config = GatewayConfig::for_origin(Url::parse("https://nutrisync.app/").unwrap())
            .with_version("v7");
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.version, "v7");
        assert_eq!(loaded.origin.as_str(), "https://nutrisync.app/");
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{ "version": "v3", "api_port": null }"#).unwrap();

        let loaded = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.version, "v3");
        assert_eq!(loaded.api_port, None);
        assert_eq!(loaded.api_prefix, "/api/");
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let loaded = GatewayConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(loaded.version, "v1");
    }

    #[test]
    fn test_resolve() {
        let config = GatewayConfig::for_origin(Url::parse("https://nutrisync.app/").unwrap());
        assert_eq!(
            config.resolve("/icon-192.png").unwrap().as_str(),
            "https://nutrisync.app/icon-192.png"
        );
    }
}
