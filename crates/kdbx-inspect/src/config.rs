//! Configuration loading

use anyhow::Context;
use kdbx_core::DecryptOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Inspector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub decrypt: DecryptOptions,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Key file used when none is given on the command line
    pub key_file: Option<PathBuf>,
    /// Environment variable holding the master password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub pretty: bool,
}

fn default_password_env() -> String {
    "KDBX_PASSWORD".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            password_env: default_password_env(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { pretty: true }
    }
}

impl Config {
    /// Load `explicit` if given, otherwise the first config file found in the
    /// standard locations, otherwise defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let config_paths: Vec<PathBuf> = vec![
            Some(PathBuf::from("kdbx-inspect.toml")),
            dirs_config_path(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        tracing::debug!("Using default configuration");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }
}

fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kdbx-inspect").join("config.toml"))
}

/// Helper to get user's config directory
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [decrypt]
            stop_on_error = false

            [keys]
            key_file = "/tmp/db.key"
            "#,
        )
        .unwrap();

        assert!(!config.decrypt.stop_on_error);
        assert!(config.decrypt.verify_header_hash);
        assert_eq!(config.keys.key_file, Some(PathBuf::from("/tmp/db.key")));
        assert_eq!(config.keys.password_env, "KDBX_PASSWORD");
        assert!(config.output.pretty);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.decrypt, DecryptOptions::default());
        assert!(config.keys.key_file.is_none());
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }
}
