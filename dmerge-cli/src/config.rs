//! Persisted CLI configuration.
//!
//! Stored as a flat key/value JSON file under the user config dir.
//! Every key can be overridden with a `DMERGE_<KEY>` environment variable;
//! unset keys fall back to built-in defaults.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Bearer token for the deconfliction service.
pub const TOKEN_KEY: &str = "token";
/// Base URL of the deconfliction service.
pub const SERVER_KEY: &str = "server";
/// Path to the git binary, when not on PATH.
pub const GIT_KEY: &str = "git";

const DEFAULT_SERVER: &str = "https://dmerge.dev";

fn default_value(key: &str) -> Option<&'static str> {
    match key {
        SERVER_KEY => Some(DEFAULT_SERVER),
        _ => None,
    }
}

/// CLI configuration backed by a JSON file.
#[derive(Debug)]
pub struct Config {
    values: BTreeMap<String, String>,
    path: PathBuf,
}

impl Config {
    /// Load configuration from the default location.
    pub fn load_default() -> Result<Self> {
        Self::load(default_path()?)
    }

    /// Load configuration from `path`. A missing file is an empty config.
    pub fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                values: BTreeMap::new(),
                path,
            });
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let values: BTreeMap<String, String> =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        Ok(Self { values, path })
    }

    /// Read the value for `key`: environment override, then stored value,
    /// then built-in default, then empty.
    pub fn get(&self, key: &str) -> String {
        let env_key = format!("DMERGE_{}", key.to_uppercase());
        if let Ok(value) = std::env::var(&env_key) {
            if !value.is_empty() {
                return value;
            }
        }
        if let Some(value) = self.values.get(key) {
            return value.clone();
        }
        default_value(key).unwrap_or_default().to_string()
    }

    /// Store a value and persist the file.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }

    /// Stored key/value pairs (without env overrides or defaults).
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(&self.values)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn default_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("no user config directory found"))?;
    Ok(base.join("dmerge").join("config.json"))
}

/// The git binary override from config, if any.
pub fn git_override(cfg: &Config) -> Option<PathBuf> {
    let value = cfg.get(GIT_KEY);
    if value.is_empty() {
        None
    } else {
        Some(Path::new(&value).to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::load(tmp.path().join("config.json")).unwrap();
        assert!(cfg.values().is_empty());
        assert_eq!(cfg.get(TOKEN_KEY), "");
    }

    #[test]
    fn test_set_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut cfg = Config::load(path.clone()).unwrap();
        cfg.set(TOKEN_KEY, "secret").unwrap();

        let reloaded = Config::load(path).unwrap();
        assert_eq!(reloaded.get(TOKEN_KEY), "secret");
    }

    #[test]
    fn test_default_server() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::load(tmp.path().join("config.json")).unwrap();
        assert_eq!(cfg.get(SERVER_KEY), DEFAULT_SERVER);
    }

    #[test]
    fn test_env_override_wins() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::load(tmp.path().join("config.json")).unwrap();
        cfg.set("envtest", "stored").unwrap();

        // SAFETY: test-local variable name, no other test reads it.
        unsafe { std::env::set_var("DMERGE_ENVTEST", "override") };
        assert_eq!(cfg.get("envtest"), "override");
        unsafe { std::env::remove_var("DMERGE_ENVTEST") };
        assert_eq!(cfg.get("envtest"), "stored");
    }

    #[test]
    fn test_git_override() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::load(tmp.path().join("config.json")).unwrap();
        assert!(git_override(&cfg).is_none());
        cfg.set(GIT_KEY, "/opt/git/bin/git").unwrap();
        assert_eq!(
            git_override(&cfg),
            Some(PathBuf::from("/opt/git/bin/git"))
        );
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Config::load(path).is_err());
    }
}
