//! Configuration loader and validator for the upload service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub youtube: YouTube,
    pub updates: Updates,
}

/// Service-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind: String,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub cleanup_after_seconds: u64,
}

/// YouTube Data API credentials layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YouTube {
    pub credentials_dir: String,
    pub tokens_dir: String,
    pub api_base: String,
}

/// Release source for self-updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Updates {
    pub repo: String,
    pub api_base: String,
    pub install_dir: String,
}

impl App {
    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cleanup_after(&self) -> Duration {
        Duration::from_secs(self.cleanup_after_seconds)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Invalid("app.bind must be a socket address"))
    }
}

impl YouTube {
    pub fn credentials_path(&self) -> PathBuf {
        expand_home(&self.credentials_dir)
    }

    pub fn tokens_path(&self) -> PathBuf {
        expand_home(&self.tokens_dir)
    }
}

impl Config {
    /// Ensure required directories exist (data, credentials and tokens).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.data_path())?;
        fs::create_dir_all(self.youtube.credentials_path())?;
        fs::create_dir_all(self.youtube.tokens_path())
    }

    /// Default SQLite URL for the upload history database.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/uploads.db", self.app.data_path().display())
    }
}

/// Expand a leading `~` to `$HOME`. Other paths are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    cfg.app.socket_addr()?;
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.youtube.credentials_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.credentials_dir must be non-empty"));
    }
    if cfg.youtube.tokens_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.tokens_dir must be non-empty"));
    }
    if cfg.youtube.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.api_base must be non-empty"));
    }

    match cfg.updates.repo.split_once('/') {
        Some((owner, name)) if !owner.trim().is_empty() && !name.trim().is_empty() => {}
        _ => return Err(ConfigError::Invalid("updates.repo must look like owner/name")),
    }
    if cfg.updates.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("updates.api_base must be non-empty"));
    }
    if cfg.updates.install_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("updates.install_dir must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind: "127.0.0.1:5000"
  poll_interval_ms: 1000
  settle_delay_ms: 3000
  cleanup_after_seconds: 3600

youtube:
  credentials_dir: "./credentials"
  tokens_dir: "./tokens"
  api_base: "https://www.googleapis.com/"

updates:
  repo: "OWNER/REPO"
  api_base: "https://api.github.com/"
  install_dir: "."
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.app.socket_addr().unwrap().port(), 5000);
    }

    #[test]
    fn invalid_bind() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.bind = "localhost".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("app.bind")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_repo() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.updates.repo = "no-slash".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("updates.repo")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.updates.repo = "owner/".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_dirs() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.youtube.tokens_dir = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_everything() {
        let td = tempdir().unwrap();
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.youtube.credentials_dir = td.path().join("creds").to_string_lossy().to_string();
        cfg.youtube.tokens_dir = td.path().join("tokens").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(td.path().join("data").exists());
        assert!(td.path().join("creds").exists());
        assert!(td.path().join("tokens").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.updates.repo, "OWNER/REPO");
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/tmp/videos"), PathBuf::from("/tmp/videos"));
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_home("~/videos"), Path::new(&home).join("videos"));
        }
    }
}
