use crate::error::{ConsoleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level console configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub console: ConsoleSettings,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// etcd client endpoints.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    /// Directory holding the backup archives.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Where snapshots are staged before archiving (default: OS temp dir).
    #[serde(default)]
    pub scratch_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
    #[serde(default = "default_backup_list_secs")]
    pub backup_list_secs: u64,
    #[serde(default = "default_backup_create_secs")]
    pub backup_create_secs: u64,
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    /// Wait between client construction attempts.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            status_secs: default_status_secs(),
            backup_list_secs: default_backup_list_secs(),
            backup_create_secs: default_backup_create_secs(),
            dial_secs: default_dial_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn backup_list(&self) -> Duration {
        Duration::from_secs(self.backup_list_secs)
    }

    pub fn backup_create(&self) -> Duration {
        Duration::from_secs(self.backup_create_secs)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_backup_dir() -> String {
    std::env::temp_dir()
        .join("etcd_console.backup")
        .display()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_secs() -> u64 {
    5
}

fn default_status_secs() -> u64 {
    5
}

fn default_backup_list_secs() -> u64 {
    15
}

fn default_backup_create_secs() -> u64 {
    30
}

fn default_dial_secs() -> u64 {
    5
}

fn default_reconnect_backoff_secs() -> u64 {
    2
}

impl ConsoleSettings {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Split a comma separated endpoint flag, dropping blanks.
    pub fn parse_endpoints(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect()
    }
}

impl ConsoleConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConsoleError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConsoleError::Config(format!("{}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConsoleError::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConsoleError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConsoleError::Config(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(path, content)
            .map_err(|e| ConsoleError::Config(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.console.endpoints.is_empty() {
            return Err(ConsoleError::Config("cannot get etcd endpoints".to_string()));
        }
        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            console: ConsoleSettings {
                endpoints: default_endpoints(),
                backup_dir: default_backup_dir(),
                scratch_dir: None,
                log_level: default_log_level(),
            },
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Resolve the config file path: `<base_dir>/console.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("console.toml")
    }

    /// Resolve the default console home directory: `~/.etcd-console`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".etcd-console"))
            .ok_or_else(|| ConsoleError::Config("Cannot determine home directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_config() {
        let tmp = TempDir::new().unwrap();
        let path = ConsoleConfig::default_path(tmp.path());
        let mut config = ConsoleConfig::default_config();
        config.console.endpoints = vec!["http://10.0.0.1:2379".into()];
        config.save(&path).unwrap();
        let loaded = ConsoleConfig::load(&path).unwrap();
        assert_eq!(loaded.console.endpoints, vec!["http://10.0.0.1:2379"]);
        assert_eq!(loaded.timeouts.request(), Duration::from_secs(5));
    }

    #[test]
    fn load_nonexistent_returns_error() {
        let result = ConsoleConfig::load(Path::new("/nonexistent/console.toml"));
        assert!(matches!(result, Err(ConsoleError::ConfigNotFound(_))));
    }

    #[test]
    fn timeouts_default_when_section_missing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("console.toml");
        std::fs::write(
            &path,
            "[console]\nendpoints = [\"http://a:2379\"]\nbackup_dir = \"/var/backups\"\n",
        )
        .unwrap();
        let loaded = ConsoleConfig::load(&path).unwrap();
        assert_eq!(loaded.timeouts.backup_create(), Duration::from_secs(30));
        assert_eq!(loaded.timeouts.reconnect_backoff(), Duration::from_secs(2));
        assert_eq!(loaded.console.log_level, "info");
    }

    #[test]
    fn empty_endpoints_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("console.toml");
        std::fs::write(&path, "[console]\nendpoints = []\n").unwrap();
        assert!(matches!(
            ConsoleConfig::load(&path),
            Err(ConsoleError::Config(_))
        ));
    }

    #[test]
    fn endpoint_flag_split_and_trimmed() {
        let endpoints = ConsoleSettings::parse_endpoints(" http://a:2379, http://b:2379 ,,");
        assert_eq!(endpoints, vec!["http://a:2379", "http://b:2379"]);
    }
}
