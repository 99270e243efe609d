//! Daemon configuration.
//!
//! Loaded once from a TOML file; validation failures are fatal-startup
//! errors, so everything past `Config::load` can rely on the invariants
//! checked here (roots exist, extensions non-empty, intervals positive).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use mediapub_core::AddOptions;
use serde::{Deserialize, Serialize};

use crate::util::expand_tilde;

pub const DEFAULT_BASE_DIR: &str = "~/.ipfs_publisher";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub net: NetConfig,
    #[serde(default)]
    pub announce: AnnounceConfig,
    /// Watched roots; tildes are expanded at load.
    pub directories: Vec<String>,
    /// Allowed file extensions, case-insensitive.
    pub extensions: Vec<String>,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    /// Override for the state/index/keys/lock directory.
    #[serde(default)]
    pub base_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
#[serde(rename_all = "snake_case")]
pub enum NetConfig {
    /// External content-network daemon reached over its HTTP API.
    External {
        #[serde(default = "default_api_url")]
        api_url: String,
        #[serde(default = "default_net_timeout")]
        timeout_secs: u64,
        #[serde(default)]
        add_options: AddOptions,
    },
}

impl NetConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            NetConfig::External { timeout_secs, .. } => Duration::from_secs(*timeout_secs),
        }
    }

    pub fn add_options(&self) -> AddOptions {
        match self {
            NetConfig::External { add_options, .. } => add_options.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_announce_interval")]
    pub interval_secs: u64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        AnnounceConfig {
            enabled: true,
            topic: default_topic(),
            interval_secs: default_announce_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_size")]
    pub event_queue_size: usize,
    #[serde(default = "default_save_interval")]
    pub state_save_interval_secs: u64,
    /// Batches larger than this show an upload progress indicator.
    #[serde(default = "default_progress_threshold")]
    pub progress_threshold: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        BehaviorConfig {
            debounce_ms: default_debounce_ms(),
            event_queue_size: default_queue_size(),
            state_save_interval_secs: default_save_interval(),
            progress_threshold: default_progress_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_api_url() -> String {
    "http://127.0.0.1:5001".to_string()
}
fn default_net_timeout() -> u64 {
    300
}
fn default_topic() -> String {
    "mdn/collections/announce".to_string()
}
fn default_announce_interval() -> u64 {
    3600
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_queue_size() -> usize {
    100
}
fn default_save_interval() -> u64 {
    60
}
fn default_progress_threshold() -> usize {
    10
}

impl Config {
    /// Reads and validates the config file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Fatal-startup validation.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.directories.is_empty() {
            bail!("at least one watched directory must be configured");
        }
        for dir in &self.directories {
            if dir.is_empty() {
                bail!("directory path cannot be empty");
            }
            let expanded = expand_tilde(dir);
            let meta = std::fs::metadata(&expanded)
                .with_context(|| format!("watched directory {}", expanded.display()))?;
            if !meta.is_dir() {
                bail!("{} is not a directory", expanded.display());
            }
        }
        if self.extensions.is_empty() {
            bail!("at least one file extension must be configured");
        }
        if self.announce.interval_secs == 0 {
            bail!("announce.interval_secs must be positive");
        }
        if self.behavior.debounce_ms == 0 {
            bail!("behavior.debounce_ms must be positive");
        }
        if self.behavior.event_queue_size == 0 {
            bail!("behavior.event_queue_size must be positive");
        }
        if self.behavior.state_save_interval_secs == 0 {
            bail!("behavior.state_save_interval_secs must be positive");
        }
        Ok(())
    }

    /// Watched roots, tilde-expanded.
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.directories.iter().map(|d| expand_tilde(d)).collect()
    }

    /// Directory holding state, index, keys and the lock file.
    pub fn base_dir(&self) -> PathBuf {
        expand_tilde(self.base_dir.as_deref().unwrap_or(DEFAULT_BASE_DIR))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.behavior.debounce_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce.interval_secs)
    }

    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.behavior.state_save_interval_secs)
    }
}

/// Commented starter config written by `mediapub init`.
pub const DEFAULT_CONFIG: &str = r#"# mediapub configuration

# Directories to publish.
directories = ["~/media"]

# File extensions to process (case-insensitive).
extensions = ["mp3", "mp4", "mkv", "avi", "flac", "wav"]

[net]
# Only "external" is currently shipped: an existing content-network daemon
# reached over its HTTP API.
mode = "external"
api_url = "http://127.0.0.1:5001"
timeout_secs = 300

[net.add_options]
pin = true
no_copy = false
chunker = "size-262144"
raw_leaves = true

[announce]
enabled = true
topic = "mdn/collections/announce"
interval_secs = 3600

[behavior]
debounce_ms = 300
event_queue_size = 100
state_save_interval_secs = 60
progress_threshold = 10
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml(dir: &str) -> String {
        format!(
            r#"
directories = ["{dir}"]
extensions = ["mp3"]

[net]
mode = "external"
"#
        )
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&minimal_toml(dir.path().to_str().unwrap())).unwrap();
        config.validate().unwrap();

        assert!(config.announce.enabled);
        assert_eq!(config.announce.topic, "mdn/collections/announce");
        assert_eq!(config.behavior.debounce_ms, 300);
        assert_eq!(config.behavior.event_queue_size, 100);
        assert_eq!(config.net.timeout(), Duration::from_secs(300));
        assert!(config.net.add_options().pin);
    }

    #[test]
    fn default_config_parses_and_roots_fail_validation() {
        // The starter file points at a placeholder directory; parsing must
        // succeed even though validation of the roots fails on this host.
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.extensions.len(), 6);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let config: Config = toml::from_str(&minimal_toml("/definitely/not/here")).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_extension_list_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let toml_text = format!(
            r#"
directories = ["{}"]
extensions = []

[net]
mode = "external"
"#,
            dir.path().to_str().unwrap()
        );
        let config: Config = toml::from_str(&toml_text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_mode_is_rejected_at_parse() {
        let err = toml::from_str::<Config>(
            r#"
directories = ["/m"]
extensions = ["mp3"]

[net]
mode = "telepathy"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn base_dir_defaults_under_home() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&minimal_toml(dir.path().to_str().unwrap())).unwrap();
        assert!(config.base_dir().ends_with(".ipfs_publisher"));
    }
}
