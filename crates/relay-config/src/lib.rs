//! Configuration loading for the relay daemon.
//!
//! # Config file locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/relay/config.toml` (system)
//! 2. `~/.config/relay/config.toml` (user)
//! 3. `./relay.toml` (local override)
//! 4. Environment variables (`RELAY_*`)
//!
//! # Example config
//!
//! ```toml
//! [listen]
//! host = "127.0.0.1"
//! port = 6500
//!
//! [heartbeat]
//! interval_ms = 5000
//! timeout_ms = 15000
//! reload_timeout_ms = 30000
//! max_failures = 3
//!
//! [command]
//! timeout_ms = 30000
//!
//! [cache]
//! ttl_seconds = 60
//!
//! [queue]
//! enabled = false
//! max_size = 10
//! ```

pub mod loader;
pub mod settings;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use settings::{CacheConfig, CommandConfig, HeartbeatConfig, ListenConfig, QueueConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete relay daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl RelayConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins): compiled defaults, `/etc/relay/config.toml`,
    /// `~/.config/relay/config.toml`, `./relay.toml`, environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, preferring `config_path` over the local
    /// `./relay.toml` override if given. System and user configs still load
    /// first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RelayConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML for `--print-config` style diagnostics.
    pub fn to_toml(&self) -> String {
        let mut out = String::new();
        out.push_str("# Relay server configuration\n\n");
        out.push_str("[listen]\n");
        out.push_str(&format!("host = \"{}\"\n", self.listen.host));
        out.push_str(&format!("port = {}\n", self.listen.port));

        out.push_str("\n[heartbeat]\n");
        out.push_str(&format!("interval_ms = {}\n", self.heartbeat.interval_ms));
        out.push_str(&format!("timeout_ms = {}\n", self.heartbeat.timeout_ms));
        out.push_str(&format!(
            "reload_timeout_ms = {}\n",
            self.heartbeat.reload_timeout_ms
        ));
        out.push_str(&format!("max_failures = {}\n", self.heartbeat.max_failures));

        out.push_str("\n[command]\n");
        out.push_str(&format!("timeout_ms = {}\n", self.command.timeout_ms));

        out.push_str("\n[cache]\n");
        out.push_str(&format!("ttl_seconds = {}\n", self.cache.ttl_seconds));

        out.push_str("\n[queue]\n");
        out.push_str(&format!("enabled = {}\n", self.queue.enabled));
        out.push_str(&format!("max_size = {}\n", self.queue.max_size));

        out.push_str("\n[telemetry]\n");
        out.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen.port, 6500);
        assert_eq!(config.heartbeat.interval_ms, 5_000);
        assert_eq!(config.command.timeout_ms, 30_000);
        assert_eq!(config.cache.ttl_seconds, 60);
        assert!(!config.queue.enabled);
    }

    #[test]
    fn to_toml_contains_every_section() {
        let toml = RelayConfig::default().to_toml();
        for section in ["[listen]", "[heartbeat]", "[command]", "[cache]", "[queue]", "[telemetry]"] {
            assert!(toml.contains(section), "missing section {section}");
        }
    }

    #[test]
    fn load_with_no_files_yields_defaults() {
        let config = RelayConfig::load().unwrap();
        assert_eq!(config.listen.port, 6500);
    }
}
