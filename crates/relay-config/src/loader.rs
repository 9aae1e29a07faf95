//! Config file discovery, loading, and environment variable overlay.

use crate::{
    CacheConfig, CommandConfig, ConfigError, HeartbeatConfig, ListenConfig, QueueConfig,
    RelayConfig, TelemetryConfig,
};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/relay/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("relay/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("relay.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string, filling in any section left unspecified.
fn parse_toml(contents: &str, path: &Path) -> Result<RelayConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = RelayConfig::default();

    if let Some(listen) = table.get("listen").and_then(|v| v.as_table()) {
        if let Some(v) = listen.get("host").and_then(|v| v.as_str()) {
            config.listen.host = v.to_string();
        }
        if let Some(v) = listen.get("port").and_then(|v| v.as_integer()) {
            config.listen.port = v as u16;
        }
    }

    if let Some(hb) = table.get("heartbeat").and_then(|v| v.as_table()) {
        if let Some(v) = hb.get("interval_ms").and_then(|v| v.as_integer()) {
            config.heartbeat.interval_ms = v as u64;
        }
        if let Some(v) = hb.get("timeout_ms").and_then(|v| v.as_integer()) {
            config.heartbeat.timeout_ms = v as u64;
        }
        if let Some(v) = hb.get("reload_timeout_ms").and_then(|v| v.as_integer()) {
            config.heartbeat.reload_timeout_ms = v as u64;
        }
        if let Some(v) = hb.get("max_failures").and_then(|v| v.as_integer()) {
            config.heartbeat.max_failures = v as u32;
        }
    }

    if let Some(cmd) = table.get("command").and_then(|v| v.as_table()) {
        if let Some(v) = cmd.get("timeout_ms").and_then(|v| v.as_integer()) {
            config.command.timeout_ms = v as u64;
        }
        if let Some(v) = cmd.get("ready_wait_budget_ms").and_then(|v| v.as_integer()) {
            config.command.ready_wait_budget_ms = v as u64;
        }
        if let Some(v) = cmd.get("ready_wait_poll_ms").and_then(|v| v.as_integer()) {
            config.command.ready_wait_poll_ms = v as u64;
        }
    }

    if let Some(cache) = table.get("cache").and_then(|v| v.as_table()) {
        if let Some(v) = cache.get("ttl_seconds").and_then(|v| v.as_integer()) {
            config.cache.ttl_seconds = v as u64;
        }
    }

    if let Some(queue) = table.get("queue").and_then(|v| v.as_table()) {
        if let Some(v) = queue.get("enabled").and_then(|v| v.as_bool()) {
            config.queue.enabled = v;
        }
        if let Some(v) = queue.get("max_size").and_then(|v| v.as_integer()) {
            config.queue.max_size = v as usize;
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    Ok(config)
}

/// Merge two configs, with `overlay` taking precedence section-by-section.
pub fn merge_configs(base: RelayConfig, overlay: RelayConfig) -> RelayConfig {
    RelayConfig {
        listen: if overlay.listen != ListenConfig::default() {
            overlay.listen
        } else {
            base.listen
        },
        heartbeat: if overlay.heartbeat != HeartbeatConfig::default() {
            overlay.heartbeat
        } else {
            base.heartbeat
        },
        command: if overlay.command != CommandConfig::default() {
            overlay.command
        } else {
            base.command
        },
        cache: if overlay.cache != CacheConfig::default() {
            overlay.cache
        } else {
            base.cache
        },
        queue: if overlay.queue != QueueConfig::default() {
            overlay.queue
        } else {
            base.queue
        },
        telemetry: if overlay.telemetry != TelemetryConfig::default() {
            overlay.telemetry
        } else {
            base.telemetry
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut RelayConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("RELAY_HOST") {
        config.listen.host = v;
        sources.env_overrides.push("RELAY_HOST".to_string());
    }
    if let Ok(v) = env::var("RELAY_PORT") {
        if let Ok(port) = v.parse() {
            config.listen.port = port;
            sources.env_overrides.push("RELAY_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_HEARTBEAT_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.heartbeat.interval_ms = ms;
            sources.env_overrides.push("RELAY_HEARTBEAT_INTERVAL_MS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_HEARTBEAT_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.heartbeat.timeout_ms = ms;
            sources.env_overrides.push("RELAY_HEARTBEAT_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_COMMAND_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.command.timeout_ms = ms;
            sources.env_overrides.push("RELAY_COMMAND_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_CACHE_TTL_SECONDS") {
        if let Ok(s) = v.parse() {
            config.cache.ttl_seconds = s;
            sources.env_overrides.push("RELAY_CACHE_TTL_SECONDS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_QUEUE_ENABLED") {
        if let Ok(b) = v.parse() {
            config.queue.enabled = b;
            sources.env_overrides.push("RELAY_QUEUE_ENABLED".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RELAY_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
