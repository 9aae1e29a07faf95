//! Configuration sections for the relay daemon.
//!
//! Each section owns its own `Default` impl via a `default_x()` function per
//! field, so a partially-specified TOML file (or no file at all) still
//! produces a fully populated config — the pattern the teacher's
//! infrastructure-config sections use.

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_interval_ms() -> u64 {
    5_000
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_reload_timeout_ms() -> u64 {
    30_000
}
fn default_max_failures() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reload_timeout_ms")]
    pub reload_timeout_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            reload_timeout_ms: default_reload_timeout_ms(),
            max_failures: default_max_failures(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_ready_wait_budget_ms() -> u64 {
    10_000
}
fn default_ready_wait_poll_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_ready_wait_budget_ms")]
    pub ready_wait_budget_ms: u64,
    #[serde(default = "default_ready_wait_poll_ms")]
    pub ready_wait_poll_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_command_timeout_ms(),
            ready_wait_budget_ms: default_ready_wait_budget_ms(),
            ready_wait_poll_ms: default_ready_wait_poll_ms(),
        }
    }
}

fn default_ttl_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

fn default_queue_max_size() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_queue_max_size(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(ListenConfig::default().port, 6500);
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.interval_ms, 5_000);
        assert_eq!(hb.timeout_ms, 15_000);
        assert_eq!(hb.reload_timeout_ms, 30_000);
        assert_eq!(hb.max_failures, 3);
        assert_eq!(CommandConfig::default().timeout_ms, 30_000);
        assert_eq!(CacheConfig::default().ttl_seconds, 60);
        let queue = QueueConfig::default();
        assert!(!queue.enabled);
        assert_eq!(queue.max_size, 10);
    }
}
