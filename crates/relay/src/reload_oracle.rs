//! Optional external signal for "this instance is mid-reload" beyond the
//! in-memory `STATUS` the instance itself reports.
//!
//! The upstream agent this protocol was modeled on sometimes exposes reload
//! state as a marker file rather than (or in addition to) a `STATUS` frame.
//! Treating it as a pluggable oracle keeps that detail optional: the default
//! no-op oracle makes the relay behave exactly as if only in-memory status
//! mattered, and a filesystem-backed oracle can be wired in when a state
//! directory is configured.

use std::path::PathBuf;

/// Tells the registry's disconnect path whether an instance should be
/// treated as reloading even though its last known `STATUS` wasn't
/// `reloading`.
pub trait ReloadOracle: Send + Sync {
    fn is_reloading(&self, instance_id: &str) -> bool;
}

/// Always reports "not reloading". Used when no state directory is
/// configured.
pub struct NoopReloadOracle;

impl ReloadOracle for NoopReloadOracle {
    fn is_reloading(&self, _instance_id: &str) -> bool {
        false
    }
}

/// Checks for a marker file at `<state_dir>/<hash(instance_id)>.reloading`.
pub struct FileReloadOracle {
    state_dir: PathBuf,
}

impl FileReloadOracle {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn marker_path(&self, instance_id: &str) -> PathBuf {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&instance_id, &mut hasher);
        let digest = std::hash::Hasher::finish(&hasher);
        self.state_dir.join(format!("{digest:016x}.reloading"))
    }
}

impl ReloadOracle for FileReloadOracle {
    fn is_reloading(&self, instance_id: &str) -> bool {
        self.marker_path(instance_id).exists()
    }
}
