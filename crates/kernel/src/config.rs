use grabsync_possession::PossessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors from loading a [`SyncConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Registry-wide configuration.
///
/// ```yaml
/// archetypes: [crate, torch, mug]
/// possession:
///   interpolation_duration: 0.25
///   desktop:
///     min_frames: 6
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Archetype names; the index in this list is the archetype index and the
    /// pool bucket.
    pub archetypes: Vec<String>,
    /// Live instances bound per update to records spawned by the log. Bulk
    /// spawns are spread over frames.
    pub spawns_per_update: usize,
    pub possession: PossessionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            archetypes: vec!["object".into()],
            spawns_per_update: 1,
            possession: PossessionConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.archetypes.is_empty() {
            return Err(ConfigError::Invalid("at least one archetype is required".into()));
        }
        if self.spawns_per_update == 0 {
            return Err(ConfigError::Invalid("spawns_per_update must be at least 1".into()));
        }
        let p = &self.possession;
        let durations = [
            ("interpolation_duration", p.interpolation_duration),
            ("floating_send_interval", p.floating_send_interval),
            ("vr.min_duration", p.vr.min_duration),
            ("desktop.min_duration", p.desktop.min_duration),
            ("rotation_watch.interval", p.rotation_watch.interval),
            ("rotation_watch.fast_interval", p.rotation_watch.fast_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| !(*v >= 0.0)) {
            return Err(ConfigError::Invalid(format!("{name} must be a non-negative duration")));
        }
        if p.rotation_watch.interval <= 0.0 || p.rotation_watch.fast_interval <= 0.0 {
            return Err(ConfigError::Invalid("rotation watch intervals must be positive".into()));
        }
        Ok(())
    }
}
