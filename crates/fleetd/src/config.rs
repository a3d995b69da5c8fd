//! fleetd.toml configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// How the leader takes snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Program and arguments; the service id is appended.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_snapshot_timeout")]
    pub timeout_secs: u64,
}

fn default_snapshot_timeout() -> u64 {
    300
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_snapshot_timeout(),
        }
    }
}

impl SnapshotConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot_section() {
        let config: FleetConfig = toml::from_str(
            r#"
            [snapshot]
            command = ["/usr/local/bin/take-snapshot", "--quiet"]
            timeout_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.snapshot.command.len(), 2);
        assert_eq!(config.snapshot.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert!(config.snapshot.command.is_empty());
        assert_eq!(config.snapshot.timeout_secs, 300);
    }

    #[test]
    fn load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.toml");
        std::fs::write(&path, "[snapshot]\ncommand = [\"echo\"]\n").unwrap();
        let config = FleetConfig::load(Some(&path)).unwrap();
        assert_eq!(config.snapshot.command, vec!["echo".to_string()]);
        assert!(FleetConfig::load(None).unwrap().snapshot.command.is_empty());
    }
}
