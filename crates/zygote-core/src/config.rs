//! Daemon configuration

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/zygoted")
}

fn default_pool_name() -> String {
    "zygoted".to_string()
}

fn default_total_mb() -> u32 {
    1024
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/zygoted.sock")
}

/// Daemon-wide knobs. Every field has a default so a partial (or
/// absent) config file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Private root under which root/, scratch/, code/ and images/ live
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Name of the cgroup subtree (prefixed with the host scope)
    #[serde(default = "default_pool_name")]
    pub pool_name: String,
    /// Memory budget shared by all sandboxes
    #[serde(default = "default_total_mb")]
    pub total_mb: u32,
    /// Control-plane Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            pool_name: default_pool_name(),
            total_mb: default_total_mb(),
            socket_path: default_socket_path(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| crate::ZygoteError::Protocol(format!("config parse: {}", e)))?;
        Ok(config)
    }

    pub fn base_image_dir(&self) -> PathBuf {
        self.work_dir.join("images")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.pool_name, "zygoted");
        assert_eq!(config.total_mb, 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"total_mb": 256}"#).unwrap();
        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.total_mb, 256);
        assert_eq!(config.pool_name, "zygoted");
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
