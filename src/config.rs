//! Static configuration, loaded once at startup from a TOML file the way
//! the teacher's own `Config` did — `serde` derives the shape, `toml`
//! parses it, and a bad file becomes a [`CoreError::Config`] the CLI
//! reports and exits on. Unlike the teacher's loader, a missing file
//! falls back to defaults rather than failing, so a fresh checkout runs
//! without needing one up front.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::vm::DEFAULT_Q_MAX;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallframeConfig {
    pub vm: VmConfig,
    pub factory: FactoryConfig,
    pub rpc: RpcConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Root directory new VM deployments are created under when the CLI
    /// isn't given an explicit path.
    pub data_dir: PathBuf,
    /// Bound on queued-but-not-yet-executing calls (spec §4.8's `Q_MAX`).
    pub queue_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            data_dir: PathBuf::from("./data"),
            queue_capacity: DEFAULT_Q_MAX,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Maximum number of children a single factory VM may have live at
    /// once; `0` means unbounded.
    pub max_children: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig { max_children: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub bind_address: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            bind_address: "0.0.0.0:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            directory: PathBuf::from("./logs"),
            json: false,
        }
    }
}

impl Default for CallframeConfig {
    fn default() -> Self {
        CallframeConfig {
            vm: VmConfig::default(),
            factory: FactoryConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CallframeConfig {
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Ok(CallframeConfig::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = CallframeConfig::load(Path::new("/nonexistent/callframe.toml")).unwrap();
        assert_eq!(config.rpc.bind_address, "0.0.0.0:8787");
    }

    #[test]
    fn partial_toml_fills_in_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("callframe.toml");
        fs::write(&path, "[rpc]\nbind_address = \"127.0.0.1:9000\"\n").unwrap();
        let config = CallframeConfig::load(&path).unwrap();
        assert_eq!(config.rpc.bind_address, "127.0.0.1:9000");
        assert_eq!(config.vm.queue_capacity, DEFAULT_Q_MAX);
    }
}
