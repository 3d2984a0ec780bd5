//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_stream_logger::{LoggerConfig, WatchEntry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub can_messages: Vec<WatchEntry>,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Bus backend; only `virtual` is built in
    #[serde(default = "default_bustype")]
    pub bustype: String,
    pub channel: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bustype() -> String {
    "virtual".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Fallback directory when no removable drive is mounted
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_true")]
    pub prefer_removable: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            prefer_removable: true,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "can_log".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub frames: Vec<CyclicFrameConfig>,
}

/// One periodically transmitted frame
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CyclicFrameConfig {
    pub id: u32,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default = "default_cyclic_period")]
    pub period_ms: u64,
}

fn default_cyclic_period() -> u64 {
    100
}

impl AppConfig {
    /// Cross-section checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.network.bustype != "virtual" {
            bail!(
                "Unsupported bustype '{}' (only 'virtual' is built in)",
                self.network.bustype
            );
        }
        self.logger
            .validate()
            .context("Invalid [logger] section")?;
        for frame in &self.simulation.frames {
            if frame.period_ms == 0 {
                bail!("Cyclic frame 0x{:X} has a zero period", frame.id);
            }
            if frame.data.len() > 8 {
                bail!("Cyclic frame 0x{:X} carries more than 8 bytes", frame.id);
            }
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config.validate()?;
    Ok(config)
}
