//! Runtime configuration for gpu-partd.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Device shape, persistence and platform selection all live here.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::persist::strategy::Platform;
use crate::topology::profile::{DeviceCatalog, Generation};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-partd", about = "GPU partition manager daemon")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address; overrides the configuration file.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub persistence: PersistenceConfig,
    /// Selects the persistence strategy.
    pub platform: Platform,
    pub boot: BootConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8090").
    pub listen: String,

    /// Bearer token marking a caller privileged. With no token every
    /// caller is privileged.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_string(),
            admin_token: None,
        }
    }
}

/// The device being partitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub generation: Generation,

    /// SMs per GPC; the generation's default when unset.
    pub sms_per_gpc: Option<u32>,

    /// Device memory in bytes.
    pub memory_size: u64,

    /// Swizz IDs unusable on this board, as a bit mask.
    pub invalid_swizz_mask: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            generation: Generation::Ga100,
            sms_per_gpc: None,
            memory_size: 80 * 1024 * 1024 * 1024, // 80 GB
            invalid_swizz_mask: 0,
        }
    }
}

impl DeviceConfig {
    pub fn catalog(&self) -> DeviceCatalog {
        let catalog = DeviceCatalog::new(self.generation, self.memory_size, self.invalid_swizz_mask);
        match self.sms_per_gpc {
            Some(sms) => catalog.with_sms_per_gpc(sms),
            None => catalog,
        }
    }
}

/// Where and how the topology record is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Record file (bare-metal and firmware-offload platforms).
    pub path: PathBuf,

    /// Compress the record with zstd.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Save the record when the daemon shuts down.
    pub save_on_shutdown: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/gpu-partd/topology.bin"),
            zstd_compression: true,
            zstd_level: 3,
            save_on_shutdown: true,
        }
    }
}

/// Topology built on attach when no record exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// GPU profile names, created in order.
    pub profiles: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
