// src/config/mod.rs - Farm configuration and program header extraction
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level farm configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FarmConfig {
    /// Directory where queued programs are materialized before streaming.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// One configured machine. Discovery supplies these; the core never
/// enumerates hardware itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Stable identity used in status updates.
    pub id: i64,

    pub name: String,

    #[serde(default)]
    pub kind: DeviceKind,

    /// Serial port path; unused for emulated devices.
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    #[serde(default)]
    pub hardware_id: String,

    #[serde(default = "default_pausable")]
    pub pausable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Serial,
    Emulated,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_baud() -> u32 {
    115200
}

fn default_pausable() -> bool {
    true
}

/// Load and parse a TOML farm configuration.
pub fn load_config(config_path: &str) -> Result<FarmConfig, ConfigError> {
    let contents = std::fs::read_to_string(config_path)?;
    let config: FarmConfig = toml::from_str(&contents)?;
    tracing::info!(
        "loaded config from {}: {} device(s)",
        config_path,
        config.devices.len()
    );
    Ok(config)
}

/// Slicer metadata read out of a program's `; key = value` comment block.
/// Applied to the device before streaming begins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramHeader {
    pub filament_type: Option<String>,
    pub filament_diameter: Option<f64>,
    pub nozzle_diameter: Option<f64>,
}

impl ProgramHeader {
    /// Scan a program for slicer settings comments. Unknown keys are
    /// ignored; a later occurrence of a key wins.
    pub fn extract(program: &str) -> Self {
        let mut header = Self::default();
        for line in program.lines() {
            let Some(rest) = line.trim().strip_prefix(';') else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "filament_type" => header.filament_type = Some(value.to_string()),
                "filament_diameter" => header.filament_diameter = value.parse().ok(),
                "nozzle_diameter" => header.nozzle_diameter = value.parse().ok(),
                _ => {}
            }
        }
        header
    }

    /// Push the extracted settings into the device's material hooks.
    pub fn apply_to(&self, device: &dyn Device) {
        if let (Some(filament_type), Some(diameter)) =
            (&self.filament_type, self.filament_diameter)
        {
            device.change_filament(filament_type, diameter);
        }
        if let Some(diameter) = self.nozzle_diameter {
            device.change_nozzle(diameter);
        }
    }
}
