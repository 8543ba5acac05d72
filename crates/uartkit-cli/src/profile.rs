//! Named line profiles kept in `<config dir>/uartkit/profiles.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uartkit_core::{TransferStrategy, UartConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: bool,
    pub stop_bits: u8,
    pub mode: String,
    pub read_timeout_ms: u64,
}

impl Default for Profile {
    fn default() -> Self {
        let line = UartConfig::default();
        Self {
            port: None,
            baud_rate: line.baud_rate,
            data_bits: line.data_bits,
            parity: line.parity,
            stop_bits: line.stop_bits,
            mode: "interrupt".to_string(),
            read_timeout_ms: 1000,
        }
    }
}

impl Profile {
    pub fn line_config(&self) -> UartConfig {
        UartConfig {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
        }
    }

    pub fn strategy(&self) -> Result<TransferStrategy> {
        self.mode
            .parse()
            .with_context(|| format!("bad mode `{}`", self.mode))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("uartkit").join("profiles.json"))
}

/// Reads every profile in `path`. A missing file is an empty set.
pub fn load_all(path: &Path) -> Result<BTreeMap<String, Profile>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn load(path: &Path, name: &str) -> Result<Profile> {
    load_all(path)?
        .remove(name)
        .with_context(|| format!("no profile named `{name}` in {}", path.display()))
}
