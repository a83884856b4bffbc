//! Optional TOML defaults for the recorder.
//!
//! Every field mirrors a CLI flag; flags win over the file, the file wins
//! over the built-in defaults. Useful for per-station deployments where the
//! port/key/ring sizing never change between observations.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub key: Option<i32>,
    pub batch: Option<usize>,
    pub segments: Option<u64>,
    pub ring_seconds: Option<f64>,
    pub readers: Option<u32>,
    pub packet_size: Option<usize>,
    pub writes_per_log: Option<u32>,
    pub timeout: Option<f64>,
    pub min_startup: Option<f64>,
    pub buffer_bytes: Option<usize>,
    pub priority: Option<i32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}
