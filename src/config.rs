//! Engine configuration.
//!
//! Defaults match the thresholds the engine was tuned with. Any value can be
//! overridden from the environment:
//!
//! - `IMGCONV_CHUNK_INPUT_BYTES`: input size that switches to tiled mode
//! - `IMGCONV_CHUNK_PIXELS`: output pixel count that switches to tiled mode
//! - `IMGCONV_TILE_EDGE`: tile edge length in pixels
//! - `IMGCONV_CLEANUP_INTERVAL`: tiles between scratch cleanup passes
//! - `IMGCONV_TIMEOUT_MS`: end-to-end timeout for one route execution
//! - `IMGCONV_MEMORY_CAP_BYTES`: memory budget sampled by the governor
//! - `IMGCONV_HISTORY_CAP`: error records kept in history
//! - `IMGCONV_MAX_DIMENSION`: largest output edge in pixels

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunk_input_threshold_bytes: u64,
    pub chunk_pixel_threshold: u64,
    pub tile_edge: u32,
    pub cleanup_interval: usize,
    pub timeout_ms: u64,
    pub memory_cap_bytes: u64,
    /// Fraction of `memory_cap_bytes` that triggers a cleanup pass.
    pub soft_memory_ratio: f64,
    pub history_cap: usize,
    /// Total recovery attempts per error record, manual and automatic.
    pub max_recovery_attempts: u32,
    /// Dimension multiplier applied when retrying after a timeout.
    pub timeout_shrink_factor: f64,
    /// Quality reduction applied when retrying after a timeout.
    pub timeout_quality_step: u8,
    pub max_dimension: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_input_threshold_bytes: 5 * 1024 * 1024,
            chunk_pixel_threshold: 4_000_000,
            tile_edge: 1024,
            cleanup_interval: 5,
            timeout_ms: 30_000,
            memory_cap_bytes: 1024 * 1024 * 1024,
            soft_memory_ratio: 0.8,
            history_cap: 100,
            max_recovery_attempts: 3,
            timeout_shrink_factor: 0.7,
            timeout_quality_step: 10,
            max_dimension: 16_384,
        }
    }
}

impl EngineConfig {
    /// Loads defaults overlaid with `IMGCONV_*` environment variables.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        overlay(&mut config.chunk_input_threshold_bytes, "IMGCONV_CHUNK_INPUT_BYTES");
        overlay(&mut config.chunk_pixel_threshold, "IMGCONV_CHUNK_PIXELS");
        overlay(&mut config.tile_edge, "IMGCONV_TILE_EDGE");
        overlay(&mut config.cleanup_interval, "IMGCONV_CLEANUP_INTERVAL");
        overlay(&mut config.timeout_ms, "IMGCONV_TIMEOUT_MS");
        overlay(&mut config.memory_cap_bytes, "IMGCONV_MEMORY_CAP_BYTES");
        overlay(&mut config.history_cap, "IMGCONV_HISTORY_CAP");
        overlay(&mut config.max_dimension, "IMGCONV_MAX_DIMENSION");
        config
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Memory level above which the governor runs a cleanup pass.
    pub fn soft_memory_limit(&self) -> u64 {
        (self.memory_cap_bytes as f64 * self.soft_memory_ratio) as u64
    }

    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.tile_edge == 0 {
            return Err(invalid("tile_edge must be positive"));
        }
        if self.cleanup_interval == 0 {
            return Err(invalid("cleanup_interval must be positive"));
        }
        if !(self.soft_memory_ratio > 0.0 && self.soft_memory_ratio <= 1.0) {
            return Err(invalid("soft_memory_ratio must be in (0, 1]"));
        }
        if !(self.timeout_shrink_factor > 0.0 && self.timeout_shrink_factor < 1.0) {
            return Err(invalid("timeout_shrink_factor must be in (0, 1)"));
        }
        if self.max_dimension == 0 {
            return Err(invalid("max_dimension must be positive"));
        }
        if self.history_cap == 0 {
            return Err(invalid("history_cap must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConvertError {
    ConvertError::InvalidOptions(format!("engine config: {}", reason))
}

fn overlay<T: FromStr>(slot: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparsable config override"),
        }
    }
}
