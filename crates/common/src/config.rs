//! Coordinator configuration: TOML + serde with per-field defaults.
//!
//! Every knob has a default matching the production deployment; only
//! `kek_hex` must be supplied. `validate()` is called once at startup and
//! fails with a `Config` error, which is fatal.

use std::path::Path;
use std::time::Duration;
use std::fs;

use serde::Deserialize;

use crate::error::{FabricError, Result};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Chunk sizing policy. The legacy deployment used a fixed chunk size; the
/// adaptive policy scales chunk size with file size. Selected once at
/// configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// <= 1 GiB: single chunk; <= 5 GiB: 500 MiB pieces; above: 1 GiB pieces.
    Adaptive,
    /// Fixed chunk size in bytes (legacy, default 5 MiB).
    Fixed(u64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Master key-encryption key, 64 hex chars (32 bytes). Required.
    #[serde(default)]
    pub kek_hex: String,

    /// Target number of live replicas per chunk. Range [2, 5].
    #[serde(default = "default_redundancy_factor")]
    pub redundancy_factor: u32,

    /// Extra replicas tolerated above the target before trimming.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u32,

    /// Minimum device reliability score eligible for placement.
    #[serde(default = "default_min_reliability")]
    pub min_reliability_for_placement: f64,

    /// Full health scan cadence.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Summary log cadence.
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,

    /// Over-replication sweep cadence.
    #[serde(default = "default_trim_interval_secs")]
    pub trim_interval_secs: u64,

    /// Silence after which an ONLINE device is marked OFFLINE.
    #[serde(default = "default_offline_threshold_secs")]
    pub device_offline_threshold_secs: u64,

    /// Chunk sizing policy: "adaptive" or "fixed".
    #[serde(default = "default_chunk_policy")]
    pub chunk_policy: String,

    /// Chunk size used when `chunk_policy = "fixed"`.
    #[serde(default = "default_fixed_chunk_size")]
    pub fixed_chunk_size_bytes: u64,

    /// Age after which staged ciphertext is evicted.
    #[serde(default = "default_temp_chunk_ttl_secs")]
    pub temp_chunk_ttl_secs: u64,

    /// Deadline for a device to acknowledge a chunk write.
    #[serde(default = "default_t_write_secs")]
    pub t_write_secs: u64,

    /// Deadline for a device to return chunk ciphertext.
    #[serde(default = "default_t_read_secs")]
    pub t_read_secs: u64,

    /// Deadline for a device to acknowledge a chunk delete.
    #[serde(default = "default_t_delete_secs")]
    pub t_delete_secs: u64,

    /// Maximum accepted upload size.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Directory for the temporary ciphertext store.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

fn default_redundancy_factor() -> u32 { 3 }
fn default_safety_margin() -> u32 { 2 }
fn default_min_reliability() -> f64 { 70.0 }
fn default_scan_interval_secs() -> u64 { 3600 }
fn default_summary_interval_secs() -> u64 { 86_400 }
fn default_trim_interval_secs() -> u64 { 43_200 }
fn default_offline_threshold_secs() -> u64 { 90 }
fn default_chunk_policy() -> String { "adaptive".to_string() }
fn default_fixed_chunk_size() -> u64 { 5 * MIB }
fn default_temp_chunk_ttl_secs() -> u64 { 86_400 }
fn default_t_write_secs() -> u64 { 30 }
fn default_t_read_secs() -> u64 { 60 }
fn default_t_delete_secs() -> u64 { 60 }
fn default_max_file_size() -> u64 { 10 * GIB }
fn default_staging_dir() -> String { "./staging".to_string() }

impl Default for Config {
    fn default() -> Self {
        Config {
            kek_hex: String::new(),
            redundancy_factor: default_redundancy_factor(),
            safety_margin: default_safety_margin(),
            min_reliability_for_placement: default_min_reliability(),
            scan_interval_secs: default_scan_interval_secs(),
            summary_interval_secs: default_summary_interval_secs(),
            trim_interval_secs: default_trim_interval_secs(),
            device_offline_threshold_secs: default_offline_threshold_secs(),
            chunk_policy: default_chunk_policy(),
            fixed_chunk_size_bytes: default_fixed_chunk_size(),
            temp_chunk_ttl_secs: default_temp_chunk_ttl_secs(),
            t_write_secs: default_t_write_secs(),
            t_read_secs: default_t_read_secs(),
            t_delete_secs: default_t_delete_secs(),
            max_file_size_bytes: default_max_file_size(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Config {
    /// Check the configuration for startup. All violations are fatal.
    pub fn validate(&self) -> Result<()> {
        match hex::decode(&self.kek_hex) {
            Ok(bytes) if bytes.len() == 32 => {}
            Ok(bytes) => {
                return Err(FabricError::Config(format!(
                    "kek_hex must decode to 32 bytes, got {}",
                    bytes.len()
                )))
            }
            Err(e) => return Err(FabricError::Config(format!("kek_hex is not valid hex: {}", e))),
        }

        if !(2..=5).contains(&self.redundancy_factor) {
            return Err(FabricError::Config(format!(
                "redundancy_factor must be in [2, 5], got {}",
                self.redundancy_factor
            )));
        }

        match self.chunk_policy.as_str() {
            "adaptive" => {}
            "fixed" => {
                if self.fixed_chunk_size_bytes == 0 {
                    return Err(FabricError::Config(
                        "fixed_chunk_size_bytes must be positive".to_string(),
                    ));
                }
            }
            other => {
                return Err(FabricError::Config(format!(
                    "unknown chunk_policy '{}', expected 'adaptive' or 'fixed'",
                    other
                )))
            }
        }

        if self.max_file_size_bytes == 0 {
            return Err(FabricError::Config("max_file_size_bytes must be positive".to_string()));
        }

        Ok(())
    }

    /// The chunk sizing policy selected by this configuration.
    ///
    /// Call after `validate()`; an unknown policy string falls back to
    /// adaptive here.
    pub fn selected_chunk_policy(&self) -> ChunkPolicy {
        match self.chunk_policy.as_str() {
            "fixed" => ChunkPolicy::Fixed(self.fixed_chunk_size_bytes),
            _ => ChunkPolicy::Adaptive,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs)
    }

    pub fn device_offline_threshold(&self) -> Duration {
        Duration::from_secs(self.device_offline_threshold_secs)
    }

    pub fn temp_chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_chunk_ttl_secs)
    }

    pub fn t_write(&self) -> Duration {
        Duration::from_secs(self.t_write_secs)
    }

    pub fn t_read(&self) -> Duration {
        Duration::from_secs(self.t_read_secs)
    }

    pub fn t_delete(&self) -> Duration {
        Duration::from_secs(self.t_delete_secs)
    }
}

/// Load configuration from a TOML file path.
/// Missing file or parse failure is a config error.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let p = path.as_ref();
    let s = fs::read_to_string(p)
        .map_err(|e| FabricError::Config(format!("cannot read {}: {}", p.display(), e)))?;
    let cfg: Config =
        toml::from_str(&s).map_err(|e| FabricError::Config(format!("parse error: {}", e)))?;
    Ok(cfg)
}
