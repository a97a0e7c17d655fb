//! Entity definitions for the coordinator's metadata store.
//!
//! Ownership is by identifier: rows reference each other by id and the
//! coordinator owns all ids. External devices are addressed by
//! `logical_device_id`; internal row ids never cross the wire.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    Online,
    Offline,
    /// Terminal: forbids new placements but keeps the row.
    Suspended,
}

/// Lifecycle state of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    Uploading,
    Active,
    /// Logically deleted; physical removal is asynchronous.
    Deleted,
}

/// Replication state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkState {
    Pending,
    Replicating,
    Healthy,
    Degraded,
    Lost,
}

/// A storage device in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// Externally presented identity; unique across the fleet.
    pub logical_device_id: String,
    pub device_type: String,
    pub owner_id: String,
    pub total_capacity_bytes: u64,
    pub available_capacity_bytes: u64,
    pub state: DeviceState,
    /// Unix ms of the last registration, heartbeat, or state change.
    pub last_seen_at: u64,
    pub cumulative_uptime_ms: u64,
    pub cumulative_downtime_ms: u64,
    /// Pure function of the uptime counters, in [0, 100].
    pub reliability_score: f64,
    /// Opaque client-reported details (model, os, app version).
    pub meta: serde_json::Value,
}

/// A stored file. Chunk contents live on devices; only metadata is here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub original_name: String,
    pub mime: String,
    pub size_bytes: u64,
    pub owner_id: String,
    /// Wrapped data-encryption key, hex.
    pub wrapped_dek: String,
    pub dek_id: String,
    /// SHA-256 of the full plaintext, hex.
    pub plaintext_hash: String,
    pub state: FileState,
    pub chunk_count: u32,
}

/// One encrypted piece of a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    /// 0-based, dense per file; unique with `file_id`.
    pub sequence_num: u32,
    /// Ciphertext size in bytes.
    pub size_bytes: u64,
    pub iv: String,
    pub auth_tag: String,
    pub aad: String,
    pub ciphertext_hash: String,
    pub state: ChunkState,
    pub current_replicas: u32,
    pub target_replicas: u32,
}

/// A placement row: this device holds (or is being sent) this chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub id: String,
    pub chunk_id: String,
    pub device_id: String,
    /// Opaque per-device storage hint.
    pub local_path: String,
    pub healthy: bool,
    /// Unix ms of the last device acknowledgement, if any.
    pub last_verified_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization_uppercase() {
        assert_eq!(serde_json::to_string(&DeviceState::Online).unwrap(), "\"ONLINE\"");
        assert_eq!(serde_json::to_string(&FileState::Deleted).unwrap(), "\"DELETED\"");
        assert_eq!(serde_json::to_string(&ChunkState::Degraded).unwrap(), "\"DEGRADED\"");

        let state: ChunkState = serde_json::from_str("\"LOST\"").unwrap();
        assert_eq!(state, ChunkState::Lost);
    }
}
