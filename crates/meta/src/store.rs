//! The metadata-store contract.
//!
//! Modeled after a relational store with transactions: conditional inserts
//! surface uniqueness violations as `Conflict`, counters move through atomic
//! adjust operations, and the join-shaped queries the control loops need are
//! part of the contract (they map to indexed SQL in a relational backend).
//!
//! Required indexes in a relational implementation:
//! `Device(logical_device_id unique, state, score)`; `File(owner_id, state)`;
//! `Chunk(file_id, state)`; unique `Chunk(file_id, sequence_num)`; unique
//! `ChunkLocation(chunk_id, device_id)`; `ChunkLocation(device_id)`.

use csf_common::Result;

use crate::model::{Chunk, ChunkLocation, ChunkState, Device, FileRecord, FileState};

pub trait MetaStore: Send + Sync + 'static {
    // ── devices ─────────────────────────────────────────────────────────

    /// Insert a device row. `Conflict` if the id or logical id exists.
    fn insert_device(&self, device: Device) -> Result<()>;

    fn get_device(&self, id: &str) -> Result<Option<Device>>;

    fn get_device_by_logical(&self, logical_device_id: &str) -> Result<Option<Device>>;

    /// Replace a device row. `NotFound` if absent.
    fn update_device(&self, device: &Device) -> Result<()>;

    fn list_devices(&self) -> Result<Vec<Device>>;

    /// Placement query: ONLINE devices with at least `min_free` available
    /// bytes and a score of at least `min_score`, ordered by
    /// `(score DESC, available DESC, id ASC)`, truncated to `limit`.
    fn find_placement_candidates(
        &self,
        min_free: u64,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<Device>>;

    /// Atomically adjust available capacity, clamped to `[0, total]`.
    fn adjust_device_capacity(&self, device_id: &str, delta: i64) -> Result<()>;

    // ── files ───────────────────────────────────────────────────────────

    fn insert_file(&self, file: FileRecord) -> Result<()>;

    fn get_file(&self, id: &str) -> Result<Option<FileRecord>>;

    fn set_file_state(&self, id: &str, state: FileState) -> Result<()>;

    /// Delete a file row; chunk rows and their placements cascade.
    fn delete_file(&self, id: &str) -> Result<()>;

    // ── chunks ──────────────────────────────────────────────────────────

    /// Insert a chunk row. `Conflict` on duplicate `(file_id, sequence_num)`.
    fn insert_chunk(&self, chunk: Chunk) -> Result<()>;

    fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// All chunks of a file ordered by sequence number.
    fn chunks_by_file(&self, file_id: &str) -> Result<Vec<Chunk>>;

    /// All chunks currently in any of the given states.
    fn chunks_in_states(&self, states: &[ChunkState]) -> Result<Vec<Chunk>>;

    fn set_chunk_state(&self, id: &str, state: ChunkState) -> Result<()>;

    /// Atomically adjust `current_replicas` (clamped at zero); returns the
    /// new value.
    fn adjust_chunk_replicas(&self, id: &str, delta: i32) -> Result<u32>;

    fn set_chunk_replicas(&self, id: &str, value: u32) -> Result<()>;

    // ── placements ──────────────────────────────────────────────────────

    /// Insert a placement row. `Conflict` on duplicate `(chunk_id, device_id)`.
    fn insert_location(&self, location: ChunkLocation) -> Result<()>;

    fn locations_by_chunk(&self, chunk_id: &str) -> Result<Vec<ChunkLocation>>;

    fn locations_by_device(&self, device_id: &str) -> Result<Vec<ChunkLocation>>;

    /// All placements of a chunk joined with their device rows.
    fn holders(&self, chunk_id: &str) -> Result<Vec<(ChunkLocation, Device)>>;

    /// Placements that count toward replication: `healthy` and the device
    /// is ONLINE.
    fn healthy_holders(&self, chunk_id: &str) -> Result<Vec<(ChunkLocation, Device)>>;

    fn set_location_health(
        &self,
        id: &str,
        healthy: bool,
        verified_at: Option<u64>,
    ) -> Result<()>;

    fn delete_location(&self, id: &str) -> Result<()>;

    fn delete_locations_by_chunk(&self, chunk_id: &str) -> Result<()>;
}
