//! In-memory reference implementation of [`MetaStore`].
//!
//! Backs the default wiring and every test. Uniqueness indexes are kept as
//! explicit side maps so that conflicting inserts fail exactly the way a
//! relational unique constraint would.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use csf_common::{FabricError, Result};

use crate::model::{Chunk, ChunkLocation, ChunkState, Device, FileRecord, FileState};
use crate::store::MetaStore;

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    device_by_logical: HashMap<String, String>,
    files: HashMap<String, FileRecord>,
    chunks: HashMap<String, Chunk>,
    chunk_seq_index: HashSet<(String, u32)>,
    locations: HashMap<String, ChunkLocation>,
    location_pair_index: HashMap<(String, String), String>,
}

/// Thread-safe in-memory metadata store.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: RwLock<Inner>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for MemoryMetaStore {
    // ── devices ─────────────────────────────────────────────────────────

    fn insert_device(&self, device: Device) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.devices.contains_key(&device.id) {
            return Err(FabricError::Conflict(format!("device id {}", device.id)));
        }
        if inner.device_by_logical.contains_key(&device.logical_device_id) {
            return Err(FabricError::Conflict(format!(
                "logical device id {}",
                device.logical_device_id
            )));
        }
        inner
            .device_by_logical
            .insert(device.logical_device_id.clone(), device.id.clone());
        inner.devices.insert(device.id.clone(), device);
        Ok(())
    }

    fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.inner.read().devices.get(id).cloned())
    }

    fn get_device_by_logical(&self, logical_device_id: &str) -> Result<Option<Device>> {
        let inner = self.inner.read();
        Ok(inner
            .device_by_logical
            .get(logical_device_id)
            .and_then(|id| inner.devices.get(id))
            .cloned())
    }

    fn update_device(&self, device: &Device) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.devices.contains_key(&device.id) {
            return Err(FabricError::NotFound(format!("device {}", device.id)));
        }
        inner.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.read().devices.values().cloned().collect())
    }

    fn find_placement_candidates(
        &self,
        min_free: u64,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<Device>> {
        let inner = self.inner.read();
        let mut candidates: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| {
                d.state == crate::model::DeviceState::Online
                    && d.available_capacity_bytes >= min_free
                    && d.reliability_score >= min_score
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.reliability_score
                .partial_cmp(&a.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.available_capacity_bytes.cmp(&a.available_capacity_bytes))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn adjust_device_capacity(&self, device_id: &str, delta: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let device = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| FabricError::NotFound(format!("device {}", device_id)))?;
        let next = device.available_capacity_bytes as i64 + delta;
        device.available_capacity_bytes =
            next.clamp(0, device.total_capacity_bytes as i64) as u64;
        Ok(())
    }

    // ── files ───────────────────────────────────────────────────────────

    fn insert_file(&self, file: FileRecord) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.files.contains_key(&file.id) {
            return Err(FabricError::Conflict(format!("file id {}", file.id)));
        }
        inner.files.insert(file.id.clone(), file);
        Ok(())
    }

    fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self.inner.read().files.get(id).cloned())
    }

    fn set_file_state(&self, id: &str, state: FileState) -> Result<()> {
        let mut inner = self.inner.write();
        let file = inner
            .files
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("file {}", id)))?;
        file.state = state;
        Ok(())
    }

    fn delete_file(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.files.remove(id);

        let chunk_ids: Vec<String> = inner
            .chunks
            .values()
            .filter(|c| c.file_id == id)
            .map(|c| c.id.clone())
            .collect();
        for chunk_id in chunk_ids {
            if let Some(chunk) = inner.chunks.remove(&chunk_id) {
                inner.chunk_seq_index.remove(&(chunk.file_id, chunk.sequence_num));
            }
            let loc_ids: Vec<String> = inner
                .locations
                .values()
                .filter(|l| l.chunk_id == chunk_id)
                .map(|l| l.id.clone())
                .collect();
            for loc_id in loc_ids {
                if let Some(loc) = inner.locations.remove(&loc_id) {
                    inner.location_pair_index.remove(&(loc.chunk_id, loc.device_id));
                }
            }
        }
        Ok(())
    }

    // ── chunks ──────────────────────────────────────────────────────────

    fn insert_chunk(&self, chunk: Chunk) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.chunks.contains_key(&chunk.id) {
            return Err(FabricError::Conflict(format!("chunk id {}", chunk.id)));
        }
        let seq_key = (chunk.file_id.clone(), chunk.sequence_num);
        if inner.chunk_seq_index.contains(&seq_key) {
            return Err(FabricError::Conflict(format!(
                "chunk ({}, {})",
                chunk.file_id, chunk.sequence_num
            )));
        }
        inner.chunk_seq_index.insert(seq_key);
        inner.chunks.insert(chunk.id.clone(), chunk);
        Ok(())
    }

    fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.inner.read().chunks.get(id).cloned())
    }

    fn chunks_by_file(&self, file_id: &str) -> Result<Vec<Chunk>> {
        let inner = self.inner.read();
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence_num);
        Ok(chunks)
    }

    fn chunks_in_states(&self, states: &[ChunkState]) -> Result<Vec<Chunk>> {
        let inner = self.inner.read();
        let wanted: HashSet<ChunkState> = states.iter().copied().collect();
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| wanted.contains(&c.state))
            .cloned()
            .collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chunks)
    }

    fn set_chunk_state(&self, id: &str, state: ChunkState) -> Result<()> {
        let mut inner = self.inner.write();
        let chunk = inner
            .chunks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", id)))?;
        chunk.state = state;
        Ok(())
    }

    fn adjust_chunk_replicas(&self, id: &str, delta: i32) -> Result<u32> {
        let mut inner = self.inner.write();
        let chunk = inner
            .chunks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", id)))?;
        let next = (chunk.current_replicas as i64 + delta as i64).max(0) as u32;
        chunk.current_replicas = next;
        Ok(next)
    }

    fn set_chunk_replicas(&self, id: &str, value: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let chunk = inner
            .chunks
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", id)))?;
        chunk.current_replicas = value;
        Ok(())
    }

    // ── placements ──────────────────────────────────────────────────────

    fn insert_location(&self, location: ChunkLocation) -> Result<()> {
        let mut inner = self.inner.write();
        let pair = (location.chunk_id.clone(), location.device_id.clone());
        if inner.location_pair_index.contains_key(&pair) {
            return Err(FabricError::Conflict(format!(
                "placement ({}, {})",
                location.chunk_id, location.device_id
            )));
        }
        inner.location_pair_index.insert(pair, location.id.clone());
        inner.locations.insert(location.id.clone(), location);
        Ok(())
    }

    fn locations_by_chunk(&self, chunk_id: &str) -> Result<Vec<ChunkLocation>> {
        let inner = self.inner.read();
        let mut locs: Vec<ChunkLocation> = inner
            .locations
            .values()
            .filter(|l| l.chunk_id == chunk_id)
            .cloned()
            .collect();
        locs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(locs)
    }

    fn locations_by_device(&self, device_id: &str) -> Result<Vec<ChunkLocation>> {
        let inner = self.inner.read();
        let mut locs: Vec<ChunkLocation> = inner
            .locations
            .values()
            .filter(|l| l.device_id == device_id)
            .cloned()
            .collect();
        locs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(locs)
    }

    fn holders(&self, chunk_id: &str) -> Result<Vec<(ChunkLocation, Device)>> {
        let inner = self.inner.read();
        let mut out: Vec<(ChunkLocation, Device)> = inner
            .locations
            .values()
            .filter(|l| l.chunk_id == chunk_id)
            .filter_map(|l| inner.devices.get(&l.device_id).map(|d| (l.clone(), d.clone())))
            .collect();
        out.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        Ok(out)
    }

    fn healthy_holders(&self, chunk_id: &str) -> Result<Vec<(ChunkLocation, Device)>> {
        Ok(self
            .holders(chunk_id)?
            .into_iter()
            .filter(|(l, d)| l.healthy && d.state == crate::model::DeviceState::Online)
            .collect())
    }

    fn set_location_health(
        &self,
        id: &str,
        healthy: bool,
        verified_at: Option<u64>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let loc = inner
            .locations
            .get_mut(id)
            .ok_or_else(|| FabricError::NotFound(format!("placement {}", id)))?;
        loc.healthy = healthy;
        if verified_at.is_some() {
            loc.last_verified_at = verified_at;
        }
        Ok(())
    }

    fn delete_location(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(loc) = inner.locations.remove(id) {
            inner.location_pair_index.remove(&(loc.chunk_id, loc.device_id));
        }
        Ok(())
    }

    fn delete_locations_by_chunk(&self, chunk_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let loc_ids: Vec<String> = inner
            .locations
            .values()
            .filter(|l| l.chunk_id == chunk_id)
            .map(|l| l.id.clone())
            .collect();
        for id in loc_ids {
            if let Some(loc) = inner.locations.remove(&id) {
                inner.location_pair_index.remove(&(loc.chunk_id, loc.device_id));
            }
        }
        Ok(())
    }
}
