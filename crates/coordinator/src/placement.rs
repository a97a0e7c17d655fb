//! Placement engine: choose which ONLINE devices host which chunk.
//!
//! Candidates come from the registry's ranked query (score, then free
//! space, then id). Placement is optimistic: when two jobs race to insert
//! the same `(chunk, device)` row, the loser's uniqueness violation is
//! treated as success.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use csf_common::{new_row_id, FabricError, Result};
use csf_meta::{ChunkLocation, ChunkState, Device, DeviceState, MetaStore};

pub struct PlacementEngine {
    store: Arc<dyn MetaStore>,
    redundancy_factor: u32,
    min_reliability: f64,
}

impl PlacementEngine {
    pub fn new(store: Arc<dyn MetaStore>, redundancy_factor: u32, min_reliability: f64) -> Self {
        PlacementEngine { store, redundancy_factor, min_reliability }
    }

    fn candidate_pool(&self, size: u64) -> Result<Vec<Device>> {
        self.store.find_placement_candidates(
            size,
            self.min_reliability,
            (3 * self.redundancy_factor) as usize,
        )
    }

    fn synthetic_path(chunk_id: &str) -> String {
        format!("chunks/{}.chunk", chunk_id)
    }

    /// Initial placement for a chunk of `size` bytes. Selects the top
    /// `target_replicas` candidates, writes placement rows (healthy until a
    /// missing ack proves otherwise), and moves the chunk to REPLICATING.
    pub fn assign(&self, chunk_id: &str, size: u64) -> Result<Vec<Device>> {
        let chunk = self
            .store
            .get_chunk(chunk_id)?
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", chunk_id)))?;
        let target = chunk.target_replicas as usize;

        let candidates = self.candidate_pool(size)?;
        if candidates.len() < target {
            return Err(FabricError::InsufficientCapacity {
                needed: target,
                found: candidates.len(),
            });
        }

        let selected: Vec<Device> = candidates.into_iter().take(target).collect();
        for device in &selected {
            let insert = self.store.insert_location(ChunkLocation {
                id: new_row_id(),
                chunk_id: chunk_id.to_string(),
                device_id: device.id.clone(),
                local_path: Self::synthetic_path(chunk_id),
                healthy: true,
                last_verified_at: None,
            });
            match insert {
                Ok(()) => {}
                Err(FabricError::Conflict(_)) => {
                    debug!("placement ({}, {}) already exists", chunk_id, device.id);
                }
                Err(e) => return Err(e),
            }
        }

        self.store.set_chunk_state(chunk_id, ChunkState::Replicating)?;
        self.store.set_chunk_replicas(chunk_id, 0)?;
        Ok(selected)
    }

    /// Replacement placement for a degraded chunk. Inserts rows only for the
    /// missing replica count, never on a device that already holds the
    /// chunk, and leaves them unhealthy until the device acks. Returns the
    /// devices that received new rows; an empty result means either nothing
    /// is missing or no candidate exists right now (the next scan retries).
    pub fn reassign(&self, chunk_id: &str) -> Result<Vec<Device>> {
        let chunk = self
            .store
            .get_chunk(chunk_id)?
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", chunk_id)))?;

        let holders = self.store.holders(chunk_id)?;
        let holding: HashSet<&str> = holders.iter().map(|(l, _)| l.device_id.as_str()).collect();
        let healthy = holders
            .iter()
            .filter(|(l, d)| l.healthy && d.state == DeviceState::Online)
            .count() as u32;

        if healthy >= chunk.target_replicas {
            return Ok(Vec::new());
        }
        let missing = (chunk.target_replicas - healthy) as usize;

        let candidates: Vec<Device> = self
            .candidate_pool(chunk.size_bytes)?
            .into_iter()
            .filter(|d| !holding.contains(d.id.as_str()))
            .take(missing)
            .collect();
        if candidates.is_empty() {
            info!("no placement candidates for chunk {}, deferring to next scan", chunk_id);
            return Ok(Vec::new());
        }

        let mut placed = Vec::with_capacity(candidates.len());
        for device in candidates {
            let insert = self.store.insert_location(ChunkLocation {
                id: new_row_id(),
                chunk_id: chunk_id.to_string(),
                device_id: device.id.clone(),
                local_path: Self::synthetic_path(chunk_id),
                healthy: false,
                last_verified_at: None,
            });
            match insert {
                Ok(()) => placed.push(device),
                Err(FabricError::Conflict(_)) => {
                    debug!("raced placement ({}, {}), skipping", chunk_id, device.id);
                }
                Err(e) => return Err(e),
            }
        }

        if !placed.is_empty() {
            self.store.set_chunk_state(chunk_id, ChunkState::Replicating)?;
        }
        Ok(placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csf_meta::{Chunk, MemoryMetaStore};

    fn device(id: &str, score: f64, available: u64) -> Device {
        Device {
            id: id.to_string(),
            logical_device_id: format!("logical-{}", id),
            device_type: "mobile".to_string(),
            owner_id: "o".to_string(),
            total_capacity_bytes: 1_000_000,
            available_capacity_bytes: available,
            state: DeviceState::Online,
            last_seen_at: 0,
            cumulative_uptime_ms: 0,
            cumulative_downtime_ms: 0,
            reliability_score: score,
            meta: serde_json::json!({}),
        }
    }

    fn chunk(id: &str, target: u32) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_id: "f1".to_string(),
            sequence_num: 0,
            size_bytes: 100,
            iv: String::new(),
            auth_tag: String::new(),
            aad: String::new(),
            ciphertext_hash: String::new(),
            state: ChunkState::Pending,
            current_replicas: 0,
            target_replicas: target,
        }
    }

    fn engine(store: Arc<MemoryMetaStore>) -> PlacementEngine {
        PlacementEngine::new(store, 3, 70.0)
    }

    #[test]
    fn test_assign_selects_top_candidates() {
        let store = Arc::new(MemoryMetaStore::new());
        store.insert_device(device("a", 100.0, 5000)).unwrap();
        store.insert_device(device("b", 90.0, 5000)).unwrap();
        store.insert_device(device("c", 95.0, 5000)).unwrap();
        store.insert_device(device("d", 80.0, 5000)).unwrap();
        store.insert_chunk(chunk("c1", 3)).unwrap();

        let selected = engine(store.clone()).assign("c1", 100).unwrap();
        let ids: Vec<&str> = selected.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let locs = store.locations_by_chunk("c1").unwrap();
        assert_eq!(locs.len(), 3);
        assert!(locs.iter().all(|l| l.healthy));
        assert!(locs.iter().all(|l| l.local_path == "chunks/c1.chunk"));

        let c = store.get_chunk("c1").unwrap().unwrap();
        assert_eq!(c.state, ChunkState::Replicating);
        assert_eq!(c.current_replicas, 0);
    }

    #[test]
    fn test_assign_insufficient_capacity() {
        let store = Arc::new(MemoryMetaStore::new());
        store.insert_device(device("a", 100.0, 5000)).unwrap();
        store.insert_device(device("b", 60.0, 5000)).unwrap(); // below threshold
        store.insert_chunk(chunk("c1", 3)).unwrap();

        let err = engine(store).assign("c1", 100).unwrap_err();
        assert!(matches!(err, FabricError::InsufficientCapacity { needed: 3, found: 1 }));
    }

    #[test]
    fn test_assign_rerun_creates_no_duplicates() {
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["a", "b", "c"] {
            store.insert_device(device(id, 100.0, 5000)).unwrap();
        }
        store.insert_chunk(chunk("c1", 3)).unwrap();

        let e = engine(store.clone());
        e.assign("c1", 100).unwrap();
        e.assign("c1", 100).unwrap();
        assert_eq!(store.locations_by_chunk("c1").unwrap().len(), 3);
    }

    #[test]
    fn test_reassign_noop_when_satisfied() {
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["a", "b", "c"] {
            store.insert_device(device(id, 100.0, 5000)).unwrap();
        }
        store.insert_chunk(chunk("c1", 3)).unwrap();
        let e = engine(store.clone());
        e.assign("c1", 100).unwrap();

        assert!(e.reassign("c1").unwrap().is_empty());
    }

    #[test]
    fn test_reassign_excludes_existing_holders() {
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["a", "b", "c", "d", "e"] {
            store.insert_device(device(id, 100.0, 5000)).unwrap();
        }
        store.insert_chunk(chunk("c1", 3)).unwrap();
        let e = engine(store.clone());
        e.assign("c1", 100).unwrap();

        // lose one holder: flip its placement unhealthy
        let locs = store.locations_by_chunk("c1").unwrap();
        store.set_location_health(&locs[0].id, false, None).unwrap();

        let placed = e.reassign("c1").unwrap();
        assert_eq!(placed.len(), 1);
        // the replacement is none of the existing holders, even the
        // unhealthy one
        let holder_ids: Vec<String> =
            locs.iter().map(|l| l.device_id.clone()).collect();
        assert!(!holder_ids.contains(&placed[0].id));

        // new row awaits an ack
        let new_loc = store
            .locations_by_chunk("c1")
            .unwrap()
            .into_iter()
            .find(|l| l.device_id == placed[0].id)
            .unwrap();
        assert!(!new_loc.healthy);
        assert_eq!(store.get_chunk("c1").unwrap().unwrap().state, ChunkState::Replicating);
    }

    #[test]
    fn test_reassign_without_candidates_defers() {
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["a", "b", "c"] {
            store.insert_device(device(id, 100.0, 5000)).unwrap();
        }
        store.insert_chunk(chunk("c1", 3)).unwrap();
        let e = engine(store.clone());
        e.assign("c1", 100).unwrap();

        // every eligible device already holds the chunk; one goes dark
        let locs = store.locations_by_chunk("c1").unwrap();
        store.set_location_health(&locs[0].id, false, None).unwrap();

        // no error, no insert
        assert!(e.reassign("c1").unwrap().is_empty());
        assert_eq!(store.locations_by_chunk("c1").unwrap().len(), 3);
    }

    #[test]
    fn test_reassign_counts_only_online_holders() {
        let store = Arc::new(MemoryMetaStore::new());
        for id in ["a", "b", "c", "d"] {
            store.insert_device(device(id, 100.0, 5000)).unwrap();
        }
        store.insert_chunk(chunk("c1", 3)).unwrap();
        let e = engine(store.clone());
        e.assign("c1", 100).unwrap();

        // device "a" goes offline; its row is still healthy=true but the
        // device no longer counts
        let mut a = store.get_device("a").unwrap().unwrap();
        a.state = DeviceState::Offline;
        store.update_device(&a).unwrap();

        let placed = e.reassign("c1").unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].id, "d");
    }
}
