//! Distribution: materialize a placement by shipping staged ciphertext to
//! each selected device.
//!
//! Sends fan out concurrently with all-settled semantics: one slow or dead
//! device never blocks the others, and a failed send just leaves its
//! placement row for the scanner to reconcile.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use csf_common::{current_timestamp_ms, FabricError, Result};
use csf_meta::{Chunk, ChunkState, Device, MetaStore};
use csf_storage::StagingStore;

use crate::connections::{encode_ciphertext, ConnectionRegistry, OutboundEvent};
use crate::placement::PlacementEngine;

/// Record one successful write ack: the placement is confirmed, the device
/// gave up `size` bytes, and the replica counter moves up. The HEALTHY
/// transition happens exactly once, when the counter crosses the target.
pub(crate) fn confirm_replica(
    store: &Arc<dyn MetaStore>,
    chunk: &Chunk,
    device: &Device,
) -> Result<()> {
    let now = current_timestamp_ms();
    if let Some(location) = store
        .locations_by_chunk(&chunk.id)?
        .into_iter()
        .find(|l| l.device_id == device.id)
    {
        store.set_location_health(&location.id, true, Some(now))?;
    }
    store.adjust_device_capacity(&device.id, -(chunk.size_bytes as i64))?;
    let replicas = store.adjust_chunk_replicas(&chunk.id, 1)?;
    if replicas == chunk.target_replicas {
        store.set_chunk_state(&chunk.id, ChunkState::Healthy)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ChunkDistribution {
    pub chunk_id: String,
    pub attempted: usize,
    pub acked: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FileDistribution {
    pub file_id: String,
    pub chunks: Vec<ChunkDistribution>,
    /// `(sequence_num, error)` for chunks that failed outright.
    pub errors: Vec<(u32, String)>,
}

pub struct Distributor {
    store: Arc<dyn MetaStore>,
    placement: Arc<PlacementEngine>,
    connections: Arc<ConnectionRegistry>,
    staging: Arc<StagingStore>,
}

impl Distributor {
    pub fn new(
        store: Arc<dyn MetaStore>,
        placement: Arc<PlacementEngine>,
        connections: Arc<ConnectionRegistry>,
        staging: Arc<StagingStore>,
    ) -> Self {
        Distributor { store, placement, connections, staging }
    }

    fn assign_event(chunk: &Chunk, ciphertext: &[u8]) -> OutboundEvent {
        OutboundEvent::ChunkAssign {
            chunk_id: chunk.id.clone(),
            file_id: chunk.file_id.clone(),
            sequence_num: chunk.sequence_num,
            size_bytes: chunk.size_bytes,
            iv: chunk.iv.clone(),
            auth_tag: chunk.auth_tag.clone(),
            aad: chunk.aad.clone(),
            checksum: chunk.ciphertext_hash.clone(),
            ciphertext_base64: encode_ciphertext(ciphertext),
        }
    }

    /// Drive placement and shipping for one staged chunk.
    pub async fn distribute_chunk(&self, chunk_id: &str) -> Result<ChunkDistribution> {
        let chunk = self
            .store
            .get_chunk(chunk_id)?
            .ok_or_else(|| FabricError::NotFound(format!("chunk {}", chunk_id)))?;
        self.store
            .get_file(&chunk.file_id)?
            .ok_or_else(|| FabricError::NotFound(format!("file {}", chunk.file_id)))?;
        let ciphertext = self
            .staging
            .get(chunk_id)?
            .ok_or_else(|| FabricError::Unavailable(format!("chunk {} not staged", chunk_id)))?;

        let devices = self.placement.assign(chunk_id, chunk.size_bytes)?;

        let chunk_ref = &chunk;
        let sends = devices.iter().map(|device| {
            let event = Self::assign_event(chunk_ref, &ciphertext);
            async move {
                self.connections
                    .send_chunk(&device.logical_device_id, &chunk_ref.id, event)
                    .await
            }
        });
        let results = join_all(sends).await;

        let mut acked = 0usize;
        for (device, result) in devices.iter().zip(results) {
            match result {
                Ok(()) => {
                    confirm_replica(&self.store, &chunk, device)?;
                    acked += 1;
                }
                Err(e) => {
                    warn!(
                        "send of chunk {} to {} failed: {}",
                        chunk.id, device.logical_device_id, e
                    );
                }
            }
        }

        if (acked as u32) < chunk.target_replicas {
            self.store.set_chunk_state(&chunk.id, ChunkState::Degraded)?;
        }

        info!("chunk {} distributed to {}/{} devices", chunk.id, acked, devices.len());
        Ok(ChunkDistribution { chunk_id: chunk.id.clone(), attempted: devices.len(), acked })
    }

    /// Distribute every chunk of a file in sequence order. A failing chunk
    /// does not halt the rest; errors are aggregated in the result.
    pub async fn distribute_file(&self, file_id: &str) -> Result<FileDistribution> {
        self.store
            .get_file(file_id)?
            .ok_or_else(|| FabricError::NotFound(format!("file {}", file_id)))?;
        let chunks = self.store.chunks_by_file(file_id)?;

        let mut out = FileDistribution { file_id: file_id.to_string(), ..Default::default() };
        for chunk in chunks {
            match self.distribute_chunk(&chunk.id).await {
                Ok(d) => out.chunks.push(d),
                Err(e) => {
                    warn!("distribution of chunk {} failed: {}", chunk.id, e);
                    out.errors.push((chunk.sequence_num, e.to_string()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use csf_meta::{DeviceState, FileRecord, FileState, MemoryMetaStore};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<MemoryMetaStore>,
        connections: Arc<ConnectionRegistry>,
        distributor: Distributor,
        staging: Arc<StagingStore>,
        _tmp: TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tmpdir");
        let store = Arc::new(MemoryMetaStore::new());
        let staging = Arc::new(StagingStore::new(tmp.path()).expect("staging"));
        let connections = Arc::new(ConnectionRegistry::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(50),
        ));
        let placement = Arc::new(PlacementEngine::new(store.clone(), 3, 70.0));
        let distributor =
            Distributor::new(store.clone(), placement, connections.clone(), staging.clone());
        Fixture { store, connections, distributor, staging, _tmp: tmp }
    }

    fn add_device(f: &Fixture, id: &str) -> Arc<MockDevice> {
        f.store
            .insert_device(csf_meta::Device {
                id: id.to_string(),
                logical_device_id: format!("logical-{}", id),
                device_type: "mobile".to_string(),
                owner_id: "o".to_string(),
                total_capacity_bytes: 10_000,
                available_capacity_bytes: 10_000,
                state: DeviceState::Online,
                last_seen_at: 0,
                cumulative_uptime_ms: 0,
                cumulative_downtime_ms: 0,
                reliability_score: 100.0,
                meta: serde_json::json!({}),
            })
            .unwrap();
        let dev = MockDevice::new(&format!("logical-{}", id));
        dev.attach(&f.connections);
        dev
    }

    fn add_file_and_chunk(f: &Fixture, chunk_id: &str, payload: &[u8]) {
        f.store
            .insert_file(FileRecord {
                id: "f1".to_string(),
                original_name: "a".to_string(),
                mime: "application/octet-stream".to_string(),
                size_bytes: payload.len() as u64,
                owner_id: "o".to_string(),
                wrapped_dek: String::new(),
                dek_id: String::new(),
                plaintext_hash: String::new(),
                state: FileState::Active,
                chunk_count: 1,
            })
            .unwrap();
        f.store
            .insert_chunk(Chunk {
                id: chunk_id.to_string(),
                file_id: "f1".to_string(),
                sequence_num: 0,
                size_bytes: payload.len() as u64,
                iv: String::new(),
                auth_tag: String::new(),
                aad: String::new(),
                ciphertext_hash: String::new(),
                state: ChunkState::Pending,
                current_replicas: 0,
                target_replicas: 3,
            })
            .unwrap();
        f.staging.put(chunk_id, payload).unwrap();
    }

    #[tokio::test]
    async fn test_distribute_all_acked() {
        let f = fixture();
        let devs: Vec<_> = ["a", "b", "c"].iter().map(|id| add_device(&f, id)).collect();
        add_file_and_chunk(&f, "c1", b"ciphertext");

        let d = f.distributor.distribute_chunk("c1").await.expect("distribute");
        assert_eq!(d.attempted, 3);
        assert_eq!(d.acked, 3);

        let chunk = f.store.get_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Healthy);
        assert_eq!(chunk.current_replicas, 3);

        for dev in &devs {
            assert!(dev.holds("c1"));
        }
        // capacity decremented, placements confirmed
        for id in ["a", "b", "c"] {
            let device = f.store.get_device(id).unwrap().unwrap();
            assert_eq!(device.available_capacity_bytes, 10_000 - 10);
        }
        for loc in f.store.locations_by_chunk("c1").unwrap() {
            assert!(loc.healthy);
            assert!(loc.last_verified_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_partial_ack_marks_degraded() {
        let f = fixture();
        add_device(&f, "a");
        add_device(&f, "b");
        let bad = add_device(&f, "c");
        bad.set_reject_writes(true);
        add_file_and_chunk(&f, "c1", b"ciphertext");

        let d = f.distributor.distribute_chunk("c1").await.expect("distribute");
        assert_eq!(d.acked, 2);

        let chunk = f.store.get_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Degraded);
        assert_eq!(chunk.current_replicas, 2);
    }

    #[tokio::test]
    async fn test_unstaged_chunk_is_unavailable() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            add_device(&f, id);
        }
        add_file_and_chunk(&f, "c1", b"x");
        f.staging.remove("c1").unwrap();

        let err = f.distributor.distribute_chunk("c1").await.unwrap_err();
        assert!(matches!(err, FabricError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_on_placements() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            add_device(&f, id);
        }
        add_file_and_chunk(&f, "c1", b"ciphertext");

        f.distributor.distribute_chunk("c1").await.expect("first");
        f.distributor.distribute_chunk("c1").await.expect("second");
        // the unique constraint keeps a single row per (chunk, device)
        assert_eq!(f.store.locations_by_chunk("c1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_distribute_file_aggregates_errors() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            add_device(&f, id);
        }
        add_file_and_chunk(&f, "c1", b"ciphertext");
        // second chunk exists but was never staged
        f.store
            .insert_chunk(Chunk {
                id: "c2".to_string(),
                file_id: "f1".to_string(),
                sequence_num: 1,
                size_bytes: 4,
                iv: String::new(),
                auth_tag: String::new(),
                aad: String::new(),
                ciphertext_hash: String::new(),
                state: ChunkState::Pending,
                current_replicas: 0,
                target_replicas: 3,
            })
            .unwrap();

        let out = f.distributor.distribute_file("f1").await.expect("file distribution");
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].0, 1);
    }
}
