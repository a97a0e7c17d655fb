//! Healer: restore missing replicas for degraded chunks.
//!
//! Consumes `heal-chunk` work items. Healing is idempotent: the job always
//! re-reads the current state, exits early when the world already moved on,
//! and only inserts placements that are genuinely missing (the placement
//! uniqueness constraint covers the races). Ciphertext is reused as-is,
//! from the staging store when still present, otherwise from any live
//! holder; re-encryption is never required.

use std::sync::Arc;

use tracing::{debug, info, warn};

use csf_common::{sha256_hex, FabricError, Result};
use csf_meta::{Chunk, ChunkLocation, ChunkState, Device, MetaStore};
use csf_storage::StagingStore;

use crate::connections::{encode_ciphertext, ConnectionRegistry, OutboundEvent};
use crate::distribution::confirm_replica;
use crate::placement::PlacementEngine;
use crate::queue::{Job, JobKind};

/// Concurrent heal jobs per worker.
pub const HEAL_CONCURRENCY: usize = 5;

pub struct Healer {
    store: Arc<dyn MetaStore>,
    placement: Arc<PlacementEngine>,
    connections: Arc<ConnectionRegistry>,
    staging: Arc<StagingStore>,
}

impl Healer {
    pub fn new(
        store: Arc<dyn MetaStore>,
        placement: Arc<PlacementEngine>,
        connections: Arc<ConnectionRegistry>,
        staging: Arc<StagingStore>,
    ) -> Self {
        Healer { store, placement, connections, staging }
    }

    /// Queue-worker entry point.
    pub async fn handle_job(&self, job: Job) -> Result<()> {
        match job.kind {
            JobKind::HealChunk { chunk_id, .. } => self.heal(&chunk_id).await,
            other => Err(FabricError::Internal(format!(
                "healer received unexpected job {}",
                other.label()
            ))),
        }
    }

    /// Get reusable ciphertext for the chunk: staged copy first, then any
    /// live holder. Either way the bytes must match the recorded hash.
    async fn obtain_ciphertext(
        &self,
        chunk: &Chunk,
        holders: &[(ChunkLocation, Device)],
    ) -> Result<Vec<u8>> {
        if let Some(staged) = self.staging.get(&chunk.id)? {
            if sha256_hex(&staged) == chunk.ciphertext_hash {
                return Ok(staged);
            }
            warn!("staged ciphertext for chunk {} is stale, ignoring", chunk.id);
        }

        for (_, device) in holders {
            if !self.connections.is_connected(&device.logical_device_id) {
                continue;
            }
            match self
                .connections
                .request_chunk(&device.logical_device_id, &chunk.id)
                .await
            {
                Ok(ciphertext) if sha256_hex(&ciphertext) == chunk.ciphertext_hash => {
                    return Ok(ciphertext)
                }
                Ok(_) => {
                    warn!(
                        "holder {} returned corrupt ciphertext for chunk {}",
                        device.logical_device_id, chunk.id
                    );
                }
                Err(e) => {
                    debug!(
                        "holder {} could not serve chunk {}: {}",
                        device.logical_device_id, chunk.id, e
                    );
                }
            }
        }
        Err(FabricError::Unavailable(format!(
            "no ciphertext source for chunk {}",
            chunk.id
        )))
    }

    /// Restore the chunk to its target replica count.
    pub async fn heal(&self, chunk_id: &str) -> Result<()> {
        // reload; a deleted chunk means the job is obsolete
        let chunk = match self.store.get_chunk(chunk_id)? {
            Some(c) => c,
            None => {
                debug!("heal: chunk {} no longer exists", chunk_id);
                return Ok(());
            }
        };

        let holders = self.store.healthy_holders(chunk_id)?;
        if holders.len() as u32 >= chunk.target_replicas {
            debug!("heal: chunk {} already satisfied", chunk_id);
            return Ok(());
        }

        let placed = self.placement.reassign(chunk_id)?;
        if placed.is_empty() {
            // no candidates right now; the next scan retries
            return Ok(());
        }

        let ciphertext = self.obtain_ciphertext(&chunk, &holders).await?;
        let mut restored = 0usize;
        for device in &placed {
            let event = OutboundEvent::ChunkAssign {
                chunk_id: chunk.id.clone(),
                file_id: chunk.file_id.clone(),
                sequence_num: chunk.sequence_num,
                size_bytes: chunk.size_bytes,
                iv: chunk.iv.clone(),
                auth_tag: chunk.auth_tag.clone(),
                aad: chunk.aad.clone(),
                checksum: chunk.ciphertext_hash.clone(),
                ciphertext_base64: encode_ciphertext(&ciphertext),
            };
            match self
                .connections
                .send_chunk(&device.logical_device_id, &chunk.id, event)
                .await
            {
                Ok(()) => {
                    confirm_replica(&self.store, &chunk, device)?;
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        "heal: send of chunk {} to {} failed: {}",
                        chunk.id, device.logical_device_id, e
                    );
                }
            }
        }

        // recount and settle the state
        let healthy = self.store.healthy_holders(chunk_id)?.len() as u32;
        let state = if healthy >= chunk.target_replicas {
            ChunkState::Healthy
        } else {
            ChunkState::Replicating
        };
        self.store.set_chunk_state(chunk_id, state)?;

        if restored == 0 {
            // nothing landed; let the queue retry with backoff
            return Err(FabricError::Unavailable(format!(
                "no replacement replica landed for chunk {}",
                chunk_id
            )));
        }
        info!(
            "heal: chunk {} restored {} replica(s), now {}/{}",
            chunk_id, restored, healthy, chunk.target_replicas
        );
        Ok(())
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
        staging: Arc<StagingStore>,
        healer: Healer,
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
        let healer =
            Healer::new(store.clone(), placement, connections.clone(), staging.clone());
        Fixture { store, connections, staging, healer, _tmp: tmp }
    }

    fn add_device(f: &Fixture, id: &str, state: DeviceState) -> Arc<MockDevice> {
        f.store
            .insert_device(Device {
                id: id.to_string(),
                logical_device_id: format!("logical-{}", id),
                device_type: "mobile".to_string(),
                owner_id: "o".to_string(),
                total_capacity_bytes: 10_000,
                available_capacity_bytes: 10_000,
                state,
                last_seen_at: 0,
                cumulative_uptime_ms: 0,
                cumulative_downtime_ms: 0,
                reliability_score: 100.0,
                meta: serde_json::json!({}),
            })
            .unwrap();
        let dev = MockDevice::new(&format!("logical-{}", id));
        if state == DeviceState::Online {
            dev.attach(&f.connections);
        }
        dev
    }

    fn seed_chunk(f: &Fixture, payload: &[u8], holders: &[(&str, &Arc<MockDevice>, bool)]) {
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
                id: "c1".to_string(),
                file_id: "f1".to_string(),
                sequence_num: 0,
                size_bytes: payload.len() as u64,
                iv: String::new(),
                auth_tag: String::new(),
                aad: String::new(),
                ciphertext_hash: sha256_hex(payload),
                state: ChunkState::Degraded,
                current_replicas: holders.iter().filter(|(_, _, h)| *h).count() as u32,
                target_replicas: 3,
            })
            .unwrap();
        for (device_id, dev, healthy) in holders {
            f.store
                .insert_location(ChunkLocation {
                    id: format!("l-{}", device_id),
                    chunk_id: "c1".to_string(),
                    device_id: device_id.to_string(),
                    local_path: String::new(),
                    healthy: *healthy,
                    last_verified_at: Some(1),
                })
                .unwrap();
            if *healthy {
                dev.preload("c1", payload);
            }
        }
    }

    #[tokio::test]
    async fn test_heal_from_staging() {
        let f = fixture();
        let d1 = add_device(&f, "d1", DeviceState::Online);
        let d2 = add_device(&f, "d2", DeviceState::Online);
        let d3 = add_device(&f, "d3", DeviceState::Online);
        let d4 = add_device(&f, "d4", DeviceState::Online);
        let _ = (&d2, &d3, &d4);
        seed_chunk(&f, b"ciphertext", &[("d1", &d1, true)]);
        f.staging.put("c1", b"ciphertext").unwrap();

        f.healer.heal("c1").await.expect("heal");

        let chunk = f.store.get_chunk("c1").unwrap().unwrap();
        assert_eq!(chunk.state, ChunkState::Healthy);
        // d1 plus two replacements
        assert_eq!(f.store.healthy_holders("c1").unwrap().len(), 3);
        // replacements actually hold the bytes
        let total_holding =
            [&d1, &d2, &d3, &d4].iter().filter(|d| d.holds("c1")).count();
        assert_eq!(total_holding, 3);
    }

    #[tokio::test]
    async fn test_heal_from_live_holder_when_unstaged() {
        let f = fixture();
        let d1 = add_device(&f, "d1", DeviceState::Online);
        let d2 = add_device(&f, "d2", DeviceState::Online);
        let d3 = add_device(&f, "d3", DeviceState::Online);
        let d4 = add_device(&f, "d4", DeviceState::Online);
        let _ = (&d3, &d4);
        seed_chunk(&f, b"replica bytes", &[("d1", &d1, true), ("d2", &d2, true)]);

        f.healer.heal("c1").await.expect("heal");
        assert_eq!(f.store.healthy_holders("c1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_heal_noop_when_satisfied() {
        let f = fixture();
        let d1 = add_device(&f, "d1", DeviceState::Online);
        let d2 = add_device(&f, "d2", DeviceState::Online);
        let d3 = add_device(&f, "d3", DeviceState::Online);
        seed_chunk(&f, b"x", &[("d1", &d1, true), ("d2", &d2, true), ("d3", &d3, true)]);

        f.healer.heal("c1").await.expect("noop");
        assert_eq!(f.store.locations_by_chunk("c1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_heal_missing_chunk_is_ok() {
        let f = fixture();
        f.healer.heal("ghost").await.expect("obsolete job acks");
    }

    #[tokio::test]
    async fn test_heal_without_source_errors_for_retry() {
        let f = fixture();
        let d1 = add_device(&f, "d1", DeviceState::Online);
        add_device(&f, "d2", DeviceState::Online);
        add_device(&f, "d3", DeviceState::Online);
        add_device(&f, "d4", DeviceState::Online);
        // d1 is a healthy holder on paper but serves corrupted bytes,
        // and nothing is staged
        seed_chunk(&f, b"original", &[("d1", &d1, true)]);
        d1.set_corrupt_reads(true);

        let err = f.healer.heal("c1").await.unwrap_err();
        assert!(matches!(err, FabricError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_heal_never_doubles_up_on_existing_holder() {
        let f = fixture();
        let d1 = add_device(&f, "d1", DeviceState::Online);
        let d2 = add_device(&f, "d2", DeviceState::Offline);
        let d3 = add_device(&f, "d3", DeviceState::Online);
        let d4 = add_device(&f, "d4", DeviceState::Online);
        let _ = (&d3, &d4);
        // d2 holds the chunk but is offline (placement unhealthy)
        seed_chunk(&f, b"bytes", &[("d1", &d1, true), ("d2", &d2, false)]);
        f.staging.put("c1", b"bytes").unwrap();

        f.healer.heal("c1").await.expect("heal");

        // exactly one placement row per device, and d2 gained none
        let locs = f.store.locations_by_chunk("c1").unwrap();
        let mut device_ids: Vec<&str> = locs.iter().map(|l| l.device_id.as_str()).collect();
        device_ids.sort();
        device_ids.dedup();
        assert_eq!(device_ids.len(), locs.len());
        assert_eq!(locs.iter().filter(|l| l.device_id == "d2").count(), 1);
    }
}
