//! Reaper: shed excess replicas and physically remove deleted files.
//!
//! Both job types are best-effort against the fleet: a device that is
//! offline or silent never blocks convergence. Whatever cannot be confirmed
//! now is left marked unhealthy for a later pass to reconcile.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use csf_common::{FabricError, Result};
use csf_meta::{DeviceState, MetaStore};
use csf_storage::StagingStore;

use crate::connections::ConnectionRegistry;
use crate::queue::{Job, JobKind};

/// Concurrent reaper jobs per worker.
pub const REAPER_CONCURRENCY: usize = 2;

pub struct Reaper {
    store: Arc<dyn MetaStore>,
    connections: Arc<ConnectionRegistry>,
    staging: Arc<StagingStore>,
    safety_margin: u32,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn MetaStore>,
        connections: Arc<ConnectionRegistry>,
        staging: Arc<StagingStore>,
        safety_margin: u32,
    ) -> Self {
        Reaper { store, connections, staging, safety_margin }
    }

    /// Queue-worker entry point.
    pub async fn handle_job(&self, job: Job) -> Result<()> {
        match job.kind {
            JobKind::DeleteFile { file_id, reason } => self.delete_file(&file_id, &reason).await,
            JobKind::TrimExcess { chunk_id } => self.trim_excess(&chunk_id).await,
            other => Err(FabricError::Internal(format!(
                "reaper received unexpected job {}",
                other.label()
            ))),
        }
    }

    /// Physically remove a logically deleted file: instruct every holder to
    /// drop its chunks, clear staged ciphertext, then drop the metadata
    /// rows (chunks cascade with the file row).
    pub async fn delete_file(&self, file_id: &str, reason: &str) -> Result<()> {
        let chunks = self.store.chunks_by_file(file_id)?;
        if chunks.is_empty() && self.store.get_file(file_id)?.is_none() {
            debug!("delete: file {} already gone", file_id);
            return Ok(());
        }

        for chunk in &chunks {
            let holders = self.store.holders(&chunk.id)?;
            let deletes = holders.iter().map(|(_, device)| {
                let chunk_id = chunk.id.clone();
                let size = chunk.size_bytes;
                async move {
                    if !self.connections.is_connected(&device.logical_device_id) {
                        return;
                    }
                    match self
                        .connections
                        .delete_chunk(&device.logical_device_id, &chunk_id, reason)
                        .await
                    {
                        Ok(true) => {
                            if let Err(e) =
                                self.store.adjust_device_capacity(&device.id, size as i64)
                            {
                                warn!("capacity restore failed for {}: {}", device.id, e);
                            }
                        }
                        Ok(false) => {
                            debug!(
                                "delete of chunk {} on {} unconfirmed",
                                chunk_id, device.logical_device_id
                            );
                        }
                        Err(e) => {
                            debug!(
                                "delete of chunk {} on {} failed: {}",
                                chunk_id, device.logical_device_id, e
                            );
                        }
                    }
                }
            });
            join_all(deletes).await;

            self.staging.remove(&chunk.id)?;
            self.store.delete_locations_by_chunk(&chunk.id)?;
        }

        self.store.delete_file(file_id)?;
        info!("file {} reaped ({} chunks, reason: {})", file_id, chunks.len(), reason);
        Ok(())
    }

    /// Reduce a chunk's healthy replicas to `target + safety_margin`,
    /// dropping the lowest-reliability holders first.
    pub async fn trim_excess(&self, chunk_id: &str) -> Result<()> {
        let chunk = match self.store.get_chunk(chunk_id)? {
            Some(c) => c,
            None => {
                debug!("trim: chunk {} no longer exists", chunk_id);
                return Ok(());
            }
        };

        let mut holders = self.store.healthy_holders(chunk_id)?;
        let allowed = (chunk.target_replicas + self.safety_margin) as usize;
        if holders.len() <= allowed {
            return Ok(());
        }
        let excess = holders.len() - allowed;

        // victims: lowest reliability first, id as the deterministic tie-break
        holders.sort_by(|a, b| {
            a.1.reliability_score
                .partial_cmp(&b.1.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let mut trimmed = 0usize;
        for (location, device) in holders.into_iter().take(excess) {
            if device.state != DeviceState::Online
                || !self.connections.is_connected(&device.logical_device_id)
            {
                // unreachable right now: flag it and let reconciliation pick
                // it up rather than blocking the trim
                self.store.set_location_health(&location.id, false, None)?;
                continue;
            }
            match self
                .connections
                .delete_chunk(&device.logical_device_id, chunk_id, "over-replicated")
                .await
            {
                Ok(true) => {
                    self.store.adjust_chunk_replicas(chunk_id, -1)?;
                    self.store.adjust_device_capacity(&device.id, chunk.size_bytes as i64)?;
                    self.store.delete_location(&location.id)?;
                    trimmed += 1;
                }
                Ok(false) => {
                    self.store.set_location_health(&location.id, false, None)?;
                }
                Err(e) => {
                    debug!(
                        "trim of chunk {} on {} failed: {}",
                        chunk_id, device.logical_device_id, e
                    );
                    self.store.set_location_health(&location.id, false, None)?;
                }
            }
        }

        info!("trim: chunk {} shed {} excess replica(s)", chunk_id, trimmed);
        Ok(())
    }
}
