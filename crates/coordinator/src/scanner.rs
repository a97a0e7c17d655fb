//! Health scanner: continuous classification of chunk health.
//!
//! The scanner is the eventual-consistency engine. It recounts healthy
//! placements per chunk (I1), reclassifies chunk state, and emits work for
//! the healer and the reaper. It never talks to devices itself.
//!
//! Priority rules for `heal-chunk`:
//! - 1 when no healthy replica remains (lost, critical)
//! - 2 when below half the target
//! - 3 otherwise

use std::sync::Arc;

use tracing::{debug, info, warn};

use csf_common::Result;
use csf_meta::{ChunkState, MetaStore};

use crate::queue::{JobKind, MemoryJobQueue};

/// States the periodic scan inspects. PENDING chunks have not been placed
/// yet; LOST chunks were already enqueued at the transition that lost them.
const SCANNED_STATES: [ChunkState; 3] =
    [ChunkState::Replicating, ChunkState::Healthy, ChunkState::Degraded];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub heal_enqueued: usize,
    pub trim_enqueued: usize,
    pub degraded: usize,
    pub lost: usize,
}

/// Fleet-wide counts for the periodic summary log.
#[derive(Debug, Default, Clone)]
pub struct FleetSummary {
    pub chunks_pending: usize,
    pub chunks_replicating: usize,
    pub chunks_healthy: usize,
    pub chunks_degraded: usize,
    pub chunks_lost: usize,
    pub devices_online: usize,
    pub devices_offline: usize,
    pub devices_suspended: usize,
}

pub struct HealthScanner {
    store: Arc<dyn MetaStore>,
    heal_queue: Arc<MemoryJobQueue>,
    reaper_queue: Arc<MemoryJobQueue>,
    safety_margin: u32,
}

/// Heal priority for a chunk with `healthy` live replicas of `target`.
pub fn heal_priority(healthy: u32, target: u32) -> u8 {
    if healthy == 0 {
        1
    } else if (healthy as f64) < target as f64 / 2.0 {
        2
    } else {
        3
    }
}

impl HealthScanner {
    pub fn new(
        store: Arc<dyn MetaStore>,
        heal_queue: Arc<MemoryJobQueue>,
        reaper_queue: Arc<MemoryJobQueue>,
        safety_margin: u32,
    ) -> Self {
        HealthScanner { store, heal_queue, reaper_queue, safety_margin }
    }

    /// One full classification pass over every replicated chunk.
    pub fn scan_all(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let chunks = self.store.chunks_in_states(&SCANNED_STATES)?;
        for chunk in chunks {
            report.scanned += 1;
            let healthy = self.store.healthy_holders(&chunk.id)?.len() as u32;
            let target = chunk.target_replicas;

            // I1: the replica counter is recomputed here, not trusted.
            if healthy != chunk.current_replicas {
                self.store.set_chunk_replicas(&chunk.id, healthy)?;
            }

            if healthy < target {
                let priority = heal_priority(healthy, target);
                let next_state = if healthy == 0 { ChunkState::Lost } else { ChunkState::Degraded };
                if chunk.state != next_state {
                    self.store.set_chunk_state(&chunk.id, next_state)?;
                }
                if next_state == ChunkState::Lost {
                    report.lost += 1;
                    warn!("chunk {} has no live replica", chunk.id);
                } else {
                    report.degraded += 1;
                }
                if self.heal_queue.enqueue(
                    JobKind::HealChunk { chunk_id: chunk.id.clone(), current: healthy, target },
                    priority,
                ) {
                    report.heal_enqueued += 1;
                }
            } else if healthy > target + self.safety_margin {
                if self
                    .reaper_queue
                    .enqueue(JobKind::TrimExcess { chunk_id: chunk.id.clone() }, 3)
                {
                    report.trim_enqueued += 1;
                }
            }
        }
        info!(
            "scan complete: {} chunks, {} heal jobs, {} trim jobs, {} degraded, {} lost",
            report.scanned, report.heal_enqueued, report.trim_enqueued, report.degraded, report.lost
        );
        Ok(report)
    }

    /// Over-replication sweep only; runs on the trim interval.
    pub fn scan_excess(&self) -> Result<usize> {
        let mut enqueued = 0usize;
        for chunk in self.store.chunks_in_states(&SCANNED_STATES)? {
            let healthy = self.store.healthy_holders(&chunk.id)?.len() as u32;
            if healthy > chunk.target_replicas + self.safety_margin
                && self.reaper_queue.enqueue(JobKind::TrimExcess { chunk_id: chunk.id.clone() }, 3)
            {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!("excess sweep enqueued {} trim jobs", enqueued);
        }
        Ok(enqueued)
    }

    /// Targeted pass run synchronously when a device leaves ONLINE: every
    /// placement on the device is flipped unhealthy, affected chunks are
    /// recounted and queued for healing. Returns the number of heal jobs.
    pub fn detect_affected(&self, device_id: &str) -> Result<usize> {
        let mut enqueued = 0usize;
        let locations = self.store.locations_by_device(device_id)?;
        debug!("device {} left ONLINE, checking {} placements", device_id, locations.len());
        for location in locations {
            if location.healthy {
                self.store.set_location_health(&location.id, false, None)?;
            }
            let chunk = match self.store.get_chunk(&location.chunk_id)? {
                Some(c) => c,
                None => continue,
            };
            let healthy = self.store.healthy_holders(&chunk.id)?.len() as u32;
            self.store.set_chunk_replicas(&chunk.id, healthy)?;

            if healthy < chunk.target_replicas {
                let next_state =
                    if healthy == 0 { ChunkState::Lost } else { ChunkState::Degraded };
                if chunk.state != next_state {
                    self.store.set_chunk_state(&chunk.id, next_state)?;
                }
                if self.heal_queue.enqueue(
                    JobKind::HealChunk {
                        chunk_id: chunk.id.clone(),
                        current: healthy,
                        target: chunk.target_replicas,
                    },
                    heal_priority(healthy, chunk.target_replicas),
                ) {
                    enqueued += 1;
                }
            }
        }
        Ok(enqueued)
    }

    /// Counts for the summary log line.
    pub fn summary(&self) -> Result<FleetSummary> {
        let mut summary = FleetSummary::default();
        let all = [
            ChunkState::Pending,
            ChunkState::Replicating,
            ChunkState::Healthy,
            ChunkState::Degraded,
            ChunkState::Lost,
        ];
        for chunk in self.store.chunks_in_states(&all)? {
            match chunk.state {
                ChunkState::Pending => summary.chunks_pending += 1,
                ChunkState::Replicating => summary.chunks_replicating += 1,
                ChunkState::Healthy => summary.chunks_healthy += 1,
                ChunkState::Degraded => summary.chunks_degraded += 1,
                ChunkState::Lost => summary.chunks_lost += 1,
            }
        }
        for device in self.store.list_devices()? {
            match device.state {
                csf_meta::DeviceState::Online => summary.devices_online += 1,
                csf_meta::DeviceState::Offline => summary.devices_offline += 1,
                csf_meta::DeviceState::Suspended => summary.devices_suspended += 1,
            }
        }
        Ok(summary)
    }
}
