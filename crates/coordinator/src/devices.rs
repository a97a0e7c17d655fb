//! Device registry: identity, lifecycle, capacity, and reliability.
//!
//! Uptime accounting is interval-based: the gap since `last_seen_at` is
//! attributed to uptime on a heartbeat and to downtime on a reconnect or an
//! offline transition. The reliability score is a pure function of the two
//! counters, so it can always be recomputed from the row.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use csf_common::{current_timestamp_ms, new_row_id, FabricError, Result};
use csf_meta::{Device, DeviceState, MetaStore};

use crate::connections::RegisterPayload;
use crate::scanner::HealthScanner;

/// `score = clamp(round(100 · uptime / (uptime + downtime), 2), 0, 100)`;
/// a device with no history scores 100.
pub fn reliability_score(uptime_ms: u64, downtime_ms: u64) -> f64 {
    let total = uptime_ms.saturating_add(downtime_ms);
    if total == 0 {
        return 100.0;
    }
    let pct = 100.0 * uptime_ms as f64 / total as f64;
    ((pct * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// Snapshot returned by [`DeviceRegistry::health`].
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHealth {
    pub online: bool,
    pub reliability_score: f64,
    pub uptime_pct: f64,
    pub consecutive_downtime_ms: u64,
    pub last_seen_at: u64,
}

pub struct DeviceRegistry {
    store: Arc<dyn MetaStore>,
    scanner: Arc<HealthScanner>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn MetaStore>, scanner: Arc<HealthScanner>) -> Self {
        DeviceRegistry { store, scanner }
    }

    /// Upsert by logical device id. First sight creates the row ONLINE with
    /// a perfect score; a reconnect books the silent gap as downtime and
    /// brings the device back ONLINE. Upsert is idempotent.
    pub fn register(&self, payload: &RegisterPayload) -> Result<Device> {
        let now = current_timestamp_ms();
        match self.store.get_device_by_logical(&payload.logical_device_id)? {
            None => {
                let device = Device {
                    id: new_row_id(),
                    logical_device_id: payload.logical_device_id.clone(),
                    device_type: payload.device_type.clone(),
                    owner_id: payload.owner_id.clone(),
                    total_capacity_bytes: payload.total_capacity_bytes,
                    available_capacity_bytes: payload.total_capacity_bytes,
                    state: DeviceState::Online,
                    last_seen_at: now,
                    cumulative_uptime_ms: 0,
                    cumulative_downtime_ms: 0,
                    reliability_score: 100.0,
                    meta: serde_json::json!({
                        "model": payload.model,
                        "os": payload.os,
                        "app": payload.app,
                    }),
                };
                self.store.insert_device(device.clone())?;
                info!("device {} registered", device.logical_device_id);
                Ok(device)
            }
            Some(mut device) => {
                if device.state == DeviceState::Suspended {
                    // terminal state: refresh bookkeeping, never revive
                    device.last_seen_at = now;
                    device.total_capacity_bytes = payload.total_capacity_bytes;
                    self.store.update_device(&device)?;
                    return Ok(device);
                }
                let gap = now.saturating_sub(device.last_seen_at);
                device.cumulative_downtime_ms =
                    device.cumulative_downtime_ms.saturating_add(gap);
                device.reliability_score = reliability_score(
                    device.cumulative_uptime_ms,
                    device.cumulative_downtime_ms,
                );
                device.state = DeviceState::Online;
                device.last_seen_at = now;
                device.total_capacity_bytes = payload.total_capacity_bytes;
                self.store.update_device(&device)?;
                info!(
                    "device {} reconnected (score {})",
                    device.logical_device_id, device.reliability_score
                );
                Ok(device)
            }
        }
    }

    /// Book the gap since last contact as uptime, refresh capacity, keep
    /// ONLINE. Unknown devices must register first.
    pub fn heartbeat(&self, logical_device_id: &str, available_bytes: u64) -> Result<Device> {
        let mut device = self
            .store
            .get_device_by_logical(logical_device_id)?
            .ok_or_else(|| FabricError::NotFound(format!("device {}", logical_device_id)))?;
        let now = current_timestamp_ms();

        if device.state == DeviceState::Suspended {
            device.last_seen_at = now;
            device.available_capacity_bytes =
                available_bytes.min(device.total_capacity_bytes);
            self.store.update_device(&device)?;
            return Ok(device);
        }

        let gap = now.saturating_sub(device.last_seen_at);
        device.cumulative_uptime_ms = device.cumulative_uptime_ms.saturating_add(gap);
        device.reliability_score =
            reliability_score(device.cumulative_uptime_ms, device.cumulative_downtime_ms);
        device.state = DeviceState::Online;
        device.last_seen_at = now;
        device.available_capacity_bytes = available_bytes.min(device.total_capacity_bytes);
        self.store.update_device(&device)?;
        Ok(device)
    }

    /// Refresh reported free space without touching uptime accounting.
    pub fn update_capacity(&self, logical_device_id: &str, available_bytes: u64) -> Result<()> {
        let mut device = self
            .store
            .get_device_by_logical(logical_device_id)?
            .ok_or_else(|| FabricError::NotFound(format!("device {}", logical_device_id)))?;
        device.available_capacity_bytes = available_bytes.min(device.total_capacity_bytes);
        self.store.update_device(&device)?;
        Ok(())
    }

    /// Transition ONLINE -> OFFLINE, booking the silent gap as downtime, and
    /// synchronously queue healing for every chunk placed on the device.
    /// Idempotent when the device is already offline. Returns the number of
    /// heal jobs enqueued.
    pub fn mark_offline(&self, logical_device_id: &str) -> Result<usize> {
        let mut device = self
            .store
            .get_device_by_logical(logical_device_id)?
            .ok_or_else(|| FabricError::NotFound(format!("device {}", logical_device_id)))?;
        if device.state != DeviceState::Online {
            debug!("device {} already non-ONLINE", logical_device_id);
            return Ok(0);
        }
        let now = current_timestamp_ms();
        let gap = now.saturating_sub(device.last_seen_at);
        device.cumulative_downtime_ms = device.cumulative_downtime_ms.saturating_add(gap);
        device.reliability_score =
            reliability_score(device.cumulative_uptime_ms, device.cumulative_downtime_ms);
        device.state = DeviceState::Offline;
        device.last_seen_at = now;
        self.store.update_device(&device)?;
        info!("device {} marked OFFLINE (score {})", logical_device_id, device.reliability_score);

        self.scanner.detect_affected(&device.id)
    }

    /// Terminal transition. Same accounting and health trigger as an offline
    /// transition; the row stays but never receives placements again.
    pub fn suspend(&self, logical_device_id: &str, reason: Option<&str>) -> Result<usize> {
        let mut device = self
            .store
            .get_device_by_logical(logical_device_id)?
            .ok_or_else(|| FabricError::NotFound(format!("device {}", logical_device_id)))?;
        if device.state == DeviceState::Suspended {
            return Ok(0);
        }
        let now = current_timestamp_ms();
        if device.state == DeviceState::Online {
            let gap = now.saturating_sub(device.last_seen_at);
            device.cumulative_downtime_ms = device.cumulative_downtime_ms.saturating_add(gap);
            device.reliability_score =
                reliability_score(device.cumulative_uptime_ms, device.cumulative_downtime_ms);
        }
        device.state = DeviceState::Suspended;
        device.last_seen_at = now;
        self.store.update_device(&device)?;
        info!(
            "device {} SUSPENDED ({})",
            logical_device_id,
            reason.unwrap_or("no reason given")
        );

        self.scanner.detect_affected(&device.id)
    }

    /// Ranked placement query; delegates to the store's indexed ordering.
    pub fn find_healthy(&self, min_free: u64, min_score: f64, limit: usize) -> Result<Vec<Device>> {
        self.store.find_placement_candidates(min_free, min_score, limit)
    }

    pub fn health(&self, logical_device_id: &str) -> Result<DeviceHealth> {
        let device = self
            .store
            .get_device_by_logical(logical_device_id)?
            .ok_or_else(|| FabricError::NotFound(format!("device {}", logical_device_id)))?;
        let now = current_timestamp_ms();
        let total = device.cumulative_uptime_ms + device.cumulative_downtime_ms;
        let uptime_pct = if total == 0 {
            100.0
        } else {
            (100.0 * device.cumulative_uptime_ms as f64 / total as f64 * 100.0).round() / 100.0
        };
        let online = device.state == DeviceState::Online;
        Ok(DeviceHealth {
            online,
            reliability_score: device.reliability_score,
            uptime_pct,
            consecutive_downtime_ms: if online { 0 } else { now.saturating_sub(device.last_seen_at) },
            last_seen_at: device.last_seen_at,
        })
    }

    /// Mark every ONLINE device silent for longer than `threshold` OFFLINE.
    /// Returns the number of devices transitioned.
    pub fn offline_sweep(&self, threshold: Duration) -> Result<usize> {
        let now = current_timestamp_ms();
        let cutoff = threshold.as_millis() as u64;
        let mut transitioned = 0usize;
        for device in self.store.list_devices()? {
            if device.state == DeviceState::Online
                && now.saturating_sub(device.last_seen_at) >= cutoff
            {
                self.mark_offline(&device.logical_device_id)?;
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }
}
