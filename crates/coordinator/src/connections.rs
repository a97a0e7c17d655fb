//! Connection registry: binds a logical device id to exactly one open
//! duplex channel and provides typed request/response over it.
//!
//! The transport that accepts device connections lives outside this crate;
//! it hands us an object implementing [`DeviceChannel`] for the outbound
//! direction and feeds inbound events into [`ConnectionRegistry::deliver`].
//! Requests are correlated by `(device, kind, chunk_id)` through a map of
//! in-flight oneshot senders; deadlines are enforced with `tokio::time::
//! timeout`, no watchdog thread needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use csf_common::{FabricError, Result};
use csf_meta::{Device, DeviceState};

// ════════════════════════════════════════════════════════════════════════════
// WIRE EVENTS
// ════════════════════════════════════════════════════════════════════════════

/// Payload of `device:register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub logical_device_id: String,
    pub device_type: String,
    pub owner_id: String,
    pub total_capacity_bytes: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
}

/// Events the coordinator sends to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "device:registered")]
    DeviceRegistered { success: bool, device: Option<Device>, message: String },

    #[serde(rename = "device:pong")]
    DevicePong { success: bool, timestamp_ms: u64, state: DeviceState },

    #[serde(rename = "chunk:assign")]
    ChunkAssign {
        chunk_id: String,
        file_id: String,
        sequence_num: u32,
        size_bytes: u64,
        iv: String,
        auth_tag: String,
        aad: String,
        checksum: String,
        ciphertext_base64: String,
    },

    #[serde(rename = "chunk:request")]
    ChunkRequest { chunk_id: String },

    #[serde(rename = "chunk:delete")]
    ChunkDelete { chunk_id: String, reason: String },
}

/// Events a device sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "device:register")]
    Register(RegisterPayload),

    #[serde(rename = "device:ping")]
    Ping { logical_device_id: String, available_capacity_bytes: u64 },

    #[serde(rename = "device:storage:update")]
    StorageUpdate { available_capacity_bytes: u64 },

    #[serde(rename = "chunk:confirm")]
    ChunkConfirm { chunk_id: String, success: bool, #[serde(default)] error: Option<String> },

    #[serde(rename = "chunk:data")]
    ChunkData {
        chunk_id: String,
        success: bool,
        #[serde(default)]
        data_base64: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "chunk:deleted")]
    ChunkDeleted { chunk_id: String, success: bool, #[serde(default)] error: Option<String> },

    #[serde(rename = "disconnect")]
    Disconnect { reason: String },
}

/// Outbound half of one device connection. Implemented by the transport.
pub trait DeviceChannel: Send + Sync {
    fn send(&self, event: OutboundEvent) -> Result<()>;
}

// ════════════════════════════════════════════════════════════════════════════
// CORRELATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKind {
    Confirm,
    Data,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    logical_device_id: String,
    kind: PendingKind,
    chunk_id: String,
}

// ════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ════════════════════════════════════════════════════════════════════════════

/// Routes chunk requests to the channel currently bound for a device.
pub struct ConnectionRegistry {
    channels: RwLock<HashMap<String, Arc<dyn DeviceChannel>>>,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<InboundEvent>>>,
    t_write: Duration,
    t_read: Duration,
    t_delete: Duration,
}

impl ConnectionRegistry {
    pub fn new(t_write: Duration, t_read: Duration, t_delete: Duration) -> Self {
        ConnectionRegistry {
            channels: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            t_write,
            t_read,
            t_delete,
        }
    }

    /// Attach a channel for a registered device. A newer connection replaces
    /// the previous one.
    pub fn bind(&self, logical_device_id: &str, channel: Arc<dyn DeviceChannel>) {
        let previous = self
            .channels
            .write()
            .insert(logical_device_id.to_string(), channel);
        if previous.is_some() {
            debug!("connection rebound for {}", logical_device_id);
        }
    }

    /// Detach the channel and fail any in-flight requests for the device.
    pub fn unbind(&self, logical_device_id: &str) {
        self.channels.write().remove(logical_device_id);
        let mut pending = self.pending.lock();
        pending.retain(|key, _| key.logical_device_id != logical_device_id);
    }

    pub fn is_connected(&self, logical_device_id: &str) -> bool {
        self.channels.read().contains_key(logical_device_id)
    }

    pub fn connected_count(&self) -> usize {
        self.channels.read().len()
    }

    fn channel(&self, logical_device_id: &str) -> Result<Arc<dyn DeviceChannel>> {
        self.channels
            .read()
            .get(logical_device_id)
            .cloned()
            .ok_or_else(|| FabricError::NotConnected(logical_device_id.to_string()))
    }

    fn register_pending(
        &self,
        logical_device_id: &str,
        kind: PendingKind,
        chunk_id: &str,
    ) -> oneshot::Receiver<InboundEvent> {
        let (tx, rx) = oneshot::channel();
        let key = PendingKey {
            logical_device_id: logical_device_id.to_string(),
            kind,
            chunk_id: chunk_id.to_string(),
        };
        // A replaced entry drops its sender; the stale waiter sees the
        // channel close and reports NotConnected.
        self.pending.lock().insert(key, tx);
        rx
    }

    fn drop_pending(&self, logical_device_id: &str, kind: PendingKind, chunk_id: &str) {
        let key = PendingKey {
            logical_device_id: logical_device_id.to_string(),
            kind,
            chunk_id: chunk_id.to_string(),
        };
        self.pending.lock().remove(&key);
    }

    /// Complete the in-flight request matching an inbound response event.
    /// Returns whether a waiter consumed it.
    pub fn deliver(&self, logical_device_id: &str, event: InboundEvent) -> bool {
        let key = match &event {
            InboundEvent::ChunkConfirm { chunk_id, .. } => PendingKey {
                logical_device_id: logical_device_id.to_string(),
                kind: PendingKind::Confirm,
                chunk_id: chunk_id.clone(),
            },
            InboundEvent::ChunkData { chunk_id, .. } => PendingKey {
                logical_device_id: logical_device_id.to_string(),
                kind: PendingKind::Data,
                chunk_id: chunk_id.clone(),
            },
            InboundEvent::ChunkDeleted { chunk_id, .. } => PendingKey {
                logical_device_id: logical_device_id.to_string(),
                kind: PendingKind::Deleted,
                chunk_id: chunk_id.clone(),
            },
            _ => return false,
        };
        let sender = self.pending.lock().remove(&key);
        match sender {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!("unmatched response from {}", logical_device_id);
                false
            }
        }
    }

    /// Send an outbound event with no expected response.
    pub fn send_event(&self, logical_device_id: &str, event: OutboundEvent) -> Result<()> {
        self.channel(logical_device_id)?.send(event)
    }

    /// Ship ciphertext to a device and await its confirmation.
    ///
    /// Failure modes: `NotConnected`, `Timeout` after `t_write`, and
    /// `DeviceRejected` when the device answers `success=false`.
    pub async fn send_chunk(
        &self,
        logical_device_id: &str,
        chunk_id: &str,
        assign: OutboundEvent,
    ) -> Result<()> {
        let channel = self.channel(logical_device_id)?;
        let rx = self.register_pending(logical_device_id, PendingKind::Confirm, chunk_id);
        if let Err(e) = channel.send(assign) {
            self.drop_pending(logical_device_id, PendingKind::Confirm, chunk_id);
            return Err(e);
        }

        match timeout(self.t_write, rx).await {
            Err(_) => {
                self.drop_pending(logical_device_id, PendingKind::Confirm, chunk_id);
                Err(FabricError::Timeout(format!(
                    "chunk:confirm:{} from {}",
                    chunk_id, logical_device_id
                )))
            }
            Ok(Err(_)) => Err(FabricError::NotConnected(logical_device_id.to_string())),
            Ok(Ok(InboundEvent::ChunkConfirm { success: true, .. })) => Ok(()),
            Ok(Ok(InboundEvent::ChunkConfirm { error, .. })) => Err(FabricError::DeviceRejected(
                error.unwrap_or_else(|| "unspecified".to_string()),
            )),
            Ok(Ok(_)) => Err(FabricError::Internal("mismatched response event".to_string())),
        }
    }

    /// Fetch ciphertext for a chunk from a device.
    pub async fn request_chunk(
        &self,
        logical_device_id: &str,
        chunk_id: &str,
    ) -> Result<Vec<u8>> {
        let channel = self.channel(logical_device_id)?;
        let rx = self.register_pending(logical_device_id, PendingKind::Data, chunk_id);
        if let Err(e) = channel.send(OutboundEvent::ChunkRequest { chunk_id: chunk_id.to_string() })
        {
            self.drop_pending(logical_device_id, PendingKind::Data, chunk_id);
            return Err(e);
        }

        match timeout(self.t_read, rx).await {
            Err(_) => {
                self.drop_pending(logical_device_id, PendingKind::Data, chunk_id);
                Err(FabricError::Timeout(format!(
                    "chunk:data:{} from {}",
                    chunk_id, logical_device_id
                )))
            }
            Ok(Err(_)) => Err(FabricError::NotConnected(logical_device_id.to_string())),
            Ok(Ok(InboundEvent::ChunkData { success: true, data_base64: Some(b64), .. })) => {
                BASE64.decode(b64.as_bytes()).map_err(|e| {
                    FabricError::Integrity(format!("invalid base64 from device: {}", e))
                })
            }
            Ok(Ok(InboundEvent::ChunkData { error, .. })) => Err(FabricError::DeviceRejected(
                error.unwrap_or_else(|| "no data returned".to_string()),
            )),
            Ok(Ok(_)) => Err(FabricError::Internal("mismatched response event".to_string())),
        }
    }

    /// Tell a device to drop a chunk. A missed deadline resolves non-fatally
    /// as `Ok(false)`; the caller marks the placement unhealthy and the next
    /// scan reconciles.
    pub async fn delete_chunk(
        &self,
        logical_device_id: &str,
        chunk_id: &str,
        reason: &str,
    ) -> Result<bool> {
        let channel = self.channel(logical_device_id)?;
        let rx = self.register_pending(logical_device_id, PendingKind::Deleted, chunk_id);
        if let Err(e) = channel.send(OutboundEvent::ChunkDelete {
            chunk_id: chunk_id.to_string(),
            reason: reason.to_string(),
        }) {
            self.drop_pending(logical_device_id, PendingKind::Deleted, chunk_id);
            return Err(e);
        }

        match timeout(self.t_delete, rx).await {
            Err(_) => {
                self.drop_pending(logical_device_id, PendingKind::Deleted, chunk_id);
                warn!(
                    "chunk:deleted:{} from {} timed out, leaving for reconciliation",
                    chunk_id, logical_device_id
                );
                Ok(false)
            }
            Ok(Err(_)) => Err(FabricError::NotConnected(logical_device_id.to_string())),
            Ok(Ok(InboundEvent::ChunkDeleted { success, .. })) => Ok(success),
            Ok(Ok(_)) => Err(FabricError::Internal("mismatched response event".to_string())),
        }
    }
}

/// Base64-encode ciphertext for the wire.
pub fn encode_ciphertext(data: &[u8]) -> String {
    BASE64.encode(data)
}
