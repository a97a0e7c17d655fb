//! Mock device channel for tests and local development.
//!
//! Plays the role of a real consumer device on the other end of a duplex
//! channel: stores assigned ciphertext in memory, serves read requests, and
//! acknowledges deletes. Failure behaviors are switchable at runtime so
//! tests can script rejections, silence (timeouts), and corrupted reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use csf_common::Result;

use crate::connections::{
    encode_ciphertext, ConnectionRegistry, DeviceChannel, InboundEvent, OutboundEvent,
};

/// In-memory device simulator.
pub struct MockDevice {
    logical_device_id: String,
    registry: Mutex<Option<Arc<ConnectionRegistry>>>,
    stored: Mutex<HashMap<String, Vec<u8>>>,
    /// Answer every write with `success=false`.
    reject_writes: AtomicBool,
    /// Stop answering anything (requests run into their deadline).
    silent: AtomicBool,
    /// Flip one byte of every served read.
    corrupt_reads: AtomicBool,
}

impl MockDevice {
    pub fn new(logical_device_id: &str) -> Arc<Self> {
        Arc::new(MockDevice {
            logical_device_id: logical_device_id.to_string(),
            registry: Mutex::new(None),
            stored: Mutex::new(HashMap::new()),
            reject_writes: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
        })
    }

    /// Bind this device's channel into the registry.
    pub fn attach(self: &Arc<Self>, registry: &Arc<ConnectionRegistry>) {
        *self.registry.lock() = Some(registry.clone());
        registry.bind(&self.logical_device_id, self.clone());
    }

    pub fn logical_device_id(&self) -> &str {
        &self.logical_device_id
    }

    pub fn set_reject_writes(&self, on: bool) {
        self.reject_writes.store(on, Ordering::SeqCst);
    }

    pub fn set_silent(&self, on: bool) {
        self.silent.store(on, Ordering::SeqCst);
    }

    pub fn set_corrupt_reads(&self, on: bool) {
        self.corrupt_reads.store(on, Ordering::SeqCst);
    }

    /// Seed the device with ciphertext as if it had been assigned earlier.
    pub fn preload(&self, chunk_id: &str, bytes: &[u8]) {
        self.stored.lock().insert(chunk_id.to_string(), bytes.to_vec());
    }

    pub fn stored_chunk_ids(&self) -> Vec<String> {
        self.stored.lock().keys().cloned().collect()
    }

    pub fn holds(&self, chunk_id: &str) -> bool {
        self.stored.lock().contains_key(chunk_id)
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().len()
    }

    fn reply(&self, event: InboundEvent) {
        if let Some(registry) = self.registry.lock().clone() {
            registry.deliver(&self.logical_device_id, event);
        }
    }
}

impl DeviceChannel for MockDevice {
    fn send(&self, event: OutboundEvent) -> Result<()> {
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        match event {
            OutboundEvent::ChunkAssign { chunk_id, ciphertext_base64, .. } => {
                if self.reject_writes.load(Ordering::SeqCst) {
                    self.reply(InboundEvent::ChunkConfirm {
                        chunk_id,
                        success: false,
                        error: Some("device refused write".to_string()),
                    });
                    return Ok(());
                }
                use base64::Engine as _;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(ciphertext_base64.as_bytes())
                    .unwrap_or_default();
                self.stored.lock().insert(chunk_id.clone(), bytes);
                self.reply(InboundEvent::ChunkConfirm { chunk_id, success: true, error: None });
            }
            OutboundEvent::ChunkRequest { chunk_id } => {
                let data = self.stored.lock().get(&chunk_id).cloned();
                match data {
                    Some(mut bytes) => {
                        if self.corrupt_reads.load(Ordering::SeqCst) && !bytes.is_empty() {
                            bytes[0] ^= 0x01;
                        }
                        self.reply(InboundEvent::ChunkData {
                            chunk_id,
                            success: true,
                            data_base64: Some(encode_ciphertext(&bytes)),
                            error: None,
                        });
                    }
                    None => {
                        self.reply(InboundEvent::ChunkData {
                            chunk_id,
                            success: false,
                            data_base64: None,
                            error: Some("chunk not held".to_string()),
                        });
                    }
                }
            }
            OutboundEvent::ChunkDelete { chunk_id, .. } => {
                self.stored.lock().remove(&chunk_id);
                self.reply(InboundEvent::ChunkDeleted { chunk_id, success: true, error: None });
            }
            OutboundEvent::DeviceRegistered { .. } | OutboundEvent::DevicePong { .. } => {}
        }
        Ok(())
    }
}
