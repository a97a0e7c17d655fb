//! # CSF Coordinator Crate
//!
//! Replication control plane of the Consumer Storage Fabric: a coordinator
//! that splits, encrypts, places, and heals fixed-size encrypted chunks
//! across a fleet of untrusted, intermittently-connected consumer devices.
//! The coordinator never holds plaintext durably; it owns metadata and
//! drives convergence.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          COORDINATOR                                 │
//! │                                                                      │
//! │  upload ──▶ Chunker ──▶ StagingStore ──▶ Placement ──▶ Distribution  │
//! │                                              │              │        │
//! │                                              ▼              ▼        │
//! │                      MetaStore ◀──────── placements ──▶ Devices      │
//! │                          ▲                                  ▲        │
//! │   download ◀── Retrieval ┘                                  │        │
//! │                                                             │        │
//! │  Scheduler ─▶ HealthScanner ─▶ heal/reaper queues ─▶ Healer/Reaper   │
//! │                     ▲                                       │        │
//! │  DeviceRegistry ────┘ (state change)      ConnectionRegistry┘        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - **devices**: device identity, lifecycle, uptime accounting, scoring
//! - **connections**: duplex channel binding and request/response routing
//! - **placement**: candidate selection and placement-row bookkeeping
//! - **distribution**: fan-out of staged ciphertext to selected devices
//! - **retrieval**: replica fail-over, decryption, whole-file verification
//! - **scanner**: periodic and targeted chunk health classification
//! - **healer** / **reaper**: queue workers restoring and shedding replicas
//! - **queue**: in-process priority queue with retries and backoff
//! - **mock**: in-memory device simulator for tests and development
//!
//! ## Key Invariant
//!
//! The metadata store is the single source of truth. Replica counters are
//! advisory between scans; the scanner recomputes them from placement rows
//! and device state, so every component tolerates stale counts.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod connections;
pub mod devices;
pub mod distribution;
pub mod healer;
pub mod mock;
pub mod placement;
pub mod queue;
pub mod reaper;
pub mod retrieval;
pub mod scanner;

pub use connections::{ConnectionRegistry, DeviceChannel, InboundEvent, OutboundEvent, RegisterPayload};
pub use devices::{reliability_score, DeviceHealth, DeviceRegistry};
pub use distribution::{ChunkDistribution, Distributor, FileDistribution};
pub use healer::{Healer, HEAL_CONCURRENCY};
pub use placement::PlacementEngine;
pub use queue::{Job, JobKind, MemoryJobQueue, ShutdownSignal};
pub use reaper::{Reaper, REAPER_CONCURRENCY};
pub use retrieval::Retriever;
pub use scanner::{heal_priority, FleetSummary, HealthScanner, ScanReport};

use csf_common::{new_row_id, Config, CryptoPipeline, FabricError, Result};
use csf_meta::{Chunk, ChunkState, Device, FileRecord, FileState, MetaStore};
use csf_storage::{chunker, StagingStore};

/// Cadence of the device liveness sweep.
const OFFLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the staging TTL eviction pass.
const STAGING_EVICTION_INTERVAL: Duration = Duration::from_secs(3600);

/// The assembled control plane. Construct once, share behind an `Arc`.
pub struct Coordinator {
    config: Config,
    crypto: Arc<CryptoPipeline>,
    store: Arc<dyn MetaStore>,
    staging: Arc<StagingStore>,
    heal_queue: Arc<MemoryJobQueue>,
    reaper_queue: Arc<MemoryJobQueue>,
    scanner: Arc<HealthScanner>,
    devices: Arc<DeviceRegistry>,
    connections: Arc<ConnectionRegistry>,
    distributor: Arc<Distributor>,
    retriever: Arc<Retriever>,
    healer: Arc<Healer>,
    reaper: Arc<Reaper>,
}

impl Coordinator {
    /// Validate the configuration and wire every component against the
    /// given metadata store.
    pub fn new(config: Config, store: Arc<dyn MetaStore>) -> Result<Self> {
        config.validate()?;
        let crypto = Arc::new(CryptoPipeline::init(&config.kek_hex)?);
        let staging = Arc::new(StagingStore::new(&config.staging_dir)?);
        let heal_queue = Arc::new(MemoryJobQueue::new("heal"));
        let reaper_queue = Arc::new(MemoryJobQueue::new("reaper"));
        let scanner = Arc::new(HealthScanner::new(
            store.clone(),
            heal_queue.clone(),
            reaper_queue.clone(),
            config.safety_margin,
        ));
        let devices = Arc::new(DeviceRegistry::new(store.clone(), scanner.clone()));
        let connections = Arc::new(ConnectionRegistry::new(
            config.t_write(),
            config.t_read(),
            config.t_delete(),
        ));
        let placement = Arc::new(PlacementEngine::new(
            store.clone(),
            config.redundancy_factor,
            config.min_reliability_for_placement,
        ));
        let distributor = Arc::new(Distributor::new(
            store.clone(),
            placement.clone(),
            connections.clone(),
            staging.clone(),
        ));
        let retriever =
            Arc::new(Retriever::new(store.clone(), connections.clone(), crypto.clone()));
        let healer = Arc::new(Healer::new(
            store.clone(),
            placement,
            connections.clone(),
            staging.clone(),
        ));
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            connections.clone(),
            staging.clone(),
            config.safety_margin,
        ));

        Ok(Coordinator {
            config,
            crypto,
            store,
            staging,
            heal_queue,
            reaper_queue,
            scanner,
            devices,
            connections,
            distributor,
            retriever,
            healer,
            reaper,
        })
    }

    // ── upload / download / delete ──────────────────────────────────────

    /// Upload pipeline up to durable staging: chunk, encrypt, stage, and
    /// persist metadata. Returns once the file is ACTIVE; distribution runs
    /// separately (see [`Coordinator::distribute_file`]).
    pub fn store_file(
        &self,
        buf: &[u8],
        original_name: &str,
        mime: &str,
        owner_id: &str,
    ) -> Result<FileRecord> {
        let file_id = new_row_id();
        let processed = chunker::process_file(
            buf,
            original_name,
            mime,
            &file_id,
            &self.config.selected_chunk_policy(),
            self.config.max_file_size_bytes,
            &self.crypto,
        )?;

        let mut file = FileRecord {
            id: file_id.clone(),
            original_name: processed.meta.original_name.clone(),
            mime: processed.meta.mime.clone(),
            size_bytes: processed.meta.size_bytes,
            owner_id: owner_id.to_string(),
            wrapped_dek: processed.meta.wrapped_dek.clone(),
            dek_id: processed.meta.dek_id.clone(),
            plaintext_hash: processed.meta.plaintext_hash.clone(),
            state: FileState::Uploading,
            chunk_count: processed.meta.chunk_count,
        };
        self.store.insert_file(file.clone())?;

        for piece in &processed.chunks {
            let chunk_id = new_row_id();
            self.staging.put(&chunk_id, &piece.ciphertext)?;
            self.store.insert_chunk(Chunk {
                id: chunk_id,
                file_id: file_id.clone(),
                sequence_num: piece.sequence_num,
                size_bytes: piece.size_bytes,
                iv: piece.iv.clone(),
                auth_tag: piece.auth_tag.clone(),
                aad: piece.aad.clone(),
                ciphertext_hash: piece.ciphertext_hash.clone(),
                state: ChunkState::Pending,
                current_replicas: 0,
                target_replicas: self.config.redundancy_factor,
            })?;
        }

        self.store.set_file_state(&file_id, FileState::Active)?;
        file.state = FileState::Active;
        info!(
            "file {} stored: {} bytes in {} chunk(s)",
            file_id, file.size_bytes, file.chunk_count
        );
        Ok(file)
    }

    /// Ship every staged chunk of a file to its selected devices.
    pub async fn distribute_file(&self, file_id: &str) -> Result<FileDistribution> {
        self.distributor.distribute_file(file_id).await
    }

    pub async fn distribute_chunk(&self, chunk_id: &str) -> Result<ChunkDistribution> {
        self.distributor.distribute_chunk(chunk_id).await
    }

    /// Reassemble a file from its replicas.
    pub async fn retrieve_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.retriever.retrieve_file(file_id).await
    }

    /// Logically delete a file and queue its physical removal. The caller
    /// gets an answer as soon as the row is marked; reaping converges
    /// asynchronously.
    pub fn delete_file(&self, file_id: &str, reason: &str) -> Result<()> {
        if self.store.get_file(file_id)?.is_none() {
            return Err(FabricError::NotFound(format!("file {}", file_id)));
        }
        self.store.set_file_state(file_id, FileState::Deleted)?;
        self.reaper_queue.enqueue(
            JobKind::DeleteFile { file_id: file_id.to_string(), reason: reason.to_string() },
            1,
        );
        info!("file {} marked DELETED ({})", file_id, reason);
        Ok(())
    }

    // ── device channel plumbing ─────────────────────────────────────────

    /// First event of every connection: register (or upsert) the device,
    /// bind its channel, and acknowledge.
    pub fn handle_register(
        &self,
        channel: Arc<dyn DeviceChannel>,
        payload: RegisterPayload,
    ) -> Result<Device> {
        let device = self.devices.register(&payload)?;
        self.connections.bind(&payload.logical_device_id, channel.clone());
        let _ = channel.send(OutboundEvent::DeviceRegistered {
            success: true,
            device: Some(device.clone()),
            message: "registered".to_string(),
        });
        Ok(device)
    }

    /// Dispatch one inbound event from an already-bound device.
    pub fn handle_event(&self, logical_device_id: &str, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Register(payload) => {
                // re-registration over a live channel; the binding stays
                self.devices.register(&payload)?;
                Ok(())
            }
            InboundEvent::Ping { logical_device_id: lid, available_capacity_bytes } => {
                let device = self.devices.heartbeat(&lid, available_capacity_bytes)?;
                let _ = self.connections.send_event(
                    &lid,
                    OutboundEvent::DevicePong {
                        success: true,
                        timestamp_ms: csf_common::current_timestamp_ms(),
                        state: device.state,
                    },
                );
                Ok(())
            }
            InboundEvent::StorageUpdate { available_capacity_bytes } => {
                self.devices.update_capacity(logical_device_id, available_capacity_bytes)
            }
            InboundEvent::ChunkConfirm { .. }
            | InboundEvent::ChunkData { .. }
            | InboundEvent::ChunkDeleted { .. } => {
                self.connections.deliver(logical_device_id, event);
                Ok(())
            }
            InboundEvent::Disconnect { reason } => {
                info!("device {} disconnected ({})", logical_device_id, reason);
                self.connections.unbind(logical_device_id);
                self.devices.mark_offline(logical_device_id)?;
                Ok(())
            }
        }
    }

    // ── runtime ─────────────────────────────────────────────────────────

    /// Start the queue workers and every periodic loop. Handles exit after
    /// `shutdown` triggers; in-flight jobs finish on their own.
    pub fn start(&self, shutdown: Arc<ShutdownSignal>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let healer = self.healer.clone();
        handles.push(queue::spawn_worker(
            "healer",
            self.heal_queue.clone(),
            HEAL_CONCURRENCY,
            shutdown.clone(),
            move |job| {
                let healer = healer.clone();
                async move { healer.handle_job(job).await }
            },
        ));

        let reaper = self.reaper.clone();
        handles.push(queue::spawn_worker(
            "reaper",
            self.reaper_queue.clone(),
            REAPER_CONCURRENCY,
            shutdown.clone(),
            move |job| {
                let reaper = reaper.clone();
                async move { reaper.handle_job(job).await }
            },
        ));

        // full health scan: once at startup, then on the configured cadence
        let scanner = self.scanner.clone();
        handles.push(spawn_periodic(
            "health-scan",
            self.config.scan_interval(),
            true,
            shutdown.clone(),
            move || {
                if let Err(e) = scanner.scan_all() {
                    error!("health scan failed: {}", e);
                }
            },
        ));

        let scanner = self.scanner.clone();
        handles.push(spawn_periodic(
            "excess-sweep",
            self.config.trim_interval(),
            false,
            shutdown.clone(),
            move || {
                if let Err(e) = scanner.scan_excess() {
                    error!("excess sweep failed: {}", e);
                }
            },
        ));

        let devices = self.devices.clone();
        let threshold = self.config.device_offline_threshold();
        handles.push(spawn_periodic(
            "offline-sweep",
            OFFLINE_SWEEP_INTERVAL,
            false,
            shutdown.clone(),
            move || match devices.offline_sweep(threshold) {
                Ok(0) => {}
                Ok(n) => info!("offline sweep transitioned {} device(s)", n),
                Err(e) => error!("offline sweep failed: {}", e),
            },
        ));

        let staging = self.staging.clone();
        let ttl = self.config.temp_chunk_ttl();
        handles.push(spawn_periodic(
            "staging-eviction",
            STAGING_EVICTION_INTERVAL,
            false,
            shutdown.clone(),
            move || match staging.evict_older_than(ttl) {
                Ok(0) => {}
                Ok(n) => info!("staging eviction removed {} chunk(s)", n),
                Err(e) => error!("staging eviction failed: {}", e),
            },
        ));

        let scanner = self.scanner.clone();
        let staging = self.staging.clone();
        let connections = self.connections.clone();
        handles.push(spawn_periodic(
            "summary",
            self.config.summary_interval(),
            false,
            shutdown,
            move || {
                let summary = match scanner.summary() {
                    Ok(s) => s,
                    Err(e) => {
                        error!("summary failed: {}", e);
                        return;
                    }
                };
                let staged = staging.total_bytes().unwrap_or(0);
                info!(
                    "summary: chunks pending={} replicating={} healthy={} degraded={} lost={} \
                     | devices online={} offline={} suspended={} connected={} | staged_bytes={}",
                    summary.chunks_pending,
                    summary.chunks_replicating,
                    summary.chunks_healthy,
                    summary.chunks_degraded,
                    summary.chunks_lost,
                    summary.devices_online,
                    summary.devices_offline,
                    summary.devices_suspended,
                    connections.connected_count(),
                    staged
                );
            },
        ));

        handles
    }

    // ── component access ────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn scanner(&self) -> &Arc<HealthScanner> {
        &self.scanner
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn staging(&self) -> &Arc<StagingStore> {
        &self.staging
    }

    pub fn heal_queue(&self) -> &Arc<MemoryJobQueue> {
        &self.heal_queue
    }

    pub fn reaper_queue(&self) -> &Arc<MemoryJobQueue> {
        &self.reaper_queue
    }
}

/// Run `tick` every `interval` until shutdown; optionally once immediately.
fn spawn_periodic<F>(
    name: &'static str,
    interval: Duration,
    run_immediately: bool,
    shutdown: Arc<ShutdownSignal>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        info!("{} loop started (every {:?})", name, interval);
        if run_immediately {
            tick();
        }
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(interval) => tick(),
            }
        }
        info!("{} loop stopped", name);
    })
}
