//! Shared harness for coordinator integration tests: a fully wired
//! coordinator over the in-memory metadata store, with mock devices playing
//! the fleet.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use csf_common::Config;
use csf_coordinator::mock::MockDevice;
use csf_coordinator::{Coordinator, RegisterPayload};
use csf_meta::MemoryMetaStore;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<MemoryMetaStore>,
    _tmp: TempDir,
}

pub fn build(configure: impl FnOnce(&mut Config)) -> Harness {
    let tmp = TempDir::new().expect("tmpdir");
    let mut config = Config {
        kek_hex: "ab".repeat(32),
        staging_dir: tmp.path().to_string_lossy().to_string(),
        ..Default::default()
    };
    configure(&mut config);
    let store = Arc::new(MemoryMetaStore::new());
    let coordinator = Arc::new(Coordinator::new(config, store.clone()).expect("wire coordinator"));
    Harness { coordinator, store, _tmp: tmp }
}

pub fn default_harness() -> Harness {
    build(|_| {})
}

/// Register a device and bind its mock channel, as a real transport would.
pub fn connect_device(h: &Harness, logical: &str, capacity: u64) -> Arc<MockDevice> {
    let dev = MockDevice::new(logical);
    dev.attach(h.coordinator.connections());
    h.coordinator
        .handle_register(
            dev.clone(),
            RegisterPayload {
                logical_device_id: logical.to_string(),
                device_type: "desktop".to_string(),
                owner_id: "owner-1".to_string(),
                total_capacity_bytes: capacity,
                model: None,
                os: None,
                app: None,
            },
        )
        .expect("register device");
    dev
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
