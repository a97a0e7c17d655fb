//! End-to-end upload and download flows against a mock fleet.

mod support;

use csf_common::FabricError;
use csf_meta::{ChunkState, MetaStore};
use support::{build, connect_device, default_harness, GIB, MIB};

#[tokio::test]
async fn test_single_chunk_round_trip() {
    let h = default_harness();
    let devices: Vec<_> = (0..3)
        .map(|i| connect_device(&h, &format!("dev-{}", i), 10 * GIB))
        .collect();

    let file = h
        .coordinator
        .store_file(b"hello", "hello.txt", "text/plain", "owner-1")
        .expect("store");
    assert_eq!(file.chunk_count, 1);

    let outcome = h.coordinator.distribute_file(&file.id).await.expect("distribute");
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.chunks.len(), 1);
    assert_eq!(outcome.chunks[0].acked, 3);

    let chunk = &h.store.chunks_by_file(&file.id).unwrap()[0];
    assert_eq!(chunk.state, ChunkState::Healthy);
    assert_eq!(chunk.current_replicas, 3);
    assert_eq!(h.store.locations_by_chunk(&chunk.id).unwrap().len(), 3);
    for device in &devices {
        assert!(device.holds(&chunk.id));
    }

    let bytes = h.coordinator.retrieve_file(&file.id).await.expect("download");
    assert_eq!(bytes, b"hello");
}

#[tokio::test]
async fn test_legacy_fixed_chunking_layout() {
    // legacy deployments pin a fixed 5 MiB chunk size
    let h = build(|cfg| {
        cfg.chunk_policy = "fixed".to_string();
        cfg.fixed_chunk_size_bytes = 5 * MIB;
    });
    for i in 0..3 {
        connect_device(&h, &format!("dev-{}", i), 10 * GIB);
    }

    let payload = vec![0x5au8; (12 * MIB) as usize];
    let file = h
        .coordinator
        .store_file(&payload, "big.bin", "application/octet-stream", "owner-1")
        .expect("store");
    assert_eq!(file.chunk_count, 3);

    let chunks = h.store.chunks_by_file(&file.id).unwrap();
    let seqs: Vec<u32> = chunks.iter().map(|c| c.sequence_num).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    // GCM ciphertext length equals plaintext length per piece
    let sizes: Vec<u64> = chunks.iter().map(|c| c.size_bytes).collect();
    assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);

    let outcome = h.coordinator.distribute_file(&file.id).await.expect("distribute");
    assert!(outcome.errors.is_empty());

    // full distribution: one placement row per (chunk, device)
    let total_placements: usize = chunks
        .iter()
        .map(|c| h.store.locations_by_chunk(&c.id).unwrap().len())
        .sum();
    assert_eq!(total_placements, 9);

    let bytes = h.coordinator.retrieve_file(&file.id).await.expect("download");
    assert_eq!(bytes, payload);
}

#[tokio::test]
async fn test_empty_upload_rejected() {
    let h = default_harness();
    let err = h.coordinator.store_file(b"", "x", "y", "owner-1").unwrap_err();
    assert!(matches!(err, FabricError::InvalidInput(_)));
}

#[tokio::test]
async fn test_oversize_upload_rejected() {
    let h = build(|cfg| cfg.max_file_size_bytes = 10);
    let err = h
        .coordinator
        .store_file(&[0u8; 11], "big", "application/octet-stream", "owner-1")
        .unwrap_err();
    assert!(matches!(err, FabricError::TooLarge { .. }));
}

#[tokio::test]
async fn test_too_few_devices_fails_distribution() {
    let h = default_harness();
    connect_device(&h, "only-one", 10 * GIB);
    connect_device(&h, "only-two", 10 * GIB);

    let file = h.coordinator.store_file(b"data", "a", "b", "owner-1").expect("store");
    let outcome = h.coordinator.distribute_file(&file.id).await.expect("aggregate");
    assert_eq!(outcome.chunks.len(), 0);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].1.contains("insufficient capacity"));
}

#[tokio::test]
async fn test_download_of_unknown_file() {
    let h = default_harness();
    let err = h.coordinator.retrieve_file("no-such-file").await.unwrap_err();
    assert!(matches!(err, FabricError::NotFound(_)));
}

#[tokio::test]
async fn test_corrupt_holder_fails_over_to_intact_one() {
    let h = default_harness();
    let devices: Vec<_> = (0..3)
        .map(|i| connect_device(&h, &format!("dev-{}", i), 10 * GIB))
        .collect();

    let file = h
        .coordinator
        .store_file(b"integrity matters", "a.bin", "application/octet-stream", "owner-1")
        .expect("store");
    h.coordinator.distribute_file(&file.id).await.expect("distribute");

    // one holder starts flipping bits; the others still serve intact bytes
    devices[0].set_corrupt_reads(true);
    let bytes = h.coordinator.retrieve_file(&file.id).await.expect("failover");
    assert_eq!(bytes, b"integrity matters");

    // with every holder corrupt the file is unavailable
    devices[1].set_corrupt_reads(true);
    devices[2].set_corrupt_reads(true);
    let err = h.coordinator.retrieve_file(&file.id).await.unwrap_err();
    assert!(matches!(err, FabricError::Unavailable(_)));
}
