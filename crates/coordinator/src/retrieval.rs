//! Retrieval: reconstitute a file from distributed replicas.
//!
//! Chunks are fetched concurrently; within a chunk, holders are tried in
//! order and a bad holder (transport failure or ciphertext hash mismatch)
//! just disqualifies itself. Live-holder lookups go through a small TTL
//! cache with the metadata store as fallback: if every cached holder fails,
//! the list is refreshed once and retried before the chunk gives up.
//! Decryption happens only after every ciphertext is in hand, and the
//! reassembled plaintext must match the file's recorded hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use csf_common::{sha256_hex, ChunkCiphertext, CryptoPipeline, FabricError, Result};
use csf_meta::{Chunk, FileRecord, FileState, MetaStore};

use crate::connections::ConnectionRegistry;

/// How long a resolved holder list stays usable.
pub const HOLDER_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct HolderRef {
    logical_device_id: String,
}

struct HolderCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<HolderRef>)>>,
}

impl HolderCache {
    fn new(ttl: Duration) -> Self {
        HolderCache { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn get(&self, chunk_id: &str) -> Option<Vec<HolderRef>> {
        let entries = self.entries.lock();
        entries.get(chunk_id).and_then(|(at, holders)| {
            (at.elapsed() < self.ttl).then(|| holders.clone())
        })
    }

    fn put(&self, chunk_id: &str, holders: Vec<HolderRef>) {
        self.entries.lock().insert(chunk_id.to_string(), (Instant::now(), holders));
    }

    fn invalidate(&self, chunk_id: &str) {
        self.entries.lock().remove(chunk_id);
    }
}

pub struct Retriever {
    store: Arc<dyn MetaStore>,
    connections: Arc<ConnectionRegistry>,
    crypto: Arc<CryptoPipeline>,
    cache: HolderCache,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn MetaStore>,
        connections: Arc<ConnectionRegistry>,
        crypto: Arc<CryptoPipeline>,
    ) -> Self {
        Retriever { store, connections, crypto, cache: HolderCache::new(HOLDER_CACHE_TTL) }
    }

    fn resolve_holders(&self, chunk_id: &str) -> Result<Vec<HolderRef>> {
        if let Some(cached) = self.cache.get(chunk_id) {
            return Ok(cached);
        }
        let holders: Vec<HolderRef> = self
            .store
            .healthy_holders(chunk_id)?
            .into_iter()
            .map(|(_, device)| HolderRef { logical_device_id: device.logical_device_id })
            .collect();
        self.cache.put(chunk_id, holders.clone());
        Ok(holders)
    }

    async fn try_holders(&self, chunk: &Chunk, holders: &[HolderRef]) -> Option<Vec<u8>> {
        for holder in holders {
            match self
                .connections
                .request_chunk(&holder.logical_device_id, &chunk.id)
                .await
            {
                Ok(ciphertext) => {
                    if sha256_hex(&ciphertext) != chunk.ciphertext_hash {
                        warn!(
                            "holder {} returned corrupt ciphertext for chunk {}",
                            holder.logical_device_id, chunk.id
                        );
                        continue;
                    }
                    return Some(ciphertext);
                }
                Err(e) => {
                    debug!(
                        "holder {} failed for chunk {}: {}",
                        holder.logical_device_id, chunk.id, e
                    );
                }
            }
        }
        None
    }

    /// Fetch verified ciphertext for one chunk with holder fail-over.
    async fn fetch_ciphertext(&self, chunk: &Chunk) -> Result<Vec<u8>> {
        let cached = self.cache.get(&chunk.id).is_some();
        let holders = self.resolve_holders(&chunk.id)?;
        if holders.is_empty() {
            return Err(FabricError::Unavailable(format!(
                "no live replica for chunk {}",
                chunk.id
            )));
        }
        if let Some(ciphertext) = self.try_holders(chunk, &holders).await {
            return Ok(ciphertext);
        }

        // every cached holder failed: fall back to a fresh metadata read
        if cached {
            self.cache.invalidate(&chunk.id);
            let fresh = self.resolve_holders(&chunk.id)?;
            if !fresh.is_empty() {
                if let Some(ciphertext) = self.try_holders(chunk, &fresh).await {
                    return Ok(ciphertext);
                }
            }
        }
        Err(FabricError::Unavailable(format!("all holders failed for chunk {}", chunk.id)))
    }

    fn decrypt(&self, file: &FileRecord, chunk: &Chunk, ciphertext: Vec<u8>) -> Result<Vec<u8>> {
        let decode = |field: &str, value: &str| {
            hex::decode(value).map_err(|e| {
                FabricError::Internal(format!("corrupt {} on chunk {}: {}", field, chunk.id, e))
            })
        };
        let input = ChunkCiphertext {
            ciphertext,
            iv: decode("iv", &chunk.iv)?,
            tag: decode("auth_tag", &chunk.auth_tag)?,
            aad: decode("aad", &chunk.aad)?,
            ciphertext_hash: chunk.ciphertext_hash.clone(),
            wrapped_dek_hex: file.wrapped_dek.clone(),
            file_id: file.id.clone(),
            chunk_index: chunk.sequence_num,
        };
        self.crypto.decrypt_chunk(&input)
    }

    /// Fetch, decrypt, reorder, and verify a whole file.
    pub async fn retrieve_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = self
            .store
            .get_file(file_id)?
            .ok_or_else(|| FabricError::NotFound(format!("file {}", file_id)))?;
        if file.state == FileState::Deleted {
            return Err(FabricError::NotFound(format!("file {}", file_id)));
        }

        let chunks = self.store.chunks_by_file(file_id)?;
        if chunks.len() as u32 != file.chunk_count {
            return Err(FabricError::Unavailable(format!(
                "file {} has {} of {} chunk rows",
                file_id,
                chunks.len(),
                file.chunk_count
            )));
        }

        // all chunks in flight concurrently; order is restored below
        let fetches = chunks.iter().map(|chunk| async move {
            let ciphertext = self.fetch_ciphertext(chunk).await?;
            Ok::<(u32, Vec<u8>), FabricError>((chunk.sequence_num, ciphertext))
        });
        let mut fetched: Vec<(u32, Vec<u8>)> = Vec::with_capacity(chunks.len());
        for result in join_all(fetches).await {
            fetched.push(result?);
        }
        fetched.sort_by_key(|(seq, _)| *seq);

        let mut plaintext = Vec::with_capacity(file.size_bytes as usize);
        for ((_, ciphertext), chunk) in fetched.into_iter().zip(chunks.iter()) {
            let piece = self.decrypt(&file, chunk, ciphertext)?;
            plaintext.extend_from_slice(&piece);
        }

        if sha256_hex(&plaintext) != file.plaintext_hash {
            return Err(FabricError::Integrity(format!(
                "reassembled file {} does not match its recorded hash",
                file_id
            )));
        }
        Ok(plaintext)
    }
}
