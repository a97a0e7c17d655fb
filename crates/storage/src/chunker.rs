//! Split a file buffer into encrypted chunks.
//!
//! Sizing follows the configured [`ChunkPolicy`]. Adaptive sizing:
//!
//! | file size            | chunks            | chunk size          |
//! |----------------------|-------------------|---------------------|
//! | <= 1 GiB             | 1                 | file size           |
//! | (1 GiB, 5 GiB]       | ceil(size/500MiB) | 500 MiB (last rest) |
//! | > 5 GiB              | ceil(size/1GiB)   | 1 GiB (last rest)   |

use csf_common::{sha256_hex, ChunkPolicy, CryptoPipeline, FabricError, Result};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// File-level output of [`process_file`].
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub file_id: String,
    pub original_name: String,
    pub mime: String,
    pub size_bytes: u64,
    pub wrapped_dek: String,
    pub dek_id: String,
    /// SHA-256 of the whole plaintext, hex.
    pub plaintext_hash: String,
    pub chunk_count: u32,
}

/// One encrypted piece, ready to stage and persist.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub sequence_num: u32,
    /// Ciphertext size in bytes.
    pub size_bytes: u64,
    pub iv: String,
    pub auth_tag: String,
    pub aad: String,
    pub ciphertext_hash: String,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub meta: FileMeta,
    pub chunks: Vec<ChunkPiece>,
}

/// Compute the plaintext sizes of each chunk for a file of `size` bytes.
/// Returns an empty plan for an empty file.
pub fn plan_chunks(size: u64, policy: &ChunkPolicy) -> Vec<u64> {
    if size == 0 {
        return Vec::new();
    }
    let piece = match policy {
        ChunkPolicy::Fixed(bytes) => (*bytes).max(1),
        ChunkPolicy::Adaptive => {
            if size <= GIB {
                size
            } else if size <= 5 * GIB {
                500 * MIB
            } else {
                GIB
            }
        }
    };
    let mut sizes = Vec::new();
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(piece);
        sizes.push(n);
        remaining -= n;
    }
    sizes
}

/// Convert a file buffer into an ordered sequence of encrypted chunks.
///
/// Issues one wrapped DEK for the file, pins the whole-file plaintext hash,
/// then encrypts each planned piece with its derived per-chunk key.
///
/// Errors: empty file is `InvalidInput`; a buffer beyond `max_file_size`
/// is `TooLarge`.
pub fn process_file(
    buf: &[u8],
    original_name: &str,
    mime: &str,
    file_id: &str,
    policy: &ChunkPolicy,
    max_file_size: u64,
    crypto: &CryptoPipeline,
) -> Result<ProcessedFile> {
    if buf.is_empty() {
        return Err(FabricError::InvalidInput("empty file".to_string()));
    }
    let size = buf.len() as u64;
    if size > max_file_size {
        return Err(FabricError::TooLarge { size, limit: max_file_size });
    }

    let plaintext_hash = sha256_hex(buf);
    let dek = crypto.issue_wrapped_dek()?;

    let plan = plan_chunks(size, policy);
    let mut chunks = Vec::with_capacity(plan.len());
    let mut offset = 0usize;
    for (i, piece_len) in plan.iter().enumerate() {
        let end = offset + *piece_len as usize;
        let piece = &buf[offset..end];
        offset = end;

        let enc = crypto.encrypt_chunk(piece, &dek.wrapped_hex, file_id, i as u32)?;
        chunks.push(ChunkPiece {
            sequence_num: i as u32,
            size_bytes: enc.ciphertext.len() as u64,
            iv: hex::encode(enc.iv),
            auth_tag: hex::encode(enc.tag),
            aad: hex::encode(&enc.aad),
            ciphertext_hash: enc.ciphertext_hash,
            ciphertext: enc.ciphertext,
        });
    }

    Ok(ProcessedFile {
        meta: FileMeta {
            file_id: file_id.to_string(),
            original_name: original_name.to_string(),
            mime: mime.to_string(),
            size_bytes: size,
            wrapped_dek: dek.wrapped_hex,
            dek_id: dek.dek_id,
            plaintext_hash,
            chunk_count: chunks.len() as u32,
        },
        chunks,
    })
}
