//! Chunk encryption pipeline: KEK wrapping, per-chunk key derivation, and
//! AES-256-GCM with bound associated data.
//!
//! Key hierarchy:
//!
//! ```text
//! KEK (process-wide, 32 bytes)
//!  └── DEK (per file, 32 bytes, stored wrapped as nonce ∥ tag ∥ ct hex)
//!       └── chunk key = HKDF-SHA256(ikm=DEK, salt=file_id, info="chunk-<i>")
//!            └── IV    = HMAC-SHA256(chunk key, file_id ∥ index_byte)[0..12]
//! ```
//!
//! Storage nodes only ever see ciphertext; plaintext DEKs and chunk keys are
//! zeroed as soon as each operation completes. The AAD binds ciphertext to
//! its logical identity `{file_id, chunk_index, version}`, so replaying a
//! chunk under a different file or sequence number fails authentication.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::digest::sha256_hex;
use crate::error::{FabricError, Result};

/// KEK and DEK length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;
/// Length of a fresh DEK identifier in bytes (hex doubles it on the wire).
pub const DEK_ID_LEN: usize = 16;
/// AAD format version bound into every chunk.
pub const AAD_VERSION: u8 = 1;

/// A freshly issued data-encryption key in its wrapped (storable) form.
#[derive(Debug, Clone)]
pub struct WrappedDek {
    /// `nonce ∥ tag ∥ ct` under the KEK, hex encoded.
    pub wrapped_hex: String,
    /// Random 16-byte identifier, hex encoded.
    pub dek_id: String,
}

/// Output of [`CryptoPipeline::encrypt_chunk`].
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub aad: Vec<u8>,
    /// SHA-256 of the ciphertext, hex encoded.
    pub ciphertext_hash: String,
}

/// Input to [`CryptoPipeline::decrypt_chunk`]: the AEAD material exactly as
/// persisted plus the chunk's logical identity.
#[derive(Debug, Clone)]
pub struct ChunkCiphertext {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub aad: Vec<u8>,
    pub ciphertext_hash: String,
    pub wrapped_dek_hex: String,
    pub file_id: String,
    pub chunk_index: u32,
}

/// Canonical AAD encoding. Field order is fixed by declaration order, so the
/// serialized form is deterministic.
#[derive(Serialize)]
struct ChunkAad<'a> {
    file_id: &'a str,
    chunk_index: u32,
    version: u8,
}

/// The chunk encryption pipeline. Holds the process-wide KEK; construct once
/// at startup and share behind an `Arc`.
pub struct CryptoPipeline {
    kek: Zeroizing<[u8; KEY_LEN]>,
}

impl std::fmt::Debug for CryptoPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoPipeline").field("kek", &"<redacted>").finish()
    }
}

impl CryptoPipeline {
    /// Initialize with a 32-byte KEK in hex. Must be called before any other
    /// operation; a malformed KEK is a fatal configuration error.
    pub fn init(kek_hex: &str) -> Result<Self> {
        let bytes = hex::decode(kek_hex)
            .map_err(|e| FabricError::Config(format!("KEK is not valid hex: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(FabricError::Config(format!(
                "KEK must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut kek = Zeroizing::new([0u8; KEY_LEN]);
        kek.copy_from_slice(&bytes);
        Ok(CryptoPipeline { kek })
    }

    /// Generate a fresh 32-byte DEK and wrap it under the KEK with a random
    /// 12-byte nonce. The plaintext DEK is zeroed before returning.
    pub fn issue_wrapped_dek(&self) -> Result<WrappedDek> {
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(dek.as_mut());

        let mut nonce = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(self.kek.as_ref())
            .map_err(|e| FabricError::Crypto(format!("KEK init failed: {}", e)))?;
        let ct_and_tag = cipher
            .encrypt(Nonce::from_slice(&nonce), dek.as_ref() as &[u8])
            .map_err(|_| FabricError::Crypto("DEK wrap failed".to_string()))?;
        let (ct, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);

        // wrapped layout: nonce ∥ tag ∥ ct
        let mut wrapped = Vec::with_capacity(IV_LEN + TAG_LEN + KEY_LEN);
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(tag);
        wrapped.extend_from_slice(ct);

        let mut dek_id = [0u8; DEK_ID_LEN];
        OsRng.fill_bytes(&mut dek_id);

        Ok(WrappedDek {
            wrapped_hex: hex::encode(wrapped),
            dek_id: hex::encode(dek_id),
        })
    }

    /// Unwrap a `nonce ∥ tag ∥ ct` hex blob back into a plaintext DEK.
    fn unwrap_dek(&self, wrapped_hex: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let blob = hex::decode(wrapped_hex)
            .map_err(|e| FabricError::Crypto(format!("wrapped DEK is not valid hex: {}", e)))?;
        if blob.len() != IV_LEN + TAG_LEN + KEY_LEN {
            return Err(FabricError::Crypto(format!(
                "wrapped DEK has malformed length {}",
                blob.len()
            )));
        }
        let nonce = &blob[..IV_LEN];
        let tag = &blob[IV_LEN..IV_LEN + TAG_LEN];
        let ct = &blob[IV_LEN + TAG_LEN..];

        // aes-gcm expects ct ∥ tag
        let mut ct_and_tag = Vec::with_capacity(ct.len() + TAG_LEN);
        ct_and_tag.extend_from_slice(ct);
        ct_and_tag.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(self.kek.as_ref())
            .map_err(|e| FabricError::Crypto(format!("KEK init failed: {}", e)))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ct_and_tag.as_slice())
            .map_err(|_| FabricError::Crypto("DEK unwrap failed: tag mismatch".to_string()))?;
        if plain.len() != KEY_LEN {
            return Err(FabricError::Crypto(format!(
                "unwrapped DEK has length {}, expected {}",
                plain.len(),
                KEY_LEN
            )));
        }
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        dek.copy_from_slice(&plain);
        Ok(dek)
    }

    /// Encrypt one chunk: unwrap the DEK, derive the per-chunk key and IV,
    /// bind the chunk identity as AAD, and hash the ciphertext.
    pub fn encrypt_chunk(
        &self,
        plaintext: &[u8],
        wrapped_dek_hex: &str,
        file_id: &str,
        chunk_index: u32,
    ) -> Result<EncryptedChunk> {
        let dek = self.unwrap_dek(wrapped_dek_hex)?;
        let key = derive_chunk_key(&dek, file_id, chunk_index)?;
        let iv = derive_chunk_iv(&key, file_id, chunk_index)?;
        let aad = chunk_aad(file_id, chunk_index)?;

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| FabricError::Crypto(format!("chunk key init failed: {}", e)))?;
        let ct_and_tag = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad: &aad })
            .map_err(|_| FabricError::Crypto("chunk encryption failed".to_string()))?;

        let split = ct_and_tag.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&ct_and_tag[split..]);
        let ciphertext = ct_and_tag[..split].to_vec();
        let ciphertext_hash = sha256_hex(&ciphertext);

        Ok(EncryptedChunk { ciphertext, iv, tag, aad, ciphertext_hash })
    }

    /// Decrypt one chunk. Validates AEAD material lengths and the ciphertext
    /// hash before touching key material; the stored IV and AAD are used as
    /// provided, so any bit flipped in transit fails authentication.
    pub fn decrypt_chunk(&self, input: &ChunkCiphertext) -> Result<Vec<u8>> {
        if input.iv.len() != IV_LEN {
            return Err(FabricError::InvalidInput(format!(
                "iv must be {} bytes, got {}",
                IV_LEN,
                input.iv.len()
            )));
        }
        if input.tag.len() != TAG_LEN {
            return Err(FabricError::InvalidInput(format!(
                "auth tag must be {} bytes, got {}",
                TAG_LEN,
                input.tag.len()
            )));
        }
        if sha256_hex(&input.ciphertext) != input.ciphertext_hash {
            return Err(FabricError::Integrity("ciphertext hash mismatch".to_string()));
        }

        let dek = self.unwrap_dek(&input.wrapped_dek_hex)?;
        let key = derive_chunk_key(&dek, &input.file_id, input.chunk_index)?;

        let mut ct_and_tag = Vec::with_capacity(input.ciphertext.len() + TAG_LEN);
        ct_and_tag.extend_from_slice(&input.ciphertext);
        ct_and_tag.extend_from_slice(&input.tag);

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| FabricError::Crypto(format!("chunk key init failed: {}", e)))?;
        cipher
            .decrypt(
                Nonce::from_slice(&input.iv),
                Payload { msg: &ct_and_tag, aad: &input.aad },
            )
            .map_err(|_| FabricError::Auth("chunk authentication failed".to_string()))
    }
}

/// HKDF-SHA256 with `salt = file_id` and `info = "chunk-<index>"`, 32 bytes.
/// Distinct `(file_id, chunk_index)` pairs yield independent keys.
fn derive_chunk_key(
    dek: &Zeroizing<[u8; KEY_LEN]>,
    file_id: &str,
    chunk_index: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(file_id.as_bytes()), dek.as_ref());
    let info = format!("chunk-{}", chunk_index);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info.as_bytes(), key.as_mut())
        .map_err(|_| FabricError::Crypto("HKDF expand failed".to_string()))?;
    Ok(key)
}

/// Deterministic IV: first 12 bytes of `HMAC-SHA256(key, file_id ∥ index_byte)`.
/// The key is unique per chunk, so the IV never repeats across chunks.
fn derive_chunk_iv(
    key: &Zeroizing<[u8; KEY_LEN]>,
    file_id: &str,
    chunk_index: u32,
) -> Result<[u8; IV_LEN]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_ref())
        .map_err(|_| FabricError::Crypto("HMAC init failed".to_string()))?;
    mac.update(file_id.as_bytes());
    mac.update(&[(chunk_index & 0xff) as u8]);
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    Ok(iv)
}

/// Canonical AAD bytes for a chunk identity.
fn chunk_aad(file_id: &str, chunk_index: u32) -> Result<Vec<u8>> {
    serde_json::to_vec(&ChunkAad { file_id, chunk_index, version: AAD_VERSION })
        .map_err(|e| FabricError::Internal(format!("AAD encoding failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> CryptoPipeline {
        CryptoPipeline::init(&"ab".repeat(32)).expect("init")
    }

    fn encrypt_sample(p: &CryptoPipeline, dek: &WrappedDek) -> ChunkCiphertext {
        let enc = p
            .encrypt_chunk(b"the quick brown fox", &dek.wrapped_hex, "file-1", 0)
            .expect("encrypt");
        ChunkCiphertext {
            ciphertext: enc.ciphertext,
            iv: enc.iv.to_vec(),
            tag: enc.tag.to_vec(),
            aad: enc.aad,
            ciphertext_hash: enc.ciphertext_hash,
            wrapped_dek_hex: dek.wrapped_hex.clone(),
            file_id: "file-1".to_string(),
            chunk_index: 0,
        }
    }

    #[test]
    fn test_init_rejects_bad_kek() {
        assert!(matches!(CryptoPipeline::init("zz"), Err(FabricError::Config(_))));
        assert!(matches!(CryptoPipeline::init("abcd"), Err(FabricError::Config(_))));
        assert!(CryptoPipeline::init(&"00".repeat(32)).is_ok());
    }

    #[test]
    fn test_wrapped_dek_shape() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        // nonce(12) + tag(16) + ct(32) = 60 bytes = 120 hex chars
        assert_eq!(dek.wrapped_hex.len(), 120);
        assert_eq!(dek.dek_id.len(), DEK_ID_LEN * 2);
    }

    #[test]
    fn test_issue_produces_distinct_deks() {
        let p = pipeline();
        let a = p.issue_wrapped_dek().expect("a");
        let b = p.issue_wrapped_dek().expect("b");
        assert_ne!(a.wrapped_hex, b.wrapped_hex);
        assert_ne!(a.dek_id, b.dek_id);
    }

    #[test]
    fn test_unwrap_rejects_malformed() {
        let p = pipeline();
        assert!(p.unwrap_dek("not hex at all").is_err());
        assert!(p.unwrap_dek("aabb").is_err());

        // tampered wrap fails the tag check
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut blob = hex::decode(&dek.wrapped_hex).unwrap();
        blob[30] ^= 0x01;
        assert!(matches!(p.unwrap_dek(&hex::encode(blob)), Err(FabricError::Crypto(_))));
    }

    #[test]
    fn test_unwrap_under_wrong_kek_fails() {
        let p = pipeline();
        let other = CryptoPipeline::init(&"cd".repeat(32)).expect("init");
        let dek = p.issue_wrapped_dek().expect("issue");
        assert!(other.unwrap_dek(&dek.wrapped_hex).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let input = encrypt_sample(&p, &dek);
        let plain = p.decrypt_chunk(&input).expect("decrypt");
        assert_eq!(plain, b"the quick brown fox");
    }

    #[test]
    fn test_encryption_is_deterministic_per_identity() {
        // Derived IVs make the pipeline deterministic for a fixed
        // (DEK, file, index); re-encrypting after a crash yields the same
        // ciphertext, which keeps healed replicas interchangeable.
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let a = p.encrypt_chunk(b"payload", &dek.wrapped_hex, "f", 3).expect("a");
        let b = p.encrypt_chunk(b"payload", &dek.wrapped_hex, "f", 3).expect("b");
        assert_eq!(a.ciphertext, b.ciphertext);
        assert_eq!(a.iv, b.iv);
        assert_eq!(a.tag, b.tag);
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.ciphertext[0] ^= 0x01;
        assert!(matches!(p.decrypt_chunk(&input), Err(FabricError::Integrity(_))));
    }

    #[test]
    fn test_tampered_ciphertext_with_matching_hash_fails_auth() {
        // An attacker who also fixes up the hash still hits the AEAD tag.
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.ciphertext[0] ^= 0x01;
        input.ciphertext_hash = crate::digest::sha256_hex(&input.ciphertext);
        assert!(matches!(p.decrypt_chunk(&input), Err(FabricError::Auth(_))));
    }

    #[test]
    fn test_tampered_iv_fails() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.iv[0] ^= 0x01;
        assert!(matches!(p.decrypt_chunk(&input), Err(FabricError::Auth(_))));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.tag[15] ^= 0x01;
        assert!(matches!(p.decrypt_chunk(&input), Err(FabricError::Auth(_))));
    }

    #[test]
    fn test_tampered_aad_fails() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.aad[0] ^= 0x01;
        assert!(matches!(p.decrypt_chunk(&input), Err(FabricError::Auth(_))));
    }

    #[test]
    fn test_wrong_file_id_fails() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.file_id = "file-2".to_string();
        assert!(p.decrypt_chunk(&input).is_err());
    }

    #[test]
    fn test_wrong_chunk_index_fails() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let mut input = encrypt_sample(&p, &dek);
        input.chunk_index = 1;
        assert!(p.decrypt_chunk(&input).is_err());
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let good = encrypt_sample(&p, &dek);

        let mut short_iv = good.clone();
        short_iv.iv.pop();
        assert!(matches!(p.decrypt_chunk(&short_iv), Err(FabricError::InvalidInput(_))));

        let mut short_tag = good;
        short_tag.tag.pop();
        assert!(matches!(p.decrypt_chunk(&short_tag), Err(FabricError::InvalidInput(_))));
    }

    #[test]
    fn test_distinct_chunks_share_neither_key_nor_iv() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let raw_dek = p.unwrap_dek(&dek.wrapped_hex).expect("unwrap");

        let k0 = derive_chunk_key(&raw_dek, "f", 0).expect("k0");
        let k1 = derive_chunk_key(&raw_dek, "f", 1).expect("k1");
        let k_other = derive_chunk_key(&raw_dek, "g", 0).expect("k other");
        assert_ne!(k0.as_ref(), k1.as_ref());
        assert_ne!(k0.as_ref(), k_other.as_ref());

        let iv0 = derive_chunk_iv(&k0, "f", 0).expect("iv0");
        let iv1 = derive_chunk_iv(&k1, "f", 1).expect("iv1");
        assert_ne!(iv0, iv1);
    }

    #[test]
    fn test_aad_is_canonical() {
        let a = chunk_aad("file-1", 7).expect("aad");
        let b = chunk_aad("file-1", 7).expect("aad");
        assert_eq!(a, b);
        let text = String::from_utf8(a).expect("utf8");
        assert!(text.contains("\"file_id\":\"file-1\""));
        assert!(text.contains("\"chunk_index\":7"));
        assert!(text.contains("\"version\":1"));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let p = pipeline();
        let dek = p.issue_wrapped_dek().expect("issue");
        let enc = p.encrypt_chunk(b"", &dek.wrapped_hex, "f", 0).expect("encrypt");
        assert!(enc.ciphertext.is_empty());
        let input = ChunkCiphertext {
            ciphertext: enc.ciphertext,
            iv: enc.iv.to_vec(),
            tag: enc.tag.to_vec(),
            aad: enc.aad,
            ciphertext_hash: enc.ciphertext_hash,
            wrapped_dek_hex: dek.wrapped_hex,
            file_id: "f".to_string(),
            chunk_index: 0,
        };
        assert_eq!(p.decrypt_chunk(&input).expect("decrypt"), b"");
    }
}
