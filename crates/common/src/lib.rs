//! # CSF Common Crate
//!
//! Shared building blocks for the CSF (Consumer Storage Fabric) coordinator.
//!
//! ## Modules
//! - `config`: typed TOML configuration with validation
//! - `crypto`: KEK/DEK management and the per-chunk AEAD pipeline
//! - `digest`: SHA-256 content hashing helpers
//! - `error`: the shared error taxonomy used across all crates
//! - `util`: timestamps and row id generation

pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod util;

pub use config::{ChunkPolicy, Config};
pub use crypto::{ChunkCiphertext, CryptoPipeline, EncryptedChunk, WrappedDek};
pub use digest::{sha256, sha256_hex};
pub use error::{FabricError, Result};
pub use util::{current_timestamp_ms, new_row_id};
