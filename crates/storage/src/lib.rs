//! # CSF Storage Crate
//!
//! File-to-chunk processing and the coordinator-local ciphertext staging
//! area.
//!
//! ## Modules
//! - `chunker`: adaptive chunk sizing and the encrypt-every-piece pipeline
//! - `staging`: file-backed temporary store for ciphertext between upload
//!   and confirmed distribution

pub mod chunker;
pub mod staging;

pub use chunker::{plan_chunks, process_file, ChunkPiece, FileMeta, ProcessedFile};
pub use staging::StagingStore;
