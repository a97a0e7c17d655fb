//! # CSF Metadata Crate
//!
//! The coordinator's persisted state: devices, files, chunks, and placements,
//! plus the transactional store contract they are accessed through.
//!
//! ## Modules
//! - `model`: entity definitions and state enums
//! - `store`: the `MetaStore` trait (the relational-store contract)
//! - `memory`: in-memory reference implementation used in wiring and tests
//!
//! The metadata store is the single source of truth; every cross-component
//! invariant is reconciled there. A relational implementation with real
//! transactions is an external collaborator and lives outside this repo.

pub mod memory;
pub mod model;
pub mod store;

pub use memory::MemoryMetaStore;
pub use model::{Chunk, ChunkLocation, ChunkState, Device, DeviceState, FileRecord, FileState};
pub use store::MetaStore;
