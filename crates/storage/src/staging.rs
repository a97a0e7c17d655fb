//! Temporary ciphertext store.
//!
//! Holds encrypted chunks between upload and confirmed distribution so the
//! healer can re-ship a replica without pulling it back from a device.
//! Layout is `<root>/<chunk_id>.chunk`; writes are atomic (temp file +
//! rename) and eviction is by file mtime. There is a single writer per
//! chunk id, so the rename never races with itself.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use csf_common::{FabricError, Result};

const CHUNK_EXT: &str = "chunk";

#[derive(Debug, Clone)]
pub struct StagingStore {
    root: PathBuf,
}

impl StagingStore {
    /// Open (creating if needed) a staging store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(StagingStore { root })
    }

    fn chunk_path(&self, chunk_id: &str) -> Result<PathBuf> {
        // chunk ids are coordinator-generated; reject anything path-like
        if chunk_id.is_empty() || chunk_id.contains(['/', '\\', '.']) {
            return Err(FabricError::InvalidInput(format!("bad chunk id '{}'", chunk_id)));
        }
        Ok(self.root.join(format!("{}.{}", chunk_id, CHUNK_EXT)))
    }

    /// Stage ciphertext for a chunk. Atomic: write to a temp file, then
    /// rename over the destination.
    pub fn put(&self, chunk_id: &str, data: &[u8]) -> Result<()> {
        let dest = self.chunk_path(chunk_id)?;
        let tmp = dest.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &dest)?;
        Ok(())
    }

    /// Read staged ciphertext if it is still present.
    pub fn get(&self, chunk_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.chunk_path(chunk_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let mut f = File::open(&path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn has(&self, chunk_id: &str) -> Result<bool> {
        Ok(self.chunk_path(chunk_id)?.exists())
    }

    /// Remove staged ciphertext. Returns whether anything was removed.
    pub fn remove(&self, chunk_id: &str) -> Result<bool> {
        let path = self.chunk_path(chunk_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    /// Evict every staged chunk whose mtime is older than `ttl`.
    /// Returns the number of files removed.
    pub fn evict_older_than(&self, ttl: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut evicted = 0usize;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("staging: cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= ttl {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("staging: evict failed for {}: {}", path.display(), e);
                } else {
                    debug!("staging: evicted {}", path.display());
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }

    /// Total size of staged ciphertext in bytes.
    pub fn total_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some(CHUNK_EXT) {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}
