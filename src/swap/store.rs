//! Filesystem-backed store for evicted chunks.

use crate::chunk::Chunk;
use crate::swap::codec::{decode_chunk, encode_chunk};
use crate::swap::path::{grid_directory, swap_path};
use crate::types::{CacheError, ChunkKey, GridId};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persistent storage for evicted chunks.
///
/// Writes are synchronous: an eviction's write-back completes before the
/// in-memory copy is discarded, which is what makes eviction invisible to
/// readers.
#[derive(Debug)]
pub struct SwapStore {
    /// Swap directory root
    swap_dir: PathBuf,
}

impl SwapStore {
    /// Create a swap store rooted at `swap_dir`.
    ///
    /// The directory is created if it does not exist.
    pub fn new(swap_dir: PathBuf) -> Result<Self, CacheError> {
        if !swap_dir.exists() {
            fs::create_dir_all(&swap_dir)?;
        }
        Ok(Self { swap_dir })
    }

    /// The store's root directory.
    pub fn swap_dir(&self) -> &Path {
        &self.swap_dir
    }

    /// Persist a chunk under its key, replacing any previous entry.
    pub fn write(&self, key: &ChunkKey, chunk: &Chunk) -> Result<usize, CacheError> {
        let path = swap_path(&self.swap_dir, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = encode_chunk(chunk);
        fs::write(&path, &bytes)?;
        debug!(key = %key, bytes = bytes.len(), "chunk written to swap store");
        Ok(bytes.len())
    }

    /// Load a chunk back from the store.
    ///
    /// A missing or undecodable entry is an error: fault-in is only
    /// attempted for chunks known to have been written back, so failure
    /// here is unrecoverable data loss.
    pub fn read(&self, key: &ChunkKey) -> Result<(Chunk, usize), CacheError> {
        let path = swap_path(&self.swap_dir, key);
        let bytes = fs::read(&path)?;
        let chunk = decode_chunk(&bytes)?;
        debug!(key = %key, bytes = bytes.len(), "chunk read from swap store");
        Ok((chunk, bytes.len()))
    }

    /// Whether an entry exists for the key.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        swap_path(&self.swap_dir, key).exists()
    }

    /// Remove the entry for a key. Removing a missing entry is not an error.
    pub fn delete(&self, key: &ChunkKey) -> Result<(), CacheError> {
        let path = swap_path(&self.swap_dir, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every entry belonging to a grid.
    ///
    /// Called when a grid is dropped so its evicted chunks' files do not
    /// linger as orphans.
    pub fn delete_grid(&self, grid: GridId) -> Result<(), CacheError> {
        let dir = grid_directory(&self.swap_dir, grid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(grid = %grid, "swap entries reclaimed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
