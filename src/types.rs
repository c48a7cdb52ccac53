//! Core types shared across the cache engine.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Identifier assigned to a grid when it registers with a cache environment.
///
/// Stable for the lifetime of the grid and never reused within one
/// environment, so swap-store keys derived from it stay unambiguous.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridId(pub(crate) u64);

impl GridId {
    /// Raw numeric value of this identifier.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GridId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid-{}", self.0)
    }
}

/// Key uniquely identifying one chunk of one grid.
///
/// Used for swap-store addressing, the protected set, and victim selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// Owning grid
    pub grid: GridId,
    /// Chunk row within the grid's chunk grid
    pub chunk_row: usize,
    /// Chunk column within the grid's chunk grid
    pub chunk_col: usize,
}

impl ChunkKey {
    /// Create a new chunk key.
    pub fn new(grid: GridId, chunk_row: usize, chunk_col: usize) -> Self {
        Self {
            grid,
            chunk_row,
            chunk_col,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{},{}", self.grid, self.chunk_row, self.chunk_col)
    }
}

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Addressing outside a grid or chunk extent. A caller contract
    /// violation, never retried.
    #[error("out of bounds: ({row}, {col}) not within {rows}x{cols}")]
    OutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    /// The memory budget cannot satisfy a chunk allocation. Transient:
    /// handled internally by the eviction/retry protocol and never visible
    /// to callers unless recovery itself fails.
    #[error("allocation failed: requested {requested} bytes, {available} available")]
    AllocationFailed { requested: usize, available: usize },

    /// I/O failure reading or writing the swap store.
    #[error("swap store I/O error: {0}")]
    SwapIo(#[from] std::io::Error),

    /// No eligible eviction victim remained. Fatal for the requested
    /// operation; the caller may abandon the computation but cannot resume
    /// it transparently.
    #[error("memory exhausted: no evictable chunk remains")]
    MemoryExhausted,

    /// Invalid configuration or construction parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Memory budget configuration.
#[derive(Debug, Clone)]
pub struct MemoryBudgetConfig {
    /// Maximum bytes of resident chunk data, reserve included
    /// (default: 2 GB)
    pub budget_bytes: usize,
    /// Size of the pre-allocated emergency reserve freed first under
    /// memory pressure (default: 1 MB)
    pub reserve_bytes: usize,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 2 * 1024 * 1024 * 1024, // 2 GB
            reserve_bytes: 1024 * 1024,           // 1 MB
        }
    }
}

/// Swap store configuration.
#[derive(Debug, Clone)]
pub struct SwapConfig {
    /// Root directory for swapped chunk files
    pub swap_dir: PathBuf,
}

impl Default for SwapConfig {
    fn default() -> Self {
        let swap_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("terracache");

        Self { swap_dir }
    }
}

/// Complete cache environment configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Memory budget configuration
    pub budget: MemoryBudgetConfig,
    /// Swap store configuration
    pub swap: SwapConfig,
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory budget in bytes.
    pub fn with_budget_bytes(mut self, bytes: usize) -> Self {
        self.budget.budget_bytes = bytes;
        self
    }

    /// Set the emergency reserve size in bytes.
    pub fn with_reserve_bytes(mut self, bytes: usize) -> Self {
        self.budget.reserve_bytes = bytes;
        self
    }

    /// Set the swap store root directory.
    pub fn with_swap_dir(mut self, dir: PathBuf) -> Self {
        self.swap.swap_dir = dir;
        self
    }
}
