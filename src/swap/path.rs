//! Swap file path construction.

use crate::types::{ChunkKey, GridId};
use std::path::{Path, PathBuf};

/// Construct the full path for a swapped chunk file.
///
/// Creates a hierarchical path structure:
/// ```text
/// <swap_dir>/grid-<id>/<chunk_row>/<chunk_row>_<chunk_col>.chunk
/// ```
///
/// The per-row directory level keeps directory fan-out bounded for grids
/// with very large chunk counts.
///
/// # Example
///
/// ```
/// use std::path::PathBuf;
/// use terracache::swap::swap_path;
/// use terracache::types::{ChunkKey, GridId};
///
/// let key = ChunkKey::new(GridId::default(), 12, 5);
/// let path = swap_path(&PathBuf::from("/swap"), &key);
///
/// assert_eq!(path, PathBuf::from("/swap/grid-0/12/12_5.chunk"));
/// ```
pub fn swap_path(swap_dir: &Path, key: &ChunkKey) -> PathBuf {
    row_directory(swap_dir, key).join(format!("{}_{}.chunk", key.chunk_row, key.chunk_col))
}

/// Directory holding all swapped chunks for one chunk row of a grid.
pub fn row_directory(swap_dir: &Path, key: &ChunkKey) -> PathBuf {
    grid_directory(swap_dir, key.grid).join(key.chunk_row.to_string())
}

/// Directory holding all swapped chunks for a grid.
pub fn grid_directory(swap_dir: &Path, grid: GridId) -> PathBuf {
    swap_dir.join(grid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_path_structure() {
        let key = ChunkKey::new(GridId(3), 12, 5);
        let path = swap_path(&PathBuf::from("/swap"), &key);
        assert_eq!(path, PathBuf::from("/swap/grid-3/12/12_5.chunk"));
    }

    #[test]
    fn test_row_directory() {
        let key = ChunkKey::new(GridId(3), 12, 5);
        let dir = row_directory(&PathBuf::from("/swap"), &key);
        assert_eq!(dir, PathBuf::from("/swap/grid-3/12"));
    }

    #[test]
    fn test_grid_directory() {
        let dir = grid_directory(&PathBuf::from("/swap"), GridId(9));
        assert_eq!(dir, PathBuf::from("/swap/grid-9"));
    }

    #[test]
    fn test_keys_map_to_distinct_paths() {
        let root = PathBuf::from("/swap");
        let a = swap_path(&root, &ChunkKey::new(GridId(1), 2, 3));
        let b = swap_path(&root, &ChunkKey::new(GridId(1), 3, 2));
        let c = swap_path(&root, &ChunkKey::new(GridId(2), 2, 3));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }
}
