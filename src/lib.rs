//! Terracache - out-of-core chunk caching for very large raster grids
//!
//! This library lets numerical raster algorithms address grids far larger
//! than available memory through a plain `(row, col)` cell API. Grids are
//! partitioned into fixed-size chunks that a shared cache environment
//! keeps resident or swaps to disk under an explicit memory budget, with
//! a uniform-value encoding so homogeneous regions cost no heap at all.
//!
//! # High-Level API
//!
//! ```no_run
//! use terracache::env::CacheEnv;
//! use terracache::grid::Grid;
//! use terracache::types::CacheConfig;
//!
//! # fn main() -> Result<(), terracache::types::CacheError> {
//! let env = CacheEnv::new(CacheConfig::new().with_budget_bytes(256 * 1024 * 1024))?;
//! let elevation = Grid::new(50_000, 50_000, 256, 256, -9999.0, &env)?;
//!
//! elevation.set_cell(31_400, 27_182, 812.5)?;
//! assert_eq!(elevation.get_cell(31_400, 27_182)?, 812.5);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod env;
pub mod grid;
pub mod logging;
pub mod stats;
pub mod swap;
pub mod types;

/// Version of the terracache library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
