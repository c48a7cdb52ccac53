//! Integration tests for the eviction and recovery protocol.
//!
//! These tests drive whole grids through a deliberately tiny memory budget
//! and verify:
//! - Transparent eviction under pressure (writes succeed, reads see them)
//! - Victim selection respecting protection scopes and the active chunk
//! - `MemoryExhausted` when no chunk is evictable
//! - Swap reclamation when a grid is dropped
//!
//! Run with: `cargo test --test eviction_integration`

use tempfile::TempDir;
use terracache::env::CacheEnv;
use terracache::grid::Grid;
use terracache::types::{CacheConfig, CacheError};

const NODATA: f64 = -9999.0;

/// Heap cost of one dense 2x2 chunk.
const CHUNK_BYTES: usize = 2 * 2 * 8;

const RESERVE: usize = 16;

/// Environment whose headroom fits exactly `dense_chunks` 2x2 chunks.
fn tiny_env(dense_chunks: usize) -> (CacheEnv, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::new()
        .with_budget_bytes(RESERVE + dense_chunks * CHUNK_BYTES)
        .with_reserve_bytes(RESERVE)
        .with_swap_dir(dir.path().join("swap"));
    (CacheEnv::new(config).unwrap(), dir)
}

#[test]
fn test_writes_across_budget_pressure_are_transparent() {
    // Room for a single dense chunk; the grid has four.
    let (env, _dir) = tiny_env(1);
    let grid = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();

    // Each write diverges one chunk to dense, forcing the previous chunk
    // out through the recovery protocol.
    let cells = [(0, 0, 1.0), (0, 2, 2.0), (2, 0, 3.0), (2, 2, 4.0)];
    for (row, col, value) in cells {
        grid.set_cell(row, col, value).unwrap();
    }

    assert!(env.stats().evictions >= 3);
    assert!(env.stats().recoveries >= 3);
    assert!(env.resident_bytes() <= env.budget_bytes());

    // Reads fault evicted chunks back in; every write is observed.
    for (row, col, value) in cells {
        assert_eq!(grid.get_cell(row, col).unwrap(), value);
    }
    // Untouched cells still read as no-data.
    assert_eq!(grid.get_cell(1, 1).unwrap(), NODATA);
}

#[test]
fn test_protection_steers_victim_selection() {
    let (env, _dir) = tiny_env(2);
    let grid = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();

    // Two dense chunks fill the budget.
    grid.set_cell(0, 0, 1.0).unwrap();
    grid.set_cell(0, 2, 2.0).unwrap();
    assert!(grid.is_resident(0, 0).unwrap());
    assert!(grid.is_resident(0, 1).unwrap());

    // Pin chunk (0, 0); the next pressure must pick chunk (0, 1) even
    // though (0, 0) comes first in scan order.
    let scope = env.begin_protection();
    grid.protect(0, 0, 0).unwrap();
    grid.set_cell(2, 0, 3.0).unwrap();
    scope.end();

    assert!(grid.is_resident(0, 0).unwrap());
    assert!(!grid.is_resident(0, 1).unwrap());
    assert!(grid.is_resident(1, 0).unwrap());

    // The evicted chunk's data survived the round-trip.
    assert_eq!(grid.get_cell(0, 2).unwrap(), 2.0);
}

#[test]
fn test_all_chunks_protected_exhausts_memory() {
    let (env, _dir) = tiny_env(2);
    let grid = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();

    grid.set_cell(0, 0, 1.0).unwrap();
    grid.set_cell(0, 2, 2.0).unwrap();

    // Pin the whole grid. Nothing is evictable, so a third dense chunk
    // cannot be accommodated.
    let scope = env.begin_protection();
    grid.protect(1, 1, 1).unwrap();
    assert!(matches!(
        grid.set_cell(2, 0, 3.0),
        Err(CacheError::MemoryExhausted)
    ));
    scope.end();

    // With the scope closed the same write goes through.
    grid.set_cell(2, 0, 3.0).unwrap();
    assert_eq!(grid.get_cell(2, 0).unwrap(), 3.0);
}

#[test]
fn test_active_chunk_is_never_its_own_victim() {
    // Headroom for one dense chunk and the grid has exactly one chunk, so
    // once it is dense any further allocation finds no other victim.
    let (env, _dir) = tiny_env(1);
    let grid = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();

    grid.set_cell(0, 0, 1.0).unwrap();
    assert!(grid.is_resident(0, 0).unwrap());

    // A second grid's diverging write cannot evict its own faulting chunk
    // either; the only victim is the first grid's chunk.
    let other = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    other.set_cell(0, 0, 2.0).unwrap();

    assert!(!grid.is_resident(0, 0).unwrap());
    assert!(other.is_resident(0, 0).unwrap());
    assert_eq!(grid.get_cell(0, 0).unwrap(), 1.0);
}

#[test]
fn test_uniform_chunks_live_within_zero_headroom() {
    // Budget equals the reserve: no headroom for dense chunks at all.
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::new()
        .with_budget_bytes(RESERVE)
        .with_reserve_bytes(RESERVE)
        .with_swap_dir(dir.path().join("swap"));
    let env = CacheEnv::new(config).unwrap();
    let grid = Grid::new(8, 8, 2, 2, NODATA, &env).unwrap();

    // Uniform chunks cost nothing, so whole-chunk fills and reads work.
    grid.fill(7.0).unwrap();
    assert_eq!(grid.get_cell(5, 5).unwrap(), 7.0);
    assert_eq!(env.resident_bytes(), 0);

    // A diverging write needs a dense buffer that can never fit. Recovery
    // evicts uniform chunks (freeing nothing) until none remain, then
    // reports exhaustion instead of looping forever.
    assert!(matches!(
        grid.set_cell(0, 0, 1.0),
        Err(CacheError::MemoryExhausted)
    ));

    // The failed write had no effect.
    assert_eq!(grid.get_cell(0, 0).unwrap(), 7.0);
}

#[test]
fn test_eviction_pressure_across_multiple_grids() {
    let (env, _dir) = tiny_env(2);
    let a = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();
    let b = Grid::new(4, 4, 2, 2, 0.0, &env).unwrap();

    for col in [0, 2] {
        a.set_cell(0, col, 1.0 + col as f64).unwrap();
        b.set_cell(0, col, 2.0 + col as f64).unwrap();
    }

    // Both grids' data survives whatever interleaving of evictions the
    // shared budget forced.
    for col in [0, 2] {
        assert_eq!(a.get_cell(0, col).unwrap(), 1.0 + col as f64);
        assert_eq!(b.get_cell(0, col).unwrap(), 2.0 + col as f64);
    }
    assert!(env.stats().evictions >= 2);
}

#[test]
fn test_write_back_failure_skips_to_next_victim() {
    let (env, _dir) = tiny_env(2);
    let a = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    let b = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    a.set_cell(0, 0, 1.0).unwrap();
    b.set_cell(0, 0, 2.0).unwrap();

    // Break write-back for grid `a` only: occupy its swap directory path
    // with a regular file. Other grids' writes still succeed.
    std::fs::write(
        terracache::swap::grid_directory(env.swap_dir(), a.id()),
        b"",
    )
    .unwrap();

    // Pressure scans `a` first, fails to write its dirty chunk back, and
    // moves on to `b`; the triggering operation still completes.
    let c = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    c.set_cell(0, 0, 3.0).unwrap();

    assert!(a.is_resident(0, 0).unwrap());
    assert!(!b.is_resident(0, 0).unwrap());
    assert!(c.is_resident(0, 0).unwrap());

    let stats = env.stats();
    assert_eq!(stats.write_back_failures, 1);
    assert_eq!(stats.evictions, 1);

    assert_eq!(a.get_cell(0, 0).unwrap(), 1.0);
    assert_eq!(b.get_cell(0, 0).unwrap(), 2.0);
    assert_eq!(c.get_cell(0, 0).unwrap(), 3.0);
}

#[test]
fn test_failed_write_back_does_not_leak_budget() {
    let (env, _dir) = tiny_env(1);
    let grid = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    for row in 0..2 {
        for col in 0..2 {
            grid.set_cell(row, col, 3.0).unwrap();
        }
    }
    assert_eq!(env.resident_bytes(), CHUNK_BYTES);

    // Break the whole store.
    std::fs::remove_dir_all(env.swap_dir()).unwrap();
    std::fs::write(env.swap_dir(), b"").unwrap();

    // The explicit eviction fails, but the all-equal chunk compacted
    // during the attempt and its dense buffer returns to the budget.
    assert!(grid.force_evict(0, 0).is_err());
    assert!(grid.is_resident(0, 0).unwrap());
    assert_eq!(env.resident_bytes(), 0);

    // A later diverging write fits in the reclaimed headroom without any
    // recovery pass, and the surviving chunk still reads back.
    let other = Grid::new(2, 2, 2, 2, NODATA, &env).unwrap();
    other.set_cell(0, 0, 1.0).unwrap();
    assert_eq!(env.stats().evictions, 0);
    assert_eq!(grid.get_cell(0, 0).unwrap(), 3.0);
}

#[test]
fn test_checkpoint_then_reload() {
    let (env, _dir) = tiny_env(4);
    let grid = Grid::new(6, 6, 2, 2, NODATA, &env).unwrap();

    for row in 0..6 {
        for col in 0..6 {
            grid.set_cell(row, col, (row * 6 + col) as f64).unwrap();
        }
    }

    // Checkpoint everything to the swap store and release the budget.
    grid.flush_all().unwrap();
    assert_eq!(grid.resident_chunks(), 0);
    assert_eq!(env.resident_bytes(), 0);

    for row in 0..6 {
        for col in 0..6 {
            assert_eq!(grid.get_cell(row, col).unwrap(), (row * 6 + col) as f64);
        }
    }
}

#[test]
fn test_dropping_a_grid_reclaims_swap_space() {
    let (env, _dir) = tiny_env(1);
    let survivor = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();
    survivor.set_cell(0, 0, 42.0).unwrap();

    {
        let scratch = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();
        scratch.set_cell(0, 0, 1.0).unwrap();
        scratch.flush_all().unwrap();
    }

    // The scratch grid's budget share and swap entries are gone; the
    // survivor is unaffected.
    assert_eq!(grid_dir_count(&env), 1);
    assert_eq!(survivor.get_cell(0, 0).unwrap(), 42.0);
}

#[test]
fn test_stats_reflect_cache_traffic() {
    let (env, _dir) = tiny_env(1);
    let grid = Grid::new(4, 4, 2, 2, NODATA, &env).unwrap();

    grid.set_cell(0, 0, 1.0).unwrap();
    grid.get_cell(0, 1).unwrap(); // same chunk: resident hit
    grid.set_cell(0, 2, 2.0).unwrap(); // forces eviction of chunk (0, 0)
    grid.get_cell(0, 0).unwrap(); // store fault-in

    let stats = env.stats();
    assert!(stats.resident_hits >= 1);
    assert!(stats.store_fault_ins >= 1);
    assert!(stats.fresh_fault_ins >= 2);
    assert!(stats.write_backs >= 1);
    assert!(stats.swap_bytes_written > 0);
    assert!(stats.swap_bytes_read > 0);
    assert!(stats.allocation_failures >= 1);
    assert_eq!(stats.evictions, stats.recoveries);
}

/// Swap layout puts each grid under its own top-level directory.
fn grid_dir_count(env: &CacheEnv) -> usize {
    std::fs::read_dir(env.swap_dir()).unwrap().count()
}
