//! Grids: logical rasters addressed by (row, col) over cached chunk slots.
//!
//! A grid decomposes cell addresses into (chunk row, chunk column,
//! offset row, offset column) by pure arithmetic over its fixed dimensions
//! and owns one slot per chunk. A slot is either resident (holds the chunk)
//! or evicted (holds only whether a swap-store entry exists). Residency is
//! purely a performance concern: reads and writes observe the same values
//! whether or not an eviction happened in between.

use crate::chunk::Chunk;
use crate::env::CacheEnv;
use crate::types::{CacheError, ChunkKey, GridId};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Residency state of one chunk.
#[derive(Debug)]
pub(crate) enum ChunkSlot {
    /// The chunk is materialized in memory.
    ///
    /// `dirty`: modified since the last write-back. `swapped`: a valid
    /// swap-store entry exists (so a clean eviction needs no rewrite).
    Resident {
        chunk: Chunk,
        dirty: bool,
        swapped: bool,
    },
    /// The chunk is not in memory. `swapped == false` means it was never
    /// dirtied: it is reconstructed as uniform no-data on fault-in without
    /// a store round-trip, which is safe because a never-written chunk is
    /// indistinguishable from an all-no-data one.
    Evicted { swapped: bool },
}

/// A grid's chunk slots, shared weakly with the cache environment so the
/// eviction scan can reach them.
#[derive(Debug)]
pub(crate) struct SlotTable {
    pub(crate) n_chunk_rows: usize,
    pub(crate) n_chunk_cols: usize,
    pub(crate) slots: Vec<ChunkSlot>,
}

impl SlotTable {
    pub(crate) fn new(n_chunk_rows: usize, n_chunk_cols: usize) -> Self {
        let slots = (0..n_chunk_rows * n_chunk_cols)
            .map(|_| ChunkSlot::Evicted { swapped: false })
            .collect();
        Self {
            n_chunk_rows,
            n_chunk_cols,
            slots,
        }
    }

    fn index(&self, chunk_row: usize, chunk_col: usize) -> usize {
        chunk_row * self.n_chunk_cols + chunk_col
    }
}

/// A very large two-dimensional raster of `f64` cells.
///
/// Cells are stored in fixed-size chunks that are transparently kept
/// resident or swapped to storage by the cache environment, so grids far
/// larger than the memory budget can be addressed through one uniform API.
///
/// # Example
///
/// ```no_run
/// use terracache::env::CacheEnv;
/// use terracache::grid::Grid;
/// use terracache::types::CacheConfig;
///
/// # fn main() -> Result<(), terracache::types::CacheError> {
/// let env = CacheEnv::new(CacheConfig::new())?;
/// let grid = Grid::new(10_000, 10_000, 256, 256, -9999.0, &env)?;
///
/// grid.set_cell(5_000, 5_000, 812.5)?;
/// assert_eq!(grid.get_cell(5_000, 5_000)?, 812.5);
/// # Ok(())
/// # }
/// ```
pub struct Grid {
    id: GridId,
    rows: usize,
    cols: usize,
    /// Chunk height in cells, fixed at construction.
    chunk_rows: usize,
    /// Chunk width in cells, fixed at construction.
    chunk_cols: usize,
    n_chunk_rows: usize,
    n_chunk_cols: usize,
    nodata: f64,
    slots: Arc<Mutex<SlotTable>>,
    env: CacheEnv,
}

impl Grid {
    /// Create a grid and register it with a cache environment.
    ///
    /// Every cell initially reads as `nodata`. Chunks in the last chunk row
    /// or column may be smaller than `chunk_rows` x `chunk_cols` when the
    /// grid extent is not an exact multiple.
    pub fn new(
        rows: usize,
        cols: usize,
        chunk_rows: usize,
        chunk_cols: usize,
        nodata: f64,
        env: &CacheEnv,
    ) -> Result<Self, CacheError> {
        if rows == 0 || cols == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "grid extent {rows}x{cols} must be non-empty"
            )));
        }
        if chunk_rows == 0 || chunk_cols == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "chunk extent {chunk_rows}x{chunk_cols} must be non-empty"
            )));
        }

        let n_chunk_rows = rows.div_ceil(chunk_rows);
        let n_chunk_cols = cols.div_ceil(chunk_cols);
        let slots = Arc::new(Mutex::new(SlotTable::new(n_chunk_rows, n_chunk_cols)));
        let id = env.register(Arc::downgrade(&slots));
        debug!(grid = %id, rows, cols, chunk_rows, chunk_cols, "grid created");

        Ok(Self {
            id,
            rows,
            cols,
            chunk_rows,
            chunk_cols,
            n_chunk_rows,
            n_chunk_cols,
            nodata,
            slots,
            env: env.clone(),
        })
    }

    /// This grid's environment-assigned identifier.
    pub fn id(&self) -> GridId {
        self.id
    }

    /// Number of cell rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of cell columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The no-data sentinel value.
    pub fn nodata(&self) -> f64 {
        self.nodata
    }

    /// Number of chunk rows.
    pub fn n_chunk_rows(&self) -> usize {
        self.n_chunk_rows
    }

    /// Number of chunk columns.
    pub fn n_chunk_cols(&self) -> usize {
        self.n_chunk_cols
    }

    /// Height in cells of the chunks in a chunk row (the last row may be
    /// smaller).
    pub fn chunk_height(&self, chunk_row: usize) -> Result<usize, CacheError> {
        if chunk_row >= self.n_chunk_rows {
            return Err(self.chunk_bounds_error(chunk_row, 0));
        }
        Ok((self.rows - chunk_row * self.chunk_rows).min(self.chunk_rows))
    }

    /// Width in cells of the chunks in a chunk column (the last column may
    /// be smaller).
    pub fn chunk_width(&self, chunk_col: usize) -> Result<usize, CacheError> {
        if chunk_col >= self.n_chunk_cols {
            return Err(self.chunk_bounds_error(0, chunk_col));
        }
        Ok((self.cols - chunk_col * self.chunk_cols).min(self.chunk_cols))
    }

    /// Decompose a cell address into (chunk row, chunk column, offset row,
    /// offset column).
    ///
    /// Pure arithmetic over the fixed grid dimensions; every valid cell
    /// maps to exactly one slot and offset.
    pub fn locate(&self, row: usize, col: usize) -> Result<(usize, usize, usize, usize), CacheError> {
        if row >= self.rows || col >= self.cols {
            return Err(CacheError::OutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok((
            row / self.chunk_rows,
            col / self.chunk_cols,
            row % self.chunk_rows,
            col % self.chunk_cols,
        ))
    }

    /// Read one cell.
    ///
    /// Faults the chunk in if it was evicted. Fails with `MemoryExhausted`
    /// only when the eviction protocol could not free any chunk.
    pub fn get_cell(&self, row: usize, col: usize) -> Result<f64, CacheError> {
        let (chunk_row, chunk_col, offset_row, offset_col) = self.locate(row, col)?;
        let key = self.key(chunk_row, chunk_col);
        self.env.run(key, || {
            let mut table = self.slots.lock().unwrap();
            let index = self.fault_in(&mut table, chunk_row, chunk_col)?;
            match &table.slots[index] {
                ChunkSlot::Resident { chunk, .. } => chunk.get(offset_row, offset_col),
                ChunkSlot::Evicted { .. } => unreachable!("fault_in leaves the slot resident"),
            }
        })
    }

    /// Write one cell and mark its chunk dirty.
    pub fn set_cell(&self, row: usize, col: usize, value: f64) -> Result<(), CacheError> {
        let (chunk_row, chunk_col, offset_row, offset_col) = self.locate(row, col)?;
        let key = self.key(chunk_row, chunk_col);
        self.env.run(key, || {
            let mut table = self.slots.lock().unwrap();
            let index = self.fault_in(&mut table, chunk_row, chunk_col)?;
            let ChunkSlot::Resident { chunk, dirty, .. } = &mut table.slots[index] else {
                unreachable!("fault_in leaves the slot resident");
            };
            self.charge_for_divergence(chunk, value)?;
            chunk.set(offset_row, offset_col, value)?;
            *dirty = true;
            Ok(())
        })
    }

    /// Add a delta to one cell.
    pub fn add_to_cell(&self, row: usize, col: usize, delta: f64) -> Result<(), CacheError> {
        let (chunk_row, chunk_col, offset_row, offset_col) = self.locate(row, col)?;
        let key = self.key(chunk_row, chunk_col);
        self.env.run(key, || {
            let mut table = self.slots.lock().unwrap();
            let index = self.fault_in(&mut table, chunk_row, chunk_col)?;
            let ChunkSlot::Resident { chunk, dirty, .. } = &mut table.slots[index] else {
                unreachable!("fault_in leaves the slot resident");
            };
            let value = chunk.get(offset_row, offset_col)? + delta;
            self.charge_for_divergence(chunk, value)?;
            chunk.set(offset_row, offset_col, value)?;
            *dirty = true;
            Ok(())
        })
    }

    /// Run a closure over a whole resident chunk.
    ///
    /// Lets tile-at-a-time algorithms iterate without per-cell address
    /// decoding; the chunk is faulted in first if needed.
    pub fn with_chunk<R>(
        &self,
        chunk_row: usize,
        chunk_col: usize,
        f: impl FnOnce(&Chunk) -> R,
    ) -> Result<R, CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let key = self.key(chunk_row, chunk_col);
        let mut f = Some(f);
        self.env.run(key, || {
            let mut table = self.slots.lock().unwrap();
            let index = self.fault_in(&mut table, chunk_row, chunk_col)?;
            let ChunkSlot::Resident { chunk, .. } = &table.slots[index] else {
                unreachable!("fault_in leaves the slot resident");
            };
            let f = f.take().expect("all fallible steps precede the closure");
            Ok(f(chunk))
        })
    }

    /// Run a mutating closure over a whole resident chunk.
    ///
    /// The chunk is materialized to the dense encoding first (bulk writes
    /// almost always diverge) and compacted back opportunistically after
    /// the closure runs. The chunk is marked dirty unconditionally.
    pub fn with_chunk_mut<R>(
        &self,
        chunk_row: usize,
        chunk_col: usize,
        f: impl FnOnce(&mut Chunk) -> R,
    ) -> Result<R, CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let key = self.key(chunk_row, chunk_col);
        let mut f = Some(f);
        self.env.run(key, || {
            let mut table = self.slots.lock().unwrap();
            let index = self.fault_in(&mut table, chunk_row, chunk_col)?;
            let ChunkSlot::Resident { chunk, dirty, .. } = &mut table.slots[index] else {
                unreachable!("fault_in leaves the slot resident");
            };
            if chunk.is_uniform() {
                self.env.charge(chunk.dense_bytes())?;
                chunk.materialize();
            }
            let f = f.take().expect("all fallible steps precede the closure");
            let result = f(chunk);
            *dirty = true;
            if chunk.compact() {
                self.env.credit(chunk.dense_bytes());
                self.env.with_stats(|stats| stats.record_compaction());
            }
            Ok(result)
        })
    }

    /// Overwrite every cell of one chunk with `value`.
    ///
    /// Whole-tile shortcut: the slot is replaced with a uniform chunk, so
    /// no dense buffer is allocated and homogeneous regions stay cheap.
    pub fn fill_chunk(&self, chunk_row: usize, chunk_col: usize, value: f64) -> Result<(), CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let mut table = self.slots.lock().unwrap();
        let index = table.index(chunk_row, chunk_col);
        let (freed, swapped) = match &table.slots[index] {
            ChunkSlot::Resident { chunk, swapped, .. } => (chunk.heap_bytes(), *swapped),
            ChunkSlot::Evicted { swapped } => (0, *swapped),
        };
        let chunk = Chunk::uniform(
            self.chunk_height(chunk_row)?,
            self.chunk_width(chunk_col)?,
            value,
        );
        table.slots[index] = ChunkSlot::Resident {
            chunk,
            dirty: true,
            swapped,
        };
        drop(table);
        self.env.credit(freed);
        Ok(())
    }

    /// Overwrite every cell of the grid with `value`.
    pub fn fill(&self, value: f64) -> Result<(), CacheError> {
        for chunk_row in 0..self.n_chunk_rows {
            for chunk_col in 0..self.n_chunk_cols {
                self.fill_chunk(chunk_row, chunk_col, value)?;
            }
        }
        Ok(())
    }

    /// Whether a chunk is currently resident. Residency is a performance
    /// detail; this accessor exists for diagnostics and tests.
    pub fn is_resident(&self, chunk_row: usize, chunk_col: usize) -> Result<bool, CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let table = self.slots.lock().unwrap();
        let index = table.index(chunk_row, chunk_col);
        Ok(matches!(table.slots[index], ChunkSlot::Resident { .. }))
    }

    /// Number of currently resident chunks.
    pub fn resident_chunks(&self) -> usize {
        let table = self.slots.lock().unwrap();
        table
            .slots
            .iter()
            .filter(|slot| matches!(slot, ChunkSlot::Resident { .. }))
            .count()
    }

    /// Pin a window of chunks around a focal chunk for the duration of the
    /// environment's open protection scope.
    ///
    /// The window spans `radius_in_chunks` chunks in every direction,
    /// clamped to the grid's chunk extent. Kernel-window algorithms call
    /// this before scanning so eviction cannot steal a chunk they are
    /// about to touch.
    pub fn protect(
        &self,
        chunk_row: usize,
        chunk_col: usize,
        radius_in_chunks: usize,
    ) -> Result<(), CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let row_start = chunk_row.saturating_sub(radius_in_chunks);
        let row_end = (chunk_row + radius_in_chunks).min(self.n_chunk_rows - 1);
        let col_start = chunk_col.saturating_sub(radius_in_chunks);
        let col_end = (chunk_col + radius_in_chunks).min(self.n_chunk_cols - 1);

        let grid = self.id;
        let keys = (row_start..=row_end).flat_map(move |row| {
            (col_start..=col_end).map(move |col| ChunkKey::new(grid, row, col))
        });
        self.env.protect_keys(keys);
        Ok(())
    }

    /// Evict one chunk explicitly, writing it back first if dirty.
    ///
    /// Used to checkpoint a just-computed grid and reclaim memory
    /// proactively instead of waiting for pressure. Evicting an already
    /// evicted chunk is a no-op. Unlike pressure-driven eviction, a
    /// write-back failure here surfaces to the caller and the chunk stays
    /// resident.
    pub fn force_evict(&self, chunk_row: usize, chunk_col: usize) -> Result<(), CacheError> {
        self.check_chunk_coords(chunk_row, chunk_col)?;
        let key = self.key(chunk_row, chunk_col);
        let mut table = self.slots.lock().unwrap();
        let index = table.index(chunk_row, chunk_col);
        if matches!(table.slots[index], ChunkSlot::Evicted { .. }) {
            return Ok(());
        }

        let ChunkSlot::Resident {
            mut chunk,
            dirty,
            swapped,
        } = std::mem::replace(&mut table.slots[index], ChunkSlot::Evicted { swapped: false })
        else {
            unreachable!("residency checked above");
        };

        let freed = chunk.heap_bytes();
        let compacted = chunk.compact();
        if dirty {
            match self.env.store().write(&key, &chunk) {
                Ok(bytes) => self.env.with_stats(|stats| stats.record_write_back(bytes)),
                Err(err) => {
                    // The chunk may have compacted above; restore it in the
                    // smaller encoding and return its dense buffer's bytes
                    // to the budget.
                    let restored = chunk.heap_bytes();
                    table.slots[index] = ChunkSlot::Resident {
                        chunk,
                        dirty,
                        swapped,
                    };
                    if restored < freed {
                        self.env.credit(freed - restored);
                        self.env.with_stats(|stats| stats.record_compaction());
                    }
                    return Err(err);
                }
            }
        }

        table.slots[index] = ChunkSlot::Evicted {
            swapped: dirty || swapped,
        };
        drop(table);

        self.env.credit(freed);
        self.env.with_stats(|stats| {
            stats.record_forced_eviction();
            if compacted {
                stats.record_compaction();
            }
        });
        debug!(key = %key, freed, "chunk evicted explicitly");
        Ok(())
    }

    /// Evict every resident chunk, writing dirty ones back.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        for chunk_row in 0..self.n_chunk_rows {
            for chunk_col in 0..self.n_chunk_cols {
                self.force_evict(chunk_row, chunk_col)?;
            }
        }
        Ok(())
    }

    fn key(&self, chunk_row: usize, chunk_col: usize) -> ChunkKey {
        ChunkKey::new(self.id, chunk_row, chunk_col)
    }

    fn check_chunk_coords(&self, chunk_row: usize, chunk_col: usize) -> Result<(), CacheError> {
        if chunk_row >= self.n_chunk_rows || chunk_col >= self.n_chunk_cols {
            return Err(self.chunk_bounds_error(chunk_row, chunk_col));
        }
        Ok(())
    }

    fn chunk_bounds_error(&self, chunk_row: usize, chunk_col: usize) -> CacheError {
        CacheError::OutOfBounds {
            row: chunk_row,
            col: chunk_col,
            rows: self.n_chunk_rows,
            cols: self.n_chunk_cols,
        }
    }

    /// Charge the budget when a write would materialize a uniform chunk.
    fn charge_for_divergence(&self, chunk: &Chunk, value: f64) -> Result<(), CacheError> {
        if let Some(current) = chunk.uniform_value() {
            if current.to_bits() != value.to_bits() {
                self.env.charge(chunk.dense_bytes())?;
            }
        }
        Ok(())
    }

    /// Ensure the slot holds a resident chunk, faulting in from the swap
    /// store or reconstructing uniform no-data. Returns the slot index.
    ///
    /// Any allocation here may fail under memory pressure; the caller runs
    /// inside the environment's retry loop.
    fn fault_in(
        &self,
        table: &mut SlotTable,
        chunk_row: usize,
        chunk_col: usize,
    ) -> Result<usize, CacheError> {
        let index = table.index(chunk_row, chunk_col);
        let swapped = match table.slots[index] {
            ChunkSlot::Resident { .. } => {
                self.env.with_stats(|stats| stats.record_resident_hit());
                return Ok(index);
            }
            ChunkSlot::Evicted { swapped } => swapped,
        };

        let key = self.key(chunk_row, chunk_col);
        let chunk = if swapped {
            let (chunk, bytes) = self.env.store().read(&key)?;
            self.env.charge(chunk.heap_bytes())?;
            self.env
                .with_stats(|stats| stats.record_store_fault_in(bytes));
            chunk
        } else {
            self.env.with_stats(|stats| stats.record_fresh_fault_in());
            Chunk::uniform(
                self.chunk_height(chunk_row)?,
                self.chunk_width(chunk_col)?,
                self.nodata,
            )
        };

        table.slots[index] = ChunkSlot::Resident {
            chunk,
            dirty: false,
            swapped,
        };
        debug!(key = %key, "chunk faulted in");
        Ok(index)
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        let resident: usize = {
            let table = self.slots.lock().unwrap();
            table
                .slots
                .iter()
                .map(|slot| match slot {
                    ChunkSlot::Resident { chunk, .. } => chunk.heap_bytes(),
                    ChunkSlot::Evicted { .. } => 0,
                })
                .sum()
        };
        self.env.deregister(self.id, resident);
    }
}
