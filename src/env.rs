//! Cache environment: grid registry, memory budget, emergency reserve,
//! protected set, and the eviction/retry protocol.
//!
//! An environment is an explicit value, not an ambient singleton: every
//! grid receives a handle at construction, and tests instantiate
//! independent environments. The environment never owns chunk data; it
//! holds weak references to grids' slot tables plus chunk identifiers for
//! protection bookkeeping.
//!
//! Memory pressure is modelled as an explicit budget. Chunk buffer
//! allocations are charged against it and fail with
//! [`CacheError::AllocationFailed`], which the centralized retry loop
//! resolves by evicting one victim chunk and re-running the whole
//! operation from its starting point.

use crate::grid::{ChunkSlot, SlotTable};
use crate::stats::{format_size, CacheStats};
use crate::swap::SwapStore;
use crate::types::{CacheConfig, CacheError, ChunkKey, GridId};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

struct EnvState {
    /// Next identifier to hand out; never reused within the environment.
    next_grid_id: u64,
    /// Registry of live grids, keyed by id. BTreeMap so the victim scan
    /// order is deterministic. Weak: the environment never owns chunk data.
    grids: BTreeMap<GridId, Weak<Mutex<SlotTable>>>,
    /// Chunk identifiers that must survive eviction while a protection
    /// scope is open.
    protected: HashSet<ChunkKey>,
    /// Maximum bytes of resident chunk data, reserve included.
    budget_bytes: usize,
    /// Size of the emergency reserve block.
    reserve_bytes: usize,
    /// Bytes currently held by resident dense chunk buffers.
    resident_bytes: usize,
    /// The pre-allocated reserve. Released first under memory pressure so
    /// the eviction bookkeeping itself has headroom, re-allocated before
    /// recovery returns.
    reserve: Option<Box<[u8]>>,
    stats: CacheStats,
}

impl EnvState {
    /// Bytes still available to chunk allocations.
    fn headroom(&self) -> usize {
        let reserved = if self.reserve.is_some() {
            self.reserve_bytes
        } else {
            0
        };
        self.budget_bytes
            .saturating_sub(self.resident_bytes + reserved)
    }

    fn release_reserve(&mut self) {
        self.reserve = None;
    }

    fn reallocate_reserve(&mut self) {
        if self.reserve.is_none() {
            self.reserve = Some(vec![0u8; self.reserve_bytes].into_boxed_slice());
        }
    }
}

/// Shared handle to a cache environment.
///
/// Cloning is cheap; all clones address the same registry, budget,
/// protected set, and swap store.
#[derive(Clone)]
pub struct CacheEnv {
    state: Arc<Mutex<EnvState>>,
    store: Arc<SwapStore>,
}

impl CacheEnv {
    /// Create an environment from a configuration.
    ///
    /// Builds the swap store (creating its directory) and allocates the
    /// emergency reserve.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let budget = config.budget;
        if budget.budget_bytes < budget.reserve_bytes {
            return Err(CacheError::InvalidConfig(format!(
                "memory budget of {} cannot hold the {} reserve",
                format_size(budget.budget_bytes),
                format_size(budget.reserve_bytes)
            )));
        }

        let store = Arc::new(SwapStore::new(config.swap.swap_dir)?);
        info!(
            budget = %format_size(budget.budget_bytes),
            reserve = %format_size(budget.reserve_bytes),
            swap_dir = %store.swap_dir().display(),
            "cache environment created"
        );

        let state = EnvState {
            next_grid_id: 0,
            grids: BTreeMap::new(),
            protected: HashSet::new(),
            budget_bytes: budget.budget_bytes,
            reserve_bytes: budget.reserve_bytes,
            resident_bytes: 0,
            reserve: Some(vec![0u8; budget.reserve_bytes].into_boxed_slice()),
            stats: CacheStats::new(),
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            store,
        })
    }

    /// Snapshot of the environment's statistics.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Bytes currently held by resident dense chunk buffers.
    pub fn resident_bytes(&self) -> usize {
        self.state.lock().unwrap().resident_bytes
    }

    /// The configured memory budget in bytes.
    pub fn budget_bytes(&self) -> usize {
        self.state.lock().unwrap().budget_bytes
    }

    /// Number of chunk identifiers currently protected.
    pub fn protected_len(&self) -> usize {
        self.state.lock().unwrap().protected.len()
    }

    /// Root directory of the swap store.
    pub fn swap_dir(&self) -> &std::path::Path {
        self.store.swap_dir()
    }

    /// Open a protection scope for a working set of chunks.
    ///
    /// A new scope clears and replaces any previous protected set; nesting
    /// is not supported. Chunks are added through [`crate::grid::Grid::protect`].
    /// The set empties when the returned scope is dropped or ended.
    pub fn begin_protection(&self) -> ProtectionScope {
        self.state.lock().unwrap().protected.clear();
        ProtectionScope { env: self.clone() }
    }

    /// Clear the protected set, ending any open scope.
    pub fn end_protection(&self) {
        self.state.lock().unwrap().protected.clear();
    }

    pub(crate) fn protect_keys(&self, keys: impl IntoIterator<Item = ChunkKey>) {
        self.state.lock().unwrap().protected.extend(keys);
    }

    pub(crate) fn store(&self) -> &SwapStore {
        &self.store
    }

    pub(crate) fn with_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self.state.lock().unwrap().stats);
    }

    /// Register a grid's slot table, assigning it an identifier.
    pub(crate) fn register(&self, table: Weak<Mutex<SlotTable>>) -> GridId {
        let mut state = self.state.lock().unwrap();
        let id = GridId(state.next_grid_id);
        state.next_grid_id += 1;
        state.grids.insert(id, table);
        debug!(grid = %id, "grid registered");
        id
    }

    /// Remove a grid from the registry, credit its still-resident bytes,
    /// drop its protected entries, and reclaim its swap entries.
    pub(crate) fn deregister(&self, grid: GridId, resident_bytes: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.grids.remove(&grid);
            state.protected.retain(|key| key.grid != grid);
            state.resident_bytes = state.resident_bytes.saturating_sub(resident_bytes);
            let resident = state.resident_bytes;
            state.stats.update_resident(resident);
        }
        if let Err(err) = self.store.delete_grid(grid) {
            warn!(grid = %grid, error = %err, "failed to reclaim swap entries");
        }
        debug!(grid = %grid, "grid deregistered");
    }

    /// Charge a chunk buffer allocation against the budget.
    pub(crate) fn charge(&self, bytes: usize) -> Result<(), CacheError> {
        if bytes == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        let available = state.headroom();
        if bytes > available {
            state.stats.record_allocation_failure();
            return Err(CacheError::AllocationFailed {
                requested: bytes,
                available,
            });
        }
        state.resident_bytes += bytes;
        let resident = state.resident_bytes;
        state.stats.update_resident(resident);
        Ok(())
    }

    /// Return freed chunk buffer bytes to the budget.
    pub(crate) fn credit(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.resident_bytes = state.resident_bytes.saturating_sub(bytes);
        let resident = state.resident_bytes;
        state.stats.update_resident(resident);
    }

    /// Centralized retry loop for one logical operation.
    ///
    /// Re-runs the whole operation from its starting point after each
    /// successful recovery; the chunk that originally faulted may now fit,
    /// or a different allocation along the same path may fail again. The
    /// loop is unbounded except by victim availability: recovery either
    /// frees one chunk or reports `MemoryExhausted`, so each iteration
    /// strictly shrinks the resident set. Any error other than
    /// `AllocationFailed` propagates unchanged.
    pub(crate) fn run<T>(
        &self,
        active: ChunkKey,
        mut op: impl FnMut() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        loop {
            match op() {
                Err(CacheError::AllocationFailed {
                    requested,
                    available,
                }) => {
                    debug!(
                        key = %active,
                        requested,
                        available,
                        "allocation failed; entering recovery"
                    );
                    self.recover(active)?;
                }
                result => return result,
            }
        }
    }

    /// The eviction protocol: free exactly one chunk or fail.
    ///
    /// `active` is the chunk the in-flight operation is resolving; it is
    /// never selected as a victim, so a fault-in cannot evict the very
    /// chunk it is loading.
    pub(crate) fn recover(&self, active: ChunkKey) -> Result<(), CacheError> {
        // Release the reserve first so the bookkeeping below has headroom,
        // then snapshot the registry and protected set. The environment
        // lock is not held while slot tables are locked.
        let (grids, protected) = {
            let mut state = self.state.lock().unwrap();
            state.release_reserve();
            state.stats.record_recovery();
            let grids: Vec<(GridId, Weak<Mutex<SlotTable>>)> = state
                .grids
                .iter()
                .map(|(id, table)| (*id, table.clone()))
                .collect();
            (grids, state.protected.clone())
        };

        for (grid_id, weak) in grids {
            let Some(table_arc) = weak.upgrade() else {
                // Grid dropped between registration and this scan.
                continue;
            };
            let mut table = table_arc.lock().unwrap();
            let n_chunk_cols = table.n_chunk_cols;

            for index in 0..table.slots.len() {
                let key = ChunkKey::new(grid_id, index / n_chunk_cols, index % n_chunk_cols);
                if key == active || protected.contains(&key) {
                    continue;
                }
                if !matches!(table.slots[index], ChunkSlot::Resident { .. }) {
                    continue;
                }

                // First eligible candidate. Take the chunk out of the slot;
                // it is restored if write-back fails.
                let ChunkSlot::Resident {
                    mut chunk,
                    dirty,
                    swapped,
                } = std::mem::replace(
                    &mut table.slots[index],
                    ChunkSlot::Evicted { swapped: false },
                )
                else {
                    unreachable!("residency checked above");
                };

                let freed = chunk.heap_bytes();
                let compacted = chunk.compact();

                let mut written = 0;
                if dirty {
                    match self.store.write(&key, &chunk) {
                        Ok(bytes) => written = bytes,
                        Err(err) => {
                            warn!(
                                key = %key,
                                error = %err,
                                "write-back failed; trying another victim"
                            );
                            // The chunk may have compacted above; the slot is
                            // restored with the smaller encoding, so the
                            // freed buffer bytes go back to the budget now.
                            let restored = chunk.heap_bytes();
                            table.slots[index] = ChunkSlot::Resident {
                                chunk,
                                dirty,
                                swapped,
                            };
                            if restored < freed {
                                self.credit(freed - restored);
                            }
                            self.with_stats(|stats| {
                                stats.record_write_back_failure();
                                if restored < freed {
                                    stats.record_compaction();
                                }
                            });
                            continue;
                        }
                    }
                }

                table.slots[index] = ChunkSlot::Evicted {
                    swapped: dirty || swapped,
                };
                drop(table);

                let mut state = self.state.lock().unwrap();
                state.resident_bytes = state.resident_bytes.saturating_sub(freed);
                state.reallocate_reserve();
                state.stats.record_eviction();
                if compacted {
                    state.stats.record_compaction();
                }
                if dirty {
                    state.stats.record_write_back(written);
                }
                let resident = state.resident_bytes;
                state.stats.update_resident(resident);
                drop(state);

                debug!(key = %key, freed, "chunk evicted under memory pressure");
                return Ok(());
            }
        }

        // No eligible candidate across any registered grid.
        self.state.lock().unwrap().reallocate_reserve();
        warn!(key = %active, "recovery found no evictable chunk");
        Err(CacheError::MemoryExhausted)
    }
}

/// Guard for a declared working-set protection scope.
///
/// While alive, the chunks added through [`crate::grid::Grid::protect`]
/// are skipped by victim selection. Dropping the guard clears the
/// protected set.
#[must_use = "the protection scope ends when this guard is dropped"]
pub struct ProtectionScope {
    env: CacheEnv,
}

impl ProtectionScope {
    /// End the scope explicitly.
    pub fn end(self) {}
}

impl Drop for ProtectionScope {
    fn drop(&mut self) {
        self.env.end_protection();
    }
}
