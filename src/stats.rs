//! Cache statistics tracking and reporting.

use std::time::Instant;

/// Counters for monitoring and debugging the chunk cache.
#[derive(Debug, Clone)]
pub struct CacheStats {
    // Residency metrics
    pub resident_hits: u64,
    pub fault_ins: u64,
    pub store_fault_ins: u64,
    pub fresh_fault_ins: u64,
    pub resident_bytes: usize,

    // Eviction metrics
    pub evictions: u64,
    pub forced_evictions: u64,
    pub compactions: u64,

    // Swap store metrics
    pub write_backs: u64,
    pub write_back_failures: u64,
    pub swap_bytes_written: u64,
    pub swap_bytes_read: u64,

    // Recovery protocol metrics
    pub allocation_failures: u64,
    pub recoveries: u64,

    // Timing
    pub created_at: Instant,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStats {
    /// Create a new statistics tracker.
    pub fn new() -> Self {
        Self {
            resident_hits: 0,
            fault_ins: 0,
            store_fault_ins: 0,
            fresh_fault_ins: 0,
            resident_bytes: 0,
            evictions: 0,
            forced_evictions: 0,
            compactions: 0,
            write_backs: 0,
            write_back_failures: 0,
            swap_bytes_written: 0,
            swap_bytes_read: 0,
            allocation_failures: 0,
            recoveries: 0,
            created_at: Instant::now(),
        }
    }

    /// Fraction of chunk resolutions satisfied without a fault-in
    /// (0.0 to 1.0).
    pub fn resident_hit_rate(&self) -> f64 {
        let total = self.resident_hits + self.fault_ins;
        if total == 0 {
            0.0
        } else {
            self.resident_hits as f64 / total as f64
        }
    }

    /// Uptime since statistics started.
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Record a chunk resolution that found the chunk already resident.
    pub fn record_resident_hit(&mut self) {
        self.resident_hits += 1;
    }

    /// Record a fault-in served from the swap store.
    pub fn record_store_fault_in(&mut self, bytes: usize) {
        self.fault_ins += 1;
        self.store_fault_ins += 1;
        self.swap_bytes_read += bytes as u64;
    }

    /// Record a fault-in of a never-written chunk reconstructed as uniform
    /// no-data without a store round-trip.
    pub fn record_fresh_fault_in(&mut self) {
        self.fault_ins += 1;
        self.fresh_fault_ins += 1;
    }

    /// Record a pressure-driven eviction.
    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    /// Record an explicit eviction (`force_evict` / `flush_all`).
    pub fn record_forced_eviction(&mut self) {
        self.forced_evictions += 1;
    }

    /// Record a dense chunk collapsing to the uniform encoding.
    pub fn record_compaction(&mut self) {
        self.compactions += 1;
    }

    /// Record a successful write-back to the swap store.
    pub fn record_write_back(&mut self, bytes: usize) {
        self.write_backs += 1;
        self.swap_bytes_written += bytes as u64;
    }

    /// Record a failed write-back (the protocol moves on to another victim).
    pub fn record_write_back_failure(&mut self) {
        self.write_back_failures += 1;
    }

    /// Record a memory budget allocation failure.
    pub fn record_allocation_failure(&mut self) {
        self.allocation_failures += 1;
    }

    /// Record one run of the eviction/recovery protocol.
    pub fn record_recovery(&mut self) {
        self.recoveries += 1;
    }

    /// Update the resident chunk byte count.
    pub fn update_resident(&mut self, bytes: usize) {
        self.resident_bytes = bytes;
    }
}

/// Format a byte count as a human-readable size.
///
/// # Example
///
/// ```
/// use terracache::stats::format_size;
///
/// assert_eq!(format_size(1024), "1KB");
/// assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2GB");
/// assert_eq!(format_size(500 * 1024 * 1024), "500MB");
/// ```
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB && bytes % GB == 0 {
        format!("{}GB", bytes / GB)
    } else if bytes >= MB {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB {
        format!("{}KB", bytes / KB)
    } else {
        format!("{}B", bytes)
    }
}
