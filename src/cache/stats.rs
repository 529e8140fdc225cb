//! Cache statistics

use serde::{Deserialize, Serialize};

/// Snapshot of cache counters and occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed because their inputs or dependencies changed
    pub invalidations: u64,
    /// Entries written
    pub writes: u64,
    /// Entries dropped from memory to respect the byte budget
    pub evictions: u64,
    /// Lookups that went to disk
    pub disk_reads: u64,
    /// Background writes or removals that failed
    pub persist_failures: u64,
    /// Known entries, in memory or on disk
    pub entry_count: usize,
    /// Entries whose result is held in memory
    pub resident_entries: usize,
    /// Entries with a persisted copy
    pub disk_entries: usize,
    /// Sum of `size_bytes` over resident entries
    pub memory_bytes: u64,
    /// Configured memory budget
    pub max_size_bytes: u64,
    /// `hits / (hits + misses)`, 0 when there were no lookups
    pub hit_rate: f64,
    /// Whether entries are persisted
    pub persistent: bool,
}

impl CacheStats {
    /// Total lookups
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Compute a hit rate from raw counters
    pub fn rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Outcome of a disk maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Entry files inspected
    pub scanned: usize,
    /// Unreadable or misnamed files removed
    pub removed_corrupt: usize,
    /// Expired or version-mismatched files removed
    pub removed_stale: usize,
    /// Files removed to respect the disk budget
    pub removed_for_budget: usize,
    /// Bytes of entry files left on disk
    pub disk_bytes: u64,
}

impl MaintenanceReport {
    /// Total files removed
    pub fn removed(&self) -> usize {
        self.removed_corrupt + self.removed_stale + self.removed_for_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_without_lookups_is_zero() {
        assert_eq!(CacheStats::rate(0, 0), 0.0);
    }

    #[test]
    fn hit_rate_is_a_fraction() {
        assert!((CacheStats::rate(3, 1) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn report_totals() {
        let report = MaintenanceReport {
            scanned: 10,
            removed_corrupt: 1,
            removed_stale: 2,
            removed_for_budget: 3,
            disk_bytes: 0,
        };
        assert_eq!(report.removed(), 6);
    }
}
