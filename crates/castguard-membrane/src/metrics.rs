//! Atomic counters for runtime observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Runtime operation counters.
pub struct CastMetrics {
    /// Casts submitted for checking.
    pub casts_checked: AtomicU64,
    pub null_sources: AtomicU64,
    /// Sources without shadow metadata.
    pub untracked_sources: AtomicU64,
    pub tracked_sources: AtomicU64,
    /// Resolved type equal to the target.
    pub exact_accepts: AtomicU64,
    /// Target found in the resolved type's ancestor set.
    pub ancestor_accepts: AtomicU64,
    /// Allocation type opted out of checking.
    pub excluded_accepts: AtomicU64,
    /// Allocation or element type without hash information.
    pub untyped_accepts: AtomicU64,
    pub rejects_negative_offset: AtomicU64,
    pub rejects_unknown_offset: AtomicU64,
    pub rejects_unknown_hash: AtomicU64,
    pub rejects_type_mismatch: AtomicU64,
    /// Registration tables merged.
    pub registry_merges: AtomicU64,
    pub registry_entries_added: AtomicU64,
    pub registry_entries_merged: AtomicU64,
    /// Known classes re-registered without the merge flag.
    pub registry_entries_skipped: AtomicU64,
    pub allocations_stack: AtomicU64,
    pub allocations_heap: AtomicU64,
    pub allocations_global: AtomicU64,
    pub allocations_other: AtomicU64,
    pub inline_writes: AtomicU64,
    pub bulk_writes: AtomicU64,
    pub slots_written: AtomicU64,
    /// Allocations recorded over pages without metadata.
    pub untracked_range_records: AtomicU64,
    pub alignment_mismatches: AtomicU64,
    pub ranges_tracked: AtomicU64,
    pub reports_emitted: AtomicU64,
}

impl CastMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            casts_checked: AtomicU64::new(0),
            null_sources: AtomicU64::new(0),
            untracked_sources: AtomicU64::new(0),
            tracked_sources: AtomicU64::new(0),
            exact_accepts: AtomicU64::new(0),
            ancestor_accepts: AtomicU64::new(0),
            excluded_accepts: AtomicU64::new(0),
            untyped_accepts: AtomicU64::new(0),
            rejects_negative_offset: AtomicU64::new(0),
            rejects_unknown_offset: AtomicU64::new(0),
            rejects_unknown_hash: AtomicU64::new(0),
            rejects_type_mismatch: AtomicU64::new(0),
            registry_merges: AtomicU64::new(0),
            registry_entries_added: AtomicU64::new(0),
            registry_entries_merged: AtomicU64::new(0),
            registry_entries_skipped: AtomicU64::new(0),
            allocations_stack: AtomicU64::new(0),
            allocations_heap: AtomicU64::new(0),
            allocations_global: AtomicU64::new(0),
            allocations_other: AtomicU64::new(0),
            inline_writes: AtomicU64::new(0),
            bulk_writes: AtomicU64::new(0),
            slots_written: AtomicU64::new(0),
            untracked_range_records: AtomicU64::new(0),
            alignment_mismatches: AtomicU64::new(0),
            ranges_tracked: AtomicU64::new(0),
            reports_emitted: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            casts_checked: Self::get(&self.casts_checked),
            null_sources: Self::get(&self.null_sources),
            untracked_sources: Self::get(&self.untracked_sources),
            tracked_sources: Self::get(&self.tracked_sources),
            exact_accepts: Self::get(&self.exact_accepts),
            ancestor_accepts: Self::get(&self.ancestor_accepts),
            excluded_accepts: Self::get(&self.excluded_accepts),
            untyped_accepts: Self::get(&self.untyped_accepts),
            rejects_negative_offset: Self::get(&self.rejects_negative_offset),
            rejects_unknown_offset: Self::get(&self.rejects_unknown_offset),
            rejects_unknown_hash: Self::get(&self.rejects_unknown_hash),
            rejects_type_mismatch: Self::get(&self.rejects_type_mismatch),
            registry_merges: Self::get(&self.registry_merges),
            registry_entries_added: Self::get(&self.registry_entries_added),
            registry_entries_merged: Self::get(&self.registry_entries_merged),
            registry_entries_skipped: Self::get(&self.registry_entries_skipped),
            allocations_stack: Self::get(&self.allocations_stack),
            allocations_heap: Self::get(&self.allocations_heap),
            allocations_global: Self::get(&self.allocations_global),
            allocations_other: Self::get(&self.allocations_other),
            inline_writes: Self::get(&self.inline_writes),
            bulk_writes: Self::get(&self.bulk_writes),
            slots_written: Self::get(&self.slots_written),
            untracked_range_records: Self::get(&self.untracked_range_records),
            alignment_mismatches: Self::get(&self.alignment_mismatches),
            ranges_tracked: Self::get(&self.ranges_tracked),
            reports_emitted: Self::get(&self.reports_emitted),
        }
    }
}

impl Default for CastMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub casts_checked: u64,
    pub null_sources: u64,
    pub untracked_sources: u64,
    pub tracked_sources: u64,
    pub exact_accepts: u64,
    pub ancestor_accepts: u64,
    pub excluded_accepts: u64,
    pub untyped_accepts: u64,
    pub rejects_negative_offset: u64,
    pub rejects_unknown_offset: u64,
    pub rejects_unknown_hash: u64,
    pub rejects_type_mismatch: u64,
    pub registry_merges: u64,
    pub registry_entries_added: u64,
    pub registry_entries_merged: u64,
    pub registry_entries_skipped: u64,
    pub allocations_stack: u64,
    pub allocations_heap: u64,
    pub allocations_global: u64,
    pub allocations_other: u64,
    pub inline_writes: u64,
    pub bulk_writes: u64,
    pub slots_written: u64,
    pub untracked_range_records: u64,
    pub alignment_mismatches: u64,
    pub ranges_tracked: u64,
    pub reports_emitted: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub const fn rejects(&self) -> u64 {
        self.rejects_negative_offset
            + self.rejects_unknown_offset
            + self.rejects_unknown_hash
            + self.rejects_type_mismatch
    }

    #[must_use]
    pub const fn accepts(&self) -> u64 {
        self.null_sources
            + self.untracked_sources
            + self.exact_accepts
            + self.ancestor_accepts
            + self.excluded_accepts
            + self.untyped_accepts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = CastMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
        assert_eq!(snap.rejects(), 0);
    }

    #[test]
    fn increment_works() {
        let m = CastMetrics::new();
        CastMetrics::inc(&m.casts_checked);
        CastMetrics::inc(&m.casts_checked);
        CastMetrics::inc(&m.rejects_type_mismatch);
        CastMetrics::add(&m.slots_written, 16);
        let snap = m.snapshot();
        assert_eq!(snap.casts_checked, 2);
        assert_eq!(snap.rejects(), 1);
        assert_eq!(snap.slots_written, 16);
    }
}
