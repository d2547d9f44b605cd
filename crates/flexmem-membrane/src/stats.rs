//! Per-backend statistics recorder.
//!
//! Mirrors the field list of flexmalloc's
//! `AllocatorStatistics`: scalar invocation counters, running
//! total/min/max per byte-bearing operation, and water-mark tracking.
//! Cross-backend "source realloc" / "target realloc" counters are updated
//! only by the core router, never by a backend acting on its own.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct MinMaxTotal {
    calls: AtomicU64,
    total: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl MinMaxTotal {
    fn record(&self, size: usize) {
        let size = size as u64;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(size, Ordering::Relaxed);
        self.max.fetch_max(size, Ordering::Relaxed);
        // There is no fetch_min on stable for all integer widths pre-1.45;
        // available here, but guard the initial zero sentinel explicitly so
        // an empty counter reports 0, not min() of a real call and 0.
        let mut observed = self.min.load(Ordering::Relaxed);
        loop {
            let candidate = if observed == 0 { size } else { observed.min(size) };
            if candidate == observed {
                break;
            }
            match self.min.compare_exchange_weak(
                observed,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
    fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
    fn min(&self) -> u64 {
        self.min.load(Ordering::Relaxed)
    }
    fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

/// Counters owned by one backend, shared across every allocation hook.
#[derive(Debug, Default)]
pub struct BackendStats {
    acquire: MinMaxTotal,
    acquire_zeroed: MinMaxTotal,
    acquire_aligned: MinMaxTotal,
    resize: MinMaxTotal,
    n_release: AtomicU64,

    current_water_mark: AtomicUsize,
    peak_water_mark: AtomicUsize,

    n_unfitted_malloc: AtomicU64,
    unfitted_malloc_bytes: AtomicU64,
    n_unfitted_calloc: AtomicU64,
    unfitted_calloc_bytes: AtomicU64,
    n_unfitted_aligned: AtomicU64,
    unfitted_aligned_bytes: AtomicU64,
    n_unfitted_realloc: AtomicU64,
    unfitted_realloc_bytes: AtomicU64,

    n_source_realloc: AtomicU64,
    source_realloc_bytes: AtomicU64,
    n_target_realloc: AtomicU64,
    target_realloc_bytes: AtomicU64,
    n_self_realloc: AtomicU64,
    self_realloc_bytes: AtomicU64,
    n_realloc_fwd_malloc: AtomicU64,
}

impl BackendStats {
    pub fn record_acquire(&self, size: usize) {
        self.acquire.record(size);
        self.add_water_mark(size);
    }

    pub fn record_acquire_zeroed(&self, size: usize) {
        self.acquire_zeroed.record(size);
        self.add_water_mark(size);
    }

    pub fn record_acquire_aligned(&self, size: usize) {
        self.acquire_aligned.record(size);
        self.add_water_mark(size);
    }

    /// Resize updates are "subtract the prior size, add the new size".
    pub fn record_resize(&self, prev_size: usize, new_size: usize) {
        self.resize.record(new_size);
        self.sub_water_mark(prev_size);
        self.add_water_mark(new_size);
    }

    pub fn record_release(&self, size: usize) {
        self.n_release.fetch_add(1, Ordering::Relaxed);
        self.sub_water_mark(size);
    }

    fn add_water_mark(&self, size: usize) {
        let new = self
            .current_water_mark
            .fetch_add(size, Ordering::Relaxed)
            + size;
        self.peak_water_mark.fetch_max(new, Ordering::Relaxed);
    }

    fn sub_water_mark(&self, size: usize) {
        // Clamp at zero to tolerate counter drift between paired add/subtract calls.
        let _ = self
            .current_water_mark
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(size))
            });
    }

    pub fn water_mark(&self) -> usize {
        self.current_water_mark.load(Ordering::Relaxed)
    }

    pub fn peak_water_mark(&self) -> usize {
        self.peak_water_mark.load(Ordering::Relaxed)
    }

    pub fn record_unfitted_malloc(&self, size: usize) {
        self.n_unfitted_malloc.fetch_add(1, Ordering::Relaxed);
        self.unfitted_malloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_unfitted_calloc(&self, size: usize) {
        self.n_unfitted_calloc.fetch_add(1, Ordering::Relaxed);
        self.unfitted_calloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_unfitted_aligned_malloc(&self, size: usize) {
        self.n_unfitted_aligned.fetch_add(1, Ordering::Relaxed);
        self.unfitted_aligned_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_unfitted_realloc(&self, size: usize) {
        self.n_unfitted_realloc.fetch_add(1, Ordering::Relaxed);
        self.unfitted_realloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_source_realloc(&self, size: usize) {
        self.n_source_realloc.fetch_add(1, Ordering::Relaxed);
        self.source_realloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_target_realloc(&self, size: usize) {
        self.n_target_realloc.fetch_add(1, Ordering::Relaxed);
        self.target_realloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_self_realloc(&self, size: usize) {
        self.n_self_realloc.fetch_add(1, Ordering::Relaxed);
        self.self_realloc_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
    }
    pub fn record_realloc_forward_malloc(&self) {
        self.n_realloc_fwd_malloc.fetch_add(1, Ordering::Relaxed);
    }

    pub fn source_realloc_bytes(&self) -> u64 {
        self.source_realloc_bytes.load(Ordering::Relaxed)
    }
    pub fn target_realloc_bytes(&self) -> u64 {
        self.target_realloc_bytes.load(Ordering::Relaxed)
    }

    /// A compact human-readable report, written the way flexmalloc's
    /// `show_statistics` lays counters out: one line per
    /// non-zero counter family.
    pub fn report(&self, name: &str, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(out, "Backend '{name}' statistics:");
        if self.acquire.calls() > 0 {
            let _ = writeln!(
                out,
                "  acquire: {} calls, {} bytes total (min {}, max {})",
                self.acquire.calls(),
                self.acquire.total(),
                self.acquire.min(),
                self.acquire.max()
            );
        }
        if self.acquire_zeroed.calls() > 0 {
            let _ = writeln!(
                out,
                "  acquire_zeroed: {} calls, {} bytes total",
                self.acquire_zeroed.calls(),
                self.acquire_zeroed.total()
            );
        }
        if self.acquire_aligned.calls() > 0 {
            let _ = writeln!(
                out,
                "  acquire_aligned: {} calls, {} bytes total",
                self.acquire_aligned.calls(),
                self.acquire_aligned.total()
            );
        }
        if self.resize.calls() > 0 {
            let _ = writeln!(out, "  resize: {} calls", self.resize.calls());
        }
        let _ = writeln!(out, "  release: {} calls", self.n_release.load(Ordering::Relaxed));
        let _ = writeln!(
            out,
            "  water mark: current {}, peak {}",
            self.water_mark(),
            self.peak_water_mark()
        );
        if self.n_unfitted_malloc.load(Ordering::Relaxed) > 0 {
            let _ = writeln!(
                out,
                "  unfitted acquire: {} ({} bytes)",
                self.n_unfitted_malloc.load(Ordering::Relaxed),
                self.unfitted_malloc_bytes.load(Ordering::Relaxed)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_mark_tracks_peak_independently_of_current() {
        let stats = BackendStats::default();
        stats.record_acquire(100);
        stats.record_acquire(200);
        assert_eq!(stats.water_mark(), 300);
        assert_eq!(stats.peak_water_mark(), 300);
        stats.record_release(250);
        assert_eq!(stats.water_mark(), 50);
        assert_eq!(stats.peak_water_mark(), 300);
    }

    #[test]
    fn release_clamps_at_zero_on_drift() {
        let stats = BackendStats::default();
        stats.record_acquire(10);
        stats.record_release(100);
        assert_eq!(stats.water_mark(), 0);
    }

    #[test]
    fn resize_subtracts_then_adds() {
        let stats = BackendStats::default();
        stats.record_acquire(64);
        stats.record_resize(64, 256);
        assert_eq!(stats.water_mark(), 256);
        assert_eq!(stats.peak_water_mark(), 256);
    }

    #[test]
    fn min_max_total_are_tracked_per_operation() {
        let stats = BackendStats::default();
        stats.record_acquire(10);
        stats.record_acquire(50);
        stats.record_acquire(30);
        assert_eq!(stats.acquire.calls(), 3);
        assert_eq!(stats.acquire.total(), 90);
        assert_eq!(stats.acquire.min(), 10);
        assert_eq!(stats.acquire.max(), 50);
    }
}
