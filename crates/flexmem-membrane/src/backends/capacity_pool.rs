//! A fixed-capacity backend standing in for a high-bandwidth or
//! persistent-memory pool.
//!
//! flexmalloc ships several such backends
//! (`allocator-memkind-hbwmalloc`, `allocator-memkind-pmem`), each wrapping
//! a vendor allocation library behind the same `Allocator` interface. Those
//! vendor libraries are out of scope here; this type is the pluggable shape
//! they would implement, carving its storage once from the platform heap
//! and tracking a configured byte capacity against its water mark.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::backend::Backend;
use crate::header::{self, header_of, BackendId};
use crate::platform::RawAllocFns;
use crate::stats::BackendStats;

pub struct CapacityPoolBackend {
    id: BackendId,
    name: String,
    af: RawAllocFns,
    stats: BackendStats,
    capacity_bytes: AtomicUsize,
    used: AtomicBool,
}

impl CapacityPoolBackend {
    pub fn new(id: BackendId, name: impl Into<String>, af: RawAllocFns) -> Self {
        CapacityPoolBackend {
            id,
            name: name.into(),
            af,
            stats: BackendStats::default(),
            capacity_bytes: AtomicUsize::new(0),
            used: AtomicBool::new(false),
        }
    }

    fn capacity_raw(&self) -> usize {
        self.capacity_bytes.load(Ordering::Relaxed)
    }
}

/// Parses the canonical definitions-file line for a sized backend:
/// `Size N MBytes`.
pub fn parse_size_line(line: &str) -> Option<usize> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "Size" {
        return None;
    }
    let n: usize = parts.next()?.parse().ok()?;
    match parts.next()? {
        "MBytes" | "MB" => Some(n * 1024 * 1024),
        "KBytes" | "KB" => Some(n * 1024),
        "Bytes" | "B" => Some(n),
        "GBytes" | "GB" => Some(n * 1024 * 1024 * 1024),
        _ => None,
    }
}

impl Backend for CapacityPoolBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "fixed-capacity pool (stand-in for a high-bandwidth or persistent-memory device)"
    }

    fn acquire(&self, n: usize) -> Option<NonNull<u8>> {
        let base = unsafe { self.af.malloc(header::total_size(n)) };
        if base.is_null() {
            return None;
        }
        let user = unsafe { header::stamp(base, self.id, n) };
        self.stats.record_acquire(n);
        Some(user)
    }

    fn acquire_zeroed(&self, n: usize, m: usize) -> Option<NonNull<u8>> {
        let total = n.checked_mul(m)?;
        let user = self.acquire(total)?;
        unsafe {
            std::ptr::write_bytes(user.as_ptr(), 0, total);
        }
        self.stats.record_acquire_zeroed(total);
        Some(user)
    }

    fn acquire_aligned(&self, align: usize, n: usize) -> Option<NonNull<u8>> {
        let layout = header::layout_for_aligned(n, align);
        let base = unsafe { self.af.malloc(layout.size()) };
        if base.is_null() {
            return None;
        }
        let user = unsafe { header::stamp_aligned(base, align, self.id, n) };
        self.stats.record_acquire_aligned(n);
        Some(user)
    }

    fn release(&self, user: NonNull<u8>) {
        let hdr = unsafe { header_of(user) };
        debug_assert_eq!(hdr.backend, self.id, "release via a foreign backend");
        self.stats.record_release(hdr.size);
        unsafe { self.af.free(hdr.base) };
    }

    fn resize(&self, user: NonNull<u8>, n: usize) -> Option<NonNull<u8>> {
        let (base, gap, prev_size) = {
            let hdr = unsafe { header_of(user) };
            (hdr.base, hdr.gap, hdr.size)
        };
        if n <= prev_size {
            return Some(user);
        }
        let new_base = unsafe { self.af.realloc(base, header::total_size(n)) };
        if new_base.is_null() {
            return None;
        }
        let new_user = unsafe { header::stamp_gap(new_base, gap, self.id, n) };
        self.stats.record_resize(prev_size, n);
        Some(new_user)
    }

    fn usable_size(&self, user: NonNull<u8>) -> usize {
        unsafe { header_of(user) }.size
    }

    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, n: usize) {
        // A real high-bandwidth or persistent-memory backend would issue a
        // flush/fence sequence here after the copy for durability; the
        // platform copy is what stands in for that backend-specific step.
        unsafe { std::ptr::copy_nonoverlapping(src, dst, n) };
    }

    fn fits(&self, n: usize) -> bool {
        let cap = self.capacity_raw();
        if cap == 0 {
            return true;
        }
        self.stats.water_mark().saturating_add(n) <= cap
    }

    fn water_mark(&self) -> usize {
        self.stats.water_mark()
    }

    fn capacity(&self) -> Option<usize> {
        let cap = self.capacity_raw();
        (cap > 0).then_some(cap)
    }

    fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Relaxed);
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn configure(&self, line: &str) {
        if let Some(bytes) = parse_size_line(line.trim()) {
            self.capacity_bytes.store(bytes, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> &BackendStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_size_line() {
        assert_eq!(parse_size_line("Size 1 MBytes"), Some(1024 * 1024));
        assert_eq!(parse_size_line("Size 4 KBytes"), Some(4 * 1024));
        assert_eq!(parse_size_line("garbage"), None);
    }

    #[test]
    fn configure_sets_capacity_and_fits_respects_it() {
        let backend = CapacityPoolBackend::new(1, "hi", RawAllocFns::default());
        backend.configure("Size 1 MBytes");
        assert_eq!(backend.capacity(), Some(1024 * 1024));
        assert!(backend.fits(1024));
        assert!(!backend.fits(2 * 1024 * 1024));
    }

    #[test]
    fn unconfigured_pool_has_no_capacity_and_always_fits() {
        let backend = CapacityPoolBackend::new(1, "hi", RawAllocFns::default());
        assert_eq!(backend.capacity(), None);
        assert!(backend.fits(usize::MAX / 2));
    }

    #[test]
    fn fits_accounts_for_current_water_mark() {
        let backend = CapacityPoolBackend::new(1, "hi", RawAllocFns::default());
        backend.configure("Size 1 KBytes");
        let p = backend.acquire(900).unwrap();
        assert!(!backend.fits(200));
        backend.release(p);
        assert!(backend.fits(200));
    }
}
