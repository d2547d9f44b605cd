//! The platform-heap backend: no capacity limit, always ready, and the
//! natural choice of fallback. Grounded on flexmalloc's
//! `allocator-posix.hxx`, which is a thin pass-through to the platform's
//! `malloc`/`realloc`/`free` plus this crate's own header bookkeeping.

use std::ptr::NonNull;

use crate::backend::Backend;
use crate::header::{self, header_of, BackendId};
use crate::platform::RawAllocFns;
use crate::stats::BackendStats;

pub struct PosixBackend {
    id: BackendId,
    af: RawAllocFns,
    stats: BackendStats,
    used: std::sync::atomic::AtomicBool,
}

impl PosixBackend {
    pub fn new(id: BackendId, af: RawAllocFns) -> Self {
        PosixBackend {
            id,
            af,
            stats: BackendStats::default(),
            used: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Backend for PosixBackend {
    fn name(&self) -> &str {
        "posix"
    }

    fn description(&self) -> &str {
        "platform heap (malloc/realloc/free), uncapped"
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
            // Contract: never shrinks visibly.
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
        unsafe { std::ptr::copy_nonoverlapping(src, dst, n) };
    }

    fn fits(&self, _n: usize) -> bool {
        true
    }

    fn water_mark(&self) -> usize {
        self.stats.water_mark()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn used(&self) -> bool {
        self.used.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set_used(&self, used: bool) {
        self.used.store(used, std::sync::atomic::Ordering::Relaxed);
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn configure(&self, _line: &str) {
        // The posix backend has nothing to configure: it is always ready
        // and uncapped.
    }

    fn stats(&self) -> &BackendStats {
        &self.stats
    }
}
