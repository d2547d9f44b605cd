//! The uniform backend contract.
//!
//! Every memory backend — the platform heap, a capacity-bounded pool
//! standing in for a high-bandwidth or persistent-memory device, or a
//! debug-instrumented wrapper around either — implements this trait. The
//! interface is wide on purpose: the statistics recorder and the
//! cross-backend realloc protocol both need granular hooks, and fitting
//! decisions have to be askable without routing back through the caller.

use std::ptr::NonNull;

use crate::stats::BackendStats;

/// A single memory backend.
///
/// Implementations must be safe to call concurrently with themselves only
/// under the caller's external lock — the core router serializes every call
/// through the single process-wide dispatch lock, so backends do not need
/// their own internal locking beyond what their statistics counters require.
pub trait Backend: Send + Sync {
    /// Unique, case-insensitively compared name.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// At most one allocation of at least `n` caller bytes, prefixed by a
    /// header.
    fn acquire(&self, n: usize) -> Option<NonNull<u8>>;

    /// Behaves like [`Backend::acquire`] for `n * m` bytes, additionally
    /// zeroing those bytes before return.
    fn acquire_zeroed(&self, n: usize, m: usize) -> Option<NonNull<u8>>;

    /// `user` is a multiple of `align` (a power of two); a header sits in
    /// the gap `[base + header_size, user)`.
    fn acquire_aligned(&self, align: usize, n: usize) -> Option<NonNull<u8>>;

    /// Releases the block whose header names this backend. Passing a
    /// pointer whose header names a different backend is a caller bug —
    /// an ownership violation, asserted at debug, undefined at release.
    fn release(&self, user: NonNull<u8>);

    /// Grows in place if possible; for `n <= current size` the contract is
    /// to leave the block untouched and return the same pointer; never
    /// shrinks visibly.
    fn resize(&self, user: NonNull<u8>, n: usize) -> Option<NonNull<u8>>;

    /// Returns the caller's originally requested size, regardless of the
    /// backend's internal padding.
    fn usable_size(&self, user: NonNull<u8>) -> usize;

    /// Backend-appropriate copy. Persistent-memory-backed implementations
    /// may issue a flush/fence sequence after the copy for durability.
    ///
    /// # Safety
    /// `dst` and `src` must be valid for `n` bytes and must not overlap.
    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, n: usize);

    /// True iff this backend can admit `n` more bytes without exceeding its
    /// configured capacity. A backend without a capacity always returns
    /// true.
    fn fits(&self, n: usize) -> bool;

    /// Current bytes charged to this backend.
    fn water_mark(&self) -> usize;

    /// Optional capacity, in bytes.
    fn capacity(&self) -> Option<usize>;

    fn used(&self) -> bool;
    fn set_used(&self, used: bool);

    fn is_ready(&self) -> bool;

    /// Apply one opaque configuration line from the definitions file.
    fn configure(&self, line: &str);

    fn stats(&self) -> &BackendStats;

    fn record_unfitted_malloc(&self, size: usize) {
        self.stats().record_unfitted_malloc(size);
    }
    fn record_unfitted_calloc(&self, size: usize) {
        self.stats().record_unfitted_calloc(size);
    }
    fn record_unfitted_aligned_malloc(&self, size: usize) {
        self.stats().record_unfitted_aligned_malloc(size);
    }
    fn record_unfitted_realloc(&self, size: usize) {
        self.stats().record_unfitted_realloc(size);
    }
    fn record_source_realloc(&self, size: usize) {
        self.stats().record_source_realloc(size);
    }
    fn record_target_realloc(&self, size: usize) {
        self.stats().record_target_realloc(size);
    }
    fn record_self_realloc(&self, size: usize) {
        self.stats().record_self_realloc(size);
    }
    fn record_realloc_forward_malloc(&self) {
        self.stats().record_realloc_forward_malloc();
    }

    /// Safe wrapper around [`Backend::memcpy`] for callers (the core
    /// router) that must not contain `unsafe` themselves. `n` is always
    /// `min(old_size, new_size)` at the one call site that uses this, so
    /// the sizes given to the two allocations back it.
    fn copy_from(&self, dst: NonNull<u8>, src: NonNull<u8>, n: usize) {
        unsafe { self.memcpy(dst.as_ptr(), src.as_ptr(), n) };
    }
}
