//! A canary-checking wrapper around any other backend.
//!
//! flexmalloc's
//! `allocator-debug` unit pads every block with a fixed byte pattern on
//! both sides of the user region and checks it on release, catching
//! adjacent-write corruption. It
//! exists purely as an opt-in diagnostic wrapper and is not wired into the
//! default definitions-file grammar.

use std::ptr::NonNull;

use crate::backend::Backend;
use crate::stats::BackendStats;

const CANARY: u8 = 0xA5;
const CANARY_WIDTH: usize = 16;

pub struct DebugBackend<B: Backend> {
    inner: B,
}

impl<B: Backend> DebugBackend<B> {
    pub fn new(inner: B) -> Self {
        DebugBackend { inner }
    }

    fn padded_len(n: usize) -> usize {
        n + 2 * CANARY_WIDTH
    }

    fn check_and_strip(&self, padded: NonNull<u8>, n: usize) -> NonNull<u8> {
        unsafe {
            let base = padded.as_ptr();
            let front = std::slice::from_raw_parts(base, CANARY_WIDTH);
            debug_assert!(
                front.iter().all(|&b| b == CANARY),
                "canary corrupted before user region in backend '{}'",
                self.inner.name()
            );
            let back = std::slice::from_raw_parts(base.add(CANARY_WIDTH + n), CANARY_WIDTH);
            debug_assert!(
                back.iter().all(|&b| b == CANARY),
                "canary corrupted after user region in backend '{}'",
                self.inner.name()
            );
            NonNull::new_unchecked(base.add(CANARY_WIDTH))
        }
    }

    fn pad(&self, padded: NonNull<u8>, n: usize) -> NonNull<u8> {
        unsafe {
            let base = padded.as_ptr();
            std::ptr::write_bytes(base, CANARY, CANARY_WIDTH);
            std::ptr::write_bytes(base.add(CANARY_WIDTH + n), CANARY, CANARY_WIDTH);
            NonNull::new_unchecked(base.add(CANARY_WIDTH))
        }
    }

    fn user_to_padded(user: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(user.as_ptr().sub(CANARY_WIDTH)) }
    }
}

impl<B: Backend> Backend for DebugBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn acquire(&self, n: usize) -> Option<NonNull<u8>> {
        let padded = self.inner.acquire(Self::padded_len(n))?;
        Some(self.pad(padded, n))
    }

    fn acquire_zeroed(&self, n: usize, m: usize) -> Option<NonNull<u8>> {
        let total = n.checked_mul(m)?;
        let padded = self.inner.acquire_zeroed(Self::padded_len(total), 1)?;
        Some(self.pad(padded, total))
    }

    fn acquire_aligned(&self, align: usize, n: usize) -> Option<NonNull<u8>> {
        // Alignment is preserved on the user-visible pointer by padding
        // only the inner allocation's front canary to a multiple of the
        // requested alignment.
        let padded = self
            .inner
            .acquire_aligned(align.max(CANARY_WIDTH), Self::padded_len(n))?;
        Some(self.pad(padded, n))
    }

    fn release(&self, user: NonNull<u8>) {
        let n = self.inner.usable_size(Self::user_to_padded(user)) - 2 * CANARY_WIDTH;
        let padded = Self::user_to_padded(user);
        self.check_and_strip(padded, n);
        self.inner.release(padded);
    }

    fn resize(&self, user: NonNull<u8>, n: usize) -> Option<NonNull<u8>> {
        let padded = Self::user_to_padded(user);
        let new_padded = self.inner.resize(padded, Self::padded_len(n))?;
        Some(self.pad(new_padded, n))
    }

    fn usable_size(&self, user: NonNull<u8>) -> usize {
        let padded = Self::user_to_padded(user);
        self.inner.usable_size(padded) - 2 * CANARY_WIDTH
    }

    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, n: usize) {
        unsafe { self.inner.memcpy(dst, src, n) };
    }

    fn fits(&self, n: usize) -> bool {
        self.inner.fits(Self::padded_len(n))
    }

    fn water_mark(&self) -> usize {
        self.inner.water_mark()
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity()
    }

    fn used(&self) -> bool {
        self.inner.used()
    }

    fn set_used(&self, used: bool) {
        self.inner.set_used(used);
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    fn configure(&self, line: &str) {
        self.inner.configure(line);
    }

    fn stats(&self) -> &BackendStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::posix::PosixBackend;
    use crate::platform::RawAllocFns;

    #[test]
    fn round_trips_data_through_canary_padding() {
        let backend = DebugBackend::new(PosixBackend::new(0, RawAllocFns::default()));
        let p = backend.acquire(8).unwrap();
        unsafe { p.as_ptr().copy_from(b"DEADBEEF".as_ptr(), 8) };
        assert_eq!(backend.usable_size(p), 8);
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 8) };
        assert_eq!(bytes, b"DEADBEEF");
        backend.release(p);
    }

    #[test]
    #[should_panic(expected = "canary corrupted")]
    fn catches_adjacent_overwrite_on_release() {
        let backend = DebugBackend::new(PosixBackend::new(0, RawAllocFns::default()));
        let p = backend.acquire(8).unwrap();
        unsafe {
            // Overwrite one byte of the trailing canary.
            p.as_ptr().add(8).write(0);
        }
        backend.release(p);
    }
}
