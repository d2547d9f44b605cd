//! A static scratch buffer serving `calloc` requests made before the
//! membrane has finished resolving its own platform symbols.
//!
//! Grounded on flexmalloc's `uninitialized_calloc`, which
//! hands out slices of a fixed-size static array via a simple bump
//! pointer rather than risking a recursive call into `malloc` while
//! `dlsym` is still being resolved (a well-known bootstrap hazard for any
//! interposer built on `dlsym(RTLD_NEXT, ...)`). The buffer is fixed-size
//! and, once exhausted, further pre-init `calloc` calls return null rather
//! than growing or blocking.
use std::sync::atomic::{AtomicUsize, Ordering};

/// 64 KiB is generous for the handful of zero-initialized allocations a
/// dynamic loader or libc itself tends to make before constructors have
/// run (typically locale and thread-local storage bookkeeping).
const PREBUFFER_BYTES: usize = 64 * 1024;

#[repr(align(16))]
struct AlignedBuf([u8; PREBUFFER_BYTES]);

static PREBUFFER: AlignedBuf = AlignedBuf([0u8; PREBUFFER_BYTES]);
static CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Hands out a zeroed slice of the static scratch buffer, or `None` once
/// the buffer is exhausted. The returned pointer must never be passed to
/// `free`: callers identify pre-init allocations by address range and
/// simply ignore the corresponding `free` call.
pub fn acquire(n: usize) -> Option<*mut u8> {
    let aligned = (n + 15) & !15;
    let start = CURSOR.fetch_add(aligned, Ordering::SeqCst);
    if start + aligned > PREBUFFER_BYTES {
        return None;
    }
    let base = PREBUFFER.0.as_ptr() as *mut u8;
    Some(unsafe { base.add(start) })
}

/// Whether a pointer falls inside the static scratch region, used by the
/// front end to recognize (and silently drop) a `free` of a pre-init
/// allocation.
pub fn owns(ptr: *const u8) -> bool {
    let base = PREBUFFER.0.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + PREBUFFER_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_zeroed_memory_inside_the_buffer() {
        let p = acquire(64).unwrap();
        assert!(owns(p));
        let bytes = unsafe { std::slice::from_raw_parts(p, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn pointer_outside_the_buffer_is_not_owned() {
        let local = 0u8;
        assert!(!owns(&local as *const u8));
    }
}
