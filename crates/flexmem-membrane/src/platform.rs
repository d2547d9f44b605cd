//! The platform's raw allocation functions, resolved once and threaded
//! through every backend that needs to carve its own storage.
//!
//! Mirrors flexmalloc's `allocation_functions_t`: a small
//! table of function pointers rather than calling `malloc`/`free`/`realloc`
//! by name. Under `LD_PRELOAD` those names resolve back into this very
//! library, so the ABI crate resolves them via `dlsym(RTLD_NEXT, ...)` at
//! startup and installs the result here; outside of interposition (unit
//! tests, benchmarks) the default table below calls the ordinary libc
//! entry points directly.

use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy)]
pub struct RawAllocFns {
    pub malloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void),
    pub realloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
}

unsafe extern "C" fn default_malloc(size: usize) -> *mut c_void {
    unsafe { libc::malloc(size) }
}
unsafe extern "C" fn default_free(ptr: *mut c_void) {
    unsafe { libc::free(ptr) }
}
unsafe extern "C" fn default_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { libc::realloc(ptr, size) }
}

impl Default for RawAllocFns {
    fn default() -> Self {
        RawAllocFns {
            malloc: default_malloc,
            free: default_free,
            realloc: default_realloc,
        }
    }
}

impl RawAllocFns {
    /// # Safety
    /// Caller must eventually `free` the returned pointer exactly once, via
    /// this same table, if it is non-null.
    pub unsafe fn malloc(&self, size: usize) -> *mut u8 {
        unsafe { (self.malloc)(size).cast() }
    }

    /// # Safety
    /// `ptr` must have been produced by [`RawAllocFns::malloc`] or
    /// [`RawAllocFns::realloc`] on this same table, or be null.
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { (self.free)(ptr.cast()) }
    }

    /// # Safety
    /// `ptr` must be null or have been produced by this same table.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { (self.realloc)(ptr.cast(), size).cast() }
    }
}

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;

static BOOTSTRAP_STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static mut BOOTSTRAP_FNS: RawAllocFns = RawAllocFns {
    malloc: default_malloc,
    free: default_free,
    realloc: default_realloc,
};

unsafe fn dlsym_next(name: &str) -> *mut c_void {
    let mut buf = [0u8; 32];
    let bytes = name.as_bytes();
    if bytes.len() + 1 > buf.len() {
        return std::ptr::null_mut();
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    unsafe { libc::dlsym(libc::RTLD_NEXT, buf.as_ptr().cast::<c_char>()) }
}

/// Resolves the platform's own `malloc`/`free`/`realloc` once, ahead of
/// the dispatch singleton being installed. The router front end needs
/// *something* to call for the handful of allocations that can happen
/// before (or during) the main initialization path — building the
/// backend registry itself allocates a `Vec` — without recursing back
/// into this very library. Resolution uses the same non-blocking
/// compare-and-swap shape as [`crate::config::config`]; a thread that
/// observes `RESOLVING` resolves its own private copy rather than
/// blocking, which is at worst a few redundant `dlsym` calls during the
/// narrow startup window.
pub fn bootstrap() -> RawAllocFns {
    loop {
        match BOOTSTRAP_STATE.load(Ordering::Acquire) {
            READY => {
                // Safety: only ever written before READY is published, and
                // never written again afterward.
                return unsafe { BOOTSTRAP_FNS };
            }
            RESOLVING => return resolve_raw_alloc_fns_uncached(),
            _ => {
                if BOOTSTRAP_STATE
                    .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let resolved = resolve_raw_alloc_fns_uncached();
                    unsafe { BOOTSTRAP_FNS = resolved };
                    BOOTSTRAP_STATE.store(READY, Ordering::Release);
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

fn resolve_raw_alloc_fns_uncached() -> RawAllocFns {
    unsafe {
        let malloc_ptr = dlsym_next("malloc");
        let free_ptr = dlsym_next("free");
        let realloc_ptr = dlsym_next("realloc");
        if malloc_ptr.is_null() || free_ptr.is_null() || realloc_ptr.is_null() {
            return RawAllocFns::default();
        }
        RawAllocFns {
            malloc: std::mem::transmute::<*mut c_void, unsafe extern "C" fn(usize) -> *mut c_void>(
                malloc_ptr,
            ),
            free: std::mem::transmute::<*mut c_void, unsafe extern "C" fn(*mut c_void)>(free_ptr),
            realloc: std::mem::transmute::<
                *mut c_void,
                unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
            >(realloc_ptr),
        }
    }
}
