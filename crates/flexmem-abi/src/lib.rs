//! The `extern "C"` interposer front end.
//!
//! This is the library the dynamic linker actually preloads: every symbol
//! below shadows its glibc counterpart for the whole process. Grounded on
//! flexmalloc's `malloc-interposer.cxx` and on this
//! pack's own `frankenlibc-abi/src/malloc_abi.rs`, which establishes the
//! shape every entry point repeats — take the reentrancy guard first, fall
//! through to the raw platform allocator on anything that isn't a plain
//! first-level call, and only then ask the router.
//!
//! `#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]` keeps these
//! symbols un-mangled (and therefore capable of shadowing libc) only in
//! release builds; under `cargo test` they stay ordinary Rust items so the
//! test binary's own allocator keeps working.

use std::ffi::{c_char, c_int, c_void};
use std::sync::OnceLock;

use flexmem_membrane::config::{self, InterposerConfig};
use flexmem_membrane::header::{self, BackendId, NO_BACKEND};
use flexmem_membrane::module_map::{ResolvedFrame, SymbolOracle};
use flexmem_membrane::platform::{self, RawAllocFns};
use flexmem_membrane::prebuffer;

pub mod dispatch_state;
mod init;

pub use init::ensure_initialized;

use dispatch_state::ReentryGuard;

const MAX_CAPTURE_FRAMES: usize = flexmem_membrane::cache::CALLSTACKS_PER_ENTRY;

/// A stack-only frame buffer: capturing a call stack must not itself
/// allocate, so this is a fixed-size array rather than a `Vec`.
struct CapturedStack {
    pcs: [u64; MAX_CAPTURE_FRAMES],
    len: usize,
}

/// Walks the current call stack via `backtrace::trace`, which never
/// allocates, stopping once the fixed-size buffer is full.
///
/// `#[inline(always)]` is load-bearing: every caller relies on frame 0 of
/// the resulting trace being its *own* frame (the interposed entry point
/// itself — `malloc`, `calloc`, and so on), exactly as if it had walked the
/// stack inline rather than through a helper. Letting the optimizer decide
/// whether to inline this would make the frame to discard depend on build
/// flags.
#[inline(always)]
fn capture_stack() -> CapturedStack {
    let mut stack = CapturedStack {
        pcs: [0u64; MAX_CAPTURE_FRAMES],
        len: 0,
    };
    backtrace::trace(|frame| {
        if stack.len >= MAX_CAPTURE_FRAMES {
            return false;
        }
        stack.pcs[stack.len] = frame.ip() as u64;
        stack.len += 1;
        true
    });
    stack
}

/// Resolves a captured stack into the `ResolvedFrame`s the classifier
/// compares against the loaded rules, one oracle call per frame.
fn resolve_frames(oracle: &dyn SymbolOracle, raw: &[u64]) -> Vec<ResolvedFrame> {
    raw.iter().map(|&pc| oracle.resolve(pc as usize)).collect()
}

/// Captures and resolves the current call site, ready to hand to the
/// router: the entry point's own frame is dropped, each retained pc is
/// adjusted one byte back into its call instruction when the subtract-one
/// policy is enabled, and the walk is clipped right after a frame that
/// resolves to `main`/`MAIN__` when the stop-at-main policy is enabled.
fn captured_frames(oracle: &dyn SymbolOracle, cfg: &InterposerConfig) -> (Vec<u64>, Vec<ResolvedFrame>) {
    let stack = capture_stack();
    let kept = stack.len.saturating_sub(1);
    let mut raw: Vec<u64> = Vec::with_capacity(kept);
    for i in 0..kept {
        let pc = stack.pcs[i + 1];
        raw.push(if cfg.callstack_minus1 { pc.wrapping_sub(1) } else { pc });
    }
    let mut frames = resolve_frames(oracle, &raw);
    if cfg.callstack_stop_at_main {
        if let Some(stop_at) = raw.iter().position(|&pc| oracle.is_entry_point(pc as usize)) {
            frames.truncate(stop_at + 1);
            raw.truncate(stop_at + 1);
        }
    }
    (raw, frames)
}

/// The raw platform allocation functions to fall back on when the router
/// isn't usable yet: the dispatch state's own resolved table once it
/// exists, otherwise the membrane's independent bootstrap resolution
/// (used only during the narrow window before `flexmem_ctor` has run).
fn raw_fns() -> RawAllocFns {
    match dispatch_state::get() {
        Some(state) => state.raw,
        None => platform::bootstrap(),
    }
}

/// Allocates `n` caller bytes directly off the platform heap and stamps a
/// header naming [`NO_BACKEND`], without touching the router at all.
/// This is the path for every allocation that cannot safely reach the
/// classifier: before `flexmem_ctor` has installed the dispatch state, or
/// while this thread has already reentered an interposed entry point.
fn raw_malloc(n: usize) -> *mut c_void {
    let af = raw_fns();
    let base = unsafe { af.malloc(header::total_size(n)) };
    if base.is_null() {
        return std::ptr::null_mut();
    }
    let user = unsafe { header::stamp(base, NO_BACKEND, n) };
    user.as_ptr().cast()
}

fn raw_malloc_aligned(align: usize, n: usize) -> *mut c_void {
    let af = raw_fns();
    let layout = header::layout_for_aligned(n, align);
    let base = unsafe { af.malloc(layout.size()) };
    if base.is_null() {
        return std::ptr::null_mut();
    }
    let user = unsafe { header::stamp_aligned(base, align, NO_BACKEND, n) };
    user.as_ptr().cast()
}

fn raw_calloc(n: usize, m: usize) -> *mut c_void {
    let Some(total) = n.checked_mul(m) else {
        return std::ptr::null_mut();
    };
    let ptr = raw_malloc(total);
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
    }
    ptr
}

/// Releases a block this front end stamped with [`NO_BACKEND`] (the
/// pre-init / reentrant path), going straight to the platform `free`
/// rather than through any registered backend.
fn raw_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let user = unsafe { std::ptr::NonNull::new_unchecked(ptr.cast::<u8>()) };
    let base = unsafe { header::header_of(user) }.base;
    unsafe { raw_fns().free(base) };
}

fn raw_realloc(ptr: *mut c_void, n: usize) -> *mut c_void {
    if ptr.is_null() {
        return raw_malloc(n);
    }
    if n == 0 {
        raw_free(ptr);
        return std::ptr::null_mut();
    }
    let user = unsafe { std::ptr::NonNull::new_unchecked(ptr.cast::<u8>()) };
    let prev_size = header::size_of(user);
    let new_ptr = raw_malloc(n);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = prev_size.min(n);
    unsafe { std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), new_ptr.cast::<u8>(), copy_len) };
    raw_free(ptr);
    new_ptr
}

/// True for a pointer this front end must never hand to the router: the
/// pre-init calloc scratch buffer, which carries no header at all.
fn is_scratch(ptr: *const c_void) -> bool {
    prebuffer::owns(ptr.cast::<u8>())
}

// ---------------------------------------------------------------------------
// malloc / free / realloc / calloc
// ---------------------------------------------------------------------------

/// Replacement `malloc`. Routes through the classifier once the dispatch
/// state is ready and this is not a reentrant call; otherwise falls
/// through to a header-wrapped platform allocation.
///
/// # Safety
/// Caller must eventually pass the returned pointer to this library's
/// `free` exactly once, or not at all if it is null.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_reentrant() {
        return raw_malloc(size);
    }
    match dispatch_state::get() {
        Some(state) => {
            let (raw, frames) = captured_frames(state.oracle.as_ref(), config::config());
            match state.router().route_malloc(&raw, &frames, size) {
                Some(p) => p.as_ptr().cast(),
                None => std::ptr::null_mut(),
            }
        }
        None => raw_malloc(size),
    }
}

/// Replacement `free`.
///
/// # Safety
/// `ptr` must be null, a pre-init scratch pointer, or a pointer this
/// library itself returned and that has not already been freed.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || is_scratch(ptr) {
        return;
    }
    let guard = ReentryGuard::enter();
    if guard.is_reentrant() {
        raw_free(ptr);
        return;
    }
    let user = unsafe { std::ptr::NonNull::new_unchecked(ptr.cast::<u8>()) };
    let backend_id: BackendId = header::backend_of(user);
    if backend_id == NO_BACKEND {
        raw_free(ptr);
        return;
    }
    if let Some(state) = dispatch_state::get() {
        state.router().route_free(user);
    }
    // Torn down: deliberately leaked rather than touched, matching this crate's
    // "late teardown races" handling.
}

/// Replacement `calloc`. The pre-init path prefers the static scratch
/// buffer over a header-wrapped platform allocation, since the scratch
/// buffer is the one path guaranteed not to need the platform symbols
/// this very call might be racing to resolve.
///
/// # Safety
/// Caller must eventually `free` the returned pointer exactly once, or
/// not at all if it is null.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_reentrant() || !dispatch_state::is_ready() {
        let Some(total) = nmemb.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        if let Some(p) = prebuffer::acquire(total) {
            return p.cast();
        }
        return raw_calloc(nmemb, size);
    }
    let state = dispatch_state::get().expect("checked is_ready above");
    let (raw, frames) = captured_frames(state.oracle.as_ref(), config::config());
    match state.router().route_calloc(&raw, &frames, nmemb, size) {
        Some(p) => p.as_ptr().cast(),
        None => std::ptr::null_mut(),
    }
}

/// Replacement `realloc`.
///
/// # Safety
/// `ptr` must be null or a pointer this library itself returned. Caller
/// must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if is_scratch(ptr) {
        // The dynamic linker's pre-init scratch blocks never grow in
        // place; hand back a fresh, fully tracked allocation instead.
        let fresh = malloc(size);
        if !fresh.is_null() && !ptr.is_null() {
            unsafe { std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), size) };
        }
        return fresh;
    }

    let guard = ReentryGuard::enter();

    if ptr.is_null() {
        drop(guard);
        return malloc(size);
    }

    let user = unsafe { std::ptr::NonNull::new_unchecked(ptr.cast::<u8>()) };
    if header::backend_of(user) == NO_BACKEND {
        return raw_realloc(ptr, size);
    }

    // Unlike malloc/calloc/free, a reentrant call here is never routed to
    // the raw platform fallback: the block already carries a real backend
    // owner, and the fallback is only "safe" for blocks that never had
    // one. Re-deriving the decision through the router (there is no lock
    // to deadlock on, only the thread-local reentry counter above) keeps a
    // backend-resident block from being silently migrated to plain heap
    // memory just because this realloc happened to nest inside another
    // interposed call.
    match dispatch_state::get() {
        Some(state) => {
            let (raw, frames) = captured_frames(state.oracle.as_ref(), config::config());
            match state.router().route_realloc(Some(user), &raw, &frames, size) {
                Some(p) => p.as_ptr().cast(),
                None => std::ptr::null_mut(),
            }
        }
        None => raw_realloc(ptr, size),
    }
}

/// `cfree`, the deprecated `free` alias.
///
/// # Safety
/// Same contract as [`free`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    unsafe { free(ptr) };
}

/// `malloc_usable_size`. A pre-init scratch pointer has no header and is
/// reported as zero usable bytes rather than dereferenced blind.
///
/// # Safety
/// `ptr` must be null or a pointer this library itself returned.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() || is_scratch(ptr) {
        return 0;
    }
    let user = unsafe { std::ptr::NonNull::new_unchecked(ptr.cast::<u8>()) };
    header::size_of(user)
}

// ---------------------------------------------------------------------------
// Aligned allocation family
// ---------------------------------------------------------------------------

const EINVAL: c_int = 22;
const ENOMEM: c_int = 12;

/// `posix_memalign`.
///
/// # Safety
/// `memptr` must be a valid pointer to a writable `*mut c_void`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % std::mem::size_of::<usize>() != 0 {
        return EINVAL;
    }
    let ptr = unsafe { aligned_alloc_impl(alignment, size) };
    if ptr.is_null() {
        return ENOMEM;
    }
    unsafe { *memptr = ptr };
    0
}

/// `memalign`, the legacy alignment entry point.
///
/// # Safety
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        return std::ptr::null_mut();
    }
    unsafe { aligned_alloc_impl(alignment, size) }
}

/// C11 `aligned_alloc`.
///
/// # Safety
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() || !size.is_multiple_of(alignment) {
        return std::ptr::null_mut();
    }
    unsafe { aligned_alloc_impl(alignment, size) }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// `valloc`: page-aligned, unrounded size.
///
/// # Safety
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    unsafe { aligned_alloc_impl(page_size(), size) }
}

/// `pvalloc`: page-aligned, size rounded up to a whole number of pages.
///
/// # Safety
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = page_size();
    let rounded = (size + page - 1) & !(page - 1);
    unsafe { aligned_alloc_impl(page, rounded) }
}

unsafe fn aligned_alloc_impl(alignment: usize, size: usize) -> *mut c_void {
    let guard = ReentryGuard::enter();
    if guard.is_reentrant() || !dispatch_state::is_ready() {
        return raw_malloc_aligned(alignment, size);
    }
    let state = dispatch_state::get().expect("checked is_ready above");
    let (raw, frames) = captured_frames(state.oracle.as_ref(), config::config());
    match state.router().route_aligned(&raw, &frames, alignment, size) {
        Some(p) => p.as_ptr().cast(),
        None => std::ptr::null_mut(),
    }
}

// ---------------------------------------------------------------------------
// dlopen interception (deferred raw-frame resolution)
// ---------------------------------------------------------------------------

type RawDlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

static RAW_DLOPEN: OnceLock<RawDlopenFn> = OnceLock::new();

unsafe extern "C" fn dlopen_unavailable(_filename: *const c_char, _flag: c_int) -> *mut c_void {
    std::ptr::null_mut()
}

fn raw_dlopen() -> RawDlopenFn {
    *RAW_DLOPEN.get_or_init(|| unsafe {
        let name = std::ffi::CString::new("dlopen").expect("symbol name has no interior NUL");
        let resolved = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
        if resolved.is_null() {
            dlopen_unavailable
        } else {
            std::mem::transmute::<*mut c_void, RawDlopenFn>(resolved)
        }
    })
}

/// Intercepts `dlopen` so a freshly mapped library's module range becomes
/// visible to raw-mode classification immediately, without waiting for a
/// process restart. `dlopen` is not on the allocation hot path, so
/// resolving the real symbol through a blocking [`OnceLock`] (rather than
/// the allocator entry points' non-blocking bootstrap dance) is fine here.
///
/// # Safety
/// Same contract as the platform's own `dlopen`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flag: c_int) -> *mut c_void {
    let handle = unsafe { (raw_dlopen())(filename, flag) };
    if !handle.is_null() {
        if let Some(state) = dispatch_state::get() {
            state.oracle.refresh();
        }
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_round_trip_before_init_uses_the_raw_header_wrapped_path() {
        // dispatch_state is never installed by this crate's own test
        // binary, so every call below exercises the pre-init path.
        let p = unsafe { malloc(64) };
        assert!(!p.is_null());
        assert_eq!(unsafe { malloc_usable_size(p) }, 64);
        unsafe { free(p) };
    }

    #[test]
    fn calloc_zeroes_memory_before_init() {
        let p = unsafe { calloc(8, 4) };
        assert!(!p.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(p.cast::<u8>(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { free(p) };
    }

    #[test]
    fn realloc_of_null_forwards_to_malloc() {
        let p = unsafe { realloc(std::ptr::null_mut(), 16) };
        assert!(!p.is_null());
        unsafe { free(p) };
    }

    #[test]
    fn realloc_of_zero_size_frees_and_returns_null() {
        let p = unsafe { malloc(16) };
        let result = unsafe { realloc(p, 0) };
        assert!(result.is_null());
    }

    #[test]
    fn realloc_preserves_the_overlapping_prefix() {
        let p = unsafe { malloc(8) };
        unsafe { std::ptr::copy_nonoverlapping(b"DEADBEEF".as_ptr(), p.cast::<u8>(), 8) };
        let grown = unsafe { realloc(p, 256) };
        assert!(!grown.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(grown.cast::<u8>(), 8) };
        assert_eq!(bytes, b"DEADBEEF");
        unsafe { free(grown) };
    }

    #[test]
    fn posix_memalign_rejects_a_non_power_of_two_alignment() {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = unsafe { posix_memalign(&mut out, 3, 16) };
        assert_eq!(rc, EINVAL);
    }

    #[test]
    fn posix_memalign_succeeds_on_a_valid_alignment() {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = unsafe { posix_memalign(&mut out, 64, 200) };
        assert_eq!(rc, 0);
        assert!(!out.is_null());
        assert_eq!((out as usize) % 64, 0);
        unsafe { free(out) };
    }

    #[test]
    fn aligned_alloc_rejects_a_size_not_a_multiple_of_alignment() {
        let p = unsafe { aligned_alloc(64, 10) };
        assert!(p.is_null());
    }

    #[test]
    fn valloc_is_page_aligned() {
        let p = unsafe { valloc(17) };
        assert!(!p.is_null());
        assert_eq!((p as usize) % page_size(), 0);
        unsafe { free(p) };
    }

    #[test]
    fn malloc_usable_size_of_null_is_zero() {
        assert_eq!(unsafe { malloc_usable_size(std::ptr::null_mut()) }, 0);
    }

    #[test]
    fn nested_malloc_during_a_reentrant_call_never_deadlocks() {
        let outer = ReentryGuard::enter();
        assert!(!outer.is_reentrant());
        let p = unsafe { malloc(32) };
        assert!(!p.is_null());
        unsafe { free(p) };
        drop(outer);
    }
}
