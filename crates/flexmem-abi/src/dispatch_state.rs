//! The process-wide dispatch singleton.
//!
//! Grounded on `membrane_state.rs`'s atomic
//! constructor/destructor-priority pattern, reinforced by
//! `frankenlibc-membrane/src/config.rs`'s non-blocking `AtomicU8` state
//! machine: a `OnceLock`/`Mutex` here would pull in the standard
//! library's futex path, which is unsafe to touch from code that might
//! itself run while resolving a lazy static (a `malloc` called from
//! inside glibc's own lazy TLS setup, for instance). The state machine
//! below never blocks; a caller that arrives mid-resolution gets routed
//! straight to the platform allocator instead of waiting.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use flexmem_core::{Classifier, MinSizeThreshold, Router};
use flexmem_membrane::cache::CallStackCache;
use flexmem_membrane::header::BackendId;
use flexmem_membrane::module_map::SymbolOracle;
use flexmem_membrane::platform::RawAllocFns;
use flexmem_membrane::registry::Registry;

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const TORN_DOWN: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);
static DISPATCH: AtomicPtr<DispatchState> = AtomicPtr::new(std::ptr::null_mut());

pub struct DispatchState {
    pub registry: Registry,
    pub classifier: Classifier,
    pub cache: CallStackCache,
    pub fallback: BackendId,
    pub min_size_threshold: Option<MinSizeThreshold>,
    pub raw: RawAllocFns,
    pub oracle: Box<dyn SymbolOracle>,
}

impl DispatchState {
    pub fn router(&self) -> Router<'_> {
        Router::new(
            &self.registry,
            &self.classifier,
            &self.cache,
            self.fallback,
            self.min_size_threshold.as_ref().map(|t| MinSizeThreshold {
                max_bytes: t.max_bytes,
                backend: t.backend,
            }),
        )
    }
}

/// Returns the ready dispatch state, or `None` if initialization hasn't
/// completed (or has already torn down). Every interposed entry point
/// must treat `None` as "fall through to the raw platform allocator" —
/// never block waiting for it.
pub fn get() -> Option<&'static DispatchState> {
    if STATE.load(Ordering::Acquire) != READY {
        return None;
    }
    let ptr = DISPATCH.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // Safety: READY is only published after DISPATCH holds a leaked,
    // never-freed allocation (see `install`).
    Some(unsafe { &*ptr })
}

/// Installs the dispatch state, transitioning from UNINIT to READY.
/// Called exactly once, from the constructor-priority init path. A
/// second call is a no-op: re-initialization mid-process is not part of
/// this crate's contract.
pub fn install(state: DispatchState) {
    if STATE
        .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    let leaked = Box::into_raw(Box::new(state));
    DISPATCH.store(leaked, Ordering::Release);
    STATE.store(READY, Ordering::Release);
}

/// Marks the dispatch state unusable. Called from the destructor-priority
/// teardown path after the final statistics report has been emitted;
/// after this, every interposed call falls through to the raw platform
/// allocator for the remainder of process exit.
pub fn teardown() {
    STATE.store(TORN_DOWN, Ordering::Release);
}

pub fn is_ready() -> bool {
    STATE.load(Ordering::Acquire) == READY
}

thread_local! {
    static REENTRY_DEPTH: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// RAII reentrancy guard. Every interposed entry point takes one before
/// doing any work; if the depth was already nonzero (this thread is
/// already inside an interposed call — e.g. the classifier's own call
/// into `backtrace` needed to allocate), [`ReentryGuard::is_reentrant`]
/// reports it so the caller can fall through to the raw platform
/// allocator instead of recursing into the router.
pub struct ReentryGuard {
    reentrant: bool,
}

impl ReentryGuard {
    pub fn enter() -> Self {
        let reentrant = REENTRY_DEPTH.with(|d| {
            let prev = d.get();
            d.set(prev + 1);
            prev > 0
        });
        ReentryGuard { reentrant }
    }

    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        REENTRY_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
