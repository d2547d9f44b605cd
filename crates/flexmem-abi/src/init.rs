//! Constructor/destructor-priority startup and teardown.
//!
//! Grounded on flexmalloc's two-phase lifecycle (static
//! constructors building `Allocators`/`CodeLocations`/`CallstackCache`
//! before `main` runs, a destructor emitting `show_statistics` after it
//! returns) and on this pack's convention of registering init/fini
//! symbols directly in the ELF `.init_array`/`.fini_array` sections
//! rather than pulling in a dedicated constructor-registration crate —
//! this library only ever targets Linux, since `/proc/self/maps` is
//! already Linux-specific (`flexmem_membrane::module_map`).

use std::ffi::{c_char, c_void, CString};
use std::os::raw::c_int;

use flexmem_core::{parse_rule_line, Classifier, MinSizeThreshold};
use flexmem_membrane::backends::capacity_pool::CapacityPoolBackend;
use flexmem_membrane::backends::debug::DebugBackend;
use flexmem_membrane::backends::posix::PosixBackend;
use flexmem_membrane::config::{self, InterposerConfig};
use flexmem_membrane::header::BackendId;
use flexmem_membrane::module_map::{BacktraceSymbolOracle, ModuleMap, NullSymbolOracle, SymbolOracle};
use flexmem_membrane::platform::RawAllocFns;
use flexmem_membrane::registry::Registry;
use flexmem_membrane::{report, Backend};

use crate::dispatch_state::{self, DispatchState};

unsafe fn resolve(name: &str) -> *mut c_void {
    let c_name = CString::new(name).expect("symbol name has no interior NUL");
    unsafe { libc::dlsym(libc::RTLD_NEXT, c_name.as_ptr().cast::<c_char>()) }
}

/// Resolves the platform's own `malloc`/`free`/`realloc` through
/// `dlsym(RTLD_NEXT, ...)`, the standard way an `LD_PRELOAD` shim avoids
/// recursing into itself. Falls back to this process's statically linked
/// libc entry points (via the `libc` crate) if resolution somehow fails,
/// which can only happen if the shim is loaded in a way that is not
/// actually `LD_PRELOAD` (e.g. linked directly as an `rlib` for tests).
fn resolve_raw_alloc_fns() -> RawAllocFns {
    unsafe {
        let malloc_ptr = resolve("malloc");
        let free_ptr = resolve("free");
        let realloc_ptr = resolve("realloc");
        if malloc_ptr.is_null() || free_ptr.is_null() || realloc_ptr.is_null() {
            return RawAllocFns::default();
        }
        RawAllocFns {
            malloc: std::mem::transmute::<
                *mut c_void,
                unsafe extern "C" fn(usize) -> *mut c_void,
            >(malloc_ptr),
            free: std::mem::transmute::<*mut c_void, unsafe extern "C" fn(*mut c_void)>(free_ptr),
            realloc: std::mem::transmute::<
                *mut c_void,
                unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
            >(realloc_ptr),
        }
    }
}

fn make_backend<B: Backend + 'static>(backend: B, debug: bool) -> Box<dyn Backend>
where
    B: Backend,
{
    if debug {
        Box::new(DebugBackend::new(backend))
    } else {
        Box::new(backend)
    }
}

/// Emits a diagnostic on the configured report sink and terminates the
/// process before any application code runs, matching the fatal-
/// configuration row of the error handling design: a missing definitions
/// or rules file, or a definitions/fallback entry naming a backend that
/// does not exist, can never be recovered from by limping along with an
/// empty registry or rule set.
fn fatal(cfg: &InterposerConfig, args: std::fmt::Arguments<'_>) -> ! {
    report::always(cfg, args);
    std::process::exit(2);
}

fn build_registry(cfg: &InterposerConfig, af: RawAllocFns) -> Registry {
    let backends: Vec<Box<dyn Backend>> = vec![
        make_backend(PosixBackend::new(0, af), cfg.debug),
        make_backend(CapacityPoolBackend::new(1, "hi", af), cfg.debug),
        make_backend(CapacityPoolBackend::new(2, "pmem", af), cfg.debug),
    ];
    let registry = Registry::new(backends);

    let Some(path) = &cfg.definitions_file else {
        fatal(cfg, format_args!("flexmem: FLEXMEM_DEFINITIONS is required but was not set"));
    };
    match std::fs::read_to_string(path) {
        Ok(text) => {
            if let Err(err) = registry.apply_definitions(&text) {
                fatal(cfg, format_args!("flexmem: definitions file error: {err}"));
            }
        }
        Err(err) => {
            fatal(
                cfg,
                format_args!("flexmem: could not read definitions file '{path}': {err}"),
            );
        }
    }
    registry
}

fn build_classifier(cfg: &InterposerConfig) -> Classifier {
    let Some(path) = &cfg.rules_file else {
        fatal(cfg, format_args!("flexmem: FLEXMEM_LOCATIONS is required but was not set"));
    };
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            fatal(cfg, format_args!("flexmem: could not read rules file '{path}': {err}"));
        }
    };
    let mut rules = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        match parse_rule_line(line, lineno as u32, cfg.source_frames) {
            None => {}
            Some(Ok(rule)) => {
                // A rule that names the fallback backend as its target is
                // redundant: an unmatched call site already lands there.
                // Dropping it up front saves a classify() comparison per
                // allocation for the price of one startup-time check.
                if cfg.ignore_locations_on_fallback_allocator
                    && rule.backend_name == cfg.fallback_allocator
                {
                    continue;
                }
                rules.push(rule);
            }
            Some(Err(reason)) => {
                report::verbose(cfg, 1, format_args!("flexmem: skipping bad rule: {reason}"));
            }
        }
    }
    Classifier::with_path_mode(rules, cfg.source_frames, cfg.compare_whole_path)
}

fn resolve_min_size_threshold(cfg: &InterposerConfig, registry: &Registry) -> Option<MinSizeThreshold> {
    let max_bytes = cfg.min_size_threshold?;
    let name = cfg.min_size_threshold_allocator.as_deref().unwrap_or("posix");
    let backend = registry.id_of(name).unwrap_or(0);
    Some(MinSizeThreshold { max_bytes, backend })
}

fn resolve_fallback(cfg: &InterposerConfig, registry: &Registry) -> BackendId {
    registry.id_of(&cfg.fallback_allocator).unwrap_or_else(|| {
        fatal(
            cfg,
            format_args!(
                "flexmem: FLEXMEM_FALLBACK_ALLOCATOR names unknown backend '{}'",
                cfg.fallback_allocator
            ),
        )
    })
}

/// Builds the frame-resolution oracle this process uses to turn raw
/// program counters into the `ResolvedFrame`s the classifier compares
/// against the loaded rules. A rule set with no rules never needs to
/// resolve anything, so it gets the zero-cost [`NullSymbolOracle`]
/// instead of walking `/proc/self/maps` for nothing.
fn build_oracle(cfg: &InterposerConfig, classifier: &Classifier) -> Box<dyn SymbolOracle> {
    if classifier.rule_count() == 0 {
        return Box::new(NullSymbolOracle);
    }
    let modules = ModuleMap::from_proc_self_maps().unwrap_or_default();
    Box::new(BacktraceSymbolOracle::new(modules, cfg.source_frames))
}

fn init_impl() {
    let cfg = config::config();
    let af = resolve_raw_alloc_fns();
    let registry = build_registry(cfg, af);
    let classifier = build_classifier(cfg);
    let fallback = resolve_fallback(cfg, &registry);
    let min_size_threshold = resolve_min_size_threshold(cfg, &registry);
    let oracle = build_oracle(cfg, &classifier);

    report::verbose(
        cfg,
        1,
        format_args!(
            "flexmem: initialized with {} backends, {} rules, fallback id {fallback}",
            registry.iter().count(),
            classifier.rule_count()
        ),
    );

    dispatch_state::install(DispatchState {
        registry,
        classifier,
        cache: flexmem_membrane::cache::CallStackCache::default(),
        fallback,
        min_size_threshold,
        raw: af,
        oracle,
    });
}

fn teardown_impl() {
    let cfg = config::config();
    if let Some(state) = dispatch_state::get() {
        let mut out = String::new();
        state.registry.report(&mut out);
        state.classifier.report(&mut out);
        state.cache.report(&mut out);
        state.registry.visualizer_header(&mut out);
        state.classifier.visualizer_report(&mut out);
        report::rusage(&mut out);
        report::always(cfg, format_args!("{out}"));
    }
    dispatch_state::teardown();
}

extern "C" fn flexmem_ctor() {
    init_impl();
    unsafe {
        libc::signal(libc::SIGINT, flexmem_signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, flexmem_signal_handler as libc::sighandler_t);
    }
}

extern "C" fn flexmem_dtor() {
    teardown_impl();
}

/// Handles `SIGINT`/`SIGTERM` by running the same teardown as the normal
/// destructor path and exiting directly, rather than re-raising the
/// signal and letting the default disposition run: a default-disposition
/// termination would skip the statistics report entirely.
///
/// Calling into `report::always` (which allocates no heap memory of its
/// own beyond what `format_args!` already laid out on the stack) from a
/// signal handler is not strictly async-signal-safe by the letter of
/// POSIX, but matches the reference behavior this crate targets: the
/// alternative of staying silent on the most common way these processes
/// are actually stopped was judged worse.
extern "C" fn flexmem_signal_handler(_sig: c_int) {
    teardown_impl();
    unsafe { libc::_exit(130) };
}

#[used]
#[unsafe(link_section = ".init_array")]
static FLEXMEM_CTOR: extern "C" fn() = flexmem_ctor;

#[used]
#[unsafe(link_section = ".fini_array")]
static FLEXMEM_DTOR: extern "C" fn() = flexmem_dtor;

/// Exposed for tests and for the rare embedder that links this crate as
/// an ordinary `rlib` rather than preloading the compiled `cdylib`, where
/// `.init_array` registration never runs.
pub fn ensure_initialized() {
    if !dispatch_state::is_ready() {
        init_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_raw_alloc_fns_never_panics() {
        let af = resolve_raw_alloc_fns();
        let p = unsafe { af.malloc(16) };
        assert!(!p.is_null());
        unsafe { af.free(p) };
    }

    #[test]
    fn build_registry_with_an_empty_definitions_file_has_the_default_backends() {
        let mut file = tempfile_with_contents("");
        let mut cfg = InterposerConfig::default();
        cfg.definitions_file = Some(file.path_string());
        let af = RawAllocFns::default();
        let registry = build_registry(&cfg, af);
        assert!(registry.get("posix").is_some());
        assert!(registry.get("hi").is_some());
        assert!(registry.get("pmem").is_some());
        file.close();
    }

    #[test]
    fn build_classifier_with_an_empty_rules_file_is_empty() {
        let mut file = tempfile_with_contents("");
        let mut cfg = InterposerConfig::default();
        cfg.rules_file = Some(file.path_string());
        let classifier = build_classifier(&cfg);
        assert_eq!(classifier.rule_count(), 0);
        file.close();
    }

    #[test]
    fn build_classifier_drops_rules_that_target_the_fallback_allocator() {
        let mut file = tempfile_with_contents("a.c:1 @ posix\nb.c:2 @ hi\n");
        let mut cfg = InterposerConfig::default();
        cfg.rules_file = Some(file.path_string());
        cfg.fallback_allocator = "posix".to_string();
        cfg.ignore_locations_on_fallback_allocator = true;

        let classifier = build_classifier(&cfg);
        assert_eq!(classifier.rule_count(), 1);

        file.close();
    }

    /// Minimal scratch-file helper so tests don't need an external crate
    /// just to write one short-lived file.
    struct TempTextFile {
        path: std::path::PathBuf,
    }

    fn tempfile_with_contents(contents: &str) -> TempTextFile {
        let path = std::env::temp_dir().join(format!(
            "flexmem-abi-init-test-{}-{}.rules",
            std::process::id(),
            contents.len()
        ));
        std::fs::write(&path, contents).expect("failed to write scratch rules file");
        TempTextFile { path }
    }

    impl TempTextFile {
        fn path_string(&self) -> String {
            self.path.to_string_lossy().into_owned()
        }

        fn close(self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
