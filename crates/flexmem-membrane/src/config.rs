//! Environment-driven configuration, resolved once and
//! cached behind a non-blocking atomic state machine.
//!
//! Grounded on `frankenlibc-membrane/src/config.rs`'s `CACHED_LEVEL`
//! pattern: a plain `OnceLock` would call into the standard library's
//! futex-based blocking primitive, which is unsafe to invoke from inside
//! an allocator that might itself be called while resolving. Instead a
//! single `AtomicU8` tracks UNRESOLVED/RESOLVING/READY, and a reentrant
//! call made while resolution is in flight gets the built-in default
//! rather than blocking.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CONFIG: AtomicPtr<InterposerConfig> = AtomicPtr::new(std::ptr::null_mut());

/// The full set of `FLEXMEM_*` environment variables,
/// parsed once at first use.
#[derive(Debug, Clone)]
pub struct InterposerConfig {
    pub verbose: u32,
    pub rules_file: Option<String>,
    pub definitions_file: Option<String>,
    pub compare_whole_path: bool,
    pub debug: bool,
    pub messages_on_stderr: bool,
    pub fallback_allocator: String,
    pub callstack_minus1: bool,
    pub callstack_stop_at_main: bool,
    pub min_size_threshold: Option<usize>,
    pub min_size_threshold_allocator: Option<String>,
    pub shorten_frames: bool,
    pub match_only_on_main_binary: bool,
    pub source_frames: bool,
    pub ignore_locations_on_fallback_allocator: bool,
    pub read_offset_base: u32,
}

impl Default for InterposerConfig {
    fn default() -> Self {
        InterposerConfig {
            verbose: 0,
            rules_file: None,
            definitions_file: None,
            compare_whole_path: false,
            debug: false,
            messages_on_stderr: false,
            fallback_allocator: "posix".to_string(),
            callstack_minus1: false,
            callstack_stop_at_main: false,
            min_size_threshold: None,
            min_size_threshold_allocator: None,
            shorten_frames: true,
            match_only_on_main_binary: false,
            source_frames: true,
            ignore_locations_on_fallback_allocator: true,
            read_offset_base: 16,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}

impl InterposerConfig {
    fn from_env() -> Self {
        let mut cfg = InterposerConfig::default();
        if let Ok(v) = std::env::var("FLEXMEM_VERBOSE") {
            if let Ok(n) = v.parse() {
                cfg.verbose = n;
            }
        }
        if let Ok(v) = std::env::var("FLEXMEM_LOCATIONS") {
            cfg.rules_file = Some(v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_DEFINITIONS") {
            cfg.definitions_file = Some(v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_COMPARE_WHOLE_PATH") {
            cfg.compare_whole_path = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_DEBUG") {
            cfg.debug = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_MESSAGES_ON_STDERR") {
            cfg.messages_on_stderr = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_FALLBACK_ALLOCATOR") {
            cfg.fallback_allocator = v;
        }
        if let Ok(v) = std::env::var("FLEXMEM_CALLSTACK_MINUS1") {
            cfg.callstack_minus1 = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_CALLSTACK_STOP_AT_MAIN") {
            cfg.callstack_stop_at_main = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_MINSIZE_THRESHOLD") {
            cfg.min_size_threshold = v.parse().ok();
        }
        if let Ok(v) = std::env::var("FLEXMEM_MINSIZE_THRESHOLD_ALLOCATOR") {
            cfg.min_size_threshold_allocator = Some(v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_SHORTEN_FRAMES") {
            cfg.shorten_frames = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_MATCH_ONLY_ON_MAIN_BINARY") {
            cfg.match_only_on_main_binary = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_SOURCE_FRAMES") {
            cfg.source_frames = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_IGNORE_LOCATIONS_ON_FALLBACK_ALLOCATOR") {
            cfg.ignore_locations_on_fallback_allocator = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("FLEXMEM_READ_OFFSET_BASE") {
            if let Ok(n) = v.parse() {
                cfg.read_offset_base = n;
            }
        }
        cfg
    }
}

/// Returns the process-wide configuration, resolving it from the
/// environment on first call. A call that arrives while another thread is
/// mid-resolution gets a freshly-built default rather than blocking;
/// correctness here costs nothing because the first allocation requests
/// of a process are rare to race against its own `dlsym` bootstrap.
pub fn config() -> &'static InterposerConfig {
    loop {
        match STATE.load(Ordering::Acquire) {
            READY => {
                let ptr = CONFIG.load(Ordering::Acquire);
                // Safety: once READY, CONFIG was set to a leaked, never-freed
                // allocation before the store that published READY.
                return unsafe { &*ptr };
            }
            RESOLVING => {
                // A concurrent resolver is in flight; don't block on it.
                return Box::leak(Box::new(InterposerConfig::from_env()));
            }
            _ => {
                if STATE
                    .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let resolved = Box::into_raw(Box::new(InterposerConfig::from_env()));
                    CONFIG.store(resolved, Ordering::Release);
                    STATE.store(READY, Ordering::Release);
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn default_config_has_posix_fallback_and_source_mode() {
        let cfg = InterposerConfig::default();
        assert_eq!(cfg.fallback_allocator, "posix");
        assert!(cfg.source_frames);
        assert_eq!(cfg.read_offset_base, 16);
    }
}
