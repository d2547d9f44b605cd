//! The module map and symbol oracle.
//!
//! Enumerates the process's loaded modules from `/proc/self/maps` and
//! exposes a [`SymbolOracle`] trait for turning a raw program-counter frame
//! into a `module!offset` or resolved `file:line` description. Grounded on
//! flexmalloc's `parse_map_files` (in `flex-malloc.cxx`),
//! including its deny-list of libraries that must never be attributed a
//! call site of their own (the libc entry, the loader, the threading
//! runtime, and this very library).
//!
//! Full ELF/BFD-backed `file:line` translation is out of scope here
//! (symbol resolution is treated as an oracle behind a trait); the default
//! oracle delegates to the `backtrace` crate, which resolves what debug
//! info is available and otherwise reports bare module-relative offsets.

use std::fs;
use std::path::PathBuf;

/// Libraries that must never be treated as the origin of a call stack.
/// Matched as a case-sensitive substring against the module's file name,
/// mirroring `__flexmalloc_excluded_libraries` (which excludes the dynamic
/// loader, libc's own threading and math support libraries, and itself,
/// but deliberately does *not* exclude libc's own object so that
/// allocations attributed to libc-start paths still classify).
const EXCLUDED_SUBSTRINGS: &[&str] = &[
    "libnuma",
    "libmemkind",
    "libbfd",
    "libgcc_s",
    "libm.so",
    "librt.so",
    "libdl.so",
    "ld-linux",
    "ld-musl",
    "libpthread",
    "libflexmem",
    "libmpi",
    "libmpicxx",
    "libmpifort",
];

pub fn is_excluded(path: &str) -> bool {
    EXCLUDED_SUBSTRINGS.iter().any(|needle| path.contains(needle))
}

#[derive(Debug, Clone)]
pub struct Module {
    pub path: PathBuf,
    pub start: usize,
    pub end: usize,
}

impl Module {
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.start && pc < self.end
    }
}

#[derive(Debug, Default)]
pub struct ModuleMap {
    modules: Vec<Module>,
}

impl ModuleMap {
    /// Builds the map by parsing `/proc/self/maps`, keeping only
    /// executable, file-backed, non-excluded mappings.
    pub fn from_proc_self_maps() -> std::io::Result<Self> {
        let text = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut modules = Vec::new();
        for line in text.lines() {
            let Some(m) = parse_maps_line(line) else {
                continue;
            };
            modules.push(m);
        }
        ModuleMap { modules }
    }

    pub fn find(&self, pc: usize) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(pc))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }
}

fn parse_maps_line(line: &str) -> Option<Module> {
    // Format: "start-end perms offset dev inode pathname"
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next()?;

    if !perms.contains('x') {
        return None;
    }
    if path.is_empty() || path.starts_with('[') {
        return None;
    }
    if is_excluded(path) {
        return None;
    }

    let (start_s, end_s) = range.split_once('-')?;
    let start = usize::from_str_radix(start_s, 16).ok()?;
    let end = usize::from_str_radix(end_s, 16).ok()?;

    Some(Module {
        path: PathBuf::from(path),
        start,
        end,
    })
}

/// A resolved description of a single call-stack frame, in whichever mode
/// the active rule set requires: source mode vs. raw mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFrame {
    Source { file: String, line: u32 },
    Raw { module: String, offset: usize },
    Unresolved,
}

/// Turns a raw program-counter value into a resolved frame description.
/// Implementations may consult debug info, a module map, or nothing at
/// all; the classifier tolerates [`ResolvedFrame::Unresolved`] frames by
/// clipping them from the tail of the walked stack.
pub trait SymbolOracle: Send + Sync {
    fn resolve(&self, pc: usize) -> ResolvedFrame;

    /// Re-reads the process's module mappings. A rule naming a module that
    /// was not yet loaded when the oracle was built never matches until the
    /// module map knows about it; the front end calls this after observing
    /// a successful `dlopen` so such a rule starts matching without a
    /// restart. Oracles that have no notion of loaded modules (e.g.
    /// [`NullSymbolOracle`]) leave this a no-op.
    fn refresh(&self) {}

    /// True when `pc` falls inside a function named `main` or `MAIN__`
    /// (the Fortran main entry point). Backs the "stop unwinding at main"
    /// policy: a caller that wants its walk to stop there needs a way to
    /// recognize it without re-running full translation itself. Oracles
    /// with no symbol name information (e.g. [`NullSymbolOracle`]) always
    /// answer `false`, which simply disables the policy for them.
    fn is_entry_point(&self, _pc: usize) -> bool {
        false
    }
}

/// An oracle that never resolves anything; useful for raw-mode
/// configurations and for tests that only exercise the classifier's
/// decision logic, not translation.
pub struct NullSymbolOracle;

impl SymbolOracle for NullSymbolOracle {
    fn resolve(&self, _pc: usize) -> ResolvedFrame {
        ResolvedFrame::Unresolved
    }
}

/// The default oracle, backed by the `backtrace` crate's own symbol
/// resolution (`backtrace::resolve`), which reads whatever debug info the
/// running binary carries (DWARF, PDB, or none), falling back to a
/// module-relative offset computed from the module map when no line
/// table entry covers the address.
pub struct BacktraceSymbolOracle {
    modules: parking_lot::Mutex<ModuleMap>,
    /// Whether the active rule set is in source mode (`FILE:LINE`) or raw
    /// mode (`MODULE!HEXOFFSET`). Attempting DWARF line-table resolution
    /// in raw mode would occasionally succeed for a frame a raw-mode rule
    /// never describes that way, silently turning a frame that should
    /// compare as `Raw` into one compared as `Source` instead — so source
    /// resolution is only ever attempted when the loaded rules are
    /// themselves written in source mode.
    source_frames: bool,
}

impl BacktraceSymbolOracle {
    pub fn new(modules: ModuleMap, source_frames: bool) -> Self {
        BacktraceSymbolOracle {
            modules: parking_lot::Mutex::new(modules),
            source_frames,
        }
    }
}

impl SymbolOracle for BacktraceSymbolOracle {
    fn resolve(&self, pc: usize) -> ResolvedFrame {
        let mut resolved = ResolvedFrame::Unresolved;
        if self.source_frames {
            let ip = pc as *mut std::os::raw::c_void;
            backtrace::resolve(ip, |symbol| {
                if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                    resolved = ResolvedFrame::Source {
                        file: file.to_string_lossy().into_owned(),
                        line,
                    };
                }
            });
        }
        if matches!(resolved, ResolvedFrame::Unresolved) {
            if let Some(module) = self.modules.lock().find(pc) {
                resolved = ResolvedFrame::Raw {
                    module: module.path.to_string_lossy().into_owned(),
                    offset: pc - module.start,
                };
            }
        }
        resolved
    }

    fn refresh(&self) {
        if let Ok(fresh) = ModuleMap::from_proc_self_maps() {
            *self.modules.lock() = fresh;
        }
    }

    fn is_entry_point(&self, pc: usize) -> bool {
        let ip = pc as *mut std::os::raw::c_void;
        let mut found = false;
        backtrace::resolve(ip, |symbol| {
            if let Some(name) = symbol.name() {
                let name = name.to_string();
                found = name.starts_with("main") || name.starts_with("MAIN__");
            }
        });
        found
    }
}
