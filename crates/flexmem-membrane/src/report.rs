//! Centralized diagnostic output.
//!
//! flexmalloc's `VERBOSE_MSG`/`DBG` macros (`common.hxx`)
//! gate plain `fprintf` calls behind a verbosity level and a
//! stdout/stderr choice read once from the environment, rather than
//! routing through a structured logging framework: anything that can
//! recurse into the allocator while formatting a log record is a
//! liability inside an interposer. This module keeps that shape, writing
//! directly with `std::io::Write` and never allocating through the
//! interposed path itself (the formatted line lives on the stack via
//! `format_args!`).

use std::io::Write as _;

use crate::config::InterposerConfig;

/// Writes a message if `cfg.verbose` is at least `level`, to stderr when
/// `cfg.messages_on_stderr` is set, stdout otherwise.
pub fn verbose(cfg: &InterposerConfig, level: u32, args: std::fmt::Arguments<'_>) {
    if cfg.verbose < level {
        return;
    }
    emit(cfg, args);
}

/// Unconditional diagnostic output, used for fatal configuration errors
/// encountered during startup.
pub fn always(cfg: &InterposerConfig, args: std::fmt::Arguments<'_>) {
    emit(cfg, args);
}

fn emit(cfg: &InterposerConfig, args: std::fmt::Arguments<'_>) {
    if cfg.messages_on_stderr {
        let _ = writeln!(std::io::stderr(), "{args}");
    } else {
        let _ = writeln!(std::io::stdout(), "{args}");
    }
}

/// Appends process resource-usage counters (peak RSS, minor/major page
/// faults, voluntary/involuntary context switches) read via the
/// platform's `getrusage(RUSAGE_SELF, ...)`, for the report emitted
/// at process teardown.
pub fn rusage(out: &mut String) {
    use std::fmt::Write as _;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return;
    }
    // ru_maxrss is kilobytes on Linux, bytes on some BSDs/macOS; this
    // crate only ever targets Linux (see module_map's /proc/self/maps
    // dependency), so the kilobyte reading is the correct one here.
    let _ = writeln!(
        out,
        "Resource usage: peak RSS {} KiB, {} minor faults, {} major faults, \
         {} voluntary ctx switches, {} involuntary ctx switches",
        usage.ru_maxrss,
        usage.ru_minflt,
        usage.ru_majflt,
        usage.ru_nvcsw,
        usage.ru_nivcsw
    );
}

#[macro_export]
macro_rules! vmsg {
    ($cfg:expr, $level:expr, $($arg:tt)*) => {
        $crate::report::verbose($cfg, $level, format_args!($($arg)*))
    };
}
