// crates/cutline-core/src/helpers/log.rs
//
// Unified logging for the scrub pipeline.
//
// The pipeline is embedded in a GUI host where stderr may not be attached
// (double-click launch on Windows discards `eprintln!` output entirely), so
// all log calls go to a temp file as well as stderr.
//
// File: <temp>/cutline.log — append-only, created on first write per session.
//
// Usage:
//   use cutline_core::helpers::log::vlog;
//   vlog("[pipeline] cold reset at t_pred=4.23");
//
// Or the macro for format-string convenience:
//   cutline_log!("[decode] {clip}: adopted fallback anchor at {ms}ms");
//
// Tag convention: [pipeline] [decode] [reader] [session] [index] [cache]
// [proxy] [admission].

use std::io::Write;

/// Write `msg` to the Cutline log file in the OS temp directory and stderr.
/// Never panics — failures are silently ignored (we're already in a fallback path).
pub fn vlog(msg: &str) {
    eprintln!("{msg}");
    let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(std::env::temp_dir().join("cutline.log"))
    else {
        return;
    };
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let _ = writeln!(f, "{ms} {msg}");
}

/// Convenience macro — formats like `eprintln!` but routes through `vlog`.
#[macro_export]
macro_rules! cutline_log {
    ($($arg:tt)*) => {
        $crate::helpers::log::vlog(&format!($($arg)*))
    };
}
