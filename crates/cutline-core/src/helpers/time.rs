// crates/cutline-core/src/helpers/time.rs
//
// Shared time-grid utilities used by every crate in the workspace.
//
// All cache keys and index entries carry time either as a frame index on the
// composition grid or as canonical quantized milliseconds — both conversions
// live here so the rounding is identical everywhere.

/// Snap `pts` (seconds) to the nearest frame boundary of a composition with
/// frame duration `fd` (seconds).
///
/// ```
/// use cutline_core::helpers::time::quantize_pts;
/// let fd = 1.0 / 24.0;
/// assert_eq!(quantize_pts(0.0, fd), 0.0);
/// assert!((quantize_pts(0.0417, fd) - fd).abs() < 1e-9);
/// assert!((quantize_pts(1.021, fd) - 25.0 * fd).abs() < 1e-9);
/// ```
pub fn quantize_pts(pts: f64, fd: f64) -> f64 {
    if fd <= 0.0 {
        return pts;
    }
    (pts / fd).round() * fd
}

/// Frame index of `pts` on the composition grid (nearest frame).
///
/// ```
/// use cutline_core::helpers::time::frame_index;
/// let fd = 1.0 / 24.0;
/// assert_eq!(frame_index(0.0, fd), 0);
/// assert_eq!(frame_index(1.0, fd), 24);
/// assert_eq!(frame_index(0.0417, fd), 1);
/// ```
pub fn frame_index(pts: f64, fd: f64) -> i64 {
    if fd <= 0.0 {
        return 0;
    }
    (pts / fd).round() as i64
}

/// Canonical milliseconds for a timestamp in seconds (round-half-away).
///
/// Index keys and cache spans all use this rounding; mixing `as i64`
/// truncation with rounding elsewhere produced off-by-one keys.
///
/// ```
/// use cutline_core::helpers::time::secs_to_ms;
/// assert_eq!(secs_to_ms(1.0), 1000);
/// assert_eq!(secs_to_ms(0.0416667), 42);
/// assert_eq!(secs_to_ms(-0.25), -250);
/// ```
pub fn secs_to_ms(t: f64) -> i64 {
    (t * 1000.0).round() as i64
}

/// ```
/// use cutline_core::helpers::time::ms_to_secs;
/// assert_eq!(ms_to_secs(1500), 1.5);
/// ```
pub fn ms_to_secs(ms: i64) -> f64 {
    ms as f64 / 1000.0
}
