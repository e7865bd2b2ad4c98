// crates/cutline-core/src/landing.rs
//
// Landing zones: convert a prediction into the prioritized time ranges the
// pipeline schedules decodes into. Behind the predicted point matters most in
// reverse — the playhead is moving into that range.

use crate::media_types::{DecodeReason, Direction, LandingZone, Prediction};

/// Build the landing zone for one update.
///
/// `recent_decode_delta` is the last observed `target - actual_pts` for the
/// clip; when it exceeds three quarters of a frame the zone enters repair
/// mode, which widens scheduling and bypasses the debounce.
pub fn plan(
    pred: &Prediction,
    direction: Direction,
    frame_duration: f64,
    recent_decode_delta: f64,
) -> LandingZone {
    let fd = frame_duration;
    let w = pred.window_frames;

    let behind_lo = (pred.t_pred - w as f64 * fd).max(0.0);

    // Ahead coverage is deliberately thinner than behind in reverse: frames
    // ahead of a reverse drag are about to become "future" frames, and the
    // future-lead cap will drop most of them anyway.
    let ahead_frames = match direction {
        Direction::Reverse => (w / 3).clamp(1, 4),
        Direction::Forward => w,
    };
    let ahead_hi = pred.t_pred + ahead_frames as f64 * fd;

    LandingZone {
        t_pred: pred.t_pred,
        behind: (behind_lo, pred.t_pred),
        ahead: (pred.t_pred, ahead_hi),
        window_frames: w,
        repair_mode: recent_decode_delta.abs() > fd * 0.75,
    }
}

/// Priority-ordered decode times for a zone: `t_pred` first, then frames
/// interleaved outward. In reverse, two behind-frames are emitted per
/// ahead-frame so the warm window builds where the playhead is heading.
pub fn priority_pts(
    zone: &LandingZone,
    direction: Direction,
    frame_duration: f64,
) -> Vec<(f64, DecodeReason)> {
    let fd = frame_duration;
    let behind_count = ((zone.t_pred - zone.behind.0) / fd).round() as i64;
    let ahead_count = ((zone.ahead.1 - zone.t_pred) / fd).round() as i64;

    let mut out = Vec::with_capacity((behind_count + ahead_count + 1) as usize);
    out.push((zone.t_pred, DecodeReason::Pred));

    let (behind_reason, ahead_reason) = if zone.repair_mode {
        (DecodeReason::RepairBehind, DecodeReason::RepairAhead)
    } else {
        (DecodeReason::Lz, DecodeReason::LzAhead)
    };

    let mut b = 1i64;
    let mut a = 1i64;
    while b <= behind_count || a <= ahead_count {
        // reverse bias: two behind per one ahead
        let behind_burst = if direction.is_reverse() { 2 } else { 1 };
        for _ in 0..behind_burst {
            if b <= behind_count {
                out.push((zone.t_pred - b as f64 * fd, behind_reason));
                b += 1;
            }
        }
        if a <= ahead_count {
            out.push((zone.t_pred + a as f64 * fd, ahead_reason));
            a += 1;
        }
    }
    out
}
