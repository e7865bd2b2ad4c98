// crates/cutline-core/src/cursor.rs
//
// Reverse-direction cursor quantization.
//
// During a reverse drag the raw UI events do not arrive monotonically — the
// pointer jitters forward between backward steps. The cursor holds monotone
// backward progress against that noise: forward raw input is absorbed unless
// it is a genuine jump, and successful reverse decodes step the cursor down
// exactly one frame at a time.

use crate::config::ScrubConfig;

/// Jump size and settle time that justify resetting against the drag
/// direction in advance mode.
const LARGE_JUMP_FRAMES: i64 = 30;
const LARGE_JUMP_HOLD_S: f64 = 1.0;

/// Anti-jitter thresholds for forward drift in observe mode, keyed by
/// ascending |velocity| band: (band ceiling, frames, hold seconds).
/// Faster drags need a bigger jump to count but settle the reset sooner.
const FORWARD_JITTER_TABLE: [(f64, i64, f64); 6] = [
    (0.25, 3, 0.18),
    (0.50, 4, 0.16),
    (1.00, 6, 0.14),
    (2.00, 8, 0.12),
    (4.00, 10, 0.10),
    (f64::INFINITY, 14, 0.08),
];

fn forward_jitter_threshold(speed: f64) -> (i64, f64) {
    for &(ceiling, frames, hold) in &FORWARD_JITTER_TABLE {
        if speed < ceiling {
            return (frames, hold);
        }
    }
    let last = FORWARD_JITTER_TABLE[FORWARD_JITTER_TABLE.len() - 1];
    (last.1, last.2)
}

#[derive(Debug)]
pub struct ReverseCursor {
    cursor:              Option<i64>,
    /// Maximum frames the cursor may trail the requested index.
    max_lag:             i64,
    last_reset_host:     f64,
    /// Host time when the current forward drift episode started.
    forward_drift_since: Option<f64>,
}

impl ReverseCursor {
    pub fn new(cfg: &ScrubConfig) -> Self {
        ReverseCursor {
            cursor: None,
            max_lag: (3 * cfg.reverse_lz_frames as i64).max(12),
            last_reset_host: f64::NEG_INFINITY,
            forward_drift_since: None,
        }
    }

    pub fn current(&self) -> Option<i64> {
        self.cursor
    }

    fn clamp_lag(&mut self, requested: i64) {
        if let Some(c) = self.cursor {
            let floor = requested - self.max_lag;
            if c < floor {
                self.cursor = Some(floor);
            }
        }
    }

    /// Advance mode — the pipeline is about to dispatch a decode for
    /// `requested`. Returns the quantized index the decode should use.
    pub fn advance(&mut self, requested: i64, host_now: f64) -> i64 {
        match self.cursor {
            None => {
                self.cursor = Some(requested);
                self.last_reset_host = host_now;
            }
            Some(c) if requested <= c => {
                self.cursor = Some(requested);
            }
            Some(c) => {
                // Forward motion during a reverse scrub: honor it only when it
                // is a genuine jump, not pointer noise.
                let jumped = requested - c >= LARGE_JUMP_FRAMES
                    && host_now - self.last_reset_host >= LARGE_JUMP_HOLD_S;
                if jumped {
                    self.cursor = Some(requested);
                    self.last_reset_host = host_now;
                }
            }
        }
        self.clamp_lag(requested);
        self.cursor.unwrap_or(requested)
    }

    /// Observe mode — a raw UI update landed but no decode is being
    /// dispatched yet.
    pub fn observe(&mut self, requested: i64, velocity: f64, host_now: f64) {
        let Some(c) = self.cursor else {
            self.cursor = Some(requested);
            self.last_reset_host = host_now;
            return;
        };

        if velocity < 0.0 {
            self.forward_drift_since = None;
            if (requested - c).abs() >= LARGE_JUMP_FRAMES {
                self.cursor = Some(requested);
                self.last_reset_host = host_now;
            }
        } else {
            let (frames, hold) = forward_jitter_threshold(velocity.abs());
            if requested - c >= frames {
                match self.forward_drift_since {
                    None => self.forward_drift_since = Some(host_now),
                    Some(since) if host_now - since >= hold => {
                        self.cursor = Some(requested);
                        self.last_reset_host = host_now;
                        self.forward_drift_since = None;
                    }
                    Some(_) => {}
                }
            } else {
                self.forward_drift_since = None;
            }
        }
        self.clamp_lag(requested);
    }

    /// Called on every successful reverse decode: one frame of backward
    /// progress.
    pub fn commit(&mut self) {
        if let Some(c) = self.cursor {
            self.cursor = Some(c - 1);
        }
    }

    pub fn reset(&mut self) {
        self.cursor = None;
        self.forward_drift_since = None;
        self.last_reset_host = f64::NEG_INFINITY;
    }
}
