// crates/cutline-core/src/predictor.rs
//
// Velocity prediction for the scrub head. Raw drag samples arrive at UI event
// rate; the predictor smooths them and projects where the playhead will be
// when a decode scheduled now actually completes.

use std::collections::VecDeque;

use crate::config::ScrubConfig;
use crate::media_types::Prediction;

/// How much drag history the instantaneous estimate may look at (seconds of
/// host time).
const HISTORY_WINDOW_S: f64 = 0.2;

/// Adaptive window bounds (frames).
const WINDOW_MIN: u32 = 2;
const WINDOW_MAX: u32 = 12;

pub struct VelocityPredictor {
    alpha:       f64,
    factor:      f64,
    clamp_min:   f64,
    clamp_max:   f64,
    /// `(host_time, timeline_time)` pairs, newest at the back.
    history:     VecDeque<(f64, f64)>,
    smoothed:    Option<f64>,
}

impl VelocityPredictor {
    pub fn new(cfg: &ScrubConfig) -> Self {
        VelocityPredictor {
            alpha: cfg.velocity_ema_alpha,
            factor: cfg.prediction_factor,
            clamp_min: cfg.prediction_clamp_min,
            clamp_max: cfg.prediction_clamp_max,
            history: VecDeque::new(),
            smoothed: None,
        }
    }

    /// Forget everything — called from `begin_scrub`.
    pub fn reset(&mut self) {
        self.history.clear();
        self.smoothed = None;
    }

    pub fn smoothed_velocity(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }

    /// Feed one raw drag sample and produce the prediction for this update.
    ///
    /// `raw_velocity` is the UI's own estimate in timeline-seconds per second;
    /// it seeds the first sample, after which velocity is derived from the
    /// sample deltas themselves.
    pub fn sample(
        &mut self,
        host_now: f64,
        t_now: f64,
        raw_velocity: f64,
        frame_duration: f64,
    ) -> Prediction {
        let v_inst = match self.history.back() {
            Some(&(prev_host, prev_t)) if host_now > prev_host => {
                (t_now - prev_t) / (host_now - prev_host)
            }
            _ => raw_velocity,
        };

        let v_smooth = match self.smoothed {
            Some(prev) => self.alpha * v_inst + (1.0 - self.alpha) * prev,
            None => v_inst,
        };
        self.smoothed = Some(v_smooth);

        self.history.push_back((host_now, t_now));
        while let Some(&(h, _)) = self.history.front() {
            if host_now - h > HISTORY_WINDOW_S {
                self.history.pop_front();
            } else {
                break;
            }
        }

        // Strong reverse drags overshoot badly if the prediction is allowed
        // its full backward reach — tighten the clamp as reverse speed grows.
        let clamp_min = if v_smooth <= -1.0 {
            -0.30
        } else if v_smooth <= -0.5 {
            -0.35
        } else {
            self.clamp_min
        };
        let offset = (v_smooth * self.factor).clamp(clamp_min, self.clamp_max);
        let t_pred = (t_now + offset).max(0.0);

        let fd = frame_duration.max(1e-6);
        let inst_fps = v_inst / fd;
        let smooth_fps = v_smooth / fd;

        // The window formula works on the raw (dimensionless) smoothed
        // velocity, like the clamp above — not the fps conversion, which
        // would tie the window size to the composition frame rate.
        let mut window = ((v_smooth.abs() * 0.5) as u32).clamp(WINDOW_MIN, WINDOW_MAX);
        if v_smooth <= -0.8 {
            window = window.max(8);
        } else if v_smooth <= -0.4 {
            window = window.max(6);
        }

        Prediction {
            t_now,
            t_pred,
            inst_velocity_fps: inst_fps,
            smoothed_velocity_fps: smooth_fps,
            smoothed_velocity: v_smooth,
            window_frames: window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FD: f64 = 1.0 / 24.0;

    fn predictor() -> VelocityPredictor {
        VelocityPredictor::new(&ScrubConfig::default())
    }

    /// Drive `n` samples at fixed velocity `v`, 16ms apart, starting at t0.
    fn drive(p: &mut VelocityPredictor, t0: f64, v: f64, n: usize) -> Prediction {
        let mut last = None;
        for k in 0..n {
            let host = k as f64 * 0.016;
            let t = t0 + v * host;
            last = Some(p.sample(host, t, v, FD));
        }
        last.unwrap()
    }

    #[test]
    fn first_sample_uses_raw_velocity() {
        let mut p = predictor();
        let pred = p.sample(0.0, 2.0, -1.0, FD);
        assert!((pred.smoothed_velocity + 1.0).abs() < 1e-9);
        assert!(pred.t_pred < pred.t_now);
    }

    #[test]
    fn prediction_offset_is_always_clamped() {
        let mut p = predictor();
        for k in 0..100 {
            let host = k as f64 * 0.016;
            // wild velocity swings
            let v = if k % 2 == 0 { -40.0 } else { 35.0 };
            let t = 50.0 + (k as f64 * 0.01);
            let pred = p.sample(host, t, v, FD);
            assert!(
                (pred.t_pred - pred.t_now).abs() <= 0.5 + 1e-9,
                "offset escaped clamp at k={k}"
            );
        }
    }

    #[test]
    fn window_formula_uses_raw_velocity_not_fps() {
        // -0.3 sits below every floor override, so the literal formula is
        // visible: |−0.3| * 0.5 = 0.15 → minimum window of 2. Computing from
        // the fps conversion instead (−7.2 at 24fps) would give 3.
        let mut p = predictor();
        let w = drive(&mut p, 10.0, -0.3, 5).window_frames;
        assert_eq!(w, 2);
    }

    #[test]
    fn window_adapts_to_reverse_velocity() {
        // velocity → expected window per the adaptation table
        let mut p = predictor();
        let w1 = drive(&mut p, 10.0, -0.1, 5).window_frames;
        assert_eq!(w1, 2);

        p.reset();
        let w2 = drive(&mut p, 10.0, -0.5, 5).window_frames;
        assert!(w2 >= 6, "got {w2}");

        p.reset();
        let w3 = drive(&mut p, 10.0, -1.2, 5).window_frames;
        assert!(w3 >= 8, "got {w3}");

        p.reset();
        let w4 = drive(&mut p, 10.0, -3.0, 5).window_frames;
        assert!((8..=12).contains(&w4), "got {w4}");
    }

    #[test]
    fn reverse_clamp_tightens_with_speed() {
        let mut p = predictor();
        let pred = drive(&mut p, 10.0, -0.7, 8);
        // at v_smooth ≈ -0.7 the backward reach is limited to 0.35s
        assert!(pred.t_now - pred.t_pred <= 0.35 + 1e-9);

        p.reset();
        let pred = drive(&mut p, 10.0, -2.0, 8);
        assert!(pred.t_now - pred.t_pred <= 0.30 + 1e-9);
    }

    #[test]
    fn ema_converges_toward_steady_velocity() {
        let mut p = predictor();
        let pred = drive(&mut p, 5.0, -1.0, 20);
        assert!((pred.smoothed_velocity + 1.0).abs() < 0.05);
    }

    #[test]
    fn prediction_never_goes_negative() {
        let mut p = predictor();
        let pred = p.sample(0.0, 0.05, -4.0, FD);
        assert!(pred.t_pred >= 0.0);
    }
}
