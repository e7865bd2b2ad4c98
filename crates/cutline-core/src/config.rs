// crates/cutline-core/src/config.rs
//
// Every tunable of the scrub pipeline in one serde-round-trippable struct.
// Defaults are the shipping values; a host can persist overrides as JSON and
// missing fields fall back to the defaults on load.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    // ── Decode shaping ───────────────────────────────────────────────────────
    /// Minimum frames decoded between the anchor and the target.
    pub preroll_frames: u32,
    /// Hard cap on parallel decodes per clip (forward + reverse separately
    /// counted, each bounded by this).
    pub max_inflight_per_clip: u32,
    /// Bad-data attempt budget per anchor before the failure handler runs.
    pub bad_data_retry_max: u32,

    // ── Landing zones ────────────────────────────────────────────────────────
    /// Target warm frames behind `t_pred` in reverse.
    pub reverse_lz_frames: u32,
    /// Target warm frames ahead of `t_pred`.
    pub forward_lz_frames: u32,

    // ── Velocity prediction ──────────────────────────────────────────────────
    pub velocity_ema_alpha: f64,
    /// Scale for `v_smooth * factor` when projecting the landing point.
    pub prediction_factor: f64,
    /// Prediction offset clamp (seconds, signed). The minimum tightens under
    /// strong reverse velocity — see `VelocityPredictor`.
    pub prediction_clamp_min: f64,
    pub prediction_clamp_max: f64,

    // ── Reverse-specific policy ──────────────────────────────────────────────
    /// Drop frames whose `pts - t_timeline` exceeds this (seconds) in reverse.
    pub reverse_future_lead_cap: f64,
    /// Failures on one anchor before fallback anchor adoption.
    pub reverse_failure_recovery_threshold: u32,
    /// Seconds to step the anchor back per recovery, and its cap.
    pub reverse_failure_backoff: f64,
    pub reverse_failure_max_backoff: f64,
    /// Reverse-direction error streak that triggers a spot-proxy request.
    pub reverse_proxy_error_threshold: u32,
    /// TTL of the `prefer_proxy` override (seconds).
    pub reverse_proxy_override_lifespan: f64,

    // ── Proxy policy ─────────────────────────────────────────────────────────
    /// Once a clip switches to proxy, Original decisions are suppressed for
    /// this long (seconds) unless the active zone fails.
    pub proxy_hold_duration: f64,

    // ── Fast path ────────────────────────────────────────────────────────────
    /// Max seconds between anchor and target for the compressed fast path.
    pub compressed_idr_target_gate: f64,

    // ── End-of-scrub ─────────────────────────────────────────────────────────
    /// Per-clip retries of the mandatory decode at `end_scrub`.
    pub mandatory_decode_max_retries: u32,

    // ── Admission ────────────────────────────────────────────────────────────
    /// If true, admission denies at the clip cap instead of preempting a
    /// running slot.
    pub admission_never_cancel_running: bool,
    /// Minimum interval between rate-gated admissions per clip (ms).
    pub admission_rate_gate_ms: u64,
    /// Admissions at scrub start that skip the rate gate.
    pub admission_burst_credits: u32,

    // ── Reader window ────────────────────────────────────────────────────────
    /// Longest reverse lookback a window may cover (seconds, ≤ 1.0).
    pub max_reverse_lookback: f64,
    /// Longest forward head past the target (seconds, ≤ 0.20).
    pub max_forward_head: f64,

    // ── Pipeline cadence ─────────────────────────────────────────────────────
    /// Minimum interval between decode starts per clip (ms), bypassed when
    /// warm coverage is critically short or repair mode is active.
    pub debounce_ms: u64,
    /// Watchdog deadline floor (ms); the live deadline is
    /// `max(3 * p95_decode, watchdog_floor_ms)`.
    pub watchdog_floor_ms: u64,
    /// Watchdog cancels the task instead of logging only.
    pub strict_watchdog: bool,

    // ── Frame cache ──────────────────────────────────────────────────────────
    pub ram_cache_bytes: u64,
    pub disk_cache_bytes: u64,
    pub cache_tile_px: u32,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        ScrubConfig {
            preroll_frames: 2,
            max_inflight_per_clip: 3,
            bad_data_retry_max: 3,

            reverse_lz_frames: 6,
            forward_lz_frames: 4,

            velocity_ema_alpha: 0.3,
            prediction_factor: 0.12,
            prediction_clamp_min: -0.5,
            prediction_clamp_max: 0.5,

            reverse_future_lead_cap: 0.25,
            reverse_failure_recovery_threshold: 3,
            reverse_failure_backoff: 0.5,
            reverse_failure_max_backoff: 2.0,
            reverse_proxy_error_threshold: 4,
            reverse_proxy_override_lifespan: 3.0,

            proxy_hold_duration: 1.5,

            compressed_idr_target_gate: 0.35,

            mandatory_decode_max_retries: 2,

            admission_never_cancel_running: false,
            admission_rate_gate_ms: 20,
            admission_burst_credits: 3,

            max_reverse_lookback: 1.0,
            max_forward_head: 0.20,

            debounce_ms: 30,
            watchdog_floor_ms: 180,
            strict_watchdog: false,

            ram_cache_bytes: 4 * 1024 * 1024 * 1024,
            disk_cache_bytes: 8 * 1024 * 1024 * 1024,
            cache_tile_px: 256,
        }
    }
}

impl ScrubConfig {
    /// GOP coalescing bucket span for a composition frame duration.
    pub fn gop_span(fd: f64) -> f64 {
        (fd * 12.0).max(0.5)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a config; unknown fields are ignored and missing fields take
    /// their defaults, so configs survive option renames across versions.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = ScrubConfig::default();
        let json = cfg.to_json().unwrap();
        let back = ScrubConfig::from_json(&json).unwrap();
        assert_eq!(back.preroll_frames, cfg.preroll_frames);
        assert_eq!(back.max_inflight_per_clip, cfg.max_inflight_per_clip);
        assert!((back.proxy_hold_duration - 1.5).abs() < 1e-9);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = ScrubConfig::from_json(r#"{ "preroll_frames": 5 }"#).unwrap();
        assert_eq!(cfg.preroll_frames, 5);
        assert_eq!(cfg.max_inflight_per_clip, 3);
        assert!((cfg.velocity_ema_alpha - 0.3).abs() < 1e-9);
    }

    #[test]
    fn gop_span_floors_at_half_second() {
        assert!((ScrubConfig::gop_span(1.0 / 24.0) - 0.5).abs() < 1e-9);
        assert!((ScrubConfig::gop_span(0.1) - 1.2).abs() < 1e-9);
    }
}
