// crates/cutline-media/src/reader.rs
//
// Sliding coverage window over one track. The reader owns which compressed
// samples are loaded and in what order they are fed to the decoder session;
// it is rebuilt only when a shift cannot extend the existing window, because
// rebuilds are the expensive path (new demux positioning, session resync).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cutline_core::cancel::CancelToken;
use cutline_core::cutline_log;
use cutline_core::error::DecodeError;
use cutline_core::helpers::time::{ms_to_secs, quantize_pts, secs_to_ms};
use cutline_core::media_types::{CompressedSample, Direction, PixelBuffer, RapRecord};

use crate::session::DecoderSession;
use crate::source::{SourceHandle, TrackInfo};

/// Rebuilds allowed per 500ms before the escalation path widens the window.
const REBUILD_THROTTLE_CAP: usize = 5;
const REBUILD_THROTTLE_WINDOW: Duration = Duration::from_millis(500);
/// Consecutive format-signature changes tolerated before forcing a rebuild.
const FORMAT_CHURN_MAX: u32 = 2;
/// Safe-window geometry near cuts (seconds).
const SAFE_PREV_SYNC_PAD: f64 = 0.120;
const SAFE_PRED_BACKOFF: f64 = 0.220;
const SAFE_HALF_SPAN: f64 = 0.500;
/// Widening applied when the throttle escalates (seconds).
const ESCALATE_BACK: f64 = 0.25;
const ESCALATE_FWD: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderWindow {
    pub anchor:  cutline_core::media_types::RaKey,
    pub start_s: f64,
    pub end_s:   f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    Kept,
    Shifted,
    Rebuilt,
}

/// Cut-edge delivery gate: decoded frames below `min_pts`, or coming from
/// samples still flagged not-sync, are dropped instead of delivered.
#[derive(Debug, Clone, Copy)]
pub struct PresentGate {
    pub min_pts:       f64,
    pub drop_not_sync: bool,
}

pub struct TrackReader {
    source:                 SourceHandle,
    info:                   TrackInfo,
    max_reverse_lookback:   f64,
    max_forward_head:       f64,
    window:                 Option<ReaderWindow>,
    samples:                Vec<CompressedSample>,
    rebuild_times:          VecDeque<Instant>,
    pub rebuilds:           u64,
    pub shifts:             u64,
    format_sig_last:        Option<u64>,
    format_changes:         u32,
    recenter_enabled_after: Option<Instant>,
}

impl TrackReader {
    pub fn new(source: SourceHandle, max_reverse_lookback: f64, max_forward_head: f64) -> Self {
        let info = source.info();
        TrackReader {
            source,
            info,
            max_reverse_lookback,
            max_forward_head,
            window: None,
            samples: Vec::new(),
            rebuild_times: VecDeque::new(),
            rebuilds: 0,
            shifts: 0,
            format_sig_last: None,
            format_changes: 0,
            recenter_enabled_after: None,
        }
    }

    pub fn info(&self) -> TrackInfo {
        self.info
    }

    pub fn active_range(&self) -> Option<(f64, f64)> {
        self.window.as_ref().map(|w| (w.start_s, w.end_s))
    }

    /// Suppress recentering (safe-window override and shifts toward t_pred)
    /// until `now + d`. Fallback adoption and deadline decode both freeze the
    /// window so the anchor they installed survives the next few updates.
    pub fn freeze_recentering(&mut self, d: Duration, now: Instant) {
        self.recenter_enabled_after = Some(now + d);
    }

    pub fn recenter_allowed(&self, now: Instant) -> bool {
        self.recenter_enabled_after.map_or(true, |t| now >= t)
    }

    /// Configure the window so the active range covers `rap.pts` through at
    /// least the target (plus reorder head). Prefers shifting the existing
    /// window; rebuilds otherwise, with throttle-escalation widening.
    pub fn ensure_window(
        &mut self,
        t_pred: f64,
        rap: &RapRecord,
        target_pts: f64,
        manual_range: Option<(f64, f64)>,
        near_cut: bool,
        prev_sync_ms: Option<i64>,
        now: Instant,
    ) -> Result<WindowAction, DecodeError> {
        let fd = self.info.frame_duration;
        let duration = self.info.duration_s;

        let (mut start, mut end) = match manual_range {
            Some((s, e)) => (s.max(0.0), e),
            None => {
                let lead_in = (fd * 5.0).max(0.18).min(self.max_reverse_lookback);
                let start = (rap.pts_s - lead_in).max(0.0);
                let reorder = self.info.codec.reorder_lead_frames() as f64 * fd;
                let min_span = (fd * 6.0).max(0.5);
                let end = (t_pred.max(target_pts) + reorder).max(start + min_span);
                (start, end)
            }
        };

        // Safe window near cuts or when the anchor moved: recenter on a point
        // safely past the previous sync so the decode does not straddle the
        // cut boundary. Skipped while recentering is frozen.
        let anchor_changed = self
            .window
            .as_ref()
            .map_or(true, |w| w.anchor != rap.key);
        if (near_cut || anchor_changed) && self.recenter_allowed(now) {
            let center = match prev_sync_ms {
                Some(p) => (ms_to_secs(p) + SAFE_PREV_SYNC_PAD).max(t_pred - SAFE_PRED_BACKOFF),
                None => t_pred - SAFE_PRED_BACKOFF,
            };
            start = start.min((center - SAFE_HALF_SPAN).max(0.0));
            end = end.max(center + SAFE_HALF_SPAN);
        }

        // Clamps. The start is never adjusted past the anchor — decode must
        // be able to begin at the RAP.
        end = end.min(duration);
        let max_span = self.max_reverse_lookback + self.max_forward_head;
        if end - start > max_span {
            start = (end - max_span).min(rap.pts_s);
        }
        start = start.min(rap.pts_s.max(0.0)).max(0.0);
        end = end.max(t_pred.min(duration)).max(target_pts.min(duration));

        let desired = ReaderWindow { anchor: rap.key, start_s: start, end_s: end };

        match &self.window {
            Some(w)
                if w.anchor == rap.key
                    && w.start_s <= desired.start_s + 1e-9
                    && w.end_s >= desired.end_s - 1e-9 =>
            {
                return Ok(WindowAction::Kept);
            }
            Some(w)
                if w.anchor.epoch == rap.key.epoch
                    && w.start_s <= t_pred
                    && t_pred <= w.end_s
                    && overlaps(w, &desired)
                    && desired.end_s.max(w.end_s) - desired.start_s.min(w.start_s)
                        <= max_span * 1.5 =>
            {
                // Extend in place.
                let merged = ReaderWindow {
                    anchor: rap.key,
                    start_s: desired.start_s.min(w.start_s),
                    end_s: desired.end_s.max(w.end_s),
                };
                self.load_samples(&merged)?;
                self.window = Some(merged);
                self.shifts += 1;
                Ok(WindowAction::Shifted)
            }
            _ => {
                let mut target = desired;
                self.rebuild_times
                    .retain(|t| now.duration_since(*t) < REBUILD_THROTTLE_WINDOW);
                if self.rebuild_times.len() >= REBUILD_THROTTLE_CAP {
                    // Thrash: widen so the next few targets land inside one
                    // window instead of forcing another rebuild each.
                    target.start_s = (target.start_s - ESCALATE_BACK).max(0.0);
                    target.end_s = (target.end_s + ESCALATE_FWD).min(duration);
                    self.rebuild_times.clear();
                    cutline_log!(
                        "[reader] rebuild throttle hit — widened to {:.3}..{:.3}",
                        target.start_s,
                        target.end_s
                    );
                }
                self.rebuild_times.push_back(now);
                self.load_samples(&target)?;
                self.window = Some(target);
                self.rebuilds += 1;
                Ok(WindowAction::Rebuilt)
            }
        }
    }

    fn load_samples(&mut self, w: &ReaderWindow) -> Result<(), DecodeError> {
        self.samples = self.source.samples_in(w.start_s, w.end_s)?;
        if self.samples.is_empty() && w.end_s > w.start_s {
            return Err(DecodeError::ReaderConfig(format!(
                "no samples in {:.3}..{:.3}",
                w.start_s, w.end_s
            )));
        }
        self.format_changes = 0;
        Ok(())
    }

    /// Widen the current window in place (decode-failure recovery).
    pub fn widen_window(&mut self, back: f64, fwd: f64) -> Result<(), DecodeError> {
        if let Some(w) = self.window.clone() {
            let widened = ReaderWindow {
                anchor: w.anchor,
                start_s: (w.start_s - back).max(0.0),
                end_s: (w.end_s + fwd).min(self.info.duration_s),
            };
            self.load_samples(&widened)?;
            self.window = Some(widened);
        }
        Ok(())
    }

    /// Drop the window so the next ensure rebuilds from scratch.
    pub fn invalidate(&mut self) {
        self.window = None;
        self.samples.clear();
    }

    /// Feed the window's samples through the session and return the first
    /// decoded frame within tolerance of the target.
    ///
    /// Tolerance is `max(frame_duration / 2, 10ms)`. If the stream runs past
    /// the target without an exact hit, the nearest delivered frame wins
    /// (best-effort "nearest" policy during live drag).
    pub fn copy_frame(
        &mut self,
        session: &mut DecoderSession,
        target_pts: f64,
        direction: Direction,
        gate: Option<PresentGate>,
        cancel: Option<&CancelToken>,
        now: Instant,
    ) -> Result<(PixelBuffer, f64), DecodeError> {
        let window = self
            .window
            .clone()
            .ok_or_else(|| DecodeError::ReaderConfig("no active window".into()))?;
        let fd = self.info.frame_duration;
        let snapped = quantize_pts(target_pts, fd);
        let tolerance = (fd / 2.0).max(0.010);

        let mut anchor_satisfied = false;
        let mut best: Option<(f64, PixelBuffer, f64)> = None;

        let samples = self.samples.clone();
        for sample in &samples {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(DecodeError::Cancelled);
            }
            if sample.data.is_empty() {
                return Err(DecodeError::bad_data());
            }

            // Consecutive format churn means the window straddles a splice the
            // index does not know about — force a rebuild.
            match self.format_sig_last {
                Some(prev) if prev != sample.format_sig => self.format_changes += 1,
                _ => self.format_changes = 0,
            }
            self.format_sig_last = Some(sample.format_sig);
            if self.format_changes > FORMAT_CHURN_MAX {
                self.invalidate();
                return Err(DecodeError::SessionInvalid);
            }

            // Drop leading dependent/partial samples until the anchor is
            // reached — the session would reject them anyway, but skipping
            // them here avoids burning the sync invariant on garbage.
            if !anchor_satisfied {
                let at_anchor = secs_to_ms(sample.dts_s) >= window.anchor.dts_ms;
                let startable = sample.is_sync
                    && !sample.flags.map_or(false, |f| {
                        f.is_dependent() || f.partial_sync == Some(true)
                    });
                if !(at_anchor && startable) {
                    continue;
                }
                anchor_satisfied = true;
            }

            let frame = match session.decode(sample, direction, now) {
                Ok(Some(f)) => f,
                Ok(None) => continue,
                Err(e) => return Err(e),
            };

            if let Some(g) = &gate {
                if frame.pts_s < g.min_pts {
                    continue;
                }
                if g.drop_not_sync
                    && sample.flags.map_or(false, |f| f.not_sync == Some(true))
                    && frame.pts_s < snapped - tolerance
                {
                    continue;
                }
            }

            let dist = (frame.pts_s - snapped).abs();
            if dist <= tolerance {
                return Ok((frame.buffer, frame.pts_s));
            }
            if best.as_ref().map_or(true, |(d, _, _)| dist < *d) {
                best = Some((dist, frame.buffer.clone(), frame.pts_s));
            }
            // Ran past the target — no closer frame is coming.
            if frame.pts_s > snapped + tolerance {
                break;
            }
        }

        match best {
            Some((_, buffer, pts)) => Ok((buffer, pts)),
            None => Err(DecodeError::bad_data()),
        }
    }

    /// `copy_frame` with the bad-data widening retries: each retry pulls the
    /// window out by two frames behind and one ahead, twice at most.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_frame_retrying(
        &mut self,
        session: &mut DecoderSession,
        target_pts: f64,
        direction: Direction,
        gate: Option<PresentGate>,
        cancel: Option<&CancelToken>,
        now: Instant,
    ) -> Result<(PixelBuffer, f64), DecodeError> {
        let fd = self.info.frame_duration;
        let mut last_err = None;
        for attempt in 0..=2 {
            if attempt > 0 {
                self.widen_window(fd * 2.0, fd)?;
                session.reset(now);
            }
            match self.copy_frame(session, target_pts, direction, gate, cancel, now) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_bad_data() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(DecodeError::bad_data))
    }
}

fn overlaps(a: &ReaderWindow, b: &ReaderWindow) -> bool {
    a.start_s < b.end_s && b.start_s < a.end_s
}
