// crates/cutline-media/src/session.rs
//
// Persistent decode session. Created lazily, reused aggressively, reset on
// format change, and ladder-escalated when a backend keeps failing. The
// actual decoder (hardware, software, image generator) sits behind
// DecodeBackend so the session logic is backend-agnostic.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cutline_core::cutline_log;
use cutline_core::error::DecodeError;
use cutline_core::helpers::time::secs_to_ms;
use cutline_core::media_types::{CompressedSample, Direction, PixelBuffer};

/// Errors within this window count toward ladder escalation.
const ERROR_WINDOW: Duration = Duration::from_millis(500);
/// Escalate after this many errors inside ERROR_WINDOW.
const ERROR_ESCALATE_COUNT: usize = 3;
/// Backend creates allowed per 500ms before escalation.
const CREATE_THROTTLE_CAP: usize = 5;
const CREATE_THROTTLE_WINDOW: Duration = Duration::from_millis(500);
/// Refuse new decodes this long after a reset so stale callbacks drain.
const FREEZE_GATE: Duration = Duration::from_millis(150);
/// Warm-frame cache bound.
const WARM_CAP: usize = 10;
/// Direction-aware warm lookup slack (seconds).
const WARM_EPSILON: f64 = 0.002;
/// ProxyOnly auto-returns to Hardware after this long.
const PROXY_ONLY_HOLD: Duration = Duration::from_millis(1750);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LadderLevel {
    /// Hardware preferred; the driver may still pick software.
    Hardware,
    /// Intra-frame-only path, auto-returns to Hardware.
    ProxyOnly,
    /// Forced software decode.
    Software,
    /// Frame-accurate slow path of last resort.
    ImageGenerator,
}

impl LadderLevel {
    fn escalated(self) -> LadderLevel {
        match self {
            LadderLevel::Hardware => LadderLevel::ProxyOnly,
            LadderLevel::ProxyOnly => LadderLevel::Software,
            LadderLevel::Software | LadderLevel::ImageGenerator => LadderLevel::ImageGenerator,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub buffer: PixelBuffer,
    pub pts_s:  f64,
}

/// One rung of the ladder. `decode` may return `Ok(None)` while the decoder
/// is buffering reordered frames.
pub trait DecodeBackend: Send {
    fn name(&self) -> &'static str;
    fn decode(
        &mut self,
        sample: &CompressedSample,
    ) -> Result<Option<DecodedFrame>, DecodeError>;
    /// Drop internal reference state (seek/reset).
    fn flush(&mut self);
}

pub trait BackendFactory: Send {
    fn create(&self, level: LadderLevel) -> Result<Box<dyn DecodeBackend>, DecodeError>;
}

pub struct DecoderSession {
    factory:          Box<dyn BackendFactory>,
    backend:          Option<Box<dyn DecodeBackend>>,
    level:            LadderLevel,
    proxy_only_until: Option<Instant>,
    error_times:      VecDeque<Instant>,
    create_times:     VecDeque<Instant>,
    freeze_until:     Option<Instant>,
    /// `pts_ms → frame`, newest at the back.
    warm:             VecDeque<(i64, DecodedFrame)>,
    last_decoded_pts: Option<f64>,
    last_format_sig:  Option<u64>,
    awaiting_sync:    bool,
    pub resets:       u64,
}

impl DecoderSession {
    pub fn new(factory: Box<dyn BackendFactory>) -> Self {
        DecoderSession {
            factory,
            backend: None,
            level: LadderLevel::Hardware,
            proxy_only_until: None,
            error_times: VecDeque::new(),
            create_times: VecDeque::new(),
            freeze_until: None,
            warm: VecDeque::new(),
            last_decoded_pts: None,
            last_format_sig: None,
            awaiting_sync: true,
            resets: 0,
        }
    }

    pub fn level(&self) -> LadderLevel {
        self.level
    }

    pub fn last_decoded_pts(&self) -> Option<f64> {
        self.last_decoded_pts
    }

    /// Flush the backend and arm the freeze gate. The next submission must be
    /// a sync sample.
    pub fn reset(&mut self, now: Instant) {
        if let Some(b) = &mut self.backend {
            b.flush();
        }
        self.freeze_until = Some(now + FREEZE_GATE);
        self.awaiting_sync = true;
        self.last_decoded_pts = None;
        self.resets += 1;
    }

    /// Drop the backend entirely (stall recovery, source switch). The ladder
    /// level survives — a stall on software decode should not retry hardware.
    pub fn force_complete_reset(&mut self, now: Instant) {
        self.backend = None;
        self.warm.clear();
        self.reset(now);
        cutline_log!("[session] force complete reset (level {:?})", self.level);
    }

    /// Manually push the ladder (reader bad-data path, proxy policy).
    pub fn escalate(&mut self, now: Instant, reason: &str) {
        let next = self.level.escalated();
        if next != self.level {
            cutline_log!("[session] escalate {:?} → {next:?} ({reason})", self.level);
            self.level = next;
            if next == LadderLevel::ProxyOnly {
                self.proxy_only_until = Some(now + PROXY_ONLY_HOLD);
            }
            self.backend = None;
            self.reset(now);
        }
    }

    fn ensure_backend(&mut self, now: Instant) -> Result<(), DecodeError> {
        // ProxyOnly is temporary — fall back to hardware once the hold lapses.
        if self.level == LadderLevel::ProxyOnly {
            if let Some(until) = self.proxy_only_until {
                if now >= until {
                    cutline_log!("[session] proxy-only hold elapsed — back to hardware");
                    self.level = LadderLevel::Hardware;
                    self.proxy_only_until = None;
                    self.backend = None;
                }
            }
        }
        if self.backend.is_some() {
            return Ok(());
        }

        // Create throttle: runaway recreate loops escalate instead of spinning.
        self.create_times.retain(|t| now.duration_since(*t) < CREATE_THROTTLE_WINDOW);
        if self.create_times.len() >= CREATE_THROTTLE_CAP {
            self.level = self.level.escalated();
            if self.level == LadderLevel::ProxyOnly {
                self.proxy_only_until = Some(now + PROXY_ONLY_HOLD);
            }
            self.create_times.clear();
            cutline_log!("[session] create throttle exceeded — escalate to {:?}", self.level);
        }
        self.create_times.push_back(now);

        let backend = self.factory.create(self.level)?;
        cutline_log!("[session] created backend '{}' at {:?}", backend.name(), self.level);
        self.backend = Some(backend);
        self.awaiting_sync = true;
        Ok(())
    }

    fn note_error(&mut self, err: &DecodeError, now: Instant) {
        if err.escalates_immediately() {
            cutline_log!("[session] {} — jumping to software", err.kind_tag());
            self.level = LadderLevel::Software;
            self.backend = None;
            self.reset(now);
            return;
        }
        self.error_times.push_back(now);
        while let Some(&front) = self.error_times.front() {
            if now.duration_since(front) > ERROR_WINDOW {
                self.error_times.pop_front();
            } else {
                break;
            }
        }
        if self.error_times.len() >= ERROR_ESCALATE_COUNT {
            self.error_times.clear();
            self.escalate(now, "error burst");
        }
    }

    /// Decode one sample. `Ok(None)` means the sample was consumed without
    /// producing a frame yet (reorder buffering, or a non-sync sample rejected
    /// while the session waits for its first sync after a reset).
    pub fn decode(
        &mut self,
        sample: &CompressedSample,
        _direction: Direction,
        now: Instant,
    ) -> Result<Option<DecodedFrame>, DecodeError> {
        // Freeze gate: let stale callbacks drain before accepting new work.
        // The window is bounded, so blocking the clip actor briefly is fine.
        if let Some(until) = self.freeze_until {
            let wait = until.saturating_duration_since(Instant::now());
            if !wait.is_zero() && wait <= FREEZE_GATE {
                std::thread::sleep(wait);
            }
            self.freeze_until = None;
        }

        // Format change mid-stream invalidates the reference state.
        if let Some(prev) = self.last_format_sig {
            if prev != sample.format_sig {
                cutline_log!("[session] format change {prev:#x} → {:#x}", sample.format_sig);
                self.reset(now);
            }
        }
        self.last_format_sig = Some(sample.format_sig);

        // First submission after (re)create must be a sync sample.
        if self.awaiting_sync {
            if !sample.is_sync {
                return Ok(None);
            }
            self.awaiting_sync = false;
        }

        self.ensure_backend(now)?;
        let backend = self.backend.as_mut().expect("backend ensured above");
        match backend.decode(sample) {
            Ok(Some(frame)) => {
                self.last_decoded_pts = Some(frame.pts_s);
                self.warm.push_back((secs_to_ms(frame.pts_s), frame.clone()));
                while self.warm.len() > WARM_CAP {
                    self.warm.pop_front();
                }
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.note_error(&e, now);
                Err(e)
            }
        }
    }

    /// Direction-aware warm lookup: reverse accepts only frames at or before
    /// the last decoded pts (+ε), forward only at or after (−ε); within the
    /// accepted set the nearest frame inside `tolerance` wins.
    pub fn warm_lookup(
        &self,
        pts: f64,
        direction: Direction,
        tolerance: f64,
    ) -> Option<DecodedFrame> {
        let last = self.last_decoded_pts?;
        let mut best: Option<(f64, &DecodedFrame)> = None;
        for (_, f) in &self.warm {
            let admissible = match direction {
                Direction::Reverse => f.pts_s <= last + WARM_EPSILON,
                Direction::Forward => f.pts_s >= last - WARM_EPSILON,
            };
            if !admissible {
                continue;
            }
            let dist = (f.pts_s - pts).abs();
            if dist <= tolerance && best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, f));
            }
        }
        best.map(|(_, f)| f.clone())
    }
}
