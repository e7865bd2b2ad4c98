// crates/cutline-media/src/scrub_decoder.rs
//
// The per-clip orchestrator: turns "I want the frame at t" into a delivered
// pixel buffer. Owns the clip's reader, decoder session, GOP index and proxy
// policy; everything recoverable is consumed here and turned into
// bookkeeping. Only cancellation and final failure escape to the pipeline.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use cutline_core::cancel::CancelToken;
use cutline_core::config::ScrubConfig;
use cutline_core::cutline_log;
use cutline_core::error::DecodeError;
use cutline_core::helpers::time::{quantize_pts, secs_to_ms};
use cutline_core::media_types::{
    DecodeStage, Direction, PixelBuffer, RapRecord,
};

use crate::gop_index::GopIndex;
use crate::proxy::{ProxyDecision, ProxyManager, ProxyService, ProxyZone, ZoneStatus};
use crate::reader::{PresentGate, TrackReader};
use crate::session::{BackendFactory, DecoderSession};
use crate::source::{SourceHandle, SourceOpener};

/// RAP lookups are memoized on this bucket grid (ms).
const RAP_BUCKET_MS: i64 = 120;
/// Attempt budget for one decode_frame call.
const MAX_ATTEMPTS: u32 = 12;
/// Cut detection slack (ms).
const CUT_SLACK_MS: i64 = 150;
/// Present-gate lead below the target (seconds).
const PRESENT_GATE_LEAD: f64 = 0.040;
/// Base fallback-adoption guard (ms).
const BASE_GUARD_MS: i64 = 500;
/// Backward steps allowed while clamping an adopted anchor.
const ADOPT_MAX_STEPS: u32 = 12;
/// Recenter freeze after fallback adoption.
const ADOPT_RECENTER_FREEZE: Duration = Duration::from_millis(150);
/// Stall detection cooldown and post-reset quiet period.
const STALL_COOLDOWN: Duration = Duration::from_millis(500);
const STALL_QUIET: Duration = Duration::from_millis(100);
/// Compressed fast-path pixel cache bound.
const FAST_CACHE_CAP: usize = 16;
/// Decode-cost history for the p95 estimate.
const COST_HISTORY_CAP: usize = 64;

/// Provides decode backends for a given source reference; the ffmpeg module
/// and the tests both implement this.
pub trait BackendProvider: Send + Sync {
    fn factory_for(&self, source_ref: &str) -> Result<Box<dyn BackendFactory>, DecodeError>;
}

#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub buffer:  PixelBuffer,
    pub pts:     f64,
    pub stages:  Vec<DecodeStage>,
    pub cost_ms: f64,
}

pub struct EnhancedScrubDecoder {
    clip:         Uuid,
    cfg:          ScrubConfig,
    opener:       Arc<dyn SourceOpener>,
    backends:     Arc<dyn BackendProvider>,
    original_ref: String,
    index_root:   Option<PathBuf>,

    source:       SourceHandle,
    active_proxy: Option<ProxyZone>,
    index:        GopIndex,
    reader:       Option<TrackReader>,
    session:      Option<DecoderSession>,
    proxy:        ProxyManager,

    rap_bucket:   HashMap<i64, RapRecord>,
    fast_gop_ms:  Option<i64>,
    fast_cache:   HashMap<i64, PixelBuffer>,

    bad_data_lead_boost:        u32,
    consecutive_bad_data:       u32,
    reverse_error_streak:       u32,
    anchor_backoff_s:           f64,
    last_stall_detect:          Option<Instant>,
    quiet_until:                Option<Instant>,
    decode_costs:               Vec<f64>,
}

impl EnhancedScrubDecoder {
    pub fn new(
        clip: Uuid,
        original_ref: String,
        opener: Arc<dyn SourceOpener>,
        backends: Arc<dyn BackendProvider>,
        proxy_service: Arc<dyn ProxyService>,
        cfg: ScrubConfig,
        index_root: Option<PathBuf>,
    ) -> Result<Self, DecodeError> {
        let source = SourceHandle::new(opener.open(&original_ref)?);
        let info = source.info();
        let proxy = ProxyManager::new(proxy_service, clip, original_ref.clone(), &cfg);
        Ok(EnhancedScrubDecoder {
            clip,
            anchor_backoff_s: cfg.reverse_failure_backoff,
            cfg,
            opener,
            backends,
            original_ref,
            index_root,
            source,
            active_proxy: None,
            index: GopIndex::new(info.track, info.stream_id),
            reader: None,
            session: None,
            proxy,
            rap_bucket: HashMap::new(),
            fast_gop_ms: None,
            fast_cache: HashMap::new(),
            bad_data_lead_boost: 0,
            consecutive_bad_data: 0,
            reverse_error_streak: 0,
            last_stall_detect: None,
            quiet_until: None,
            decode_costs: Vec::new(),
        })
    }

    pub fn clip(&self) -> Uuid {
        self.clip
    }

    pub fn frame_duration(&self) -> f64 {
        self.source.info().frame_duration
    }

    pub fn duration(&self) -> f64 {
        self.source.info().duration_s
    }

    pub fn is_on_proxy(&self) -> bool {
        self.active_proxy.is_some()
    }

    pub fn active_proxy_zone(&self) -> Option<u64> {
        self.active_proxy.as_ref().map(|z| z.zone_id)
    }

    pub fn proxy_override_active(&self, now: Instant) -> bool {
        self.proxy.override_active(now)
    }

    pub fn reverse_error_streak(&self) -> u32 {
        self.reverse_error_streak
    }

    /// Watchdog deadline input: p95 of recent decode costs (ms).
    pub fn p95_decode_ms(&self) -> f64 {
        if self.decode_costs.is_empty() {
            return 0.0;
        }
        let mut sorted = self.decode_costs.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn freeze_recentering(&mut self, d: Duration, now: Instant) {
        if let Some(r) = &mut self.reader {
            r.freeze_recentering(d, now);
        }
    }

    /// A tracked decode timed out (watchdog). Advances the reverse failure
    /// streak; at the recovery threshold the anchor cache is dropped and the
    /// backoff grows so the next attempt re-anchors further back.
    pub fn note_watchdog_timeout(&mut self) {
        self.reverse_error_streak += 1;
        if self.reverse_error_streak >= self.cfg.reverse_failure_recovery_threshold {
            self.rap_bucket.clear();
            self.anchor_backoff_s =
                (self.anchor_backoff_s * 2.0).min(self.cfg.reverse_failure_max_backoff);
        }
    }

    /// Cold reset after a timeline jump: everything positional is stale.
    pub fn reset_for_timeline_jump(&mut self, _t_pred: f64, now: Instant) {
        self.rap_bucket.clear();
        self.fast_cache.clear();
        self.fast_gop_ms = None;
        self.bad_data_lead_boost = 0;
        if let Some(r) = &mut self.reader {
            r.invalidate();
        }
        if let Some(s) = &mut self.session {
            s.reset(now);
        }
    }

    /// Stall recovery / stuck-task release: rebuild reader and session.
    pub fn force_full_reset(&mut self, reason: &str, now: Instant) {
        cutline_log!("[decode] {}: force full reset ({reason})", self.clip);
        self.rap_bucket.clear();
        self.fast_cache.clear();
        self.fast_gop_ms = None;
        self.reader = None;
        if let Some(s) = &mut self.session {
            s.force_complete_reset(now);
        }
        self.quiet_until = Some(now + STALL_QUIET);
    }

    /// Reverse-pipeline stall check: every slot is in flight and nothing warm
    /// exists behind the playhead. Bounded by a 500ms cooldown. Returns true
    /// when a recovery reset fired (the caller must also release admission
    /// and cancel the coalesced job).
    pub fn detect_stall(
        &mut self,
        reverse_inflight: u32,
        max_inflight: u32,
        warm_behind: u32,
        now: Instant,
    ) -> bool {
        if reverse_inflight < max_inflight || warm_behind > 0 {
            return false;
        }
        if let Some(last) = self.last_stall_detect {
            if now.duration_since(last) < STALL_COOLDOWN {
                return false;
            }
        }
        self.last_stall_detect = Some(now);
        self.force_full_reset("stuck-detection", now);
        true
    }

    // ── Source selection ─────────────────────────────────────────────────────

    /// Mount the source the proxy policy wants for `abs_ms`. Switching either
    /// way drops the reader, session and index state.
    fn prepare_source(
        &mut self,
        abs_ms: i64,
        now: Instant,
        stages: &mut Vec<DecodeStage>,
    ) -> Result<(), DecodeError> {
        let want = match self.proxy.decision(abs_ms, now) {
            ProxyDecision::Proxy(z) => Some(z),
            ProxyDecision::Original => None,
        };
        let current = self.active_proxy.as_ref().map(|z| z.zone_id);
        if want.as_ref().map(|z| z.zone_id) == current {
            return Ok(());
        }

        let source_ref = want
            .as_ref()
            .map(|z| z.url.clone())
            .unwrap_or_else(|| self.original_ref.clone());
        cutline_log!(
            "[decode] {}: mounting {} for {abs_ms}ms",
            self.clip,
            if want.is_some() { "proxy" } else { "original" }
        );
        self.source = SourceHandle::new(self.opener.open(&source_ref)?);
        self.active_proxy = want;
        self.reader = None;
        self.session = Some(DecoderSession::new(self.backends.factory_for(&source_ref)?));
        // Epoch bump kills every key minted against the old source's table.
        self.index.reset_all_caches();
        let info = self.source.info();
        let samples = self.source.samples_in(0.0, info.duration_s)?;
        self.index.rebuild(&samples);
        self.rap_bucket.clear();
        self.fast_cache.clear();
        self.fast_gop_ms = None;
        stages.push(DecodeStage::ProxySwitch);
        Ok(())
    }

    fn active_source_ref(&self) -> String {
        self.active_proxy
            .as_ref()
            .map(|z| z.url.clone())
            .unwrap_or_else(|| self.original_ref.clone())
    }

    fn ensure_resources(&mut self) -> Result<(), DecodeError> {
        if self.index.is_empty() {
            let loaded = self
                .index_root
                .as_ref()
                .map(|root| self.index.load(root))
                .unwrap_or(false);
            if !loaded {
                let info = self.source.info();
                let samples = self.source.samples_in(0.0, info.duration_s)?;
                self.index.rebuild(&samples);
                if let Some(root) = &self.index_root {
                    if let Err(e) = self.index.save(root) {
                        cutline_log!("[index] save failed: {e}");
                    }
                }
            }
        }
        if self.reader.is_none() {
            self.reader = Some(TrackReader::new(
                self.source.clone(),
                self.cfg.max_reverse_lookback,
                self.cfg.max_forward_head,
            ));
        }
        if self.session.is_none() {
            let source_ref = self.active_source_ref();
            self.session = Some(DecoderSession::new(self.backends.factory_for(&source_ref)?));
        }
        Ok(())
    }

    // ── RAP resolution ───────────────────────────────────────────────────────

    fn resolve_rap(&mut self, t: f64, now: Instant, stages: &mut Vec<DecodeStage>) -> RapRecord {
        let bucket = secs_to_ms(t) / RAP_BUCKET_MS;
        if let Some(r) = self.rap_bucket.get(&bucket) {
            let fresh = r.key.epoch == self.index.current_epoch();
            let clean = fresh && {
                let key = r.key;
                self.index.fail_count(&key, now) == 0
            };
            if clean {
                stages.push(DecodeStage::RapCacheHit);
                return self.rap_bucket[&bucket].clone();
            }
            self.rap_bucket.remove(&bucket);
        }
        stages.push(DecodeStage::RapLookup);
        let r = self.index.find_random_access(t, now);
        self.rap_bucket.insert(bucket, r.clone());
        self.rap_bucket
            .insert(secs_to_ms(r.pts_s) / RAP_BUCKET_MS, r.clone());
        r
    }

    /// Clamp a fallback candidate to the adoption rules: never ahead of the
    /// target by more than the guard; step back through prev_sync while it
    /// is; re-anchor at prev_sync(target) when it lands too far away.
    fn clamp_fallback(&mut self, mut candidate: RapRecord, target_ms: i64, now: Instant) -> RapRecord {
        let guard_ms = secs_to_ms(self.anchor_backoff_s).max(BASE_GUARD_MS);
        let mut steps = 0;
        while candidate.abs_ms > target_ms + guard_ms && steps < ADOPT_MAX_STEPS {
            match self.index.prev_sync_before(candidate.abs_ms, now) {
                Some(p) => candidate = p,
                None => break,
            }
            steps += 1;
        }
        if (candidate.abs_ms - target_ms).abs() > guard_ms.max(BASE_GUARD_MS) {
            if let Some(p) = self.index.prev_sync_before(target_ms, now) {
                candidate = p;
            }
        }
        candidate
    }

    // ── The decode ───────────────────────────────────────────────────────────

    pub fn decode_frame(
        &mut self,
        target_t: f64,
        t_pred: f64,
        direction: Direction,
        deadline_mode: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<DecodeOutcome, DecodeError> {
        let started = Instant::now();
        let mut stages: Vec<DecodeStage> = Vec::new();
        let now = started;

        if self.quiet_until.is_some_and(|q| now < q) {
            return Err(DecodeError::Cancelled);
        }

        let fd = self.frame_duration();
        let snapped = quantize_pts(target_t.clamp(0.0, self.duration()), fd);
        let target_ms = secs_to_ms(snapped);
        let pred_ms = secs_to_ms(t_pred);

        // Display surface flagged a late frame near some position — pre-warm
        // proxy coverage there before it costs another late delivery.
        if let Some(late_ms) = self.proxy.consume_late_frame_trigger() {
            self.proxy
                .ensure_spot_proxy(late_ms, 4000, "late_frame", "display", now);
        }

        self.prepare_source(target_ms, now, &mut stages)?;
        self.ensure_resources()?;

        let mut rap = self.resolve_rap(snapped, now, &mut stages);

        // Compressed fast path: reverse targets sitting right on top of their
        // anchor can be served from the engine's own pixel cache.
        if direction.is_reverse()
            && (snapped - rap.pts_s).abs() <= self.cfg.compressed_idr_target_gate
        {
            let gop_ms = secs_to_ms(rap.pts_s);
            if self.fast_gop_ms == Some(gop_ms) {
                if let Some(buf) = self.fast_cache.get(&target_ms) {
                    stages.push(DecodeStage::FastPath);
                    return Ok(DecodeOutcome {
                        buffer: buf.clone(),
                        pts: snapped,
                        stages,
                        cost_ms: started.elapsed().as_secs_f64() * 1000.0,
                    });
                }
            }
        }

        let mut attempt_hashes: HashSet<u64> = HashSet::new();
        let mut bad_data_attempts: u32 = 0;
        let mut alternate_next = false; // prev first, then next

        for _attempt in 0..MAX_ATTEMPTS {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(DecodeError::Cancelled);
            }
            let now = Instant::now();

            let anchor_ms = rap.abs_ms;
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            (anchor_ms, target_ms, self.active_source_ref()).hash(&mut hasher);
            let attempt_hash = hasher.finish();
            if !attempt_hashes.insert(attempt_hash) {
                self.bad_data_lead_boost += 1;
                if deadline_mode {
                    stages.push(DecodeStage::DeadlineSkip);
                    return Err(DecodeError::Cancelled);
                }
            }

            // Cut-edge state: near a RAP boundary, or the anchor has history.
            let rap_key = rap.key;
            let cut_edge = self.index.is_near_cut(target_ms, CUT_SLACK_MS)
                || self.index.is_near_cut(pred_ms, CUT_SLACK_MS)
                || self.index.fail_count(&rap_key, now) > 0;
            if cut_edge && !stages.contains(&DecodeStage::CutEdge) {
                stages.push(DecodeStage::CutEdge);
            }

            let preroll = if cut_edge {
                self.cfg.preroll_frames.max(3)
            } else {
                self.cfg.preroll_frames.max(1)
            };
            let gate = cut_edge.then_some(PresentGate {
                min_pts: snapped - PRESENT_GATE_LEAD,
                drop_not_sync: true,
            });

            // Forward-feed window: preroll behind the anchor, reorder lead
            // (plus the bad-data boost) ahead of the target.
            let reorder = self.source.info().codec.reorder_lead_frames();
            let back_span = preroll as f64 * fd;
            let fwd_head = (reorder + self.bad_data_lead_boost).max(1) as f64 * fd;
            let manual = (
                (snapped - back_span).min(rap.pts_s).max(0.0),
                t_pred.max(snapped) + fwd_head,
            );
            let prev_sync_ms = self
                .index
                .prev_sync_before(target_ms, now)
                .map(|r| r.abs_ms);

            let copied = {
                let reader = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| DecodeError::ReaderConfig("reader missing".into()))?;
                let session = self
                    .session
                    .as_mut()
                    .ok_or(DecodeError::SessionInvalid)?;
                match reader.ensure_window(
                    t_pred,
                    &rap,
                    snapped,
                    Some(manual),
                    cut_edge,
                    prev_sync_ms,
                    now,
                ) {
                    Ok(_) => reader.copy_frame(session, snapped, direction, gate, cancel, now),
                    Err(e) => Err(e),
                }
            };

            match copied {
                Ok((buffer, pts)) => {
                    stages.push(DecodeStage::ReaderCopy);
                    if self
                        .session
                        .as_ref()
                        .is_some_and(|s| s.level() == crate::session::LadderLevel::ImageGenerator)
                    {
                        stages.push(DecodeStage::ImageGenerator);
                    }
                    self.index.reset_fail(&rap_key);
                    self.bad_data_lead_boost = 0;
                    self.consecutive_bad_data = 0;
                    self.reverse_error_streak = 0;
                    self.anchor_backoff_s = self.cfg.reverse_failure_backoff;

                    let cost_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.decode_costs.push(cost_ms);
                    if self.decode_costs.len() > COST_HISTORY_CAP {
                        self.decode_costs.remove(0);
                    }

                    // Feed the fast-path cache for targets near the anchor.
                    if (snapped - rap.pts_s).abs() <= self.cfg.compressed_idr_target_gate {
                        let gop_ms = secs_to_ms(rap.pts_s);
                        if self.fast_gop_ms != Some(gop_ms) {
                            self.fast_gop_ms = Some(gop_ms);
                            self.fast_cache.clear();
                        }
                        if self.fast_cache.len() < FAST_CACHE_CAP {
                            self.fast_cache.insert(secs_to_ms(pts), buffer.clone());
                        }
                    }

                    return Ok(DecodeOutcome { buffer, pts, stages, cost_ms });
                }

                Err(DecodeError::Cancelled) => return Err(DecodeError::Cancelled),

                Err(ref e) if e.is_bad_data() => {
                    self.index.note_fail(rap_key, now);
                    self.consecutive_bad_data += 1;
                    bad_data_attempts += 1;
                    if direction.is_reverse() {
                        self.reverse_error_streak += 1;
                    }

                    // Proxy policy reactions.
                    if self.active_proxy.is_some() {
                        if self.proxy.note_playback_failure("bad_data", now) {
                            // two strikes — remount the original
                            self.prepare_source(target_ms, now, &mut stages)?;
                            self.ensure_resources()?;
                            rap = self.resolve_rap(snapped, now, &mut stages);
                            continue;
                        }
                    } else if direction.is_reverse() {
                        if self.consecutive_bad_data >= 2 {
                            let status = self.proxy.ensure_spot_proxy(
                                target_ms,
                                4000,
                                "reverse_bad_data",
                                "scrub",
                                now,
                            );
                            if status == ZoneStatus::Ready {
                                self.prepare_source(target_ms, now, &mut stages)?;
                                self.ensure_resources()?;
                                rap = self.resolve_rap(snapped, now, &mut stages);
                                continue;
                            }
                        }
                        if self.reverse_error_streak >= self.cfg.reverse_proxy_error_threshold {
                            self.proxy.set_override(now);
                        }
                    }

                    // Anchor replacement: alternate prev/next within the
                    // retry budget, then the failure handler takes over.
                    let candidate = if bad_data_attempts <= self.cfg.bad_data_retry_max {
                        let c = if alternate_next {
                            self.index.next_sync_after(target_ms, now)
                        } else {
                            self.index.prev_sync_before(anchor_ms, now)
                        };
                        alternate_next = !alternate_next;
                        c
                    } else {
                        // Repeated failure: quarantine the anchor and step
                        // back by the (growing) backoff.
                        if self.index.fail_count(&rap_key, now)
                            >= self.cfg.reverse_failure_recovery_threshold
                        {
                            self.index
                                .quarantine(rap_key, now + Duration::from_secs(5));
                            self.anchor_backoff_s = (self.anchor_backoff_s * 2.0)
                                .min(self.cfg.reverse_failure_max_backoff);
                        }
                        let back_ms = target_ms - secs_to_ms(self.anchor_backoff_s);
                        self.index.prev_sync_before(back_ms, now)
                    };

                    match candidate {
                        Some(c) => {
                            let adopted = self.clamp_fallback(c, target_ms, now);
                            if adopted.key != rap.key {
                                stages.push(DecodeStage::FallbackAdopt);
                                rap = adopted;
                                self.rap_bucket.clear();
                                if let Some(r) = &mut self.reader {
                                    r.freeze_recentering(ADOPT_RECENTER_FREEZE, now);
                                }
                                if let Some(s) = &mut self.session {
                                    s.reset(now);
                                }
                            }
                        }
                        None => {
                            // Nothing left to anchor on in this source.
                            if bad_data_attempts > self.cfg.bad_data_retry_max {
                                return Err(DecodeError::bad_data());
                            }
                        }
                    }
                }

                Err(DecodeError::SessionInvalid) => {
                    if let Some(s) = &mut self.session {
                        s.reset(now);
                    }
                }

                Err(DecodeError::ReaderConfig(_)) => {
                    if let Some(r) = &mut self.reader {
                        r.widen_window(0.25, 0.10)?;
                    }
                }

                Err(DecodeError::UnsupportedFormat) | Err(DecodeError::Malfunction) => {
                    // The session already escalated its ladder; go around
                    // once more on the software rung.
                    if !stages.contains(&DecodeStage::SoftwareFallback) {
                        stages.push(DecodeStage::SoftwareFallback);
                    }
                }

                Err(e) => return Err(e),
            }
        }

        if deadline_mode {
            self.proxy.note_deadline_failure(target_ms);
        }
        Err(DecodeError::bad_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{CoverageReply, ProxyDecision};
    use crate::session::{DecodeBackend, DecodedFrame, LadderLevel};
    use crate::source::testutil::{ScriptedOpener, BAD_SENTINEL};
    use cutline_core::media_types::CompressedSample;
    use parking_lot::Mutex;

    const FD: f64 = 1.0 / 24.0;

    struct StubBackend;

    impl DecodeBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn decode(
            &mut self,
            s: &CompressedSample,
        ) -> Result<Option<DecodedFrame>, DecodeError> {
            if s.data == BAD_SENTINEL {
                return Err(DecodeError::bad_data());
            }
            Ok(Some(DecodedFrame {
                buffer: PixelBuffer::rgba(2, 2, s.data.repeat(2)),
                pts_s: s.pts_s,
            }))
        }
        fn flush(&mut self) {}
    }

    struct StubProvider;

    impl BackendProvider for StubProvider {
        fn factory_for(&self, _r: &str) -> Result<Box<dyn BackendFactory>, DecodeError> {
            struct F;
            impl BackendFactory for F {
                fn create(
                    &self,
                    _l: LadderLevel,
                ) -> Result<Box<dyn DecodeBackend>, DecodeError> {
                    Ok(Box::new(StubBackend))
                }
            }
            Ok(Box::new(F))
        }
    }

    /// Proxy service that grants ready coverage on request.
    #[derive(Default)]
    struct GrantingProxy {
        zones:    Mutex<Vec<ProxyZone>>,
        requests: Mutex<Vec<String>>,
    }

    impl ProxyService for GrantingProxy {
        fn ensure_coverage_if_needed(
            &self,
            _clip: Uuid,
            _source_ref: &str,
            around_abs_ms: i64,
            span_ms: i64,
            reason: &str,
            _context: &str,
        ) -> CoverageReply {
            self.requests.lock().push(reason.to_string());
            let id = self.zones.lock().len() as u64 + 1;
            self.zones.lock().push(ProxyZone {
                zone_id: id,
                url: format!("proxy:{id}"),
                span_ms: (around_abs_ms - span_ms / 2, around_abs_ms + span_ms / 2),
                context: "scrub".into(),
                status: ZoneStatus::Ready,
            });
            CoverageReply { status: ZoneStatus::Ready, zone_id: Some(id), did_request_export: true }
        }

        fn decision(&self, _clip: Uuid, abs_ms: i64) -> ProxyDecision {
            self.zones
                .lock()
                .iter()
                .find(|z| z.span_ms.0 <= abs_ms && abs_ms <= z.span_ms.1)
                .cloned()
                .map_or(ProxyDecision::Original, ProxyDecision::Proxy)
        }

        fn mark_playback_failure(&self, _clip: Uuid, zone_id: u64, _reason: &str) {
            self.zones.lock().retain(|z| z.zone_id != zone_id);
        }

        fn note_deadline_failure(&self, _c: Uuid, _t: i64, _s: &str) {}

        fn consume_late_frame_trigger(&self, _c: Uuid) -> Option<i64> {
            None
        }
    }

    /// Proxy service that never has coverage.
    struct NoProxy;

    impl ProxyService for NoProxy {
        fn ensure_coverage_if_needed(
            &self,
            _c: Uuid,
            _s: &str,
            _a: i64,
            _sp: i64,
            _r: &str,
            _x: &str,
        ) -> CoverageReply {
            CoverageReply { status: ZoneStatus::Missing, zone_id: None, did_request_export: false }
        }
        fn decision(&self, _c: Uuid, _a: i64) -> ProxyDecision {
            ProxyDecision::Original
        }
        fn mark_playback_failure(&self, _c: Uuid, _z: u64, _r: &str) {}
        fn note_deadline_failure(&self, _c: Uuid, _t: i64, _s: &str) {}
        fn consume_late_frame_trigger(&self, _c: Uuid) -> Option<i64> {
            None
        }
    }

    fn decoder_with(
        proxy: Arc<dyn ProxyService>,
        opener: ScriptedOpener,
    ) -> EnhancedScrubDecoder {
        EnhancedScrubDecoder::new(
            Uuid::new_v4(),
            "original.mov".into(),
            Arc::new(opener),
            Arc::new(StubProvider),
            proxy,
            ScrubConfig::default(),
            None,
        )
        .unwrap()
    }

    fn opener() -> ScriptedOpener {
        ScriptedOpener { duration_s: 10.0, fps: 24.0, gop_len: 12 }
    }

    #[test]
    fn mid_gop_target_decodes() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let target = 53.0 * FD;
        let out = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!((out.pts - target).abs() <= (FD / 2.0).max(0.010));
        assert!(out.stages.contains(&DecodeStage::ReaderCopy));
        assert!(out.stages.contains(&DecodeStage::RapLookup));
    }

    #[test]
    fn rap_bucket_cache_hits_on_repeat() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let target = 53.0 * FD;
        d.decode_frame(target, target, Direction::Reverse, false, None).unwrap();
        let out = d
            .decode_frame(52.0 * FD, 52.0 * FD, Direction::Reverse, false, None)
            .unwrap();
        assert!(out.stages.contains(&DecodeStage::RapCacheHit));
    }

    #[test]
    fn fast_path_serves_from_pixel_cache() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        // right on the anchor: within the idr-target gate
        let target = 48.0 * FD;
        let first = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!(!first.stages.contains(&DecodeStage::FastPath));
        let second = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!(second.stages.contains(&DecodeStage::FastPath));
    }

    #[test]
    fn timeline_jump_reset_clears_fast_cache() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let target = 48.0 * FD;
        d.decode_frame(target, target, Direction::Reverse, false, None).unwrap();
        d.reset_for_timeline_jump(1.0, Instant::now());
        let out = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!(!out.stages.contains(&DecodeStage::FastPath));
    }

    #[test]
    fn bad_data_recovers_through_spot_proxy() {
        // the whole GOP around 5.0s is poisoned on the original
        let proxy = Arc::new(GrantingProxy::default());
        let mut d = EnhancedScrubDecoder::new(
            Uuid::new_v4(),
            "original.mov".into(),
            Arc::new(PoisonedOpener { poison_from: 108, poison_to: 132 }),
            Arc::new(StubProvider),
            proxy.clone(),
            ScrubConfig::default(),
            None,
        )
        .unwrap();

        let target = 5.0; // frame 120, inside the poisoned GOP
        let out = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!(out.stages.contains(&DecodeStage::ProxySwitch), "stages: {:?}", out.stages);
        assert!(d.is_on_proxy());
        assert!((out.pts - quantize_pts(target, FD)).abs() <= FD);
        // the coverage request carried the reverse bad-data reason
        assert!(proxy
            .requests
            .lock()
            .iter()
            .any(|r| r == "reverse_bad_data"));

        // follow-up decodes nearby stay on the proxy and succeed
        let out2 = d
            .decode_frame(5.2, 5.2, Direction::Reverse, false, None)
            .unwrap();
        assert!((out2.pts - quantize_pts(5.2, FD)).abs() <= FD);
    }

    #[test]
    fn anchors_alternate_before_giving_up() {
        // no proxy available; the poisoned span covers every anchor the
        // alternation will try, so the decode ultimately fails — but the
        // index must show failures recorded against multiple anchors.
        let mut d = EnhancedScrubDecoder::new(
            Uuid::new_v4(),
            "original.mov".into(),
            Arc::new(PoisonedOpener { poison_from: 0, poison_to: 500 }),
            Arc::new(StubProvider),
            Arc::new(NoProxy),
            ScrubConfig::default(),
            None,
        )
        .unwrap();
        let err = d
            .decode_frame(5.0, 5.0, Direction::Reverse, false, None)
            .unwrap_err();
        assert!(err.is_bad_data());
        assert!(d.reverse_error_streak() >= 2);
    }

    #[test]
    fn deadline_mode_skips_on_repeated_attempt() {
        let mut d = EnhancedScrubDecoder::new(
            Uuid::new_v4(),
            "original.mov".into(),
            Arc::new(PoisonedOpener { poison_from: 0, poison_to: 500 }),
            Arc::new(StubProvider),
            Arc::new(NoProxy),
            ScrubConfig::default(),
            None,
        )
        .unwrap();
        let err = d
            .decode_frame(5.0, 5.0, Direction::Reverse, true, None)
            .unwrap_err();
        // either the duplicate-hash skip or the retry budget ends it, but it
        // must not burn all 12 attempts silently in deadline mode
        assert!(matches!(err, DecodeError::Cancelled | DecodeError::BadData { .. }));
    }

    #[test]
    fn cut_edge_gates_frames_before_the_target() {
        let mut d = decoder_with(
            Arc::new(NoProxy),
            ScriptedOpener { duration_s: 12.0, fps: 24.0, gop_len: 12 },
        );
        // 50ms past the RAP at 10.0s — well inside the 150ms cut slack
        let target = 10.050;
        let out = d
            .decode_frame(target, target, Direction::Reverse, false, None)
            .unwrap();
        assert!(out.stages.contains(&DecodeStage::CutEdge), "stages: {:?}", out.stages);
        // the present gate drops anything more than 40ms before the target
        assert!(out.pts >= target - 0.040 - 1e-9, "leading frame leaked: {}", out.pts);
        assert!((out.pts - quantize_pts(target, FD)).abs() <= FD);
    }

    #[test]
    fn late_frame_trigger_requests_coverage() {
        struct LateFrameProxy {
            inner:   GrantingProxy,
            pending: Mutex<Option<i64>>,
        }
        impl ProxyService for LateFrameProxy {
            fn ensure_coverage_if_needed(
                &self,
                clip: Uuid,
                source_ref: &str,
                around_abs_ms: i64,
                span_ms: i64,
                reason: &str,
                context: &str,
            ) -> CoverageReply {
                self.inner
                    .ensure_coverage_if_needed(clip, source_ref, around_abs_ms, span_ms, reason, context)
            }
            fn decision(&self, clip: Uuid, abs_ms: i64) -> ProxyDecision {
                self.inner.decision(clip, abs_ms)
            }
            fn mark_playback_failure(&self, clip: Uuid, zone_id: u64, reason: &str) {
                self.inner.mark_playback_failure(clip, zone_id, reason)
            }
            fn note_deadline_failure(&self, clip: Uuid, t: i64, s: &str) {
                self.inner.note_deadline_failure(clip, t, s)
            }
            fn consume_late_frame_trigger(&self, _clip: Uuid) -> Option<i64> {
                self.pending.lock().take()
            }
        }

        let svc = Arc::new(LateFrameProxy {
            inner: GrantingProxy::default(),
            pending: Mutex::new(Some(7000)),
        });
        let mut d = EnhancedScrubDecoder::new(
            Uuid::new_v4(),
            "original.mov".into(),
            Arc::new(opener()),
            Arc::new(StubProvider),
            svc.clone(),
            ScrubConfig::default(),
            None,
        )
        .unwrap();

        d.decode_frame(7.0, 7.0, Direction::Reverse, false, None).unwrap();
        assert!(
            svc.inner.requests.lock().iter().any(|r| r == "late_frame"),
            "late-frame trigger must turn into a coverage request"
        );
    }

    #[test]
    fn stall_detection_is_cooldown_bounded() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let now = Instant::now();
        assert!(d.detect_stall(3, 3, 0, now));
        // immediately again: cooldown suppresses
        assert!(!d.detect_stall(3, 3, 0, now + Duration::from_millis(100)));
        assert!(d.detect_stall(3, 3, 0, now + Duration::from_millis(600)));
        // not stalled when warm frames exist or slots are free
        assert!(!d.detect_stall(2, 3, 0, now + Duration::from_secs(2)));
        assert!(!d.detect_stall(3, 3, 4, now + Duration::from_secs(3)));
    }

    #[test]
    fn quiet_period_rejects_decodes_after_reset() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        d.force_full_reset("test", Instant::now());
        let err = d
            .decode_frame(2.0, 2.0, Direction::Reverse, false, None)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Cancelled));
        // after the quiet period decodes work again
        std::thread::sleep(Duration::from_millis(120));
        assert!(d.decode_frame(2.0, 2.0, Direction::Reverse, false, None).is_ok());
    }

    #[test]
    fn cancellation_token_stops_the_attempt_loop() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let token = CancelToken::new(1);
        token.cancel();
        let err = d
            .decode_frame(2.0, 2.0, Direction::Reverse, false, Some(&token))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Cancelled));
    }

    #[test]
    fn watchdog_timeouts_grow_the_recovery_backoff() {
        let mut d = decoder_with(Arc::new(NoProxy), opener());
        let before = d.anchor_backoff_s;
        for _ in 0..ScrubConfig::default().reverse_failure_recovery_threshold {
            d.note_watchdog_timeout();
        }
        assert!(d.anchor_backoff_s > before);
        assert!(d.anchor_backoff_s <= ScrubConfig::default().reverse_failure_max_backoff);
    }

    /// Opener whose original has a poisoned frame range; proxies are clean.
    struct PoisonedOpener {
        poison_from: i64,
        poison_to:   i64,
    }

    impl SourceOpener for PoisonedOpener {
        fn open(
            &self,
            source_ref: &str,
        ) -> Result<Box<dyn crate::source::MediaSource + Send>, DecodeError> {
            use crate::source::testutil::ScriptedSource;
            let mut src = ScriptedSource::new(10.0, 24.0, 12);
            if source_ref.starts_with("proxy:") {
                src = src.intra();
            } else {
                for i in self.poison_from..=self.poison_to {
                    src.bad_frames.insert(i);
                }
            }
            Ok(Box::new(src))
        }
    }
}
