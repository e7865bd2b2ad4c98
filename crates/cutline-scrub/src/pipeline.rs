// crates/cutline-scrub/src/pipeline.rs
//
// The integrated scrub pipeline. Lives on the host's interaction thread:
// begin_scrub / update_scrub / end_scrub never block on decode — they plan
// targets, gate them through admission and coalescing, and hand orders to the
// per-clip workers. Results come back through the display surface and the
// event channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use cutline_core::admission::AdmissionController;
use cutline_core::cancel::CancelToken;
use cutline_core::coalesce::{gop_key_ms, CoalesceDecision, GopCoalescer};
use cutline_core::config::ScrubConfig;
use cutline_core::cursor::ReverseCursor;
use cutline_core::cutline_log;
use cutline_core::helpers::time::{frame_index, quantize_pts};
use cutline_core::landing;
use cutline_core::media_types::{
    DecodeReason, DecodeTarget, Direction, FrameOrigin, ScrubEvent,
};
use cutline_core::predictor::VelocityPredictor;
use cutline_media::frame_cache::ClearLevel;
use cutline_media::proxy::ProxyService;
use cutline_media::scrub_decoder::BackendProvider;
use cutline_media::source::SourceOpener;
use cutline_media::{EnhancedScrubDecoder, FrameCache};

use crate::display::{CacheSurface, DisplaySurface};
use crate::worker::{
    spawn_clip_worker, spawn_watchdog, ClipStats, DecodeDone, Shared, WatchdogRegistry,
    WorkOrder, WorkerMsg,
};

/// Per-clip order channel depth; a full channel denies the dispatch instead
/// of blocking the interaction thread.
const ORDER_CHANNEL_CAP: usize = 16;
const EVENT_CHANNEL_CAP: usize = 512;
/// End-of-scrub waits per decode.
const DEADLINE_WAIT: Duration = Duration::from_secs(2);
const MANDATORY_WAIT: Duration = Duration::from_secs(1);
/// Reader recenter freeze at end_scrub (ms).
const END_SCRUB_RECENTER_FREEZE_MS: u64 = 200;

struct ClipHandle {
    tx:            Sender<WorkerMsg>,
    join:          Option<JoinHandle<()>>,
    fd:            f64,
    duration:      f64,
    coalescer:     GopCoalescer,
    active_cancel: Option<CancelToken>,
    last_dispatch: Option<Instant>,
    last_stall:    Option<Instant>,
}

pub struct ScrubPipeline {
    cfg:            ScrubConfig,
    opener:         Arc<dyn SourceOpener>,
    backends:       Arc<dyn BackendProvider>,
    proxy:          Arc<dyn ProxyService>,
    cache:          Arc<Mutex<FrameCache>>,
    surface:        Arc<dyn DisplaySurface>,
    shared:         Arc<Shared>,
    registry:       Arc<WatchdogRegistry>,
    watchdog_stop:  Arc<AtomicBool>,
    watchdog_join:  Option<JoinHandle<()>>,
    events_rx:      Receiver<ScrubEvent>,
    done_rx:        Receiver<DecodeDone>,
    clips:          HashMap<Uuid, ClipHandle>,
    predictor:      VelocityPredictor,
    epoch:          u64,
    host_epoch:     Instant,
    composition_fd: f64,
    index_root:     Option<PathBuf>,
}

impl ScrubPipeline {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        backends: Arc<dyn BackendProvider>,
        proxy: Arc<dyn ProxyService>,
        cfg: ScrubConfig,
        cache_root: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let mut cache = FrameCache::new(cfg.ram_cache_bytes, cfg.cache_tile_px);
        if let Some(root) = &cache_root {
            cache = cache
                .with_disk(root, cfg.disk_cache_bytes)
                .context("disk cache tier")?;
        }
        let cache = Arc::new(Mutex::new(cache));
        let surface: Arc<dyn DisplaySurface> = Arc::new(CacheSurface::new(cache.clone()));

        // Events are lossy telemetry (try_send everywhere); completions are
        // load-bearing, so that channel must never be able to block a worker.
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_CAP);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            cfg: cfg.clone(),
            admission: Mutex::new(AdmissionController::new(&cfg)),
            cursors: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            surface: surface.clone(),
            events: events_tx,
            done: done_tx,
            epoch: AtomicU64::new(0),
        });
        let registry: Arc<WatchdogRegistry> = Arc::new(Mutex::new(HashMap::new()));
        let watchdog_stop = Arc::new(AtomicBool::new(false));
        let watchdog_join = Some(spawn_watchdog(
            registry.clone(),
            shared.clone(),
            watchdog_stop.clone(),
        ));

        Ok(ScrubPipeline {
            predictor: VelocityPredictor::new(&cfg),
            cfg,
            opener,
            backends,
            proxy,
            cache,
            surface,
            shared,
            registry,
            watchdog_stop,
            watchdog_join,
            events_rx,
            done_rx,
            clips: HashMap::new(),
            epoch: 0,
            host_epoch: Instant::now(),
            composition_fd: 1.0 / 24.0,
            index_root: cache_root,
        })
    }

    /// Telemetry channel: drain once per host tick.
    pub fn events(&self) -> &Receiver<ScrubEvent> {
        &self.events_rx
    }

    /// The in-process frame cache backing the default display surface.
    pub fn cache(&self) -> Arc<Mutex<FrameCache>> {
        self.cache.clone()
    }

    fn host_now(&self) -> f64 {
        self.host_epoch.elapsed().as_secs_f64()
    }

    // ── Phases ───────────────────────────────────────────────────────────────

    /// Start a scrub session over `clips` (clip id → source reference).
    pub fn begin_scrub(&mut self, clips: HashMap<Uuid, String>) -> anyhow::Result<()> {
        self.teardown_workers();

        self.epoch += 1;
        self.shared.epoch.store(self.epoch, Ordering::Relaxed);
        self.surface.begin_epoch(self.epoch);
        self.predictor.reset();
        self.shared.admission.lock().reset();
        self.shared.cursors.lock().clear();
        self.shared.stats.lock().clear();

        let mut min_fd = f64::MAX;
        for (clip, source_ref) in clips {
            let decoder = EnhancedScrubDecoder::new(
                clip,
                source_ref,
                self.opener.clone(),
                self.backends.clone(),
                self.proxy.clone(),
                self.cfg.clone(),
                self.index_root.clone(),
            )
            .map_err(|e| anyhow::anyhow!("open clip {clip}: {e}"))?;
            let fd = decoder.frame_duration();
            let duration = decoder.duration();
            min_fd = min_fd.min(fd);
            self.cache.lock().register_clip(clip, fd);
            self.shared
                .cursors
                .lock()
                .insert(clip, ReverseCursor::new(&self.cfg));

            let (tx, rx) = bounded(ORDER_CHANNEL_CAP);
            let join = spawn_clip_worker(decoder, rx, self.shared.clone(), self.registry.clone());
            self.clips.insert(
                clip,
                ClipHandle {
                    tx,
                    join: Some(join),
                    fd,
                    duration,
                    coalescer: GopCoalescer::new(),
                    active_cancel: None,
                    last_dispatch: None,
                    last_stall: None,
                },
            );
        }
        if min_fd < f64::MAX {
            self.composition_fd = min_fd;
        }
        cutline_log!("[pipeline] begin_scrub: {} clips, epoch {}", self.clips.len(), self.epoch);
        Ok(())
    }

    /// One raw drag sample. Never blocks on decode.
    pub fn update_scrub(&mut self, t_now: f64, raw_velocity: f64, direction: Direction) {
        self.drain_done();
        let host = self.host_now();
        let pred = self
            .predictor
            .sample(host, t_now, raw_velocity, self.composition_fd);
        let now = Instant::now();

        let clip_ids: Vec<Uuid> = self.clips.keys().copied().collect();
        for clip in clip_ids {
            self.update_clip(clip, t_now, raw_velocity, direction, &pred, host, now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn update_clip(
        &mut self,
        clip: Uuid,
        t_now: f64,
        raw_velocity: f64,
        direction: Direction,
        pred: &cutline_core::media_types::Prediction,
        host: f64,
        now: Instant,
    ) {
        let Some(handle) = self.clips.get_mut(&clip) else { return };
        let fd = handle.fd;
        let duration = handle.duration;

        // Raw-input cursor observation (anti-jitter bookkeeping).
        {
            let mut cursors = self.shared.cursors.lock();
            if let Some(c) = cursors.get_mut(&clip) {
                c.observe(frame_index(t_now, fd), raw_velocity, host);
            }
        }

        let stats: ClipStats = self
            .shared
            .stats
            .lock()
            .get(&clip)
            .copied()
            .unwrap_or_default();

        let zone = landing::plan(pred, direction, fd, stats.recent_delta);
        let warm_behind = self
            .surface
            .warm_frame_count(clip, zone.behind.0, zone.behind.1) as u32;
        let warm_ahead = self
            .surface
            .warm_frame_count(clip, zone.ahead.0, zone.ahead.1) as u32;

        // Cold reset: the playhead landed somewhere with no warm coverage at
        // all — everything positional in the decoder is stale.
        if warm_behind == 0 && warm_ahead == 0 && stats.successes > 0 {
            if let Some(tok) = handle.active_cancel.take() {
                tok.cancel();
            }
            handle.coalescer.on_cancel();
            self.shared
                .admission
                .lock()
                .force_release_for_clip(clip, "cold-reset");
            let _ = handle.tx.try_send(WorkerMsg::TimelineReset { t_pred: zone.t_pred });
            let _ = self
                .shared
                .events
                .try_send(ScrubEvent::ColdReset { clip, t_pred: zone.t_pred });
        }

        // Stuck detection: all reverse slots burning, nothing warm behind.
        // Gated on a prior success so a cold pipeline that simply hasn't run
        // yet is not mistaken for a hang (the watchdog covers that case).
        let max_inflight = self.cfg.max_inflight_per_clip;
        let reverse_inflight = self.shared.admission.lock().reverse_inflight(clip);
        if reverse_inflight >= max_inflight && warm_behind == 0 && stats.successes > 0 {
            let cooled = handle
                .last_stall
                .map_or(true, |t| now.duration_since(t) >= Duration::from_millis(500));
            if cooled {
                handle.last_stall = Some(now);
                if let Some(tok) = handle.active_cancel.take() {
                    tok.cancel();
                }
                handle.coalescer.on_cancel();
                self.shared
                    .admission
                    .lock()
                    .force_release_for_clip(clip, "stuck-detection");
                let _ = handle.tx.try_send(WorkerMsg::FullReset { reason: "stuck-detection" });
                return;
            }
        }

        // Debounce, bypassed when coverage is critically short or repair mode
        // is active.
        let critical = warm_behind == 0 || zone.repair_mode;
        if !critical {
            if let Some(last) = handle.last_dispatch {
                if now.duration_since(last) < Duration::from_millis(self.cfg.debounce_ms) {
                    return;
                }
            }
        }

        // Build the candidate list: t_pred first, the live position next,
        // then the landing zone interleaved outward.
        let mut candidates = landing::priority_pts(&zone, direction, fd);
        if (t_now - zone.t_pred).abs() > fd / 2.0 {
            candidates.insert(1, (quantize_pts(t_now, fd), DecodeReason::Now));
        }

        // Cost-ordered selection under the dispatch budget.
        let budget = if stats.proxy_override {
            1
        } else if direction.is_reverse() {
            3
        } else {
            4
        };
        let mut scored: Vec<(f64, f64, DecodeReason)> = candidates
            .into_iter()
            .map(|(t, reason)| {
                let ahead_penalty = if t > zone.t_pred + 1e-9 { 2.0 } else { 0.0 };
                ((t - zone.t_pred).abs() / fd + ahead_penalty, t, reason)
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut dispatched = 0u32;
        for (_, t, reason) in scored {
            if dispatched >= budget {
                break;
            }
            let t = t.clamp(0.0, duration);
            // Reverse: never schedule frames the playhead is moving away from.
            if direction.is_reverse() && t > t_now + self.cfg.reverse_future_lead_cap {
                continue;
            }
            if self.surface.has_warm_frame(clip, t, fd / 2.0, 0.0, direction) {
                continue;
            }
            if self.dispatch_target(
                clip,
                t,
                reason,
                t_now,
                zone.t_pred,
                direction,
                FrameOrigin::Scrub,
                host,
                now,
                false,
            ) {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            if let Some(handle) = self.clips.get_mut(&clip) {
                handle.last_dispatch = Some(now);
            }
        }
    }

    /// Gate one target through admission + coalescing; queue it on success.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_target(
        &mut self,
        clip: Uuid,
        t: f64,
        reason: DecodeReason,
        t_now: f64,
        t_pred: f64,
        direction: Direction,
        origin: FrameOrigin,
        host: f64,
        now: Instant,
        is_stop: bool,
    ) -> bool {
        let Some(handle) = self.clips.get_mut(&clip) else { return false };
        let fd = handle.fd;

        // Reverse cursor quantization for the primary targets.
        let t = if direction.is_reverse()
            && matches!(reason, DecodeReason::Pred | DecodeReason::Now)
        {
            let mut cursors = self.shared.cursors.lock();
            match cursors.get_mut(&clip) {
                Some(c) => c.advance(frame_index(t, fd), host) as f64 * fd,
                None => t,
            }
        } else {
            t
        };

        let needs_immediate = matches!(
            reason,
            DecodeReason::Pred
                | DecodeReason::Now
                | DecodeReason::Repair
                | DecodeReason::RepairBehind
                | DecodeReason::RepairAhead
                | DecodeReason::Deadline
        );
        let warm_behind = self.surface.warm_frame_count(
            clip,
            t_pred - self.cfg.reverse_lz_frames as f64 * fd,
            t_pred,
        ) as u32;

        let admission = self.shared.admission.lock().check_admission(
            clip,
            direction,
            is_stop,
            needs_immediate,
            warm_behind,
            self.cfg.reverse_lz_frames,
            now,
        );
        if !admission.admitted {
            return false;
        }
        if admission.preempted {
            if let Some(tok) = handle.active_cancel.take() {
                tok.cancel();
            }
        }

        let gop = gop_key_ms(t, fd);
        let job_id = match handle.coalescer.decide(gop, t) {
            CoalesceDecision::Reuse { retarget: false } => {
                // Someone is already decoding this exact target — give the
                // slot back.
                self.shared.admission.lock().on_finished(clip, direction);
                return false;
            }
            CoalesceDecision::Reuse { retarget: true } => {
                // Stale targets poison the reverse path; always restart.
                if let Some(tok) = handle.active_cancel.take() {
                    tok.cancel();
                }
                handle.coalescer.on_start(gop, t)
            }
            CoalesceDecision::Cancel { .. } => {
                if let Some(tok) = handle.active_cancel.take() {
                    tok.cancel();
                }
                handle.coalescer.on_cancel();
                handle.coalescer.on_start(gop, t)
            }
            CoalesceDecision::Start => handle.coalescer.on_start(gop, t),
        };

        let stats_p95 = self
            .shared
            .stats
            .lock()
            .get(&clip)
            .map_or(0.0, |s| s.p95_ms);
        let watchdog = Duration::from_millis(
            ((3.0 * stats_p95) as u64).max(self.cfg.watchdog_floor_ms),
        );

        let cancel = CancelToken::new(self.epoch);
        let order = WorkOrder {
            target: DecodeTarget {
                pts: t,
                store_in_primary: reason.stores_primary(),
                reason,
                force: is_stop,
            },
            t_pred,
            t_timeline: t_now,
            direction,
            deadline_mode: is_stop,
            origin,
            epoch: self.epoch,
            job_id,
            cancel: cancel.clone(),
            timed_out: Arc::new(AtomicBool::new(false)),
            watchdog,
        };
        match handle.tx.try_send(WorkerMsg::Decode(Box::new(order))) {
            Ok(()) => {
                handle.active_cancel = Some(cancel);
                true
            }
            Err(_) => {
                // Channel full: the worker is saturated; back out the slot.
                self.shared
                    .admission
                    .lock()
                    .on_failure_or_timeout(clip, direction);
                handle.coalescer.on_cancel();
                false
            }
        }
    }

    /// The drag ended at `t_final`: make sure every clip has a frame, then
    /// run the exact deadline decode per clip and tear the session down.
    pub fn end_scrub(&mut self, t_final: f64) {
        self.drain_done();
        let host = self.host_now();
        let clip_ids: Vec<Uuid> = self.clips.keys().copied().collect();

        for clip in &clip_ids {
            let successes = self
                .shared
                .stats
                .lock()
                .get(clip)
                .map_or(0, |s| s.successes);
            if successes == 0 {
                // Mandatory decode: a clip that never produced a frame gets
                // direct attempts before the deadline pass.
                for _ in 0..=self.cfg.mandatory_decode_max_retries {
                    let now = Instant::now();
                    if self.dispatch_target(
                        *clip,
                        t_final,
                        DecodeReason::Now,
                        t_final,
                        t_final,
                        Direction::Forward,
                        FrameOrigin::Scrub,
                        host,
                        now,
                        false,
                    ) {
                        if self.wait_for_clip_done(*clip, MANDATORY_WAIT) {
                            break;
                        }
                    }
                }
            }
        }

        for clip in &clip_ids {
            let fd = self.clips.get(clip).map_or(self.composition_fd, |h| h.fd);
            let target = quantize_pts(t_final, fd);
            if let Some(handle) = self.clips.get_mut(clip) {
                let _ = handle.tx.try_send(WorkerMsg::FreezeRecenter {
                    ms: END_SCRUB_RECENTER_FREEZE_MS,
                });
            }
            let now = Instant::now();
            if self.dispatch_target(
                *clip,
                target,
                DecodeReason::Deadline,
                t_final,
                target,
                Direction::Reverse,
                FrameOrigin::Scrub,
                host,
                now,
                true,
            ) {
                self.wait_for_clip_done(*clip, DEADLINE_WAIT);
            }
            self.shared.admission.lock().end_deadline(*clip);
        }

        self.teardown_workers();
        cutline_log!("[pipeline] end_scrub at {t_final:.3}");
    }

    // ── Cache surface passthroughs ───────────────────────────────────────────

    pub fn pin_frame_range(&self, clip: Uuid, lo: f64, hi: f64) {
        self.cache.lock().pin_frame_range(clip, lo, hi);
    }

    pub fn clear_cache(&self, level: ClearLevel) {
        self.cache.lock().clear(level);
    }

    /// Fire-and-forget warm-up around the playhead (backward-biased).
    pub fn prefetch_around(&mut self, clip: Uuid, t: f64, back_frames: u32, fwd_frames: u32) {
        let targets = self
            .cache
            .lock()
            .prefetch_targets(clip, t, back_frames, fwd_frames);
        let host = self.host_now();
        let now = Instant::now();
        for pts in targets {
            self.dispatch_target(
                clip,
                pts,
                DecodeReason::Lz,
                t,
                t,
                if pts < t { Direction::Reverse } else { Direction::Forward },
                FrameOrigin::Prefetch,
                host,
                now,
                false,
            );
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn drain_done(&mut self) {
        while let Ok(done) = self.done_rx.try_recv() {
            self.apply_done(&done);
        }
    }

    fn apply_done(&mut self, done: &DecodeDone) {
        if let Some(handle) = self.clips.get_mut(&done.clip) {
            handle.coalescer.on_complete(done.job_id);
            if handle.coalescer.active().is_none() {
                handle.active_cancel = None;
            }
        }
    }

    /// Block until some order for `clip` completes (other clips' completions
    /// are applied along the way). Returns whether a success arrived.
    fn wait_for_clip_done(&mut self, clip: Uuid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.done_rx.recv_timeout(remaining) {
                Ok(done) => {
                    self.apply_done(&done);
                    if done.clip == clip {
                        return done.success;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    fn teardown_workers(&mut self) {
        for (_, handle) in self.clips.iter_mut() {
            if let Some(tok) = handle.active_cancel.take() {
                tok.cancel();
            }
            let _ = handle.tx.send(WorkerMsg::Shutdown);
        }
        for (_, mut handle) in self.clips.drain() {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for ScrubPipeline {
    fn drop(&mut self) {
        self.teardown_workers();
        self.watchdog_stop.store(true, Ordering::Relaxed);
        if let Some(j) = self.watchdog_join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_media::proxy::NullProxyService;
    use cutline_media::source::testutil::{ScriptedBackendProvider, ScriptedOpener};

    const FD: f64 = 1.0 / 24.0;

    fn pipeline(delay_ms: u64) -> ScrubPipeline {
        let cfg = ScrubConfig::default();
        ScrubPipeline::new(
            Arc::new(ScriptedOpener { duration_s: 10.0, fps: 24.0, gop_len: 12 }),
            Arc::new(ScriptedBackendProvider { delay_ms }),
            Arc::new(NullProxyService),
            cfg,
            None,
        )
        .unwrap()
    }

    fn one_clip(p: &mut ScrubPipeline) -> Uuid {
        let clip = Uuid::new_v4();
        let mut clips = HashMap::new();
        clips.insert(clip, "original.mov".to_string());
        p.begin_scrub(clips).unwrap();
        clip
    }

    fn drain_events(p: &ScrubPipeline) -> Vec<ScrubEvent> {
        let mut out = Vec::new();
        while let Ok(e) = p.events().try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn steady_reverse_scrub_builds_warm_coverage() {
        let mut p = pipeline(0);
        let clip = one_clip(&mut p);

        for k in 0..20 {
            let t = 2.0 - k as f64 * FD;
            p.update_scrub(t, -1.0, Direction::Reverse);
            std::thread::sleep(Duration::from_millis(8));
        }
        // let the workers drain
        std::thread::sleep(Duration::from_millis(250));
        p.update_scrub(2.0 - 19.0 * FD, -1.0, Direction::Reverse);
        std::thread::sleep(Duration::from_millis(250));

        let lo = 2.0 - 26.0 * FD;
        let warm = p.cache.lock().warm_frame_count(clip, lo, 2.0 + FD);
        assert!(warm >= 8, "only {warm} warm frames after a steady reverse scrub");

        let events = drain_events(&p);
        let completed = events
            .iter()
            .filter(|e| matches!(e, ScrubEvent::DecodeCompleted { .. }))
            .count();
        assert!(completed >= 10, "only {completed} completions");
    }

    #[test]
    fn deadline_decode_lands_one_primary_frame() {
        let mut p = pipeline(0);
        let clip = one_clip(&mut p);

        p.update_scrub(7.4, -1.0, Direction::Reverse);
        std::thread::sleep(Duration::from_millis(100));
        p.end_scrub(7.3);

        let idx = frame_index(quantize_pts(7.3, FD), FD);
        let info = p.cache.lock().entry_info(clip, idx);
        assert_eq!(info.map(|(primary, _)| primary), Some(true), "deadline frame is primary");

        let events = drain_events(&p);
        let deadline_pts = events.iter().find_map(|e| match e {
            ScrubEvent::DeadlineDecoded { pts, .. } => Some(*pts),
            _ => None,
        });
        let pts = deadline_pts.expect("deadline decode event");
        assert!((pts - quantize_pts(7.3, FD)).abs() <= FD / 2.0 + 1e-9);
    }

    #[test]
    fn far_jump_triggers_cold_reset() {
        let mut p = pipeline(0);
        let _clip = one_clip(&mut p);

        for k in 0..5 {
            p.update_scrub(2.0 - k as f64 * FD, -1.0, Direction::Reverse);
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(150));
        // jump far outside any warm coverage
        p.update_scrub(8.0, -1.0, Direction::Reverse);
        std::thread::sleep(Duration::from_millis(100));

        let events = drain_events(&p);
        assert!(
            events.iter().any(|e| matches!(e, ScrubEvent::ColdReset { .. })),
            "no cold reset after an 6-second jump"
        );
    }

    #[test]
    fn slow_decodes_fire_the_watchdog() {
        let mut p = pipeline(400); // decode takes ≥400ms vs the 180ms floor
        let _clip = one_clip(&mut p);

        p.update_scrub(2.0, -1.0, Direction::Reverse);
        std::thread::sleep(Duration::from_millis(500));

        let events = drain_events(&p);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ScrubEvent::WatchdogFired { cancelled: false, .. })),
            "watchdog should fire (log-only) for slow decodes"
        );
    }

    #[test]
    fn mandatory_decode_covers_untouched_clips() {
        let mut p = pipeline(0);
        let clip = one_clip(&mut p);
        // end the scrub without a single update
        p.end_scrub(3.0);
        let warm = p
            .cache
            .lock()
            .warm_frame_count(clip, 3.0 - FD, 3.0 + FD);
        assert!(warm >= 1, "mandatory decode must leave a frame near t_final");
    }

    #[test]
    fn every_clip_in_the_session_gets_coverage() {
        let mut p = pipeline(0);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut clips = HashMap::new();
        clips.insert(a, "a.mov".to_string());
        clips.insert(b, "b.mov".to_string());
        p.begin_scrub(clips).unwrap();

        for k in 0..8 {
            p.update_scrub(3.0 - k as f64 * FD, -1.0, Direction::Reverse);
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(250));

        let cache = p.cache();
        let cache = cache.lock();
        for clip in [a, b] {
            let warm = cache.warm_frame_count(clip, 3.0 - 12.0 * FD, 3.0 + FD);
            assert!(warm >= 2, "clip {clip} has only {warm} warm frames");
        }
    }

    #[test]
    fn prefetch_warms_frames_around_the_playhead() {
        let mut p = pipeline(0);
        let clip = one_clip(&mut p);
        p.prefetch_around(clip, 5.0, 3, 1);
        std::thread::sleep(Duration::from_millis(250));
        let warm = p.cache.lock().warm_frame_count(clip, 5.0 - 4.0 * FD, 5.0 + 2.0 * FD);
        assert!(warm >= 1, "prefetch produced no warm frames");
    }

    #[test]
    fn pin_and_clear_cache_passthroughs() {
        let mut p = pipeline(0);
        let clip = one_clip(&mut p);
        p.update_scrub(1.0, -1.0, Direction::Reverse);
        std::thread::sleep(Duration::from_millis(150));
        p.pin_frame_range(clip, 0.0, 2.0);
        p.clear_cache(ClearLevel::Ram);
        // pinned frames are still evictable by explicit clear (full wipe)
        let warm = p.cache.lock().warm_frame_count(clip, 0.0, 2.0);
        assert_eq!(warm, 0);
    }
}
