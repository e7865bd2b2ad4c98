// crates/cutline-scrub/src/worker.rs
//
// Per-clip decode workers. One thread per clip owns that clip's
// EnhancedScrubDecoder — the clip actor — and drains a bounded order channel.
// Admission slots are granted by the pipeline before an order is queued and
// released here exactly once per order, whatever the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use cutline_core::admission::AdmissionController;
use cutline_core::cancel::CancelToken;
use cutline_core::config::ScrubConfig;
use cutline_core::cursor::ReverseCursor;
use cutline_core::media_types::{DecodeTarget, Direction, FrameOrigin, ScrubEvent};
use cutline_media::EnhancedScrubDecoder;

use crate::display::DisplaySurface;

pub struct WorkOrder {
    pub target:        DecodeTarget,
    pub t_pred:        f64,
    pub t_timeline:    f64,
    pub direction:     Direction,
    pub deadline_mode: bool,
    pub origin:        FrameOrigin,
    pub epoch:         u64,
    pub job_id:        u64,
    pub cancel:        CancelToken,
    pub timed_out:     Arc<AtomicBool>,
    pub watchdog:      Duration,
}

pub enum WorkerMsg {
    Decode(Box<WorkOrder>),
    TimelineReset { t_pred: f64 },
    FullReset { reason: &'static str },
    FreezeRecenter { ms: u64 },
    Shutdown,
}

/// Lightweight completion record drained by the pipeline (coalescer state,
/// end_scrub waits). The heavyweight result already went to the display
/// surface from the worker thread.
#[derive(Debug, Clone, Copy)]
pub struct DecodeDone {
    pub clip:          Uuid,
    pub job_id:        u64,
    pub epoch:         u64,
    pub success:       bool,
    pub pts:           Option<f64>,
    pub target:        f64,
    pub deadline_mode: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ClipStats {
    pub successes:      u64,
    pub recent_delta:   f64,
    pub p95_ms:         f64,
    pub proxy_override: bool,
    pub reverse_streak: u32,
}

/// State shared between the pipeline thread, the clip workers and the
/// watchdog monitor.
pub struct Shared {
    pub cfg:       ScrubConfig,
    pub admission: Mutex<AdmissionController>,
    pub cursors:   Mutex<HashMap<Uuid, ReverseCursor>>,
    pub stats:     Mutex<HashMap<Uuid, ClipStats>>,
    pub surface:   Arc<dyn DisplaySurface>,
    pub events:    Sender<ScrubEvent>,
    pub done:      Sender<DecodeDone>,
    pub epoch:     AtomicU64,
}

pub struct InflightRec {
    pub clip:      Uuid,
    pub started:   Instant,
    pub deadline:  Duration,
    pub cancel:    CancelToken,
    pub timed_out: Arc<AtomicBool>,
    pub fired:     bool,
}

pub type WatchdogRegistry = Mutex<HashMap<(Uuid, u64), InflightRec>>;

/// Should this decoded frame be cached, and as primary?
///
/// `None` drops the frame entirely: a reverse "future" frame (ahead of the
/// timeline by more than the lead cap) is already useless — the playhead is
/// moving away from it. Forced targets (deadline, repair) still cache, but
/// never as primary when they are future frames.
pub fn store_decision(
    cfg: &ScrubConfig,
    direction: Direction,
    target: &DecodeTarget,
    pts: f64,
    t_timeline: f64,
    fd: f64,
) -> Option<bool> {
    if direction.is_reverse() && pts - t_timeline > cfg.reverse_future_lead_cap {
        if !target.force {
            return None;
        }
        return Some(false);
    }
    let delta = (target.pts - pts).abs();
    Some(target.store_in_primary && target.reason.stores_primary() && delta <= 0.75 * fd)
}

pub fn spawn_clip_worker(
    mut decoder: EnhancedScrubDecoder,
    rx: Receiver<WorkerMsg>,
    shared: Arc<Shared>,
    registry: Arc<WatchdogRegistry>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let clip = decoder.clip();
        for msg in rx.iter() {
            match msg {
                WorkerMsg::Shutdown => return,

                WorkerMsg::TimelineReset { t_pred } => {
                    decoder.reset_for_timeline_jump(t_pred, Instant::now());
                }

                WorkerMsg::FullReset { reason } => {
                    decoder.force_full_reset(reason, Instant::now());
                    let _ = shared.events.try_send(ScrubEvent::StallRecovered { clip });
                }

                WorkerMsg::FreezeRecenter { ms } => {
                    decoder.freeze_recentering(Duration::from_millis(ms), Instant::now());
                }

                WorkerMsg::Decode(order) => {
                    run_order(&mut decoder, *order, &shared, &registry);
                }
            }
        }
    })
}

fn run_order(
    decoder: &mut EnhancedScrubDecoder,
    order: WorkOrder,
    shared: &Arc<Shared>,
    registry: &Arc<WatchdogRegistry>,
) {
    let clip = decoder.clip();
    let epoch_now = shared.epoch.load(Ordering::Relaxed);

    // Stale or pre-cancelled orders release their slot and vanish.
    if order.epoch != epoch_now || order.cancel.is_cancelled() {
        shared
            .admission
            .lock()
            .on_failure_or_timeout(clip, order.direction);
        let _ = shared.done.send(DecodeDone {
            clip,
            job_id: order.job_id,
            epoch: order.epoch,
            success: false,
            pts: None,
            target: order.target.pts,
            deadline_mode: order.deadline_mode,
        });
        return;
    }

    registry.lock().insert(
        (clip, order.job_id),
        InflightRec {
            clip,
            started: Instant::now(),
            deadline: order.watchdog,
            cancel: order.cancel.clone(),
            timed_out: order.timed_out.clone(),
            fired: false,
        },
    );

    let result = decoder.decode_frame(
        order.target.pts,
        order.t_pred,
        order.direction,
        order.deadline_mode,
        Some(&order.cancel),
    );

    registry.lock().remove(&(clip, order.job_id));

    match result {
        Ok(out) => {
            let fd = decoder.frame_duration();
            let delta = order.target.pts - out.pts;

            match store_decision(
                &shared.cfg,
                order.direction,
                &order.target,
                out.pts,
                order.t_timeline,
                fd,
            ) {
                Some(primary) => {
                    shared.surface.cache_frame(
                        out.buffer,
                        clip,
                        out.pts,
                        order.epoch,
                        order.origin,
                        primary,
                        out.cost_ms,
                    );
                    // Forward scrub sheds frames the playhead has passed;
                    // in reverse the "history" is the warm-behind window we
                    // just paid to build, so it stays. Prefetch fill never
                    // prunes — it decodes behind the playhead on purpose.
                    if order.direction == Direction::Forward
                        && order.origin != FrameOrigin::Prefetch
                    {
                        let keep = order.target.pts - fd.max((4.0 * fd).min(0.020));
                        shared.surface.prune_history(clip, keep);
                    }
                    if order.direction.is_reverse() {
                        if let Some(c) = shared.cursors.lock().get_mut(&clip) {
                            c.commit();
                        }
                    }
                    if order.deadline_mode {
                        let _ = shared
                            .events
                            .try_send(ScrubEvent::DeadlineDecoded { clip, pts: out.pts });
                    }
                    if out.stages.contains(&cutline_core::media_types::DecodeStage::ProxySwitch) {
                        let _ = match decoder.active_proxy_zone() {
                            Some(zone) => shared
                                .events
                                .try_send(ScrubEvent::ProxyActivated { clip, zone }),
                            None => shared.events.try_send(ScrubEvent::ProxyReturned { clip }),
                        };
                    }
                    let _ = shared.events.try_send(ScrubEvent::DecodeCompleted {
                        clip,
                        target: order.target.pts,
                        pts: out.pts,
                        cost_ms: out.cost_ms,
                        reason: order.target.reason,
                        stages: out.stages,
                    });
                }
                None => {
                    // future frame in reverse — decoded but not delivered
                }
            }

            {
                let mut stats = shared.stats.lock();
                let st = stats.entry(clip).or_default();
                st.successes += 1;
                st.recent_delta = delta;
                st.p95_ms = decoder.p95_decode_ms();
                st.proxy_override = decoder.proxy_override_active(Instant::now());
                st.reverse_streak = decoder.reverse_error_streak();
            }
            shared.admission.lock().on_finished(clip, order.direction);
            let _ = shared.done.send(DecodeDone {
                clip,
                job_id: order.job_id,
                epoch: order.epoch,
                success: true,
                pts: Some(out.pts),
                target: order.target.pts,
                deadline_mode: order.deadline_mode,
            });
        }

        Err(e) => {
            if order.timed_out.load(Ordering::Relaxed) {
                decoder.note_watchdog_timeout();
            }
            // cancellations are silent; real failures get an event
            if e.advances_failure_streak() {
                let _ = shared.events.try_send(ScrubEvent::DecodeFailed {
                    clip,
                    target: order.target.pts,
                    kind: e.kind_tag(),
                });
            }
            {
                let mut stats = shared.stats.lock();
                let st = stats.entry(clip).or_default();
                st.reverse_streak = decoder.reverse_error_streak();
            }
            shared
                .admission
                .lock()
                .on_failure_or_timeout(clip, order.direction);
            let _ = shared.done.send(DecodeDone {
                clip,
                job_id: order.job_id,
                epoch: order.epoch,
                success: false,
                pts: None,
                target: order.target.pts,
                deadline_mode: order.deadline_mode,
            });
        }
    }
}

/// Watchdog monitor: scans the in-flight registry and fires on overdue
/// decodes. Log-only by default; strict mode cancels the order's token (the
/// worker sees Cancelled at its next suspension point and releases normally).
pub fn spawn_watchdog(
    registry: Arc<WatchdogRegistry>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
        let now = Instant::now();
        let strict = shared.cfg.strict_watchdog;
        let mut registry = registry.lock();
        for rec in registry.values_mut() {
            if rec.fired || now.duration_since(rec.started) < rec.deadline {
                continue;
            }
            rec.fired = true;
            let elapsed_ms = now.duration_since(rec.started).as_millis() as u64;
            let _ = shared.events.try_send(ScrubEvent::WatchdogFired {
                clip: rec.clip,
                elapsed_ms,
                cancelled: strict,
            });
            if strict {
                rec.timed_out.store(true, Ordering::Relaxed);
                rec.cancel.cancel();
            }
        }
    })
}
