// crates/cutline-core/src/coalesce.rs
//
// GOP-level coalescing: redundant decode requests landing in the same GOP
// reuse the in-flight job instead of starting another pass over the same
// samples. A moved target within the GOP always restarts the job — a stale
// target makes the reverse path reject the frame as "future" on completion.

use crate::config::ScrubConfig;
use crate::helpers::time::secs_to_ms;

/// GOP bucket key for a presentation time, in canonical milliseconds.
pub fn gop_key_ms(pts: f64, frame_duration: f64) -> i64 {
    let span = ScrubConfig::gop_span(frame_duration);
    secs_to_ms((pts / span).floor() * span)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceDecision {
    /// No job in flight — start one.
    Start,
    /// Same GOP. `retarget == true` means the target moved and the job must
    /// be restarted at the new target.
    Reuse { retarget: bool },
    /// Different GOP — cancel the active job and start fresh.
    Cancel { reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct ActiveJob {
    pub gop_key_ms: i64,
    pub target_pts: f64,
    /// Generation counter distinguishing restarted jobs in the same GOP.
    pub job_id:     u64,
}

#[derive(Debug, Default)]
pub struct GopCoalescer {
    active:  Option<ActiveJob>,
    next_id: u64,
}

impl GopCoalescer {
    pub fn new() -> Self {
        GopCoalescer::default()
    }

    pub fn active(&self) -> Option<&ActiveJob> {
        self.active.as_ref()
    }

    pub fn decide(&self, new_gop_ms: i64, new_target: f64) -> CoalesceDecision {
        let Some(job) = &self.active else {
            return CoalesceDecision::Start;
        };
        if (new_gop_ms - job.gop_key_ms).abs() < 1 {
            if (new_target - job.target_pts).abs() <= 0.010 {
                CoalesceDecision::Reuse { retarget: false }
            } else {
                CoalesceDecision::Reuse { retarget: true }
            }
        } else {
            CoalesceDecision::Cancel { reason: "gop_changed" }
        }
    }

    /// Record a newly started (or restarted) job and return its id.
    pub fn on_start(&mut self, gop_key_ms: i64, target_pts: f64) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.active = Some(ActiveJob { gop_key_ms, target_pts, job_id: id });
        id
    }

    /// Clear the slot if `job_id` is still the active job. A completion
    /// racing a restart must not clear the newer job.
    pub fn on_complete(&mut self, job_id: u64) {
        if self.active.map_or(false, |j| j.job_id == job_id) {
            self.active = None;
        }
    }

    pub fn on_cancel(&mut self) -> Option<u64> {
        self.active.take().map(|j| j.job_id)
    }
}
