// crates/cutline-core/src/admission.rs
//
// Admission control: the gate every decode must pass before a worker slot is
// spent on it. Slots are granted here (check_admission increments inflight)
// and must be paired with a release on completion, failure, or cancellation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::ScrubConfig;
use crate::media_types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted:  bool,
    pub reason:    &'static str,
    /// A running slot was force-released to make room (clip-limit guard).
    pub preempted: bool,
}

impl Admission {
    fn granted(reason: &'static str) -> Self {
        Admission { admitted: true, reason, preempted: false }
    }

    fn denied(reason: &'static str) -> Self {
        Admission { admitted: false, reason, preempted: false }
    }
}

#[derive(Debug, Default)]
pub struct AdmissionState {
    pub forward_inflight:     u32,
    pub reverse_inflight:     u32,
    pub deadline_in_progress: bool,
    pub burst_credits:        u32,
    pub last_admit:           Option<Instant>,
}

impl AdmissionState {
    fn inflight(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Forward => self.forward_inflight,
            Direction::Reverse => self.reverse_inflight,
        }
    }

    fn bump(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => self.forward_inflight += 1,
            Direction::Reverse => self.reverse_inflight += 1,
        }
    }

    fn release(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => {
                self.forward_inflight = self.forward_inflight.saturating_sub(1)
            }
            Direction::Reverse => {
                self.reverse_inflight = self.reverse_inflight.saturating_sub(1)
            }
        }
    }
}

pub struct AdmissionController {
    max_inflight_per_clip: u32,
    never_cancel_running:  bool,
    rate_gate:             Duration,
    initial_burst:         u32,
    clips:                 HashMap<Uuid, AdmissionState>,
}

impl AdmissionController {
    pub fn new(cfg: &ScrubConfig) -> Self {
        AdmissionController {
            max_inflight_per_clip: cfg.max_inflight_per_clip,
            never_cancel_running: cfg.admission_never_cancel_running,
            rate_gate: Duration::from_millis(cfg.admission_rate_gate_ms),
            initial_burst: cfg.admission_burst_credits,
            clips: HashMap::new(),
        }
    }

    /// Drop all per-clip state and re-arm burst credits. Called at
    /// `begin_scrub`.
    pub fn reset(&mut self) {
        self.clips.clear();
    }

    fn state(&mut self, clip: Uuid) -> &mut AdmissionState {
        let initial_burst = self.initial_burst;
        self.clips.entry(clip).or_insert_with(|| AdmissionState {
            burst_credits: initial_burst,
            ..AdmissionState::default()
        })
    }

    /// Request a decode slot. On `admitted == true` the slot is already
    /// counted; pair with `on_finished` / `on_failure_or_timeout`.
    #[allow(clippy::too_many_arguments)]
    pub fn check_admission(
        &mut self,
        clip: Uuid,
        direction: Direction,
        is_stop: bool,
        needs_immediate: bool,
        warm_behind: u32,
        warm_required: u32,
        now: Instant,
    ) -> Admission {
        let never_cancel = self.never_cancel_running;
        let cap = self.max_inflight_per_clip;
        let rate_gate = self.rate_gate;
        let st = self.state(clip);

        // A deadline lock admits only the deadline decode itself.
        if st.deadline_in_progress && !is_stop {
            return Admission::denied("deadline_lock");
        }

        if is_stop {
            // Deadline submissions start isolated: ignore burst counters and
            // take the lock immediately.
            st.deadline_in_progress = true;
            st.bump(direction);
            st.last_admit = Some(now);
            return Admission::granted("deadline");
        }

        let mut preempted = false;
        if st.inflight(direction) >= cap {
            if never_cancel {
                return Admission::denied("clip_limit");
            }
            // Make room by dropping one running slot; the caller cancels the
            // matching task ("clip_limit_guard").
            st.release(direction);
            preempted = true;
        }

        // Rate gate — bypassed when the caller marked the target immediate or
        // the warm window behind the playhead is critically short.
        let critical = warm_behind < warm_required;
        if !needs_immediate && !critical {
            if st.burst_credits > 0 {
                st.burst_credits -= 1;
            } else if let Some(last) = st.last_admit {
                if now.duration_since(last) < rate_gate {
                    return Admission::denied("rate_gate");
                }
            }
        }

        st.bump(direction);
        st.last_admit = Some(now);
        Admission {
            admitted: true,
            reason: if preempted { "clip_limit_guard" } else { "ok" },
            preempted,
        }
    }

    pub fn on_finished(&mut self, clip: Uuid, direction: Direction) {
        self.state(clip).release(direction);
    }

    pub fn on_failure_or_timeout(&mut self, clip: Uuid, direction: Direction) {
        self.state(clip).release(direction);
    }

    /// Release every slot the clip holds. Used by stuck detection and source
    /// switches; returns how many slots were released.
    pub fn force_release_for_clip(&mut self, clip: Uuid, _reason: &str) -> u32 {
        let st = self.state(clip);
        let released = st.forward_inflight + st.reverse_inflight;
        st.forward_inflight = 0;
        st.reverse_inflight = 0;
        released
    }

    /// Lift a deadline lock after the deadline decode resolves.
    pub fn end_deadline(&mut self, clip: Uuid) {
        self.state(clip).deadline_in_progress = false;
    }

    pub fn reverse_inflight(&self, clip: Uuid) -> u32 {
        self.clips.get(&clip).map_or(0, |s| s.reverse_inflight)
    }

    pub fn forward_inflight(&self, clip: Uuid) -> u32 {
        self.clips.get(&clip).map_or(0, |s| s.forward_inflight)
    }

    pub fn is_deadline_locked(&self, clip: Uuid) -> bool {
        self.clips.get(&clip).is_some_and(|s| s.deadline_in_progress)
    }

    pub fn max_inflight(&self) -> u32 {
        self.max_inflight_per_clip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(never_cancel: bool) -> AdmissionController {
        let cfg = ScrubConfig {
            max_inflight_per_clip: 2,
            admission_never_cancel_running: never_cancel,
            admission_rate_gate_ms: 20,
            admission_burst_credits: 2,
            ..ScrubConfig::default()
        };
        AdmissionController::new(&cfg)
    }

    fn admit(ac: &mut AdmissionController, clip: Uuid, now: Instant) -> Admission {
        ac.check_admission(clip, Direction::Reverse, false, true, 0, 0, now)
    }

    #[test]
    fn inflight_never_exceeds_cap() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        for _ in 0..10 {
            let a = admit(&mut ac, clip, now);
            assert!(a.admitted);
            assert!(ac.reverse_inflight(clip) <= 2);
        }
    }

    #[test]
    fn cap_preempts_unless_never_cancel() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        admit(&mut ac, clip, now);
        admit(&mut ac, clip, now);
        let third = admit(&mut ac, clip, now);
        assert!(third.admitted);
        assert!(third.preempted);
        assert_eq!(third.reason, "clip_limit_guard");

        let mut ac = controller(true);
        admit(&mut ac, clip, now);
        admit(&mut ac, clip, now);
        let third = admit(&mut ac, clip, now);
        assert!(!third.admitted);
        assert_eq!(third.reason, "clip_limit");
    }

    #[test]
    fn rate_gate_applies_after_burst_credits() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        // warm window satisfied → rate gate active, but two burst credits
        let a1 = ac.check_admission(clip, Direction::Reverse, false, false, 8, 4, now);
        let a2 = ac.check_admission(clip, Direction::Reverse, false, false, 8, 4, now);
        assert!(a1.admitted && a2.admitted);
        ac.on_finished(clip, Direction::Reverse);
        ac.on_finished(clip, Direction::Reverse);
        // credits spent, same instant → rate gated
        let a3 = ac.check_admission(clip, Direction::Reverse, false, false, 8, 4, now);
        assert!(!a3.admitted);
        assert_eq!(a3.reason, "rate_gate");
        // after the gate interval it admits again
        let later = now + Duration::from_millis(25);
        let a4 = ac.check_admission(clip, Direction::Reverse, false, false, 8, 4, later);
        assert!(a4.admitted);
    }

    #[test]
    fn short_warm_window_bypasses_rate_gate() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        for _ in 0..2 {
            ac.check_admission(clip, Direction::Reverse, false, false, 8, 4, now);
            ac.on_finished(clip, Direction::Reverse);
        }
        // same instant, no credits left, but warm_behind < warm_required
        let a = ac.check_admission(clip, Direction::Reverse, false, false, 1, 4, now);
        assert!(a.admitted);
    }

    #[test]
    fn deadline_locks_out_other_decodes() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        let d = ac.check_admission(clip, Direction::Reverse, true, true, 0, 0, now);
        assert!(d.admitted);
        assert_eq!(d.reason, "deadline");
        let other = admit(&mut ac, clip, now);
        assert!(!other.admitted);
        assert_eq!(other.reason, "deadline_lock");
        ac.end_deadline(clip);
        assert!(admit(&mut ac, clip, now).admitted);
    }

    #[test]
    fn force_release_zeroes_both_directions() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        admit(&mut ac, clip, now);
        ac.check_admission(clip, Direction::Forward, false, true, 0, 0, now);
        let released = ac.force_release_for_clip(clip, "stuck-detection");
        assert_eq!(released, 2);
        assert_eq!(ac.reverse_inflight(clip), 0);
        assert_eq!(ac.forward_inflight(clip), 0);
    }

    #[test]
    fn directions_are_counted_separately() {
        let mut ac = controller(false);
        let clip = Uuid::new_v4();
        let now = Instant::now();
        admit(&mut ac, clip, now);
        admit(&mut ac, clip, now);
        // reverse is full; forward still has room without preemption
        let f = ac.check_admission(clip, Direction::Forward, false, true, 0, 0, now);
        assert!(f.admitted);
        assert!(!f.preempted);
    }
}
