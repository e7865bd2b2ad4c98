// crates/cutline-media/src/proxy.rs
//
// Spot-proxy substitution policy. Proxy *generation* lives in an external
// service; this module decides when a clip should decode from a proxy zone
// instead of the original, and when it is allowed back.
//
// The hysteresis matters: flapping between original and proxy sources resets
// the reader and decoder session each time, which costs more than staying on
// the proxy a little too long.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use cutline_core::config::ScrubConfig;
use cutline_core::cutline_log;

/// Minimum spacing between coverage requests for one clip.
const REQUEST_SPACING: Duration = Duration::from_millis(250);
/// Playback failures on the active zone before switching back to original.
const PLAYBACK_STRIKES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneStatus {
    Ready,
    Pending,
    Failed,
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyZone {
    pub zone_id: u64,
    pub url:     String,
    pub span_ms: (i64, i64),
    pub context: String,
    pub status:  ZoneStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyDecision {
    Original,
    Proxy(ProxyZone),
}

#[derive(Debug, Clone)]
pub struct CoverageReply {
    pub status:             ZoneStatus,
    pub zone_id:            Option<u64>,
    pub did_request_export: bool,
}

/// Outbound contract to the proxy service.
pub trait ProxyService: Send + Sync {
    fn ensure_coverage_if_needed(
        &self,
        clip: Uuid,
        source_ref: &str,
        around_abs_ms: i64,
        span_ms: i64,
        reason: &str,
        context: &str,
    ) -> CoverageReply;

    fn decision(&self, clip: Uuid, abs_ms: i64) -> ProxyDecision;

    fn mark_playback_failure(&self, clip: Uuid, zone_id: u64, reason: &str);

    fn note_deadline_failure(&self, clip: Uuid, target_ms: i64, source_ref: &str);

    /// Display surface reported a late frame near this time, if any.
    fn consume_late_frame_trigger(&self, clip: Uuid) -> Option<i64>;
}

/// Stand-in for hosts without a proxy pipeline: never has coverage, so every
/// decision is Original and the error ladder carries recovery alone.
pub struct NullProxyService;

impl ProxyService for NullProxyService {
    fn ensure_coverage_if_needed(
        &self,
        _clip: Uuid,
        _source_ref: &str,
        _around_abs_ms: i64,
        _span_ms: i64,
        _reason: &str,
        _context: &str,
    ) -> CoverageReply {
        CoverageReply { status: ZoneStatus::Missing, zone_id: None, did_request_export: false }
    }

    fn decision(&self, _clip: Uuid, _abs_ms: i64) -> ProxyDecision {
        ProxyDecision::Original
    }

    fn mark_playback_failure(&self, _clip: Uuid, _zone_id: u64, _reason: &str) {}

    fn note_deadline_failure(&self, _clip: Uuid, _target_ms: i64, _source_ref: &str) {}

    fn consume_late_frame_trigger(&self, _clip: Uuid) -> Option<i64> {
        None
    }
}

pub struct ProxyManager {
    service:         Arc<dyn ProxyService>,
    clip:            Uuid,
    source_ref:      String,
    hold:            Duration,
    override_span:   Duration,
    activated_at:    Option<Instant>,
    active_zone:     Option<ProxyZone>,
    override_until:  Option<Instant>,
    last_request_at: Option<Instant>,
    playback_strikes: u32,
}

impl ProxyManager {
    pub fn new(
        service: Arc<dyn ProxyService>,
        clip: Uuid,
        source_ref: String,
        cfg: &ScrubConfig,
    ) -> Self {
        ProxyManager {
            service,
            clip,
            source_ref,
            hold: Duration::from_secs_f64(cfg.proxy_hold_duration),
            override_span: Duration::from_secs_f64(cfg.reverse_proxy_override_lifespan),
            activated_at: None,
            active_zone: None,
            override_until: None,
            last_request_at: None,
            playback_strikes: 0,
        }
    }

    pub fn is_on_proxy(&self) -> bool {
        self.activated_at.is_some() && self.active_zone.is_some()
    }

    pub fn active_zone(&self) -> Option<&ProxyZone> {
        self.active_zone.as_ref()
    }

    /// Force proxy decisions for the configured override lifespan.
    pub fn set_override(&mut self, now: Instant) {
        self.override_until = Some(now + self.override_span);
    }

    pub fn override_active(&self, now: Instant) -> bool {
        self.override_until.is_some_and(|t| now < t)
    }

    /// Which source should decode `abs_ms` right now.
    pub fn decision(&mut self, abs_ms: i64, now: Instant) -> ProxyDecision {
        if self.override_active(now) && self.active_zone.is_none() {
            // Override wants a proxy that does not exist yet — re-request,
            // bounded by the request spacing.
            self.ensure_spot_proxy(abs_ms, 4000, "override", "reverse-override", now);
        }

        match self.service.decision(self.clip, abs_ms) {
            ProxyDecision::Proxy(zone) => {
                if self.activated_at.is_none() {
                    cutline_log!("[proxy] {}: activated zone {}", self.clip, zone.zone_id);
                    self.activated_at = Some(now);
                    self.playback_strikes = 0;
                }
                self.active_zone = Some(zone.clone());
                ProxyDecision::Proxy(zone)
            }
            ProxyDecision::Original => {
                // Hysteresis: once on proxy, stay there for the hold period
                // unless the zone itself failed.
                if let (Some(at), Some(zone)) = (self.activated_at, self.active_zone.clone()) {
                    let zone_failed = zone.status == ZoneStatus::Failed;
                    if now < at + self.hold && !zone_failed {
                        return ProxyDecision::Proxy(zone);
                    }
                    cutline_log!("[proxy] {}: back to original", self.clip);
                    self.activated_at = None;
                    self.active_zone = None;
                }
                ProxyDecision::Original
            }
        }
    }

    /// Ask the service for coverage around `around_ms`. Requests are spaced
    /// at least 250ms apart per clip; a Ready reply activates the zone.
    pub fn ensure_spot_proxy(
        &mut self,
        around_ms: i64,
        span_ms: i64,
        reason: &str,
        context: &str,
        now: Instant,
    ) -> ZoneStatus {
        if let Some(last) = self.last_request_at {
            if now.duration_since(last) < REQUEST_SPACING {
                return self
                    .active_zone
                    .as_ref()
                    .map_or(ZoneStatus::Missing, |z| z.status);
            }
        }
        self.last_request_at = Some(now);

        let reply = self.service.ensure_coverage_if_needed(
            self.clip,
            &self.source_ref,
            around_ms,
            span_ms,
            reason,
            context,
        );
        cutline_log!(
            "[proxy] {}: coverage {:?} around {around_ms}ms ({reason})",
            self.clip,
            reply.status
        );
        if reply.status == ZoneStatus::Ready {
            if let ProxyDecision::Proxy(zone) = self.service.decision(self.clip, around_ms) {
                if self.activated_at.is_none() {
                    self.activated_at = Some(now);
                }
                self.playback_strikes = 0;
                self.active_zone = Some(zone);
            }
        }
        reply.status
    }

    /// A decode from the active proxy zone failed. Two strikes switch the
    /// clip back to the original and quarantine the zone with the reason.
    /// Returns true when the switch-back happened.
    pub fn note_playback_failure(&mut self, reason: &str, _now: Instant) -> bool {
        let Some(zone) = self.active_zone.clone() else { return false };
        self.playback_strikes += 1;
        if self.playback_strikes >= PLAYBACK_STRIKES {
            cutline_log!(
                "[proxy] {}: zone {} struck out ({reason}) — back to original",
                self.clip,
                zone.zone_id
            );
            self.service.mark_playback_failure(self.clip, zone.zone_id, reason);
            self.activated_at = None;
            self.active_zone = None;
            self.playback_strikes = 0;
            self.override_until = None;
            return true;
        }
        false
    }

    pub fn note_deadline_failure(&self, target_ms: i64) {
        self.service
            .note_deadline_failure(self.clip, target_ms, &self.source_ref);
    }

    pub fn consume_late_frame_trigger(&self) -> Option<i64> {
        self.service.consume_late_frame_trigger(self.clip)
    }
}
