// crates/cutline-core/src/media_types.rs
//
// Types that flow across the channels between cutline-media, cutline-scrub
// and the embedding application. No ffmpeg, no I/O — just plain data.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::helpers::time::secs_to_ms;

// ── Scrub direction & frame provenance ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn is_reverse(self) -> bool {
        self == Direction::Reverse
    }

    /// Direction implied by a signed velocity (seconds of timeline per second).
    pub fn from_velocity(v: f64) -> Self {
        if v < 0.0 { Direction::Reverse } else { Direction::Forward }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    Scrub,
    Playback,
    Prefetch,
}

// ── Codec class ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecClass {
    Avc,
    Hevc,
    /// All-intra sources (ProRes, MJPEG, spot proxies): every sample is a RAP.
    IntraOnly,
}

impl CodecClass {
    /// Extra decoded frames the reader window must extend past the target to
    /// absorb bidirectional reordering. Zero for intra-only sources.
    pub fn reorder_lead_frames(self) -> u32 {
        match self {
            CodecClass::Avc => 6,
            CodecClass::Hevc => 8,
            CodecClass::IntraOnly => 0,
        }
    }
}

// ── Sample attachments & random-access classification ────────────────────────

/// Per-sample attachment flags as reported by the container.
///
/// Fields are tri-state: `Some(true)` / `Some(false)` mean the attachment was
/// present with that value, `None` means the attachment was absent. The
/// distinction matters — an explicit `not_sync = false` classifies as IDR,
/// while a missing dictionary falls back to structural sync detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFlags {
    pub not_sync:              Option<bool>,
    pub depends_on_others:     Option<bool>,
    pub random_access:         Option<bool>,
    pub partial_sync:          Option<bool>,
    pub no_temporal_ref:       Option<bool>,
    pub depended_on_by_others: Option<bool>,
}

impl SampleFlags {
    pub fn is(v: Option<bool>) -> bool {
        v == Some(true)
    }

    /// True when the sample cannot start decode (dependent or marked not-sync).
    pub fn is_dependent(&self) -> bool {
        Self::is(self.depends_on_others) || Self::is(self.not_sync)
    }
}

/// Random-access point classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RapKind {
    Idr,
    Cra,
    Bla,
    PartialSync,
    None,
}

impl RapKind {
    /// Non-IDR entry points need preroll before the target is clean.
    pub fn requires_preroll(self) -> bool {
        !matches!(self, RapKind::Idr)
    }

    pub fn is_usable(self) -> bool {
        !matches!(self, RapKind::None)
    }
}

// ── Random-access identity ───────────────────────────────────────────────────

/// Stable identity of a random-access point.
///
/// `epoch` is a per-track monotone counter bumped on every index reset; a key
/// minted under an old epoch is silently unresolvable afterwards, so stale
/// references can never collide with rebuilt index state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RaKey {
    pub track:     Uuid,
    pub stream_id: u32,
    pub epoch:     u64,
    /// Canonical decode timestamp in quantized milliseconds.
    pub dts_ms:    i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RapRecord {
    pub key:              RaKey,
    pub pts_s:            f64,
    /// Absolute (asset-local) presentation time, quantized milliseconds.
    pub abs_ms:           i64,
    pub kind:             RapKind,
    pub flags:            Option<SampleFlags>,
    pub requires_preroll: bool,
    /// Synthesized stand-in when no usable RAP was found near the target.
    pub is_fallback:      bool,
    /// Classified IDR purely from structural sync (no attachment dictionary).
    pub metadata_less:    bool,
}

impl RapRecord {
    /// Synthetic fallback record at `t` used when the index has no answer.
    pub fn fallback_at(track: Uuid, stream_id: u32, epoch: u64, t: f64) -> Self {
        let ms = secs_to_ms(t);
        RapRecord {
            key: RaKey { track, stream_id, epoch, dts_ms: ms },
            pts_s: t,
            abs_ms: ms,
            kind: RapKind::None,
            flags: None,
            requires_preroll: true,
            is_fallback: true,
            metadata_less: false,
        }
    }
}

// ── Compressed samples ───────────────────────────────────────────────────────

/// One compressed sample as produced by a `MediaSource`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSample {
    pub stream_id:  u32,
    pub pts_s:      f64,
    pub dts_s:      f64,
    pub duration_s: f64,
    /// Structural sync-sample bit (container-level, e.g. stss membership).
    pub is_sync:    bool,
    /// Attachment dictionary; `None` when the container carried none.
    pub flags:      Option<SampleFlags>,
    /// Hash of the format description; a change mid-stream forces a reader
    /// rebuild and a decoder session reset.
    pub format_sig: u64,
    pub data:       Vec<u8>,
}

// ── Decoded frames ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba,
    Nv12,
    Yuv420p,
}

impl PixelFormat {
    /// Stable on-disk code for the blob header.
    pub fn code(self) -> u32 {
        match self {
            PixelFormat::Rgba => 1,
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuv420p => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PixelFormat::Rgba),
            2 => Some(PixelFormat::Nv12),
            3 => Some(PixelFormat::Yuv420p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub bytes_per_row: u32,
    pub height:        u32,
    pub data:          Vec<u8>,
}

/// A decoded planar pixel buffer. Plane layout follows `format`:
/// one plane for RGBA, two for NV12, three for YUV420P.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    pub width:  u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
}

impl PixelBuffer {
    pub fn byte_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    /// Single-plane RGBA buffer, the common case for the software path.
    pub fn rgba(width: u32, height: u32, data: Vec<u8>) -> Self {
        PixelBuffer {
            width,
            height,
            format: PixelFormat::Rgba,
            planes: vec![Plane { bytes_per_row: width * 4, height, data }],
        }
    }
}

// ── Frame cache keys ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl TileRect {
    pub fn intersects(&self, other: &TileRect) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameQuality {
    Original,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    Rec709,
    Srgb,
}

/// Cache identity of a decoded frame. Time is carried as a frame index on the
/// composition grid so every key is exactly on a frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameCacheKey {
    pub clip:        Uuid,
    pub frame_index: i64,
    pub view_hash:   u64,
    pub tile:        Option<TileRect>,
    pub quality:     FrameQuality,
    pub color_space: ColorSpace,
}

impl FrameCacheKey {
    pub fn full_frame(clip: Uuid, frame_index: i64) -> Self {
        FrameCacheKey {
            clip,
            frame_index,
            view_hash: 0,
            tile: None,
            quality: FrameQuality::Original,
            color_space: ColorSpace::Rec709,
        }
    }

    pub fn pts(&self, frame_duration: f64) -> f64 {
        self.frame_index as f64 * frame_duration
    }
}

// ── Prediction & landing zones ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub t_now:  f64,
    pub t_pred: f64,
    /// Instantaneous velocity in frames per second of wall time.
    pub inst_velocity_fps:     f64,
    pub smoothed_velocity_fps: f64,
    /// Smoothed velocity in timeline-seconds per second (signed).
    pub smoothed_velocity:     f64,
    pub window_frames:         u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandingZone {
    pub t_pred:        f64,
    /// `[low, t_pred]`
    pub behind:        (f64, f64),
    /// `[t_pred, high]`
    pub ahead:         (f64, f64),
    pub window_frames: u32,
    pub repair_mode:   bool,
}

// ── Decode targets ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeReason {
    Pred,
    Now,
    Lz,
    LzAhead,
    FallbackPrev,
    FallbackNext,
    RepairBehind,
    RepairAhead,
    Repair,
    Deadline,
}

impl DecodeReason {
    /// Reasons whose results are eligible for the primary display store.
    pub fn stores_primary(self) -> bool {
        matches!(
            self,
            DecodeReason::Pred
                | DecodeReason::Now
                | DecodeReason::Repair
                | DecodeReason::RepairBehind
                | DecodeReason::Deadline
        )
    }

    pub fn tag(self) -> &'static str {
        match self {
            DecodeReason::Pred => "pred",
            DecodeReason::Now => "now",
            DecodeReason::Lz => "lz",
            DecodeReason::LzAhead => "lz_ahead",
            DecodeReason::FallbackPrev => "fallback_prev",
            DecodeReason::FallbackNext => "fallback_next",
            DecodeReason::RepairBehind => "repair_behind",
            DecodeReason::RepairAhead => "repair_ahead",
            DecodeReason::Repair => "repair",
            DecodeReason::Deadline => "deadline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeTarget {
    pub pts:              f64,
    pub store_in_primary: bool,
    pub reason:           DecodeReason,
    /// Bypasses the reverse future-lead drop (deadline and repair targets).
    pub force:            bool,
}

// ── Decode stages (telemetry) ────────────────────────────────────────────────

/// Path markers accumulated while resolving one decode, reported with the
/// completed frame so the embedder can surface what the pipeline did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    RapLookup,
    RapCacheHit,
    FastPath,
    ReaderCopy,
    CutEdge,
    FallbackAdopt,
    ProxySwitch,
    SoftwareFallback,
    ImageGenerator,
    DeadlineSkip,
}

// ── Telemetry events ─────────────────────────────────────────────────────────

/// Events sent from the decode workers and pipeline to the embedder.
/// Drained from the pipeline's event channel once per UI tick.
#[derive(Debug, Clone)]
pub enum ScrubEvent {
    DecodeCompleted {
        clip:    Uuid,
        target:  f64,
        pts:     f64,
        cost_ms: f64,
        reason:  DecodeReason,
        stages:  Vec<DecodeStage>,
    },
    DecodeFailed {
        clip:   Uuid,
        target: f64,
        kind:   &'static str,
    },
    ProxyActivated { clip: Uuid, zone: u64 },
    ProxyReturned { clip: Uuid },
    WatchdogFired { clip: Uuid, elapsed_ms: u64, cancelled: bool },
    StallRecovered { clip: Uuid },
    ColdReset { clip: Uuid, t_pred: f64 },
    DeadlineDecoded { clip: Uuid, pts: f64 },
}
