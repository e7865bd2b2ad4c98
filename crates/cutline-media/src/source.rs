// crates/cutline-media/src/source.rs
//
// The seam between the scrub machinery and actual containers. A MediaSource
// hands out compressed samples for a time range; everything above it (index,
// reader, decoder session) is container-agnostic and therefore testable with
// synthetic sources.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use cutline_core::error::DecodeError;
use cutline_core::media_types::{CodecClass, CompressedSample};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackInfo {
    pub track:          Uuid,
    pub stream_id:      u32,
    pub codec:          CodecClass,
    pub duration_s:     f64,
    pub frame_duration: f64,
}

pub trait MediaSource: Send {
    fn track(&self) -> TrackInfo;

    /// All samples whose pts falls in `[start_s, end_s]`, ordered by dts.
    /// Ranges outside the asset return the clamped subset, not an error.
    fn samples_in(
        &mut self,
        start_s: f64,
        end_s: f64,
    ) -> Result<Vec<CompressedSample>, DecodeError>;
}

/// Shared handle to a source. Each clip's reader and index build both pull
/// from the same source; the mutex serializes them (sources are stateful —
/// they seek).
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<Mutex<Box<dyn MediaSource + Send>>>,
    info:  TrackInfo,
}

impl SourceHandle {
    pub fn new(source: Box<dyn MediaSource + Send>) -> Self {
        let info = source.track();
        SourceHandle { inner: Arc::new(Mutex::new(source)), info }
    }

    pub fn info(&self) -> TrackInfo {
        self.info
    }

    pub fn samples_in(
        &self,
        start_s: f64,
        end_s: f64,
    ) -> Result<Vec<CompressedSample>, DecodeError> {
        self.inner.lock().samples_in(start_s, end_s)
    }
}

/// Maps a source reference (container path or proxy URL) to an opened source.
/// The embedder supplies one; tests supply synthetic ones.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source_ref: &str) -> Result<Box<dyn MediaSource + Send>, DecodeError>;
}

// ── Synthetic source (test support) ──────────────────────────────────────────

/// Scripted in-memory source used across the workspace's tests: a regular
/// GOP structure with one sync sample every `gop_len` frames, and optional
/// bad-data frames injected by pts.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil {
    use super::*;
    use cutline_core::media_types::SampleFlags;
    use std::collections::HashSet;

    pub const BAD_SENTINEL: &[u8] = b"BAD!";

    pub struct ScriptedSource {
        pub info:     TrackInfo,
        pub gop_len:  u32,
        /// pts (frame indices) whose sample data is the bad sentinel.
        pub bad_frames: HashSet<i64>,
        /// frame index at which the format signature flips (cut simulation)
        pub format_flip_at: Option<i64>,
        pub intra_only: bool,
    }

    impl ScriptedSource {
        pub fn new(duration_s: f64, fps: f64, gop_len: u32) -> Self {
            ScriptedSource {
                info: TrackInfo {
                    track: Uuid::new_v4(),
                    stream_id: 1,
                    codec: CodecClass::Avc,
                    duration_s,
                    frame_duration: 1.0 / fps,
                },
                gop_len,
                bad_frames: HashSet::new(),
                format_flip_at: None,
                intra_only: false,
            }
        }

        pub fn intra(mut self) -> Self {
            self.intra_only = true;
            self.info.codec = CodecClass::IntraOnly;
            self
        }

        pub fn hevc(mut self) -> Self {
            self.info.codec = CodecClass::Hevc;
            self
        }

        fn sample_at(&self, idx: i64) -> CompressedSample {
            let fd = self.info.frame_duration;
            let is_sync = self.intra_only || idx % self.gop_len as i64 == 0;
            let flags = SampleFlags {
                not_sync: Some(!is_sync),
                depends_on_others: Some(!is_sync),
                random_access: if is_sync { Some(true) } else { None },
                ..SampleFlags::default()
            };
            let data = if self.bad_frames.contains(&idx) {
                BAD_SENTINEL.to_vec()
            } else {
                idx.to_le_bytes().to_vec()
            };
            let format_sig = match self.format_flip_at {
                Some(flip) if idx >= flip => 2,
                _ => 1,
            };
            CompressedSample {
                stream_id: self.info.stream_id,
                pts_s: idx as f64 * fd,
                dts_s: idx as f64 * fd,
                duration_s: fd,
                is_sync,
                flags: Some(flags),
                format_sig,
                data,
            }
        }
    }

    impl MediaSource for ScriptedSource {
        fn track(&self) -> TrackInfo {
            self.info
        }

        fn samples_in(
            &mut self,
            start_s: f64,
            end_s: f64,
        ) -> Result<Vec<CompressedSample>, DecodeError> {
            let fd = self.info.frame_duration;
            let last = (self.info.duration_s / fd).floor() as i64 - 1;
            let lo = ((start_s / fd).ceil() as i64).clamp(0, last.max(0));
            let hi = ((end_s / fd).floor() as i64).clamp(0, last.max(0));
            Ok((lo..=hi).map(|i| self.sample_at(i)).collect())
        }
    }

    /// Opener that serves one scripted original plus intra-only proxies for
    /// any ref starting with `proxy:`.
    pub struct ScriptedOpener {
        pub duration_s: f64,
        pub fps:        f64,
        pub gop_len:    u32,
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, source_ref: &str) -> Result<Box<dyn MediaSource + Send>, DecodeError> {
            let mut src = ScriptedSource::new(self.duration_s, self.fps, self.gop_len);
            if source_ref.starts_with("proxy:") {
                src = src.intra();
            }
            Ok(Box::new(src))
        }
    }

    // ── Scripted decode backend ──────────────────────────────────────────────

    use crate::scrub_decoder::BackendProvider;
    use crate::session::{BackendFactory, DecodeBackend, DecodedFrame, LadderLevel};
    use cutline_core::media_types::PixelBuffer;

    /// Backend that "decodes" scripted samples instantly (optionally with an
    /// artificial per-frame delay, for watchdog tests) and errors on the bad
    /// sentinel.
    pub struct ScriptedBackendProvider {
        pub delay_ms: u64,
    }

    struct ScriptedFactory {
        delay_ms: u64,
    }

    struct ScriptedBackend {
        delay_ms: u64,
    }

    impl DecodeBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn decode(
            &mut self,
            s: &CompressedSample,
        ) -> Result<Option<DecodedFrame>, DecodeError> {
            if self.delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
            }
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

    impl BackendFactory for ScriptedFactory {
        fn create(&self, _level: LadderLevel) -> Result<Box<dyn DecodeBackend>, DecodeError> {
            Ok(Box::new(ScriptedBackend { delay_ms: self.delay_ms }))
        }
    }

    impl BackendProvider for ScriptedBackendProvider {
        fn factory_for(&self, _source_ref: &str) -> Result<Box<dyn BackendFactory>, DecodeError> {
            Ok(Box::new(ScriptedFactory { delay_ms: self.delay_ms }))
        }
    }
}
