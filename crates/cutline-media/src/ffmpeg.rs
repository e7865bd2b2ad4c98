// crates/cutline-media/src/ffmpeg.rs
//
// FFmpeg-backed MediaSource and DecodeBackend. This is the real-media path;
// everything above it stays container-agnostic behind the traits in source.rs
// and session.rs.
//
// The hardware decode session is the platform driver's concern and is not
// modeled here — every ladder rung of this build decodes through FFmpeg,
// which is also what the Hardware rung means on hosts where the driver picks
// software anyway.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use cutline_core::cutline_log;
use cutline_core::error::DecodeError;
use cutline_core::media_types::{CodecClass, CompressedSample, PixelBuffer};

use crate::scrub_decoder::BackendProvider;
use crate::session::{BackendFactory, DecodeBackend, DecodedFrame, LadderLevel};
use crate::source::{MediaSource, SourceOpener, TrackInfo};

fn codec_class(id: ffmpeg::codec::Id) -> CodecClass {
    match id {
        ffmpeg::codec::Id::H264 => CodecClass::Avc,
        ffmpeg::codec::Id::HEVC => CodecClass::Hevc,
        _ => CodecClass::IntraOnly,
    }
}

/// Stable per-file track identity: the scrub pipeline keys indices and cache
/// entries on it, so it must not change between opens of the same file.
fn track_uuid(path: &Path) -> Uuid {
    let mut h = DefaultHasher::new();
    path.hash(&mut h);
    let hi = h.finish();
    path.to_string_lossy().len().hash(&mut h);
    Uuid::from_u64_pair(hi, h.finish())
}

// ── Source ───────────────────────────────────────────────────────────────────

pub struct FfmpegSource {
    path:       PathBuf,
    ictx:       ffmpeg::format::context::Input,
    video_idx:  usize,
    tb_num:     i32,
    tb_den:     i32,
    info:       TrackInfo,
    format_sig: u64,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let ictx = input(path)
            .map_err(|e| DecodeError::ReaderConfig(format!("open {}: {e}", path.display())))?;
        let video_idx = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| DecodeError::ReaderConfig("no video stream".into()))?
            .index();

        let (tb_num, tb_den, duration_s, frame_duration, codec, format_sig) = {
            let stream = ictx.stream(video_idx).unwrap();
            let tb = stream.time_base();
            let dur = stream.duration() as f64 * tb.numerator() as f64
                / tb.denominator() as f64;
            let dur = if dur > 0.0 {
                dur
            } else {
                ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
            };
            let rate = stream.avg_frame_rate();
            let fd = if rate.numerator() > 0 {
                rate.denominator() as f64 / rate.numerator() as f64
            } else {
                1.0 / 30.0
            };
            let params = stream.parameters();
            let codec = codec_class(params.id());
            let (w, h) = unsafe {
                let p = params.as_ptr();
                ((*p).width as u32, (*p).height as u32)
            };
            let mut hasher = DefaultHasher::new();
            (params.id() as i32, w, h).hash(&mut hasher);
            (
                tb.numerator(),
                tb.denominator(),
                dur,
                fd,
                codec,
                hasher.finish(),
            )
        };

        Ok(FfmpegSource {
            info: TrackInfo {
                track: track_uuid(path),
                stream_id: video_idx as u32,
                codec,
                duration_s,
                frame_duration,
            },
            path: path.to_path_buf(),
            ictx,
            video_idx,
            tb_num,
            tb_den,
            format_sig,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pts_to_secs(&self, pts: i64) -> f64 {
        pts as f64 * self.tb_num as f64 / self.tb_den as f64
    }

    /// Position the demuxer so that the next packet read starts at a keyframe
    /// no later than `start_s`. The seek range is capped at the target, which
    /// makes libav pick the preceding keyframe; the window loaders above
    /// drop whatever pre-roll that produces.
    ///
    /// A failed seek is not fatal — reading simply continues from wherever
    /// the demuxer currently is. Some containers (and `avformat_seek_file`
    /// on some platforms, notably with a zero timestamp) refuse the call, so
    /// zero targets skip it entirely.
    fn position_before(&mut self, start_s: f64) {
        if start_s <= 0.0 {
            return;
        }
        let ts = (start_s * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        if let Err(e) = self.ictx.seek(ts, ..=ts) {
            cutline_log!(
                "[reader] {}: seek to {start_s:.3}s refused ({e}), reading from current position",
                self.path.display()
            );
        }
    }
}

impl MediaSource for FfmpegSource {
    fn track(&self) -> TrackInfo {
        self.info
    }

    fn samples_in(
        &mut self,
        start_s: f64,
        end_s: f64,
    ) -> Result<Vec<CompressedSample>, DecodeError> {
        self.position_before(start_s);

        let mut out = Vec::new();
        for (stream, packet) in self.ictx.packets().flatten() {
            if stream.index() != self.video_idx {
                continue;
            }
            let pts = packet.pts().or(packet.dts()).unwrap_or(0);
            let pts_s = self.pts_to_secs(pts);
            // Half a second of overshoot covers pts/dts reorder at the tail.
            if pts_s > end_s + 0.5 {
                break;
            }
            if pts_s < start_s - 0.5 {
                continue;
            }
            let dts_s = packet.dts().map_or(pts_s, |d| self.pts_to_secs(d));
            out.push(CompressedSample {
                stream_id: self.video_idx as u32,
                pts_s,
                dts_s,
                duration_s: self.pts_to_secs(packet.duration().max(0)),
                is_sync: packet.is_key(),
                // Container attachment dictionaries are not surfaced by this
                // demuxer path; classification falls back to the structural
                // sync bit (metadata-less IDR).
                flags: None,
                format_sig: self.format_sig,
                data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
            });
        }
        out.sort_by(|a, b| a.dts_s.partial_cmp(&b.dts_s).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }
}

// ── Decode backend ───────────────────────────────────────────────────────────

pub struct FfmpegDecodeBackend {
    decoder: ffmpeg::decoder::video::Video,
    scaler:  Option<SwsContext>,
    tb_num:  i32,
    tb_den:  i32,
}

impl FfmpegDecodeBackend {
    pub fn open(path: &Path, video_idx: usize) -> Result<Self, DecodeError> {
        // Separate input context for decoder construction (Parameters borrows
        // from the stream).
        let ictx = input(path)
            .map_err(|e| DecodeError::ReaderConfig(format!("backend open: {e}")))?;
        let stream = ictx
            .stream(video_idx)
            .ok_or_else(|| DecodeError::ReaderConfig("stream gone".into()))?;
        let tb = stream.time_base();
        let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|_| DecodeError::UnsupportedFormat)?;
        let decoder = dec_ctx
            .decoder()
            .video()
            .map_err(|_| DecodeError::UnsupportedFormat)?;
        Ok(FfmpegDecodeBackend {
            decoder,
            scaler: None,
            tb_num: tb.numerator(),
            tb_den: tb.denominator(),
        })
    }

    fn secs_to_pts(&self, t: f64) -> i64 {
        (t * self.tb_den as f64 / self.tb_num as f64) as i64
    }

    fn pts_to_secs(&self, pts: i64) -> f64 {
        pts as f64 * self.tb_num as f64 / self.tb_den as f64
    }

    fn frame_to_rgba(
        &mut self,
        decoded: &ffmpeg::util::frame::video::Video,
    ) -> Result<PixelBuffer, DecodeError> {
        let (w, h) = (self.decoder.width(), self.decoder.height());
        if self.scaler.is_none() {
            self.scaler = Some(
                SwsContext::get(
                    self.decoder.format(),
                    w,
                    h,
                    Pixel::RGBA,
                    w.max(2),
                    h.max(2),
                    Flags::BILINEAR,
                )
                .map_err(|_| DecodeError::UnsupportedFormat)?,
            );
        }
        let scaler = self.scaler.as_mut().unwrap();
        let mut out = ffmpeg::util::frame::video::Video::empty();
        scaler
            .run(decoded, &mut out)
            .map_err(|_| DecodeError::SessionInvalid)?;
        // Scaler rows are stride-padded; the PixelBuffer contract wants a
        // tight layout, so repack row by row at the visible width.
        let stride = out.stride(0);
        let raw = out.data(0);
        let row_bytes = w as usize * 4;
        let mut data = Vec::with_capacity(row_bytes * h as usize);
        for row in 0..h as usize {
            let at = row * stride;
            data.extend_from_slice(&raw[at..at + row_bytes]);
        }
        Ok(PixelBuffer::rgba(w, h, data))
    }
}

impl DecodeBackend for FfmpegDecodeBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn decode(
        &mut self,
        sample: &CompressedSample,
    ) -> Result<Option<DecodedFrame>, DecodeError> {
        if sample.data.is_empty() {
            return Err(DecodeError::bad_data());
        }
        let mut packet = ffmpeg::Packet::copy(&sample.data);
        packet.set_pts(Some(self.secs_to_pts(sample.pts_s)));
        packet.set_dts(Some(self.secs_to_pts(sample.dts_s)));

        if self.decoder.send_packet(&packet).is_err() {
            return Err(DecodeError::bad_data());
        }
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            let pts = decoded.pts().unwrap_or(0);
            let buffer = self.frame_to_rgba(&decoded)?;
            return Ok(Some(DecodedFrame { buffer, pts_s: self.pts_to_secs(pts) }));
        }
        // Decoder is buffering (reorder); no frame for this packet yet.
        Ok(None)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ── Openers & factories ──────────────────────────────────────────────────────

/// Opens sources straight from filesystem paths (proxy refs included — spot
/// proxies are just short intra-coded files).
pub struct FfmpegOpener;

impl SourceOpener for FfmpegOpener {
    fn open(&self, source_ref: &str) -> Result<Box<dyn MediaSource + Send>, DecodeError> {
        Ok(Box::new(FfmpegSource::open(Path::new(source_ref))?))
    }
}

pub struct FfmpegBackendProvider;

struct FfmpegBackendFactory {
    path:      PathBuf,
    video_idx: usize,
}

impl BackendFactory for FfmpegBackendFactory {
    fn create(&self, level: LadderLevel) -> Result<Box<dyn DecodeBackend>, DecodeError> {
        // All rungs run through FFmpeg in this build; the level only matters
        // for the session's escalation bookkeeping.
        let _ = level;
        Ok(Box::new(FfmpegDecodeBackend::open(&self.path, self.video_idx)?))
    }
}

impl BackendProvider for FfmpegBackendProvider {
    fn factory_for(&self, source_ref: &str) -> Result<Box<dyn BackendFactory>, DecodeError> {
        let path = PathBuf::from(source_ref);
        let probe = FfmpegSource::open(&path)?;
        Ok(Box::new(FfmpegBackendFactory {
            path,
            video_idx: probe.video_idx,
        }))
    }
}
