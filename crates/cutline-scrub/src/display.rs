// crates/cutline-scrub/src/display.rs
//
// The display-surface contract: where decoded frames go and where warm-window
// queries come from. The compositor implements this in the host app; the
// default implementation routes everything into the in-process FrameCache.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use cutline_core::media_types::{Direction, FrameOrigin, PixelBuffer};
use cutline_media::FrameCache;

pub trait DisplaySurface: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn cache_frame(
        &self,
        buffer: PixelBuffer,
        clip: Uuid,
        presentation_time: f64,
        version: u64,
        origin: FrameOrigin,
        store_in_primary: bool,
        decode_cost_ms: f64,
    );

    fn has_warm_frame(
        &self,
        clip: Uuid,
        at: f64,
        tolerance: f64,
        max_past_lag: f64,
        bias: Direction,
    ) -> bool;

    fn warm_frame_count(&self, clip: Uuid, lo: f64, hi: f64) -> usize;

    fn prune_history(&self, clip: Uuid, keep_after: f64);

    /// New scrub session: writes versioned below `epoch` are stale.
    fn begin_epoch(&self, _epoch: u64) {}
}

/// Default surface: the workspace's own frame cache.
pub struct CacheSurface {
    cache: Arc<Mutex<FrameCache>>,
}

impl CacheSurface {
    pub fn new(cache: Arc<Mutex<FrameCache>>) -> Self {
        CacheSurface { cache }
    }
}

impl DisplaySurface for CacheSurface {
    fn cache_frame(
        &self,
        buffer: PixelBuffer,
        clip: Uuid,
        presentation_time: f64,
        version: u64,
        origin: FrameOrigin,
        store_in_primary: bool,
        decode_cost_ms: f64,
    ) {
        self.cache.lock().cache_frame(
            clip,
            presentation_time,
            buffer,
            version,
            origin,
            store_in_primary,
            decode_cost_ms,
        );
    }

    fn has_warm_frame(
        &self,
        clip: Uuid,
        at: f64,
        tolerance: f64,
        max_past_lag: f64,
        bias: Direction,
    ) -> bool {
        self.cache
            .lock()
            .has_warm_frame(clip, at, tolerance, max_past_lag, bias)
    }

    fn warm_frame_count(&self, clip: Uuid, lo: f64, hi: f64) -> usize {
        self.cache.lock().warm_frame_count(clip, lo, hi)
    }

    fn prune_history(&self, clip: Uuid, keep_after: f64) {
        self.cache.lock().prune_history(clip, keep_after);
    }

    fn begin_epoch(&self, epoch: u64) {
        let mut cache = self.cache.lock();
        while cache.current_epoch() < epoch {
            cache.bump_epoch();
        }
    }
}
