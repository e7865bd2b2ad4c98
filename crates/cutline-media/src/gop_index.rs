// crates/cutline-media/src/gop_index.rs
//
// Per-track ordered table of random-access points. One instance per track,
// shared behind a mutex (one index actor per process).
//
// Keys carry the index epoch; `reset_all_caches` bumps the epoch and re-mints
// every record key, so any RaKey held by a caller across a reset becomes
// silently unresolvable instead of aliasing a rebuilt entry.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cutline_core::cutline_log;
use cutline_core::helpers::time::secs_to_ms;
use cutline_core::media_types::{CompressedSample, RaKey, RapKind, RapRecord};

/// Failure entries live this long; a RAP that failed 5s ago is clean again.
const FAIL_TTL: Duration = Duration::from_secs(5);
/// Bound on tracked failing keys.
const FAIL_CAP: usize = 256;
/// Memoized lookup entries.
const LOOKUP_CACHE_CAP: usize = 64;
/// find_random_access scans this far around the request (seconds).
const SCAN_SPAN_S: f64 = 2.0;
/// An after-the-target anchor is only acceptable within this (seconds).
const AFTER_GATE_S: f64 = 0.5;

const PERSIST_VERSION: u32 = 1;

struct FailEntry {
    count:      u32,
    expires_at: Instant,
}

/// Classify one sample by its attachment dictionary.
///
/// Returns the RAP kind plus whether the classification fell back to the
/// structural sync bit because no attachments were present.
pub fn classify_sample(sample: &CompressedSample) -> (RapKind, bool) {
    match &sample.flags {
        Some(f) => {
            if f.depends_on_others == Some(true) || f.not_sync == Some(true) {
                (RapKind::None, false)
            } else if f.partial_sync == Some(true) {
                (RapKind::PartialSync, false)
            } else if f.random_access == Some(true) {
                (RapKind::Cra, false)
            } else if f.no_temporal_ref == Some(true) {
                (RapKind::Bla, false)
            } else if f.not_sync == Some(false) {
                (RapKind::Idr, false)
            } else {
                (RapKind::None, false)
            }
        }
        None if sample.is_sync => (RapKind::Idr, true),
        None => (RapKind::None, false),
    }
}

pub struct GopIndex {
    track:         Uuid,
    stream_id:     u32,
    epoch:         u64,
    /// Strictly increasing in `abs_ms` (up to quantization), unique by key.
    records:       Vec<RapRecord>,
    by_abs_ms:     HashMap<i64, usize>,
    failures:      LruCache<RaKey, FailEntry>,
    quarantined:   HashMap<RaKey, Instant>,
    prev_cache:    LruCache<i64, Option<usize>>,
    nearest_cache: LruCache<i64, Option<usize>>,
}

impl GopIndex {
    pub fn new(track: Uuid, stream_id: u32) -> Self {
        GopIndex {
            track,
            stream_id,
            epoch: 1,
            records: Vec::new(),
            by_abs_ms: HashMap::new(),
            failures: LruCache::new(NonZeroUsize::new(FAIL_CAP).unwrap()),
            quarantined: HashMap::new(),
            prev_cache: LruCache::new(NonZeroUsize::new(LOOKUP_CACHE_CAP).unwrap()),
            nearest_cache: LruCache::new(NonZeroUsize::new(LOOKUP_CACHE_CAP).unwrap()),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rebuild the table from a sample scan. Non-RAP samples are dropped;
    /// records are minted under the current epoch.
    pub fn rebuild(&mut self, samples: &[CompressedSample]) {
        self.records.clear();
        self.by_abs_ms.clear();
        self.prev_cache.clear();
        self.nearest_cache.clear();

        for s in samples {
            let (kind, metadata_less) = classify_sample(s);
            if !kind.is_usable() {
                continue;
            }
            let abs_ms = secs_to_ms(s.pts_s);
            if self.by_abs_ms.contains_key(&abs_ms) {
                continue; // unique by quantized time
            }
            let rec = RapRecord {
                key: RaKey {
                    track: self.track,
                    stream_id: self.stream_id,
                    epoch: self.epoch,
                    dts_ms: secs_to_ms(s.dts_s),
                },
                pts_s: s.pts_s,
                abs_ms,
                kind,
                flags: s.flags,
                requires_preroll: kind.requires_preroll(),
                is_fallback: false,
                metadata_less,
            };
            self.by_abs_ms.insert(abs_ms, self.records.len());
            self.records.push(rec);
        }
        self.records.sort_by_key(|r| r.abs_ms);
        self.by_abs_ms = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.abs_ms, i))
            .collect();
        cutline_log!(
            "[index] rebuilt: {} RAPs (epoch {})",
            self.records.len(),
            self.epoch
        );
    }

    /// Bump the epoch and re-mint every record key. All outstanding keys
    /// become unresolvable; failure and quarantine state is dropped.
    pub fn reset_all_caches(&mut self) {
        self.epoch += 1;
        for r in &mut self.records {
            r.key.epoch = self.epoch;
        }
        self.failures.clear();
        self.quarantined.clear();
        self.prev_cache.clear();
        self.nearest_cache.clear();
        cutline_log!("[index] reset — epoch now {}", self.epoch);
    }

    /// O(1) exact-time lookup via the secondary hash.
    pub fn record_at_ms(&self, abs_ms: i64) -> Option<RapRecord> {
        self.by_abs_ms.get(&abs_ms).map(|&i| self.records[i].clone())
    }

    /// Canonical absolute ms for a key, or None for stale/unknown keys.
    pub fn time_ms(&self, key: &RaKey) -> Option<i64> {
        if key.epoch != self.epoch {
            return None;
        }
        self.records
            .iter()
            .find(|r| r.key == *key)
            .map(|r| r.abs_ms)
    }

    // ── Failure & quarantine bookkeeping ─────────────────────────────────────

    pub fn note_fail(&mut self, key: RaKey, now: Instant) {
        if key.epoch != self.epoch {
            return;
        }
        match self.failures.get_mut(&key) {
            Some(e) => {
                e.count += 1;
                e.expires_at = now + FAIL_TTL;
            }
            None => {
                self.failures
                    .put(key, FailEntry { count: 1, expires_at: now + FAIL_TTL });
            }
        }
    }

    pub fn fail_count(&mut self, key: &RaKey, now: Instant) -> u32 {
        match self.failures.peek(key) {
            Some(e) if e.expires_at > now => e.count,
            Some(_) => {
                self.failures.pop(key);
                0
            }
            None => 0,
        }
    }

    pub fn quarantine(&mut self, key: RaKey, until: Instant) {
        if key.epoch == self.epoch {
            self.quarantined.insert(key, until);
        }
    }

    pub fn is_quarantined(&self, key: &RaKey, now: Instant) -> bool {
        self.quarantined.get(key).is_some_and(|&t| t > now)
    }

    pub fn reset_fail(&mut self, key: &RaKey) {
        self.failures.pop(key);
        self.quarantined.remove(key);
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Index of the last record with `abs_ms <= t_ms` (ignoring quarantine).
    fn at_or_before_idx(&self, t_ms: i64) -> Option<usize> {
        let n = self.records.partition_point(|r| r.abs_ms <= t_ms);
        n.checked_sub(1)
    }

    fn passes(&self, idx: usize, now: Instant) -> bool {
        !self.is_quarantined(&self.records[idx].key, now)
    }

    pub fn prev_sync_before(&mut self, t_ms: i64, now: Instant) -> Option<RapRecord> {
        if let Some(&cached) = self.prev_cache.get(&t_ms) {
            if let Some(idx) = cached {
                let rec = &self.records[idx];
                let failed = self
                    .failures
                    .peek(&rec.key)
                    .is_some_and(|e| e.expires_at > now && e.count > 0);
                if !failed && self.passes(idx, now) {
                    return Some(self.records[idx].clone());
                }
                self.prev_cache.pop(&t_ms);
            } else {
                return None;
            }
        }
        let mut idx = self.at_or_before_idx(t_ms - 1);
        while let Some(i) = idx {
            if self.passes(i, now) {
                self.prev_cache.put(t_ms, Some(i));
                return Some(self.records[i].clone());
            }
            idx = i.checked_sub(1);
        }
        self.prev_cache.put(t_ms, None);
        None
    }

    pub fn nearest_at_or_before(&mut self, t_ms: i64, now: Instant) -> Option<RapRecord> {
        if let Some(&cached) = self.nearest_cache.get(&t_ms) {
            if let Some(idx) = cached {
                let rec = &self.records[idx];
                let failed = self
                    .failures
                    .peek(&rec.key)
                    .is_some_and(|e| e.expires_at > now && e.count > 0);
                if !failed && self.passes(idx, now) {
                    return Some(self.records[idx].clone());
                }
                self.nearest_cache.pop(&t_ms);
            } else {
                return None;
            }
        }
        let mut idx = self.at_or_before_idx(t_ms);
        while let Some(i) = idx {
            if self.passes(i, now) {
                self.nearest_cache.put(t_ms, Some(i));
                return Some(self.records[i].clone());
            }
            idx = i.checked_sub(1);
        }
        self.nearest_cache.put(t_ms, None);
        None
    }

    pub fn next_sync_after(&self, t_ms: i64, now: Instant) -> Option<RapRecord> {
        let start = self.records.partition_point(|r| r.abs_ms <= t_ms);
        self.records[start..]
            .iter()
            .find(|r| !self.is_quarantined(&r.key, now))
            .cloned()
    }

    /// Whether `t_ms` lies within `slack_ms` of any RAP boundary.
    pub fn is_near_cut(&self, t_ms: i64, slack_ms: i64) -> bool {
        let n = self.records.partition_point(|r| r.abs_ms <= t_ms);
        if let Some(r) = n.checked_sub(1).map(|i| &self.records[i]) {
            if (t_ms - r.abs_ms).abs() <= slack_ms {
                return true;
            }
        }
        if let Some(r) = self.records.get(n) {
            if (r.abs_ms - t_ms).abs() <= slack_ms {
                return true;
            }
        }
        false
    }

    /// Full anchor search around `near_t` seconds.
    ///
    /// Preference order: best non-partial RAP at/before the target; else one
    /// after within 0.5s; else a partial before; else a partial after within
    /// 0.5s; else a synthetic fallback record at the target itself.
    pub fn find_random_access(&mut self, near_t: f64, now: Instant) -> RapRecord {
        let t_ms = secs_to_ms(near_t);
        let lo_ms = secs_to_ms(near_t - SCAN_SPAN_S);
        let hi_ms = secs_to_ms(near_t + SCAN_SPAN_S);
        let after_gate = secs_to_ms(near_t + AFTER_GATE_S);

        let mut best_before: Option<&RapRecord> = None;
        let mut best_after: Option<&RapRecord> = None;
        let mut best_before_partial: Option<&RapRecord> = None;
        let mut best_after_partial: Option<&RapRecord> = None;

        let start = self.records.partition_point(|r| r.abs_ms < lo_ms);
        for r in &self.records[start..] {
            if r.abs_ms > hi_ms {
                break;
            }
            if self.is_quarantined(&r.key, now) {
                continue;
            }
            let partial = matches!(r.kind, RapKind::PartialSync);
            if r.abs_ms <= t_ms {
                if partial {
                    best_before_partial = Some(r);
                } else {
                    best_before = Some(r);
                }
            } else if partial {
                if best_after_partial.is_none() {
                    best_after_partial = Some(r);
                }
            } else if best_after.is_none() {
                best_after = Some(r);
            }
        }

        let chosen = best_before
            .or_else(|| best_after.filter(|r| r.abs_ms <= after_gate))
            .or(best_before_partial)
            .or_else(|| best_after_partial.filter(|r| r.abs_ms <= after_gate));

        match chosen {
            Some(r) => r.clone(),
            None => {
                cutline_log!("[index] no RAP near {t_ms}ms — synthesizing fallback");
                RapRecord::fallback_at(self.track, self.stream_id, self.epoch, near_t)
            }
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn persist_path(cache_root: &Path, track: Uuid) -> PathBuf {
        cache_root
            .join("IFrameIndices")
            .join(format!("{track}.iframeindex"))
    }

    /// Write the table as versioned JSON under `<root>/IFrameIndices/`.
    pub fn save(&self, cache_root: &Path) -> std::io::Result<()> {
        let dir = cache_root.join("IFrameIndices");
        std::fs::create_dir_all(&dir)?;
        let persisted = PersistedIndex {
            version: PERSIST_VERSION,
            track: self.track,
            stream_id: self.stream_id,
            records: self.records.clone(),
        };
        let json = serde_json::to_vec(&persisted)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.persist(Self::persist_path(cache_root, self.track))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Load a previously saved table. Records are re-minted under the current
    /// epoch; version or identity mismatches discard the file silently.
    pub fn load(&mut self, cache_root: &Path) -> bool {
        let path = Self::persist_path(cache_root, self.track);
        let Ok(bytes) = std::fs::read(&path) else { return false };
        let Ok(p) = serde_json::from_slice::<PersistedIndex>(&bytes) else {
            return false;
        };
        if p.version != PERSIST_VERSION || p.track != self.track || p.stream_id != self.stream_id
        {
            return false;
        }
        self.records = p.records;
        for r in &mut self.records {
            r.key.epoch = self.epoch;
            r.key.track = self.track;
        }
        self.records.sort_by_key(|r| r.abs_ms);
        self.by_abs_ms = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.abs_ms, i))
            .collect();
        self.prev_cache.clear();
        self.nearest_cache.clear();
        true
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version:   u32,
    track:     Uuid,
    stream_id: u32,
    records:   Vec<RapRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testutil::ScriptedSource;
    use crate::source::MediaSource;
    use cutline_core::media_types::SampleFlags;

    const FD: f64 = 1.0 / 24.0;

    fn build_index(gop_len: u32) -> GopIndex {
        let mut src = ScriptedSource::new(10.0, 24.0, gop_len);
        let samples = src.samples_in(0.0, 10.0).unwrap();
        let info = src.track();
        let mut idx = GopIndex::new(info.track, info.stream_id);
        idx.rebuild(&samples);
        idx
    }

    #[test]
    fn records_are_strictly_increasing() {
        let idx = build_index(12);
        for w in idx.records.windows(2) {
            assert!(w[0].abs_ms < w[1].abs_ms);
        }
        // 10s at 24fps, one sync every 12 frames → 20 RAPs
        assert_eq!(idx.len(), 20);
    }

    #[test]
    fn classification_ladder() {
        let mut s = CompressedSample {
            stream_id: 1,
            pts_s: 0.0,
            dts_s: 0.0,
            duration_s: FD,
            is_sync: true,
            flags: None,
            format_sig: 1,
            data: vec![],
        };
        // no attachments, structurally sync → metadata-less IDR
        assert_eq!(classify_sample(&s), (RapKind::Idr, true));

        s.flags = Some(SampleFlags { not_sync: Some(true), ..SampleFlags::default() });
        assert_eq!(classify_sample(&s).0, RapKind::None);

        s.flags = Some(SampleFlags { partial_sync: Some(true), ..SampleFlags::default() });
        assert_eq!(classify_sample(&s).0, RapKind::PartialSync);

        s.flags = Some(SampleFlags { random_access: Some(true), ..SampleFlags::default() });
        assert_eq!(classify_sample(&s).0, RapKind::Cra);

        s.flags = Some(SampleFlags { no_temporal_ref: Some(true), ..SampleFlags::default() });
        assert_eq!(classify_sample(&s).0, RapKind::Bla);

        s.flags = Some(SampleFlags { not_sync: Some(false), ..SampleFlags::default() });
        assert_eq!(classify_sample(&s).0, RapKind::Idr);

        // depends_on_others wins over everything
        s.flags = Some(SampleFlags {
            depends_on_others: Some(true),
            random_access: Some(true),
            ..SampleFlags::default()
        });
        assert_eq!(classify_sample(&s).0, RapKind::None);
    }

    #[test]
    fn prev_nearest_next_queries() {
        let mut idx = build_index(12);
        let now = Instant::now();
        // RAPs at frame 0, 12, 24 … → 0ms, 500ms, 1000ms
        let prev = idx.prev_sync_before(600, now).unwrap();
        assert_eq!(prev.abs_ms, 500);
        let nearest = idx.nearest_at_or_before(500, now).unwrap();
        assert_eq!(nearest.abs_ms, 500);
        let prev_strict = idx.prev_sync_before(500, now).unwrap();
        assert_eq!(prev_strict.abs_ms, 0, "prev is strictly before");
        let next = idx.next_sync_after(500, now).unwrap();
        assert_eq!(next.abs_ms, 1000);
    }

    #[test]
    fn near_cut_detection_uses_slack() {
        let idx = build_index(12);
        assert!(idx.is_near_cut(520, 150));
        assert!(idx.is_near_cut(920, 150)); // 80ms before the 1000ms RAP
        assert!(!idx.is_near_cut(750, 150));
    }

    #[test]
    fn find_random_access_prefers_before() {
        let mut idx = build_index(12);
        let now = Instant::now();
        let r = idx.find_random_access(0.7, now);
        assert_eq!(r.abs_ms, 500);
        assert!(!r.is_fallback);
    }

    #[test]
    fn find_random_access_falls_back_to_synthetic() {
        let info_track = Uuid::new_v4();
        let mut idx = GopIndex::new(info_track, 1);
        let now = Instant::now();
        let r = idx.find_random_access(3.0, now);
        assert!(r.is_fallback);
        assert_eq!(r.kind, RapKind::None);
        assert_eq!(r.key.epoch, idx.current_epoch());
    }

    #[test]
    fn find_random_access_after_gate_is_half_a_second() {
        // RAPs only at 4.0s and beyond; ask just before one
        let mut src = ScriptedSource::new(10.0, 24.0, 12);
        let samples: Vec<_> = src
            .samples_in(4.0, 10.0)
            .unwrap()
            .into_iter()
            .collect();
        let info = src.track();
        let mut idx = GopIndex::new(info.track, info.stream_id);
        idx.rebuild(&samples);
        let now = Instant::now();

        // 3.7 has nothing before it; the 4.0 RAP is 0.3s ahead → acceptable
        let r = idx.find_random_access(3.7, now);
        assert!(!r.is_fallback);
        assert_eq!(r.abs_ms, 4000);

        // 3.2 is 0.8s before the first RAP → outside the after-gate
        let r = idx.find_random_access(3.2, now);
        assert!(r.is_fallback);
    }

    #[test]
    fn partial_sync_is_a_last_resort_before_synthetic() {
        let mut samples = Vec::new();
        // one partial-sync sample at 2.0s, nothing else
        samples.push(CompressedSample {
            stream_id: 1,
            pts_s: 2.0,
            dts_s: 2.0,
            duration_s: FD,
            is_sync: false,
            flags: Some(SampleFlags { partial_sync: Some(true), ..SampleFlags::default() }),
            format_sig: 1,
            data: vec![1],
        });
        let mut idx = GopIndex::new(Uuid::new_v4(), 1);
        idx.rebuild(&samples);
        let now = Instant::now();

        let r = idx.find_random_access(2.3, now);
        assert_eq!(r.kind, RapKind::PartialSync);
        assert!(!r.is_fallback);

        // a real RAP in range always wins over the partial
        samples.push(CompressedSample {
            stream_id: 1,
            pts_s: 2.1,
            dts_s: 2.1,
            duration_s: FD,
            is_sync: true,
            flags: Some(SampleFlags {
                not_sync: Some(false),
                ..SampleFlags::default()
            }),
            format_sig: 1,
            data: vec![2],
        });
        idx.rebuild(&samples);
        let r = idx.find_random_access(2.3, now);
        assert_eq!(r.kind, RapKind::Idr);
        assert_eq!(r.abs_ms, 2100);
    }

    #[test]
    fn quarantined_keys_are_never_returned() {
        let mut idx = build_index(12);
        let now = Instant::now();
        let r = idx.find_random_access(0.7, now);
        idx.quarantine(r.key, now + Duration::from_secs(1));
        let r2 = idx.find_random_access(0.7, now);
        assert_ne!(r2.key, r.key);
        assert_eq!(r2.abs_ms, 0, "falls back to the previous RAP");
        // quarantine expires
        let later = now + Duration::from_secs(2);
        let r3 = idx.find_random_access(0.7, later);
        assert_eq!(r3.abs_ms, 500);
    }

    #[test]
    fn failures_expire_after_ttl() {
        let mut idx = build_index(12);
        let now = Instant::now();
        let r = idx.find_random_access(0.7, now);
        idx.note_fail(r.key, now);
        idx.note_fail(r.key, now);
        assert_eq!(idx.fail_count(&r.key, now), 2);
        assert_eq!(idx.fail_count(&r.key, now + Duration::from_secs(6)), 0);
    }

    #[test]
    fn cached_lookup_is_invalidated_by_failures() {
        let mut idx = build_index(12);
        let now = Instant::now();
        let first = idx.prev_sync_before(600, now).unwrap();
        assert_eq!(first.abs_ms, 500);
        // failure alone invalidates the memo; the record is still returned by
        // a fresh walk (failures bias selection, they don't hide records)
        idx.note_fail(first.key, now);
        let again = idx.prev_sync_before(600, now).unwrap();
        assert_eq!(again.abs_ms, 500);
    }

    #[test]
    fn epoch_bump_invalidates_stale_keys() {
        let mut idx = build_index(12);
        let now = Instant::now();
        let r = idx.find_random_access(0.7, now);
        let stale = r.key;
        idx.reset_all_caches();
        assert_eq!(idx.time_ms(&stale), None);
        let fresh = idx.find_random_access(0.7, now);
        assert_eq!(fresh.key.epoch, idx.current_epoch());
        assert!(fresh.key.epoch > stale.epoch);
        assert_eq!(idx.time_ms(&fresh.key), Some(500));
    }

    #[test]
    fn persistence_round_trips_and_gates_version() {
        let dir = tempfile::tempdir().unwrap();
        let idx = build_index(12);
        idx.save(dir.path()).unwrap();

        let mut restored = GopIndex::new(idx.track, idx.stream_id);
        assert!(restored.load(dir.path()));
        assert_eq!(restored.len(), idx.len());
        // restored keys carry the restoring index's epoch
        let now = Instant::now();
        let r = restored.find_random_access(0.7, now);
        assert_eq!(r.key.epoch, restored.current_epoch());

        // wrong track → silently discarded
        let mut other = GopIndex::new(Uuid::new_v4(), idx.stream_id);
        assert!(!other.load(dir.path()));
    }
}
