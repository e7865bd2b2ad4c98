// crates/cutline-media/src/disk_cache.rs
//
// Disk tier of the frame cache: one blob file per cached frame under
// `<cache_root>/FrameServerCache/`, LRU by modification time, atomically
// written (temp + rename) so a crash never leaves a torn blob.
//
// Blob layout (all integers little-endian):
//   magic 'CNMX' | version | width | height | pixelFormat | planeCount |
//   reserved                                                  (28 bytes)
//   planeCount × { bytesPerRow | height | dataLength }         (12 bytes each)
//   plane payloads, concatenated

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use cutline_core::cutline_log;
use cutline_core::media_types::{FrameCacheKey, FrameQuality, PixelBuffer, PixelFormat, Plane};

const MAGIC: &[u8; 4] = b"CNMX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 28;
const PLANE_DESC_LEN: usize = 12;

// ── Blob codec ───────────────────────────────────────────────────────────────

pub fn encode_blob(buffer: &PixelBuffer) -> Vec<u8> {
    let payload: usize = buffer.planes.iter().map(|p| p.data.len()).sum();
    let mut out =
        Vec::with_capacity(HEADER_LEN + buffer.planes.len() * PLANE_DESC_LEN + payload);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&buffer.width.to_le_bytes());
    out.extend_from_slice(&buffer.height.to_le_bytes());
    out.extend_from_slice(&buffer.format.code().to_le_bytes());
    out.extend_from_slice(&(buffer.planes.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    for p in &buffer.planes {
        out.extend_from_slice(&p.bytes_per_row.to_le_bytes());
        out.extend_from_slice(&p.height.to_le_bytes());
        out.extend_from_slice(&(p.data.len() as u32).to_le_bytes());
    }
    for p in &buffer.planes {
        out.extend_from_slice(&p.data);
    }
    out
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

pub fn parse_blob(bytes: &[u8]) -> Option<PixelBuffer> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return None;
    }
    if read_u32(bytes, 4)? != VERSION {
        return None;
    }
    let width = read_u32(bytes, 8)?;
    let height = read_u32(bytes, 12)?;
    let format = PixelFormat::from_code(read_u32(bytes, 16)?)?;
    let plane_count = read_u32(bytes, 20)? as usize;

    let mut planes = Vec::with_capacity(plane_count);
    let mut desc_at = HEADER_LEN;
    let mut payload_at = HEADER_LEN + plane_count * PLANE_DESC_LEN;
    for _ in 0..plane_count {
        let bytes_per_row = read_u32(bytes, desc_at)?;
        let plane_height = read_u32(bytes, desc_at + 4)?;
        let data_len = read_u32(bytes, desc_at + 8)? as usize;
        let data = bytes.get(payload_at..payload_at + data_len)?.to_vec();
        planes.push(Plane { bytes_per_row, height: plane_height, data });
        desc_at += PLANE_DESC_LEN;
        payload_at += data_len;
    }
    Some(PixelBuffer { width, height, format, planes })
}

/// Row-wise copy of a plane into a destination with its own stride. Each row
/// copies `min(dst_bytes_per_row, src_bytes_per_row)` bytes.
pub fn copy_plane_rows(src: &Plane, dst: &mut [u8], dst_bytes_per_row: usize) {
    let src_bpr = src.bytes_per_row as usize;
    let copy = src_bpr.min(dst_bytes_per_row);
    for row in 0..src.height as usize {
        let s = row * src_bpr;
        let d = row * dst_bytes_per_row;
        if s + copy > src.data.len() || d + copy > dst.len() {
            break;
        }
        dst[d..d + copy].copy_from_slice(&src.data[s..s + copy]);
    }
}

// ── Disk tier ────────────────────────────────────────────────────────────────

pub struct DiskCache {
    dir:       PathBuf,
    max_bytes: u64,
}

impl DiskCache {
    pub fn new(cache_root: &Path, max_bytes: u64) -> std::io::Result<Self> {
        let dir = cache_root.join("FrameServerCache");
        std::fs::create_dir_all(&dir)?;
        Ok(DiskCache { dir, max_bytes })
    }

    fn file_name(key: &FrameCacheKey) -> String {
        let q = match key.quality {
            FrameQuality::Original => "o",
            FrameQuality::Proxy => "p",
        };
        let tile = key
            .tile
            .map(|t| format!("-{}x{}x{}x{}", t.x, t.y, t.w, t.h))
            .unwrap_or_default();
        format!(
            "{}-{}-{:016x}-{q}{tile}.cache",
            key.clip, key.frame_index, key.view_hash
        )
    }

    fn path_for(&self, key: &FrameCacheKey) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    pub fn write(&self, key: &FrameCacheKey, buffer: &PixelBuffer) -> std::io::Result<()> {
        let blob = encode_blob(buffer);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&blob)?;
        tmp.persist(self.path_for(key)).map_err(|e| e.error)?;
        self.enforce_budget();
        Ok(())
    }

    /// Read and re-touch a blob so recently-read frames survive eviction.
    pub fn read(&self, key: &FrameCacheKey) -> Option<PixelBuffer> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        let parsed = parse_blob(&bytes);
        if parsed.is_none() {
            // torn or foreign file — drop it so it stops costing budget
            let _ = std::fs::remove_file(&path);
            return None;
        }
        if let Ok(f) = std::fs::File::options().write(true).open(&path) {
            let _ = f.set_modified(SystemTime::now());
        }
        parsed
    }

    pub fn remove(&self, key: &FrameCacheKey) {
        let _ = std::fs::remove_file(self.path_for(key));
    }

    pub fn clear(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for e in entries.flatten() {
                let _ = std::fs::remove_file(e.path());
            }
        }
    }

    /// Evict oldest-modified blobs until the tier fits its byte budget.
    fn enforce_budget(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return };
        let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let md = e.metadata().ok()?;
                if !md.is_file() {
                    return None;
                }
                Some((e.path(), md.len(), md.modified().ok()?))
            })
            .collect();
        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        if total <= self.max_bytes {
            return;
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, len, _) in files {
            if total <= self.max_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(len);
            }
        }
        cutline_log!("[cache] disk tier trimmed to {total} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn nv12_buffer() -> PixelBuffer {
        // luma plane with stride padding (20 > 16 visible bytes)
        let luma = Plane {
            bytes_per_row: 20,
            height: 8,
            data: (0..160u32).map(|i| (i % 251) as u8).collect(),
        };
        let chroma = Plane {
            bytes_per_row: 20,
            height: 4,
            data: (0..80u32).map(|i| (i * 3 % 251) as u8).collect(),
        };
        PixelBuffer { width: 16, height: 8, format: PixelFormat::Nv12, planes: vec![luma, chroma] }
    }

    #[test]
    fn blob_round_trip_preserves_everything() {
        let buf = nv12_buffer();
        let blob = encode_blob(&buf);
        assert_eq!(&blob[0..4], b"CNMX");
        let parsed = parse_blob(&blob).unwrap();
        assert_eq!(parsed.width, buf.width);
        assert_eq!(parsed.height, buf.height);
        assert_eq!(parsed.format, buf.format);
        assert_eq!(parsed.planes.len(), 2);
        for (a, b) in parsed.planes.iter().zip(buf.planes.iter()) {
            assert_eq!(a.bytes_per_row, b.bytes_per_row);
            assert_eq!(a.height, b.height);
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let buf = nv12_buffer();
        let mut blob = encode_blob(&buf);
        blob[0] = b'X';
        assert!(parse_blob(&blob).is_none());

        let mut blob = encode_blob(&buf);
        blob[4] = 9; // version
        assert!(parse_blob(&blob).is_none());

        assert!(parse_blob(&[]).is_none());
        let blob = encode_blob(&buf);
        assert!(parse_blob(&blob[..blob.len() - 4]).is_none(), "truncated payload");
    }

    #[test]
    fn row_copy_clamps_to_narrower_destination() {
        let src = Plane {
            bytes_per_row: 8,
            height: 3,
            data: (0..24u8).collect(),
        };
        // destination rows are 6 wide — each row keeps its first 6 bytes
        let mut dst = vec![0xFFu8; 18];
        copy_plane_rows(&src, &mut dst, 6);
        for row in 0..3usize {
            let want: Vec<u8> = (0..6).map(|i| (row * 8 + i) as u8).collect();
            assert_eq!(&dst[row * 6..row * 6 + 6], &want[..]);
        }
        // and a wider destination keeps src stride's worth, leaving the rest
        let mut wide = vec![0xEEu8; 30];
        copy_plane_rows(&src, &mut wide, 10);
        assert_eq!(&wide[0..8], &src.data[0..8]);
        assert_eq!(wide[8], 0xEE);
    }

    #[test]
    fn disk_round_trip_and_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1024).unwrap();
        let clip = Uuid::new_v4();

        let buf = nv12_buffer(); // 240 payload bytes + headers
        let k1 = FrameCacheKey::full_frame(clip, 1);
        cache.write(&k1, &buf).unwrap();
        let back = cache.read(&k1).unwrap();
        assert_eq!(back.planes[0].data, buf.planes[0].data);

        // three more writes push the tier over 1 KiB — oldest goes first
        let k2 = FrameCacheKey::full_frame(clip, 2);
        let k3 = FrameCacheKey::full_frame(clip, 3);
        let k4 = FrameCacheKey::full_frame(clip, 4);
        cache.write(&k2, &buf).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.write(&k3, &buf).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.write(&k4, &buf).unwrap();
        let survivors = [&k1, &k2, &k3, &k4]
            .iter()
            .filter(|k| cache.read(k).is_some())
            .count();
        assert!(survivors < 4, "budget must evict something");
        assert!(cache.read(&k4).is_some(), "newest write survives");
    }

    #[test]
    fn torn_blob_is_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), 1 << 20).unwrap();
        let key = FrameCacheKey::full_frame(Uuid::new_v4(), 7);
        let path = cache.path_for(&key);
        std::fs::write(&path, b"CNMXgarbage").unwrap();
        assert!(cache.read(&key).is_none());
        assert!(!path.exists());
    }
}
