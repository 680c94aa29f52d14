//! Immutable segment files.
//!
//! Each frozen artifact is a pair of files:
//!
//! - `*.seg` — length-prefixed records, optionally snappy-compressed
//!   per record, followed by a 12-byte footer:
//!   `[u64 BE record count][u32 BE crc32 of all record payloads]`
//! - `*.idx` — the sidecar key index: `[u64 BE entry count]`, then per entry
//!   `[u32 BE key len][key][u64 BE record offset]`, followed by a
//!   `[u32 BE crc32]` footer over the entry bytes.
//!
//! Keys are strictly ascending, so the index is loaded into memory at open
//! and binary-searched per lookup; the data file is only touched to fetch
//! record payloads.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::StoreError;

/// Upper bound on a single record payload; guards against unreasonable
/// allocations from corrupted length prefixes.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const DATA_FOOTER_LEN: u64 = 12;

/// File name stem shared by the `.seg`/`.idx` pair of one component,
/// e.g. `accounts.0-1.vals`.
pub fn segment_base(stream: &str, from_step: u64, to_step: u64, component: &str) -> String {
    format!("{stream}.{from_step}-{to_step}.{component}")
}

/// Parses a `.seg` file name back into `(stream, from_step, to_step,
/// component)`. Returns `None` for files that are not segment data files.
pub fn parse_segment_name(name: &str) -> Option<(&str, u64, u64, &str)> {
    let rest = name.strip_suffix(".seg")?;
    let mut parts = rest.split('.');
    let stream = parts.next()?;
    let range = parts.next()?;
    let component = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let (from, to) = range.split_once('-')?;
    Some((stream, from.parse().ok()?, to.parse().ok()?, component))
}

/// Writes one segment pair. Keys must be added in strictly ascending order.
///
/// The writer owns the partially written files: dropping it before
/// [`SegmentWriter::finish`] removes them from disk, so an aborted build
/// leaves no artifacts behind.
pub struct SegmentWriter {
    data: BufWriter<File>,
    data_path: PathBuf,
    idx_path: PathBuf,
    compress: bool,
    index: Vec<(Vec<u8>, u64)>,
    offset: u64,
    hasher: crc32fast::Hasher,
    finished: bool,
}

impl SegmentWriter {
    pub fn create(dir: &Path, base: &str, compress: bool) -> Result<Self, StoreError> {
        let data_path = dir.join(format!("{base}.seg"));
        let idx_path = dir.join(format!("{base}.idx"));
        let data = BufWriter::new(File::create(&data_path)?);
        Ok(Self {
            data,
            data_path,
            idx_path,
            compress,
            index: Vec::new(),
            offset: 0,
            hasher: crc32fast::Hasher::new(),
            finished: false,
        })
    }

    /// Appends one record. `key` must be strictly greater than the previous
    /// key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if let Some((last, _)) = self.index.last() {
            if key <= last.as_slice() {
                return Err(StoreError::Custom(format!(
                    "segment {}: keys must be strictly ascending",
                    self.data_path.display()
                )));
            }
        }
        let payload = if self.compress {
            snap::raw::Encoder::new().compress_vec(value)?
        } else {
            value.to_vec()
        };
        if payload.len() > MAX_RECORD_SIZE {
            return Err(StoreError::Custom(format!(
                "segment {}: record of {} bytes exceeds the {} byte limit",
                self.data_path.display(),
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        self.data.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.data.write_all(&payload)?;
        self.hasher.update(&payload);
        self.index.push((key.to_vec(), self.offset));
        self.offset += 4 + payload.len() as u64;
        Ok(())
    }

    /// Writes both footers and the index file. After this the files are
    /// immutable and survive the writer.
    pub fn finish(mut self) -> Result<(), StoreError> {
        self.data
            .write_all(&(self.index.len() as u64).to_be_bytes())?;
        let crc = std::mem::take(&mut self.hasher).finalize();
        self.data.write_all(&crc.to_be_bytes())?;
        self.data.flush()?;

        let mut body = Vec::with_capacity(self.index.len() * 16);
        for (key, offset) in &self.index {
            body.extend_from_slice(&(key.len() as u32).to_be_bytes());
            body.extend_from_slice(key);
            body.extend_from_slice(&offset.to_be_bytes());
        }
        let mut idx = BufWriter::new(File::create(&self.idx_path)?);
        idx.write_all(&(self.index.len() as u64).to_be_bytes())?;
        idx.write_all(&body)?;
        idx.write_all(&crc32fast::hash(&body).to_be_bytes())?;
        idx.flush()?;

        self.finished = true;
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.data_path);
            let _ = std::fs::remove_file(&self.idx_path);
        }
    }
}

/// Read handle over one finished segment pair.
///
/// The data file stays open for the lifetime of the reader, so unlinking the
/// files (after a merge) does not invalidate readers that still hold one.
#[derive(Debug)]
pub struct SegmentReader {
    data: Mutex<File>,
    data_path: PathBuf,
    idx_path: PathBuf,
    compress: bool,
    index: Vec<(Vec<u8>, u64)>,
}

impl SegmentReader {
    pub fn open(dir: &Path, base: &str, compress: bool) -> Result<Self, StoreError> {
        let data_path = dir.join(format!("{base}.seg"));
        let idx_path = dir.join(format!("{base}.idx"));

        let index = read_index(&idx_path)?;

        let mut data = File::open(&data_path)?;
        let data_len = data.metadata()?.len();
        if data_len < DATA_FOOTER_LEN {
            return Err(StoreError::CorruptSegment {
                path: data_path,
                reason: format!("file of {data_len} bytes is smaller than the footer"),
            });
        }
        data.seek(SeekFrom::End(-(DATA_FOOTER_LEN as i64)))?;
        let mut footer = [0u8; 12];
        data.read_exact(&mut footer)?;
        let count = u64::from_be_bytes(footer[..8].try_into().unwrap_or_default());
        if count != index.len() as u64 {
            return Err(StoreError::CorruptSegment {
                path: data_path,
                reason: format!(
                    "record count {count} does not match index entry count {}",
                    index.len()
                ),
            });
        }

        Ok(Self {
            data: Mutex::new(data),
            data_path,
            idx_path,
            compress,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn key_at(&self, pos: usize) -> &[u8] {
        &self.index[pos].0
    }

    pub fn value_at(&self, pos: usize) -> Result<Vec<u8>, StoreError> {
        self.read_record(self.index[pos].1)
    }

    /// Exact-match lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.index.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(pos) => Ok(Some(self.value_at(pos)?)),
            Err(_) => Ok(None),
        }
    }

    /// Position of the first key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.index.partition_point(|(k, _)| k.as_slice() < key)
    }

    /// Position of the last key `<= upper` that still starts with `prefix`.
    /// This is the predecessor search behind as-of reads over
    /// `key ++ txNum`-shaped entries.
    pub fn last_at_or_before(&self, upper: &[u8], prefix: &[u8]) -> Option<usize> {
        let p = self.index.partition_point(|(k, _)| k.as_slice() <= upper);
        let pos = p.checked_sub(1)?;
        self.index[pos].0.starts_with(prefix).then_some(pos)
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(&[u8], Vec<u8>), StoreError>> + '_ {
        (0..self.index.len()).map(move |pos| {
            let value = self.value_at(pos)?;
            Ok((self.key_at(pos), value))
        })
    }

    /// Recomputes the data checksum and compares it against the footer.
    pub fn verify_checksum(&self) -> Result<(), StoreError> {
        let mut hasher = crc32fast::Hasher::new();
        {
            let mut data = self
                .data
                .lock()
                .map_err(|_| StoreError::Custom("poisoned segment file lock".to_string()))?;
            for (_, offset) in &self.index {
                data.seek(SeekFrom::Start(*offset))?;
                let mut len_buf = [0u8; 4];
                data.read_exact(&mut len_buf)?;
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                data.read_exact(&mut payload)?;
                hasher.update(&payload);
            }
            data.seek(SeekFrom::End(-4))?;
            let mut crc_buf = [0u8; 4];
            data.read_exact(&mut crc_buf)?;
            if u32::from_be_bytes(crc_buf) != hasher.finalize() {
                return Err(StoreError::CorruptSegment {
                    path: self.data_path.clone(),
                    reason: "data checksum mismatch".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Unlinks both files. Existing readers keep working off the open handle.
    pub fn delete_from_disk(&self) -> Result<(), StoreError> {
        std::fs::remove_file(&self.data_path)?;
        std::fs::remove_file(&self.idx_path)?;
        Ok(())
    }

    fn read_record(&self, offset: u64) -> Result<Vec<u8>, StoreError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| StoreError::Custom("poisoned segment file lock".to_string()))?;
        data.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        data.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(StoreError::CorruptSegment {
                path: self.data_path.clone(),
                reason: format!("record claims unreasonable size {len} bytes"),
            });
        }
        let mut payload = vec![0u8; len];
        data.read_exact(&mut payload)?;
        drop(data);
        if self.compress {
            Ok(snap::raw::Decoder::new().decompress_vec(&payload)?)
        } else {
            Ok(payload)
        }
    }
}

fn read_index(idx_path: &Path) -> Result<Vec<(Vec<u8>, u64)>, StoreError> {
    let raw = std::fs::read(idx_path)?;
    if raw.len() < 12 {
        return Err(StoreError::CorruptIndex {
            path: idx_path.to_path_buf(),
            reason: format!("file of {} bytes is smaller than header plus footer", raw.len()),
        });
    }
    let count = u64::from_be_bytes(raw[..8].try_into().unwrap_or_default()) as usize;
    let body = &raw[8..raw.len() - 4];
    let crc = u32::from_be_bytes(raw[raw.len() - 4..].try_into().unwrap_or_default());
    if crc32fast::hash(body) != crc {
        return Err(StoreError::CorruptIndex {
            path: idx_path.to_path_buf(),
            reason: "entry checksum mismatch".to_string(),
        });
    }

    let mut index = Vec::with_capacity(count);
    let mut at = 0usize;
    for _ in 0..count {
        let Some(len_bytes) = body.get(at..at + 4) else {
            return Err(truncated(idx_path));
        };
        let key_len = u32::from_be_bytes(len_bytes.try_into().unwrap_or_default()) as usize;
        at += 4;
        let Some(key) = body.get(at..at + key_len) else {
            return Err(truncated(idx_path));
        };
        at += key_len;
        let Some(off_bytes) = body.get(at..at + 8) else {
            return Err(truncated(idx_path));
        };
        let offset = u64::from_be_bytes(off_bytes.try_into().unwrap_or_default());
        at += 8;
        index.push((key.to_vec(), offset));
    }
    if at != body.len() {
        return Err(StoreError::CorruptIndex {
            path: idx_path.to_path_buf(),
            reason: format!("{} trailing bytes after {count} entries", body.len() - at),
        });
    }
    Ok(index)
}

fn truncated(idx_path: &Path) -> StoreError {
    StoreError::CorruptIndex {
        path: idx_path.to_path_buf(),
        reason: "truncated entry".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_segment(
        dir: &Path,
        base: &str,
        compress: bool,
        entries: &[(&[u8], &[u8])],
    ) -> SegmentReader {
        let mut w = SegmentWriter::create(dir, base, compress).unwrap();
        for (k, v) in entries {
            w.add(k, v).unwrap();
        }
        w.finish().unwrap();
        SegmentReader::open(dir, base, compress).unwrap()
    }

    #[test]
    fn roundtrip_raw() {
        let dir = tempfile::tempdir().unwrap();
        let r = write_segment(
            dir.path(),
            "accounts.0-1.vals",
            false,
            &[(b"a", b"1"), (b"b", b""), (b"c", b"333")],
        );
        assert_eq!(r.len(), 3);
        assert_eq!(r.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(r.get(b"b").unwrap(), Some(Vec::new()));
        assert_eq!(r.get(b"c").unwrap(), Some(b"333".to_vec()));
        assert_eq!(r.get(b"d").unwrap(), None);
        r.verify_checksum().unwrap();
    }

    #[test]
    fn roundtrip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![0x42u8; 4096];
        let r = write_segment(dir.path(), "code.0-1.vals", true, &[(b"k", big.as_slice())]);
        assert_eq!(r.get(b"k").unwrap(), Some(big));
        r.verify_checksum().unwrap();
    }

    #[test]
    fn rejects_out_of_order_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::create(dir.path(), "accounts.0-1.vals", false).unwrap();
        w.add(b"b", b"1").unwrap();
        assert!(w.add(b"a", b"2").is_err());
        assert!(w.add(b"b", b"2").is_err());
    }

    #[test]
    fn dropped_writer_removes_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = SegmentWriter::create(dir.path(), "accounts.0-1.vals", false).unwrap();
            w.add(b"a", b"1").unwrap();
        }
        assert!(!dir.path().join("accounts.0-1.vals.seg").exists());
        assert!(!dir.path().join("accounts.0-1.vals.idx").exists());
    }

    #[test]
    fn detects_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), "accounts.0-1.vals", false, &[(b"a", b"1")]);
        let idx_path = dir.path().join("accounts.0-1.vals.idx");
        let mut raw = std::fs::read(&idx_path).unwrap();
        let at = raw.len() - 6;
        raw[at] ^= 0xff;
        std::fs::write(&idx_path, raw).unwrap();
        assert!(matches!(
            SegmentReader::open(dir.path(), "accounts.0-1.vals", false),
            Err(StoreError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn predecessor_search_respects_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let r = write_segment(
            dir.path(),
            "accounts.0-1.hist",
            false,
            &[
                (&[1, 0, 5][..], b"a"),
                (&[1, 0, 9][..], b"b"),
                (&[2, 0, 1][..], b"c"),
            ],
        );
        // last entry with prefix [1] at or before [1, 0, 7]
        let pos = r.last_at_or_before(&[1, 0, 7], &[1]).unwrap();
        assert_eq!(r.key_at(pos), &[1, 0, 5]);
        // nothing with prefix [0]
        assert!(r.last_at_or_before(&[0, 0xff, 0xff], &[0]).is_none());
        // upper below the first prefixed entry
        assert!(r.last_at_or_before(&[1, 0, 4], &[1]).is_none());
    }

    #[test]
    fn lower_bound_and_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let r = write_segment(
            dir.path(),
            "accounts.0-1.vals",
            false,
            &[(b"aa", b"1"), (b"ab", b"2"), (b"b", b"3")],
        );
        assert_eq!(r.lower_bound(b"ab"), 1);
        assert_eq!(r.lower_bound(b"c"), 3);
        let all: Vec<_> = r.iter().map(|e| e.unwrap().1).collect();
        assert_eq!(all, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn parses_segment_names() {
        assert_eq!(
            parse_segment_name("accounts.0-1.vals.seg"),
            Some(("accounts", 0, 1, "vals"))
        );
        assert_eq!(
            parse_segment_name("log_addrs.4-8.bm.seg"),
            Some(("log_addrs", 4, 8, "bm"))
        );
        assert_eq!(parse_segment_name("accounts.0-1.vals.idx"), None);
        assert_eq!(parse_segment_name("archive.json"), None);
    }
}
