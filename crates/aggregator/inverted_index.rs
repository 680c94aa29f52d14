//! An inverted-index stream: key => set of txNums at which the key appeared.
//!
//! Appearances for the unfrozen steps live in the KV store as raw
//! `(txNum, key)` pairs; frozen steps are segment files mapping each key to a
//! serialized 64-bit roaring bitmap of its txNums.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::{
    MergeRange,
    api::{KvTransaction, tables::IndexTables},
    domain::history_key,
    error::StoreError,
    segment::{SegmentReader, SegmentWriter, parse_segment_name, segment_base},
};

pub(crate) const BITMAP_COMPONENT: &str = "bm";

/// One immutable inverted-index file covering `[start_tx, end_tx)`:
/// `key => serialized RoaringTreemap`.
#[derive(Debug)]
pub struct IndexFile {
    pub start_tx: u64,
    pub end_tx: u64,
    pub(crate) data: SegmentReader,
}

impl IndexFile {
    pub(crate) fn delete_from_disk(&self) -> Result<(), StoreError> {
        self.data.delete_from_disk()
    }
}

/// In-memory intermediate of one inverted index for one step.
pub struct IndexCollation {
    pub(crate) tx_from: u64,
    pub(crate) tx_to: u64,
    pub(crate) bitmaps: BTreeMap<Vec<u8>, RoaringTreemap>,
}

#[derive(Debug)]
pub struct InvertedIndex {
    name: &'static str,
    dir: PathBuf,
    aggregation_step: u64,
    tables: IndexTables,
    tx: Option<Arc<dyn KvTransaction>>,
    tx_num: u64,
    files: Arc<RwLock<BTreeMap<(u64, u64), Arc<IndexFile>>>>,
}

impl InvertedIndex {
    pub fn open(
        dir: &Path,
        name: &'static str,
        tables: IndexTables,
        aggregation_step: u64,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;

        let mut ranges = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name_str) = file_name.to_str() else {
                continue;
            };
            let Some((stream, from_step, to_step, component)) = parse_segment_name(name_str)
            else {
                continue;
            };
            if stream == name && component == BITMAP_COMPONENT {
                ranges.push((from_step * aggregation_step, to_step * aggregation_step));
            }
        }
        ranges.sort_unstable();

        let mut files = BTreeMap::new();
        for &(start_tx, end_tx) in &ranges {
            let subsumed = ranges
                .iter()
                .any(|&(s, e)| (s, e) != (start_tx, end_tx) && s <= start_tx && end_tx <= e);
            if subsumed {
                warn!(index = name, start_tx, end_tx, "ignoring file subsumed by a merged file");
                continue;
            }
            let base = segment_base(
                name,
                start_tx / aggregation_step,
                end_tx / aggregation_step,
                BITMAP_COMPONENT,
            );
            match SegmentReader::open(dir, &base, false) {
                Ok(data) => {
                    files.insert((end_tx, start_tx), Arc::new(IndexFile { start_tx, end_tx, data }));
                }
                Err(err) => {
                    warn!(index = name, start_tx, end_tx, %err, "skipping unreadable file");
                }
            }
        }

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            aggregation_step,
            tables,
            tx: None,
            tx_num: 0,
            files: Arc::new(RwLock::new(files)),
        })
    }

    pub fn set_tx(&mut self, tx: Arc<dyn KvTransaction>) {
        self.tx = Some(tx);
    }

    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
    }

    fn tx(&self) -> Result<&Arc<dyn KvTransaction>, StoreError> {
        self.tx.as_ref().ok_or(StoreError::NoActiveTransaction)
    }

    /// Records an appearance of `key` at the current txNum.
    pub fn add(&self, key: &[u8]) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let mut change_key = Vec::with_capacity(8 + key.len());
        change_key.extend_from_slice(&self.tx_num.to_be_bytes());
        change_key.extend_from_slice(key);
        tx.put(self.tables.keys, &change_key, &[])?;
        tx.put(self.tables.idx, &history_key(key, self.tx_num), &[])?;
        Ok(())
    }

    /// TxNums in `[start_tx, end_tx)` at which `key` appeared, ascending,
    /// composed from the file stack and the mutable overlay.
    pub fn iter_range(
        &self,
        key: &[u8],
        start_tx: u64,
        end_tx: u64,
    ) -> Result<InvertedIndexIterator, StoreError> {
        let mut found = BTreeSet::new();
        for file in self.files_snapshot()? {
            if file.start_tx >= end_tx || file.end_tx <= start_tx {
                continue;
            }
            if let Some(raw) = file.data.get(key)? {
                let bitmap = decode_bitmap(&raw)?;
                found.extend(bitmap.iter().filter(|t| (start_tx..end_tx).contains(t)));
            }
        }
        let tx = self.tx()?;
        let rows = tx.range(
            self.tables.idx,
            &history_key(key, start_tx),
            Some(history_key(key, end_tx).as_slice()),
        )?;
        for (entry_key, _) in rows {
            if entry_key.len() == key.len() + 8 && entry_key.starts_with(key) {
                let tx_num =
                    u64::from_be_bytes(entry_key[key.len()..].try_into().unwrap_or_default());
                found.insert(tx_num);
            }
        }
        Ok(InvertedIndexIterator {
            inner: found.into_iter(),
        })
    }

    /// Scans the mutable store for every appearance in `[tx_from, tx_to)`.
    pub fn collate(&self, tx_from: u64, tx_to: u64) -> Result<IndexCollation, StoreError> {
        self.check_alignment(tx_from, tx_to)?;
        let tx = self.tx()?;
        let mut bitmaps: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        let rows = tx.range(
            self.tables.keys,
            &tx_from.to_be_bytes(),
            Some(tx_to.to_be_bytes().as_slice()),
        )?;
        for (change_key, _) in rows {
            let (tx_num, key) = crate::domain::split_change_key(&change_key)?;
            bitmaps.entry(key.to_vec()).or_default().insert(tx_num);
        }
        Ok(IndexCollation {
            tx_from,
            tx_to,
            bitmaps,
        })
    }

    /// Builds the immutable bitmap file for a collation.
    pub fn build_files(&self, collation: &IndexCollation) -> Result<IndexFile, StoreError> {
        let file = self.write_file(collation.tx_from, collation.tx_to, &collation.bitmaps)?;
        debug!(
            index = self.name,
            tx_from = collation.tx_from,
            tx_to = collation.tx_to,
            keys = file.data.len(),
            "built inverted-index file"
        );
        Ok(file)
    }

    pub fn integrate_files(&self, file: IndexFile) -> Result<(), StoreError> {
        let mut files = self.files_mut()?;
        files.insert((file.end_tx, file.start_tx), Arc::new(file));
        Ok(())
    }

    /// Removes every appearance in `[tx_from, tx_to)` from the mutable store.
    pub fn prune(&self, tx_from: u64, tx_to: u64) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let rows = tx.range(
            self.tables.keys,
            &tx_from.to_be_bytes(),
            Some(tx_to.to_be_bytes().as_slice()),
        )?;
        for (change_key, _) in rows {
            let (tx_num, key) = crate::domain::split_change_key(&change_key)?;
            tx.delete(self.tables.idx, &history_key(key, tx_num))?;
            tx.delete(self.tables.keys, &change_key)?;
        }
        Ok(())
    }

    pub fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> Result<MergeRange, StoreError> {
        let ranges: Vec<(u64, u64)> = self
            .files_read()?
            .keys()
            .map(|&(end, start)| (start, end))
            .collect();
        Ok(crate::compute_merge_range(
            &ranges,
            self.aggregation_step,
            max_end_tx,
            max_span,
        ))
    }

    /// Files fully contained in `[tx_from, tx_to)`, oldest first; borrowed by
    /// the merge, owned by the index until the merged file is integrated.
    pub fn files_in_range(&self, tx_from: u64, tx_to: u64) -> Result<Vec<Arc<IndexFile>>, StoreError> {
        Ok(self
            .files_read()?
            .values()
            .filter(|file| file.start_tx >= tx_from && file.end_tx <= tx_to)
            .cloned()
            .collect())
    }

    /// Merges the selected files by unioning the per-key bitmaps.
    pub fn merge_files(
        &self,
        inputs: &[Arc<IndexFile>],
        tx_from: u64,
        tx_to: u64,
    ) -> Result<IndexFile, StoreError> {
        let mut bitmaps: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for input in inputs {
            for entry in input.data.iter() {
                let (key, raw) = entry?;
                let bitmap = decode_bitmap(&raw)?;
                *bitmaps.entry(key.to_vec()).or_default() |= bitmap;
            }
        }
        let file = self.write_file(tx_from, tx_to, &bitmaps)?;
        debug!(
            index = self.name,
            tx_from,
            tx_to,
            inputs = inputs.len(),
            "merged inverted-index files"
        );
        Ok(file)
    }

    pub fn integrate_merged_files(
        &self,
        inputs: &[Arc<IndexFile>],
        merged: IndexFile,
    ) -> Result<(), StoreError> {
        let mut files = self.files_mut()?;
        for input in inputs {
            files.remove(&(input.end_tx, input.start_tx));
        }
        files.insert((merged.end_tx, merged.start_tx), Arc::new(merged));
        Ok(())
    }

    pub fn delete_files(&self, inputs: &[Arc<IndexFile>]) -> Result<(), StoreError> {
        for input in inputs {
            input.delete_from_disk()?;
        }
        Ok(())
    }

    /// Largest txNum covered by this index's files, 0 when none exist.
    pub fn end_tx_num_on_disk(&self) -> Result<u64, StoreError> {
        Ok(self
            .files_read()?
            .keys()
            .next_back()
            .map(|&(end, _)| end)
            .unwrap_or(0))
    }

    fn write_file(
        &self,
        tx_from: u64,
        tx_to: u64,
        bitmaps: &BTreeMap<Vec<u8>, RoaringTreemap>,
    ) -> Result<IndexFile, StoreError> {
        self.check_alignment(tx_from, tx_to)?;
        let base = segment_base(
            self.name,
            tx_from / self.aggregation_step,
            tx_to / self.aggregation_step,
            BITMAP_COMPONENT,
        );
        let mut writer = SegmentWriter::create(&self.dir, &base, false)?;
        let mut buf = Vec::new();
        for (key, bitmap) in bitmaps {
            buf.clear();
            bitmap
                .serialize_into(&mut buf)
                .map_err(|e| StoreError::Bitmap(e.to_string()))?;
            writer.add(key, &buf)?;
        }
        writer.finish()?;
        Ok(IndexFile {
            start_tx: tx_from,
            end_tx: tx_to,
            data: SegmentReader::open(&self.dir, &base, false)?,
        })
    }

    fn check_alignment(&self, tx_from: u64, tx_to: u64) -> Result<(), StoreError> {
        if tx_from % self.aggregation_step != 0
            || tx_to % self.aggregation_step != 0
            || tx_to <= tx_from
        {
            return Err(StoreError::UnalignedRange {
                start: tx_from,
                end: tx_to,
                step: self.aggregation_step,
            });
        }
        Ok(())
    }

    fn files_snapshot(&self) -> Result<Vec<Arc<IndexFile>>, StoreError> {
        Ok(self.files_read()?.values().cloned().collect())
    }

    fn files_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<(u64, u64), Arc<IndexFile>>>, StoreError>
    {
        self.files
            .read()
            .map_err(|_| StoreError::Custom("poisoned index file list lock".to_string()))
    }

    fn files_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<(u64, u64), Arc<IndexFile>>>, StoreError>
    {
        self.files
            .write()
            .map_err(|_| StoreError::Custom("poisoned index file list lock".to_string()))
    }
}

fn decode_bitmap(raw: &[u8]) -> Result<RoaringTreemap, StoreError> {
    RoaringTreemap::deserialize_from(raw).map_err(|e| StoreError::Bitmap(e.to_string()))
}

/// Ascending txNums produced by [`InvertedIndex::iter_range`].
pub struct InvertedIndexIterator {
    inner: std::collections::btree_set::IntoIter<u64>,
}

impl Iterator for InvertedIndexIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.inner.next()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{api::tables::LOG_ADDRS_TABLES, backend::in_memory::InMemoryBackend};

    const STEP: u64 = 4;

    fn test_index(dir: &Path) -> InvertedIndex {
        let mut index = InvertedIndex::open(dir, "log_addrs", LOG_ADDRS_TABLES, STEP).unwrap();
        index.set_tx(Arc::new(InMemoryBackend::new().begin()));
        index
    }

    fn freeze(index: &InvertedIndex, tx_from: u64, tx_to: u64) {
        let collation = index.collate(tx_from, tx_to).unwrap();
        let file = index.build_files(&collation).unwrap();
        index.integrate_files(file).unwrap();
        index.prune(tx_from, tx_to).unwrap();
    }

    #[test]
    fn range_query_over_mutable_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = test_index(dir.path());
        for tx_num in [1u64, 2, 3] {
            index.set_tx_num(tx_num);
            index.add(b"x").unwrap();
        }
        let got: Vec<u64> = index.iter_range(b"x", 2, 4).unwrap().collect();
        assert_eq!(got, vec![2, 3]);
    }

    #[test]
    fn range_query_spans_files_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = test_index(dir.path());
        for tx_num in [0u64, 2, 5] {
            index.set_tx_num(tx_num);
            index.add(b"x").unwrap();
        }
        freeze(&index, 0, STEP);
        let got: Vec<u64> = index.iter_range(b"x", 0, 100).unwrap().collect();
        assert_eq!(got, vec![0, 2, 5]);
        // the raw appearances of the frozen step are gone from the kv store
        let got: Vec<u64> = index.iter_range(b"x", 0, STEP).unwrap().collect();
        assert_eq!(got, vec![0, 2]);
    }

    #[test]
    fn unknown_key_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = test_index(dir.path());
        index.set_tx_num(1);
        index.add(b"x").unwrap();
        freeze(&index, 0, STEP);
        assert_eq!(index.iter_range(b"y", 0, 100).unwrap().count(), 0);
    }

    #[test]
    fn merge_unions_bitmaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = test_index(dir.path());
        index.set_tx_num(1);
        index.add(b"x").unwrap();
        index.set_tx_num(6);
        index.add(b"x").unwrap();
        index.set_tx_num(7);
        index.add(b"y").unwrap();
        freeze(&index, 0, STEP);
        freeze(&index, STEP, 2 * STEP);

        let range = index.find_merge_range(2 * STEP, 32 * STEP).unwrap();
        assert!(range.needs_merge);
        assert_eq!((range.from, range.to), (0, 2 * STEP));

        let inputs = index.files_in_range(0, 2 * STEP).unwrap();
        let merged = index.merge_files(&inputs, 0, 2 * STEP).unwrap();
        index.integrate_merged_files(&inputs, merged).unwrap();
        index.delete_files(&inputs).unwrap();

        let got: Vec<u64> = index.iter_range(b"x", 0, 100).unwrap().collect();
        assert_eq!(got, vec![1, 6]);
        let got: Vec<u64> = index.iter_range(b"y", 0, 100).unwrap().collect();
        assert_eq!(got, vec![7]);
        assert_eq!(index.end_tx_num_on_disk().unwrap(), 2 * STEP);
    }

    #[test]
    fn reopen_rescans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemoryBackend::new();
        {
            let mut index =
                InvertedIndex::open(dir.path(), "log_addrs", LOG_ADDRS_TABLES, STEP).unwrap();
            index.set_tx(Arc::new(backend.begin()));
            index.set_tx_num(2);
            index.add(b"x").unwrap();
            freeze(&index, 0, STEP);
        }
        let mut index = InvertedIndex::open(dir.path(), "log_addrs", LOG_ADDRS_TABLES, STEP).unwrap();
        index.set_tx(Arc::new(backend.begin()));
        let got: Vec<u64> = index.iter_range(b"x", 0, 100).unwrap().collect();
        assert_eq!(got, vec![2]);
    }
}
