//! A domain stream: one keyed historical store (accounts, storage or code).
//!
//! The current value and the per-key version history of the unfrozen steps
//! live in the node's KV store; everything older is served from immutable
//! segment files. Every version is stamped with the txNum of the write; an
//! empty value is the delete marker and shadows older file-resident values.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    MergeRange,
    api::{KvTransaction, prefix_range, tables::DomainTables},
    error::StoreError,
    segment::{SegmentReader, SegmentWriter, parse_segment_name, segment_base},
};

pub(crate) const VALUES_COMPONENT: &str = "vals";
pub(crate) const HISTORY_COMPONENT: &str = "hist";

/// Settings-table key under which prune progress is recorded.
const PRUNED_TO_KEY: &[u8] = b"pruned_to";

/// One immutable domain file-set covering `[start_tx, end_tx)`.
///
/// Components: `values` holds the latest in-range version per key
/// (`key => txNum ++ value`, tombstones included); `history` holds every
/// in-range version (`key ++ txNum => value`).
#[derive(Debug)]
pub struct DomainFile {
    pub start_tx: u64,
    pub end_tx: u64,
    pub(crate) values: SegmentReader,
    pub(crate) history: SegmentReader,
}

impl DomainFile {
    pub(crate) fn delete_from_disk(&self) -> Result<(), StoreError> {
        self.values.delete_from_disk()?;
        self.history.delete_from_disk()?;
        Ok(())
    }
}

/// Merge opportunities of one domain, reported per file component. The
/// components of a domain file share their txNum range by construction, so
/// the two ranges always coincide; both are still reported to keep the
/// selector contract uniform.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainRanges {
    pub values: MergeRange,
    pub history: MergeRange,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.values.needs_merge || self.history.needs_merge
    }
}

/// File-lookup counters of one domain.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    queries: AtomicU64,
    hits: AtomicU64,
}

/// In-memory intermediate of one domain for one step, produced by
/// [`Domain::collate`]. Purely transient; dropping it releases everything.
pub struct DomainCollation {
    pub(crate) tx_from: u64,
    pub(crate) tx_to: u64,
    /// key => (txNum of the latest in-range version, value)
    pub(crate) values: BTreeMap<Vec<u8>, (u64, Vec<u8>)>,
    /// key ++ txNum => value, every in-range version
    pub(crate) history: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Debug)]
pub struct Domain {
    name: &'static str,
    dir: PathBuf,
    aggregation_step: u64,
    tables: DomainTables,
    compress_vals: bool,
    tx: Option<Arc<dyn KvTransaction>>,
    tx_num: u64,
    files: Arc<RwLock<BTreeMap<(u64, u64), Arc<DomainFile>>>>,
    stats: StatsCounters,
}

impl Domain {
    /// Opens the domain in its own subdirectory, rebuilding the file list by
    /// rescanning the directory. Incomplete file-sets (a crashed build) are
    /// skipped; file-sets subsumed by a larger merged file (a crash between
    /// integrate-merged and delete) are ignored but left on disk.
    pub fn open(
        dir: &Path,
        name: &'static str,
        tables: DomainTables,
        compress_vals: bool,
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
            if stream == name && component == VALUES_COMPONENT {
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
                warn!(domain = name, start_tx, end_tx, "ignoring file subsumed by a merged file");
                continue;
            }
            match open_file_set(dir, name, aggregation_step, start_tx, end_tx, compress_vals) {
                Ok(file) => {
                    files.insert((end_tx, start_tx), Arc::new(file));
                }
                Err(err) => {
                    warn!(domain = name, start_tx, end_tx, %err, "skipping unreadable file-set");
                }
            }
        }

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            aggregation_step,
            tables,
            compress_vals,
            tx: None,
            tx_num: 0,
            files: Arc::new(RwLock::new(files)),
            stats: StatsCounters::default(),
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

    /// Records a new version of `key` at the current txNum.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let tx = self.tx()?;
        tx.put(self.tables.keys, key, &self.tx_num.to_be_bytes())?;
        tx.put(self.tables.vals, key, value)?;
        let mut change_key = Vec::with_capacity(8 + key.len());
        change_key.extend_from_slice(&self.tx_num.to_be_bytes());
        change_key.extend_from_slice(key);
        tx.put(self.tables.history_keys, &change_key, &[])?;
        tx.put(self.tables.history_vals, &history_key(key, self.tx_num), value)?;
        Ok(())
    }

    /// Records a deletion of `key` at the current txNum.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.put(key, &[])
    }

    /// Current value of `key`: the mutable store first, then the file stack
    /// newest-first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(value) = self.tx()?.get(self.tables.vals, key)? {
            return Ok(non_empty(value));
        }
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        for file in self.files_newest_first()? {
            if let Some(record) = file.values.get(key)? {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let (_, value) = split_values_record(&record)?;
                return Ok(non_empty(value.to_vec()));
            }
        }
        Ok(None)
    }

    /// Value of `key` as of `tx_num`: the latest version whose txNum is
    /// `<= tx_num`. The mutable history only holds versions newer than
    /// anything frozen, so it is consulted first.
    pub fn get_before_tx_num(&self, key: &[u8], tx_num: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let tx = self.tx()?;
        let from = history_key(key, 0);
        let to = if tx_num == u64::MAX {
            crate::api::next_prefix(key)
        } else {
            Some(history_key(key, tx_num + 1))
        };
        let rows = tx.range(self.tables.history_vals, &from, to.as_deref())?;
        if let Some((_, value)) = rows
            .iter()
            .rev()
            .find(|(k, _)| k.len() == key.len() + 8 && k.starts_with(key))
        {
            return Ok(non_empty(value.clone()));
        }

        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        for file in self.files_newest_first()? {
            if file.start_tx > tx_num {
                continue;
            }
            if let Some(pos) = history_seek(&file.history, key, tx_num) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(non_empty(file.history.value_at(pos)?));
            }
        }
        Ok(None)
    }

    /// Invokes `f` for every live key starting with `prefix`, composing the
    /// file stack with the mutable overlay. Tombstoned keys are skipped.
    pub fn for_each_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut files = self.files_newest_first()?;
        files.reverse();
        for file in files {
            let mut pos = file.values.lower_bound(prefix);
            while pos < file.values.len() && file.values.key_at(pos).starts_with(prefix) {
                let (_, value) = split_values_record(&file.values.value_at(pos)?)
                    .map(|(t, v)| (t, v.to_vec()))?;
                merged.insert(file.values.key_at(pos).to_vec(), value);
                pos += 1;
            }
        }
        for (key, value) in prefix_range(tx.as_ref(), self.tables.vals, prefix)? {
            merged.insert(key, value);
        }
        for (key, value) in &merged {
            if !value.is_empty() {
                f(key, value)?;
            }
        }
        Ok(())
    }

    /// Scans the mutable store for everything written in `[tx_from, tx_to)`.
    pub fn collate(&self, tx_from: u64, tx_to: u64) -> Result<DomainCollation, StoreError> {
        self.check_alignment(tx_from, tx_to)?;
        let tx = self.tx()?;

        let mut history = BTreeMap::new();
        let mut touched = BTreeSet::new();
        let rows = tx.range(
            self.tables.history_keys,
            &tx_from.to_be_bytes(),
            Some(tx_to.to_be_bytes().as_slice()),
        )?;
        for (change_key, _) in rows {
            let (version, key) = split_change_key(&change_key)?;
            let version_key = history_key(key, version);
            let value = tx
                .get(self.tables.history_vals, &version_key)?
                .ok_or_else(|| {
                    StoreError::Custom(format!(
                        "domain {}: missing history value for key {} at txNum {version}",
                        self.name,
                        hex::encode(key)
                    ))
                })?;
            history.insert(version_key, value);
            touched.insert(key.to_vec());
        }

        let mut values = BTreeMap::new();
        for key in touched {
            let rows = tx.range(
                self.tables.history_vals,
                &history_key(&key, 0),
                Some(history_key(&key, tx_to).as_slice()),
            )?;
            let latest = rows
                .iter()
                .rev()
                .find(|(k, _)| k.len() == key.len() + 8 && k.starts_with(key.as_slice()));
            if let Some((version_key, value)) = latest {
                let version = u64::from_be_bytes(
                    version_key[key.len()..].try_into().unwrap_or_default(),
                );
                values.insert(key, (version, value.clone()));
            }
        }

        Ok(DomainCollation {
            tx_from,
            tx_to,
            values,
            history,
        })
    }

    /// Builds the immutable file-set for a collation. Partially written
    /// segments are removed on every failure path.
    pub fn build_files(&self, collation: &DomainCollation) -> Result<DomainFile, StoreError> {
        let values = collation
            .values
            .iter()
            .map(|(key, (version, value))| (key.as_slice(), values_record(*version, value)));
        let history = collation
            .history
            .iter()
            .map(|(key, value)| (key.as_slice(), value.clone()));
        let file = self.write_files(collation.tx_from, collation.tx_to, values, history)?;
        debug!(
            domain = self.name,
            tx_from = collation.tx_from,
            tx_to = collation.tx_to,
            keys = file.values.len(),
            "built domain files"
        );
        Ok(file)
    }

    /// Makes a built file-set visible to readers.
    pub fn integrate_files(&self, file: DomainFile) -> Result<(), StoreError> {
        let mut files = self.files_mut()?;
        files.insert((file.end_tx, file.start_tx), Arc::new(file));
        Ok(())
    }

    /// Removes everything in `[tx_from, tx_to)` from the mutable store: the
    /// whole version history of the range, plus the current rows of keys
    /// whose latest version is now file-resident.
    pub fn prune(&self, tx_from: u64, tx_to: u64) -> Result<(), StoreError> {
        let tx = self.tx()?;
        let rows = tx.range(
            self.tables.history_keys,
            &tx_from.to_be_bytes(),
            Some(tx_to.to_be_bytes().as_slice()),
        )?;
        let mut touched = BTreeSet::new();
        for (change_key, _) in rows {
            let (version, key) = split_change_key(&change_key)?;
            tx.delete(self.tables.history_vals, &history_key(key, version))?;
            touched.insert(key.to_vec());
            tx.delete(self.tables.history_keys, &change_key)?;
        }
        for key in touched {
            let Some(raw) = tx.get(self.tables.keys, &key)? else {
                continue;
            };
            let latest = u64::from_be_bytes(raw.as_slice().try_into().map_err(|_| {
                StoreError::Custom(format!("domain {}: malformed latest-version entry", self.name))
            })?);
            if latest < tx_to {
                tx.delete(self.tables.keys, &key)?;
                tx.delete(self.tables.vals, &key)?;
            }
        }
        tx.put(self.tables.settings, PRUNED_TO_KEY, &tx_to.to_be_bytes())?;
        Ok(())
    }

    /// TxNum up to which the mutable store has been pruned.
    pub fn pruned_up_to(&self) -> Result<Option<u64>, StoreError> {
        let raw = self.tx()?.get(self.tables.settings, PRUNED_TO_KEY)?;
        Ok(raw.map(|r| u64::from_be_bytes(r.as_slice().try_into().unwrap_or_default())))
    }

    pub fn find_merge_range(&self, max_end_tx: u64, max_span: u64) -> Result<DomainRanges, StoreError> {
        let ranges: Vec<(u64, u64)> = self
            .files_read()?
            .keys()
            .map(|&(end, start)| (start, end))
            .collect();
        let range =
            crate::compute_merge_range(&ranges, self.aggregation_step, max_end_tx, max_span);
        Ok(DomainRanges {
            values: range,
            history: range,
        })
    }

    /// Files fully contained in `[tx_from, tx_to)`, oldest first. The caller
    /// borrows these; ownership stays with the domain until
    /// [`Domain::integrate_merged_files`] swaps them out.
    pub fn files_in_range(&self, tx_from: u64, tx_to: u64) -> Result<Vec<Arc<DomainFile>>, StoreError> {
        Ok(self
            .files_read()?
            .values()
            .filter(|file| file.start_tx >= tx_from && file.end_tx <= tx_to)
            .cloned()
            .collect())
    }

    /// Merges the selected file-sets into one covering `[tx_from, tx_to)`.
    /// For the values component the newest version of each key wins; the
    /// history components have disjoint keys and concatenate.
    pub fn merge_files(
        &self,
        inputs: &[Arc<DomainFile>],
        tx_from: u64,
        tx_to: u64,
    ) -> Result<DomainFile, StoreError> {
        let mut values: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut history: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for input in inputs {
            for entry in input.values.iter() {
                let (key, record) = entry?;
                values.insert(key.to_vec(), record);
            }
            for entry in input.history.iter() {
                let (key, value) = entry?;
                history.insert(key.to_vec(), value);
            }
        }
        let file = self.write_files(
            tx_from,
            tx_to,
            values.iter().map(|(k, v)| (k.as_slice(), v.clone())),
            history.iter().map(|(k, v)| (k.as_slice(), v.clone())),
        )?;
        debug!(
            domain = self.name,
            tx_from,
            tx_to,
            inputs = inputs.len(),
            "merged domain files"
        );
        Ok(file)
    }

    /// Atomically replaces the merged inputs with the merged output in the
    /// in-memory list. The inputs stay on disk until
    /// [`Domain::delete_files`].
    pub fn integrate_merged_files(
        &self,
        inputs: &[Arc<DomainFile>],
        merged: DomainFile,
    ) -> Result<(), StoreError> {
        let mut files = self.files_mut()?;
        for input in inputs {
            files.remove(&(input.end_tx, input.start_tx));
        }
        files.insert((merged.end_tx, merged.start_tx), Arc::new(merged));
        Ok(())
    }

    /// Unlinks merged-away inputs from disk. Readers still holding a handle
    /// keep working off the open file descriptor.
    pub fn delete_files(&self, inputs: &[Arc<DomainFile>]) -> Result<(), StoreError> {
        for input in inputs {
            input.delete_from_disk()?;
        }
        Ok(())
    }

    /// Largest txNum covered by this domain's files, 0 when none exist.
    pub fn end_tx_num_on_disk(&self) -> Result<u64, StoreError> {
        Ok(self
            .files_read()?
            .keys()
            .next_back()
            .map(|&(end, _)| end)
            .unwrap_or(0))
    }

    /// Snapshot of the file stack for an independent reader.
    pub(crate) fn files_newest_first(&self) -> Result<Vec<Arc<DomainFile>>, StoreError> {
        Ok(self.files_read()?.values().rev().cloned().collect())
    }

    /// Returns and resets the file-lookup counters.
    pub(crate) fn take_stats(&self) -> (u64, u64) {
        (
            self.stats.queries.swap(0, Ordering::Relaxed),
            self.stats.hits.swap(0, Ordering::Relaxed),
        )
    }

    fn write_files<'a>(
        &self,
        tx_from: u64,
        tx_to: u64,
        values: impl Iterator<Item = (&'a [u8], Vec<u8>)>,
        history: impl Iterator<Item = (&'a [u8], Vec<u8>)>,
    ) -> Result<DomainFile, StoreError> {
        self.check_alignment(tx_from, tx_to)?;
        let from_step = tx_from / self.aggregation_step;
        let to_step = tx_to / self.aggregation_step;
        let vals_base = segment_base(self.name, from_step, to_step, VALUES_COMPONENT);
        let hist_base = segment_base(self.name, from_step, to_step, HISTORY_COMPONENT);

        let mut vals_writer = SegmentWriter::create(&self.dir, &vals_base, self.compress_vals)?;
        for (key, record) in values {
            vals_writer.add(key, &record)?;
        }
        let mut hist_writer = SegmentWriter::create(&self.dir, &hist_base, self.compress_vals)?;
        for (key, value) in history {
            hist_writer.add(key, &value)?;
        }
        vals_writer.finish()?;
        if let Err(err) = hist_writer.finish() {
            remove_segment_pair(&self.dir, &vals_base);
            return Err(err);
        }

        let open = || -> Result<DomainFile, StoreError> {
            Ok(DomainFile {
                start_tx: tx_from,
                end_tx: tx_to,
                values: SegmentReader::open(&self.dir, &vals_base, self.compress_vals)?,
                history: SegmentReader::open(&self.dir, &hist_base, self.compress_vals)?,
            })
        };
        open().inspect_err(|_| {
            remove_segment_pair(&self.dir, &vals_base);
            remove_segment_pair(&self.dir, &hist_base);
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

    fn files_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<(u64, u64), Arc<DomainFile>>>, StoreError>
    {
        self.files
            .read()
            .map_err(|_| StoreError::Custom("poisoned domain file list lock".to_string()))
    }

    fn files_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<(u64, u64), Arc<DomainFile>>>, StoreError>
    {
        self.files
            .write()
            .map_err(|_| StoreError::Custom("poisoned domain file list lock".to_string()))
    }
}

fn open_file_set(
    dir: &Path,
    name: &str,
    aggregation_step: u64,
    start_tx: u64,
    end_tx: u64,
    compress_vals: bool,
) -> Result<DomainFile, StoreError> {
    let from_step = start_tx / aggregation_step;
    let to_step = end_tx / aggregation_step;
    Ok(DomainFile {
        start_tx,
        end_tx,
        values: SegmentReader::open(
            dir,
            &segment_base(name, from_step, to_step, VALUES_COMPONENT),
            compress_vals,
        )?,
        history: SegmentReader::open(
            dir,
            &segment_base(name, from_step, to_step, HISTORY_COMPONENT),
            compress_vals,
        )?,
    })
}

fn remove_segment_pair(dir: &Path, base: &str) {
    let _ = std::fs::remove_file(dir.join(format!("{base}.seg")));
    let _ = std::fs::remove_file(dir.join(format!("{base}.idx")));
}

/// `key ++ tx_num.to_be_bytes()`, the history entry key.
pub(crate) fn history_key(key: &[u8], tx_num: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out
}

/// `tx_num.to_be_bytes() ++ value`, the values-component record.
pub(crate) fn values_record(tx_num: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Splits a values-component record back into `(txNum, value)`.
pub(crate) fn split_values_record(record: &[u8]) -> Result<(u64, &[u8]), StoreError> {
    if record.len() < 8 {
        return Err(StoreError::Custom(
            "malformed values record: shorter than its txNum stamp".to_string(),
        ));
    }
    let tx_num = u64::from_be_bytes(record[..8].try_into().unwrap_or_default());
    Ok((tx_num, &record[8..]))
}

pub(crate) fn split_change_key(change_key: &[u8]) -> Result<(u64, &[u8]), StoreError> {
    if change_key.len() <= 8 {
        return Err(StoreError::Custom(
            "malformed change key: missing key suffix".to_string(),
        ));
    }
    let version = u64::from_be_bytes(change_key[..8].try_into().unwrap_or_default());
    Ok((version, &change_key[8..]))
}

/// Position of the latest version of `key` in a history segment with txNum
/// `<= tx_num`. Steps over entries of longer keys that share `key` as a byte
/// prefix.
pub(crate) fn history_seek(history: &SegmentReader, key: &[u8], tx_num: u64) -> Option<usize> {
    let upper = history_key(key, tx_num);
    let mut pos = history.last_at_or_before(&upper, key);
    while let Some(p) = pos {
        let entry_key = history.key_at(p);
        if !entry_key.starts_with(key) {
            return None;
        }
        if entry_key.len() == key.len() + 8 {
            return Some(p);
        }
        pos = p.checked_sub(1);
    }
    None
}

/// TxNum stamp of the history entry at `pos`.
pub(crate) fn history_version_at(history: &SegmentReader, pos: usize, key_len: usize) -> u64 {
    let entry_key = history.key_at(pos);
    u64::from_be_bytes(entry_key[key_len..].try_into().unwrap_or_default())
}

pub(crate) fn non_empty(value: Vec<u8>) -> Option<Vec<u8>> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{api::tables::ACCOUNTS_TABLES, backend::in_memory::InMemoryBackend};

    const STEP: u64 = 4;

    fn test_domain(dir: &Path) -> Domain {
        let mut domain = Domain::open(dir, "accounts", ACCOUNTS_TABLES, false, STEP).unwrap();
        domain.set_tx(Arc::new(InMemoryBackend::new().begin()));
        domain
    }

    fn freeze(domain: &Domain, tx_from: u64, tx_to: u64) {
        let collation = domain.collate(tx_from, tx_to).unwrap();
        let file = domain.build_files(&collation).unwrap();
        domain.integrate_files(file).unwrap();
        domain.prune(tx_from, tx_to).unwrap();
    }

    #[test]
    fn latest_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(1);
        domain.put(b"k", b"one").unwrap();
        domain.set_tx_num(2);
        domain.put(b"k", b"two").unwrap();
        assert_eq!(domain.get(b"k").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn delete_shadows_older_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"k", b"v").unwrap();
        domain.set_tx_num(1);
        domain.delete(b"k").unwrap();
        assert_eq!(domain.get(b"k").unwrap(), None);
    }

    #[test]
    fn reads_survive_freeze_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"a", b"1").unwrap();
        domain.set_tx_num(2);
        domain.put(b"b", b"2").unwrap();
        freeze(&domain, 0, STEP);

        assert_eq!(domain.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(domain.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(domain.pruned_up_to().unwrap(), Some(STEP));
        // version history left the mutable store
        let (queries, hits) = domain.take_stats();
        assert!(queries >= 2 && hits >= 2);
    }

    #[test]
    fn as_of_reads_across_files_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"a", b"1").unwrap();
        domain.set_tx_num(4);
        domain.put(b"a", b"2").unwrap();
        freeze(&domain, 0, STEP);
        freeze(&domain, STEP, 2 * STEP);

        assert_eq!(domain.get_before_tx_num(b"a", 3).unwrap(), Some(b"1".to_vec()));
        assert_eq!(domain.get_before_tx_num(b"a", 4).unwrap(), Some(b"2".to_vec()));
        assert_eq!(domain.get_before_tx_num(b"a", 100).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn as_of_read_of_deleted_version_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"a", b"1").unwrap();
        domain.set_tx_num(1);
        domain.delete(b"a").unwrap();
        freeze(&domain, 0, STEP);

        assert_eq!(domain.get_before_tx_num(b"a", 0).unwrap(), Some(b"1".to_vec()));
        assert_eq!(domain.get_before_tx_num(b"a", 1).unwrap(), None);
        assert_eq!(domain.get(b"a").unwrap(), None);
    }

    #[test]
    fn prefix_iteration_merges_files_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"aa1", b"old").unwrap();
        domain.put(b"aa2", b"x").unwrap();
        freeze(&domain, 0, STEP);
        domain.set_tx_num(4);
        domain.put(b"aa1", b"new").unwrap();
        domain.put(b"ab3", b"y").unwrap();
        domain.set_tx_num(5);
        domain.delete(b"aa2").unwrap();

        let mut seen = Vec::new();
        domain
            .for_each_prefix(b"aa", &mut |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(b"aa1".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn merge_preserves_latest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut domain = test_domain(dir.path());
        domain.set_tx_num(0);
        domain.put(b"a", b"old").unwrap();
        domain.set_tx_num(5);
        domain.put(b"a", b"new").unwrap();
        freeze(&domain, 0, STEP);
        freeze(&domain, STEP, 2 * STEP);

        let ranges = domain.find_merge_range(2 * STEP, 32 * STEP).unwrap();
        assert!(ranges.any());
        assert_eq!((ranges.values.from, ranges.values.to), (0, 2 * STEP));

        let inputs = domain.files_in_range(0, 2 * STEP).unwrap();
        assert_eq!(inputs.len(), 2);
        let merged = domain.merge_files(&inputs, 0, 2 * STEP).unwrap();
        domain.integrate_merged_files(&inputs, merged).unwrap();
        domain.delete_files(&inputs).unwrap();

        assert_eq!(domain.get(b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(domain.get_before_tx_num(b"a", 2).unwrap(), Some(b"old".to_vec()));
        assert_eq!(domain.end_tx_num_on_disk().unwrap(), 2 * STEP);
        assert!(!dir.path().join("accounts.0-1.vals.seg").exists());
        assert!(dir.path().join("accounts.0-2.vals.seg").exists());
    }

    #[test]
    fn reopen_rescans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InMemoryBackend::new();
        {
            let mut domain =
                Domain::open(dir.path(), "accounts", ACCOUNTS_TABLES, false, STEP).unwrap();
            domain.set_tx(Arc::new(backend.begin()));
            domain.set_tx_num(0);
            domain.put(b"a", b"1").unwrap();
            freeze(&domain, 0, STEP);
        }
        let mut domain = Domain::open(dir.path(), "accounts", ACCOUNTS_TABLES, false, STEP).unwrap();
        domain.set_tx(Arc::new(backend.begin()));
        assert_eq!(domain.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(domain.end_tx_num_on_disk().unwrap(), STEP);
    }

    #[test]
    fn collate_rejects_unaligned_range() {
        let dir = tempfile::tempdir().unwrap();
        let domain = test_domain(dir.path());
        assert!(matches!(
            domain.collate(1, STEP),
            Err(StoreError::UnalignedRange { .. })
        ));
    }
}
