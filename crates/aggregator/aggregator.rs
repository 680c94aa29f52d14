//! Historical state archive for an execution node.
//!
//! The archive manages an append-only, time-partitioned history of three
//! key/value domains (accounts, contract storage, contract code) and four
//! inverted indices (log addresses, log topics, trace senders, trace
//! recipients), keyed by transaction ordinal (txNum).
//!
//! Recent writes land in the node's transactional KV store. At every step
//! boundary (`aggregation_step` txNums) the archive freezes the previous
//! step into immutable segment files, merges adjacent files following a
//! size-tiered policy, and prunes the now file-resident mutations from the
//! KV store. Reads compose the mutable overlay with the file stack.
//!
//! The archive is single-writer: all write-side operations, including
//! [`Aggregator::finish_tx`], must come from one thread. Independent readers
//! use [`AggregatorContext`] snapshots.

pub mod api;
pub mod backend;
mod context;
mod domain;
mod error;
mod inverted_index;
mod segment;

use std::{
    path::Path,
    sync::{
        Arc,
        mpsc::{Receiver, SyncSender, sync_channel},
    },
    thread,
};

use bytes::Bytes;
use ethereum_types::{Address, H256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use crate::{
    api::KvTransaction,
    context::{AggregatorContext, DomainContext, HistoryIterator, NoStateRead, ReconKeysIterator},
    domain::{Domain, DomainCollation, DomainFile, DomainRanges},
    error::StoreError,
    inverted_index::{IndexCollation, IndexFile, InvertedIndex, InvertedIndexIterator},
};

use crate::api::tables;

/// Largest merged file, in steps.
pub const DEFAULT_MAX_SPAN_STEPS: u64 = 32;

const SCHEMA_VERSION: u64 = 1;
const METADATA_FILENAME: &str = "archive.json";

/// Seven independent data streams: three domains, four inverted indices.
const STREAM_COUNT: usize = 7;

/// One merge opportunity: concatenate every file inside `[from, to)` into a
/// single file covering the whole range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeRange {
    pub needs_merge: bool,
    pub from: u64,
    pub to: u64,
}

/// Merge opportunities across all seven streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ranges {
    pub accounts: DomainRanges,
    pub storage: DomainRanges,
    pub code: DomainRanges,
    pub log_addrs: MergeRange,
    pub log_topics: MergeRange,
    pub traces_from: MergeRange,
    pub traces_to: MergeRange,
}

impl Ranges {
    /// Whether any stream still has files to merge.
    pub fn any(&self) -> bool {
        self.accounts.any()
            || self.storage.any()
            || self.code.any()
            || self.log_addrs.needs_merge
            || self.log_topics.needs_merge
            || self.traces_from.needs_merge
            || self.traces_to.needs_merge
    }
}

/// Size-tiered merge selection over one stream's file ranges (ascending by
/// end txNum). A file of length `2^k` steps must start at a multiple of
/// `2^k` steps; the candidate span of a file ending at step `e` is therefore
/// the largest power of two dividing `e`, capped at `max_span`. Among
/// eligible ranges the earliest wins.
pub(crate) fn compute_merge_range(
    ranges: &[(u64, u64)],
    step: u64,
    max_end_tx: u64,
    max_span: u64,
) -> MergeRange {
    let mut out = MergeRange::default();
    for &(start, end) in ranges {
        if end > max_end_tx {
            break;
        }
        let end_step = end / step;
        let span_step = end_step & end_step.wrapping_neg();
        let span = (span_step * step).min(max_span);
        let from = end.saturating_sub(span);
        if from < start && (!out.needs_merge || from < out.from) {
            out = MergeRange {
                needs_merge: true,
                from,
                to: end,
            };
        }
    }
    out
}

/// Aggregated file-lookup counters, see
/// [`Aggregator::get_and_reset_stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilesStats {
    pub file_queries: u64,
    pub file_hits: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveMetadata {
    schema_version: u64,
    aggregation_step: u64,
}

fn validate_metadata(dir: &Path, aggregation_step: u64) -> Result<(), StoreError> {
    let path = dir.join(METADATA_FILENAME);
    if !path.exists() {
        let metadata = ArchiveMetadata {
            schema_version: SCHEMA_VERSION,
            aggregation_step,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
        return Ok(());
    }
    let metadata: ArchiveMetadata = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    if metadata.schema_version != SCHEMA_VERSION {
        return Err(StoreError::IncompatibleSchemaVersion {
            found: metadata.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    if metadata.aggregation_step != aggregation_step {
        return Err(StoreError::StepMismatch {
            found: metadata.aggregation_step,
            expected: aggregation_step,
        });
    }
    Ok(())
}

/// Everything collated from the mutable store for one step, across all
/// seven streams. Transient; dropping it releases the memory.
struct AggCollation {
    accounts: DomainCollation,
    storage: DomainCollation,
    code: DomainCollation,
    log_addrs: IndexCollation,
    log_topics: IndexCollation,
    traces_from: IndexCollation,
    traces_to: IndexCollation,
}

/// Built-but-not-yet-integrated files of one freeze. Any field may be absent
/// on a failed build; [`AggStaticFiles::close_and_remove`] releases whatever
/// exists and is idempotent.
#[derive(Default)]
struct AggStaticFiles {
    accounts: Option<DomainFile>,
    storage: Option<DomainFile>,
    code: Option<DomainFile>,
    log_addrs: Option<IndexFile>,
    log_topics: Option<IndexFile>,
    traces_from: Option<IndexFile>,
    traces_to: Option<IndexFile>,
}

impl AggStaticFiles {
    fn close_and_remove(&mut self) {
        for file in [
            self.accounts.take(),
            self.storage.take(),
            self.code.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = file.delete_from_disk();
        }
        for file in [
            self.log_addrs.take(),
            self.log_topics.take(),
            self.traces_from.take(),
            self.traces_to.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = file.delete_from_disk();
        }
    }
}

/// Files selected as merge inputs. A borrowed view: ownership stays with the
/// per-stream lists until the merged outputs are integrated.
#[derive(Default)]
struct SelectedStaticFiles {
    accounts: Vec<Arc<DomainFile>>,
    storage: Vec<Arc<DomainFile>>,
    code: Vec<Arc<DomainFile>>,
    log_addrs: Vec<Arc<IndexFile>>,
    log_topics: Vec<Arc<IndexFile>>,
    traces_from: Vec<Arc<IndexFile>>,
    traces_to: Vec<Arc<IndexFile>>,
}

/// Merged outputs of one merge round. Streams that had nothing to merge stay
/// absent; [`MergedFiles::close_and_remove`] releases whatever exists and is
/// idempotent.
#[derive(Default)]
struct MergedFiles {
    accounts: Option<DomainFile>,
    storage: Option<DomainFile>,
    code: Option<DomainFile>,
    log_addrs: Option<IndexFile>,
    log_topics: Option<IndexFile>,
    traces_from: Option<IndexFile>,
    traces_to: Option<IndexFile>,
}

impl MergedFiles {
    fn close_and_remove(&mut self) {
        for file in [
            self.accounts.take(),
            self.storage.take(),
            self.code.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = file.delete_from_disk();
        }
        for file in [
            self.log_addrs.take(),
            self.log_topics.take(),
            self.traces_from.take(),
            self.traces_to.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = file.delete_from_disk();
        }
    }
}

/// The state archive. See the crate docs for the overall model.
#[derive(Debug)]
pub struct Aggregator {
    aggregation_step: u64,
    max_span: u64,
    accounts: Domain,
    storage: Domain,
    code: Domain,
    log_addrs: InvertedIndex,
    log_topics: InvertedIndex,
    traces_from: InvertedIndex,
    traces_to: InvertedIndex,
    tx_num: u64,
    /// Composition buffer for `address ++ location` storage keys. Part of the
    /// single-writer state; [`AggregatorContext`] carries its own.
    key_buf: Vec<u8>,
}

impl Aggregator {
    /// Opens the archive in `dir`, creating it if needed. Each stream keeps
    /// its files in its own subdirectory and rebuilds its file list by
    /// rescanning it.
    pub fn new(dir: &Path, aggregation_step: u64) -> Result<Self, StoreError> {
        if aggregation_step == 0 {
            return Err(StoreError::Custom(
                "aggregation step must be positive".to_string(),
            ));
        }
        std::fs::create_dir_all(dir)?;
        validate_metadata(dir, aggregation_step)?;

        let open_domain = |name: &'static str, tables, compress| {
            Domain::open(&dir.join(name), name, tables, compress, aggregation_step)
        };
        let open_index = |name: &'static str, tables| {
            InvertedIndex::open(&dir.join(name), name, tables, aggregation_step)
        };

        let archive = Self {
            aggregation_step,
            max_span: DEFAULT_MAX_SPAN_STEPS * aggregation_step,
            accounts: open_domain("accounts", tables::ACCOUNTS_TABLES, false)?,
            storage: open_domain("storage", tables::STORAGE_TABLES, false)?,
            code: open_domain("code", tables::CODE_TABLES, true)?,
            log_addrs: open_index("log_addrs", tables::LOG_ADDRS_TABLES)?,
            log_topics: open_index("log_topics", tables::LOG_TOPICS_TABLES)?,
            traces_from: open_index("traces_from", tables::TRACES_FROM_TABLES)?,
            traces_to: open_index("traces_to", tables::TRACES_TO_TABLES)?,
            tx_num: 0,
            key_buf: Vec::new(),
        };
        info!(
            dir = %dir.display(),
            aggregation_step,
            frozen_up_to = archive.end_tx_num_minimax()?,
            "opened state archive"
        );
        Ok(archive)
    }

    /// Rebinds every stream to a new read-write KV transaction.
    pub fn set_tx(&mut self, tx: Arc<dyn KvTransaction>) {
        self.accounts.set_tx(tx.clone());
        self.storage.set_tx(tx.clone());
        self.code.set_tx(tx.clone());
        self.log_addrs.set_tx(tx.clone());
        self.log_topics.set_tx(tx.clone());
        self.traces_from.set_tx(tx.clone());
        self.traces_to.set_tx(tx);
    }

    /// Advances the logical clock; subsequent writes are stamped with
    /// `tx_num`.
    pub fn set_tx_num(&mut self, tx_num: u64) {
        self.tx_num = tx_num;
        self.accounts.set_tx_num(tx_num);
        self.storage.set_tx_num(tx_num);
        self.code.set_tx_num(tx_num);
        self.log_addrs.set_tx_num(tx_num);
        self.log_topics.set_tx_num(tx_num);
        self.traces_from.set_tx_num(tx_num);
        self.traces_to.set_tx_num(tx_num);
    }

    pub fn update_account_data(&mut self, addr: &Address, data: &[u8]) -> Result<(), StoreError> {
        self.accounts.put(addr.as_bytes(), data)
    }

    /// Empty code deletes the entry.
    pub fn update_account_code(&mut self, addr: &Address, code: &[u8]) -> Result<(), StoreError> {
        if code.is_empty() {
            self.code.delete(addr.as_bytes())
        } else {
            self.code.put(addr.as_bytes(), code)
        }
    }

    /// Deletes the account, its code and every live storage slot under it.
    /// All three deletions are attempted; the first error is returned.
    pub fn delete_account(&mut self, addr: &Address) -> Result<(), StoreError> {
        let mut first_err = None;
        if let Err(e) = self.accounts.delete(addr.as_bytes()) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.code.delete(addr.as_bytes()) {
            first_err.get_or_insert(e);
        }
        let mut slots = Vec::new();
        let collect = self.storage.for_each_prefix(addr.as_bytes(), &mut |key, _| {
            slots.push(key.to_vec());
            Ok(())
        });
        match collect {
            Err(e) => {
                first_err.get_or_insert(e);
            }
            Ok(()) => {
                for key in slots {
                    if let Err(e) = self.storage.delete(&key) {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Empty value deletes the slot.
    pub fn write_account_storage(
        &mut self,
        addr: &Address,
        location: &H256,
        value: &[u8],
    ) -> Result<(), StoreError> {
        compose_storage_key(&mut self.key_buf, addr, location);
        if value.is_empty() {
            self.storage.delete(&self.key_buf)
        } else {
            self.storage.put(&self.key_buf, value)
        }
    }

    pub fn add_log_addr(&mut self, addr: &Address) -> Result<(), StoreError> {
        self.log_addrs.add(addr.as_bytes())
    }

    pub fn add_log_topic(&mut self, topic: &H256) -> Result<(), StoreError> {
        self.log_topics.add(topic.as_bytes())
    }

    pub fn add_trace_from(&mut self, addr: &Address) -> Result<(), StoreError> {
        self.traces_from.add(addr.as_bytes())
    }

    pub fn add_trace_to(&mut self, addr: &Address) -> Result<(), StoreError> {
        self.traces_to.add(addr.as_bytes())
    }

    pub fn read_account_data(&self, addr: &Address) -> Result<Option<Bytes>, StoreError> {
        Ok(self.accounts.get(addr.as_bytes())?.map(Bytes::from))
    }

    /// Account value as of `tx_num`: the latest version written at or before
    /// it.
    pub fn read_account_data_before_tx_num(
        &self,
        addr: &Address,
        tx_num: u64,
    ) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .accounts
            .get_before_tx_num(addr.as_bytes(), tx_num)?
            .map(Bytes::from))
    }

    pub fn read_account_storage(
        &mut self,
        addr: &Address,
        location: &H256,
    ) -> Result<Option<Bytes>, StoreError> {
        compose_storage_key(&mut self.key_buf, addr, location);
        Ok(self.storage.get(&self.key_buf)?.map(Bytes::from))
    }

    pub fn read_account_storage_before_tx_num(
        &mut self,
        addr: &Address,
        location: &H256,
        tx_num: u64,
    ) -> Result<Option<Bytes>, StoreError> {
        compose_storage_key(&mut self.key_buf, addr, location);
        Ok(self
            .storage
            .get_before_tx_num(&self.key_buf, tx_num)?
            .map(Bytes::from))
    }

    pub fn read_account_code(&self, addr: &Address) -> Result<Option<Bytes>, StoreError> {
        Ok(self.code.get(addr.as_bytes())?.map(Bytes::from))
    }

    pub fn read_account_code_before_tx_num(
        &self,
        addr: &Address,
        tx_num: u64,
    ) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .code
            .get_before_tx_num(addr.as_bytes(), tx_num)?
            .map(Bytes::from))
    }

    pub fn read_account_code_size(&self, addr: &Address) -> Result<usize, StoreError> {
        Ok(self
            .code
            .get(addr.as_bytes())?
            .map_or(0, |code| code.len()))
    }

    /// TxNums in `[start_tx, end_tx)` at which logs were emitted from `addr`.
    pub fn log_addr_iterator(
        &self,
        addr: &Address,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<InvertedIndexIterator, StoreError> {
        self.log_addrs.iter_range(addr.as_bytes(), start_tx, end_tx)
    }

    /// TxNums in `[start_tx, end_tx)` at which logs carried `topic`.
    pub fn log_topic_iterator(
        &self,
        topic: &H256,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<InvertedIndexIterator, StoreError> {
        self.log_topics.iter_range(topic.as_bytes(), start_tx, end_tx)
    }

    /// TxNums in `[start_tx, end_tx)` at which `addr` sent a trace.
    pub fn trace_from_iterator(
        &self,
        addr: &Address,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<InvertedIndexIterator, StoreError> {
        self.traces_from.iter_range(addr.as_bytes(), start_tx, end_tx)
    }

    /// TxNums in `[start_tx, end_tx)` at which `addr` received a trace.
    pub fn trace_to_iterator(
        &self,
        addr: &Address,
        start_tx: u64,
        end_tx: u64,
    ) -> Result<InvertedIndexIterator, StoreError> {
        self.traces_to.iter_range(addr.as_bytes(), start_tx, end_tx)
    }

    /// Minimum over all streams of the largest file-covered txNum: the global
    /// durability horizon. Everything below it is fully represented in
    /// static files.
    pub fn end_tx_num_minimax(&self) -> Result<u64, StoreError> {
        let mut minimax = u64::MAX;
        for end in [
            self.accounts.end_tx_num_on_disk()?,
            self.storage.end_tx_num_on_disk()?,
            self.code.end_tx_num_on_disk()?,
            self.log_addrs.end_tx_num_on_disk()?,
            self.log_topics.end_tx_num_on_disk()?,
            self.traces_from.end_tx_num_on_disk()?,
            self.traces_to.end_tx_num_on_disk()?,
        ] {
            minimax = minimax.min(end);
        }
        Ok(minimax)
    }

    /// Aggregates and resets the file-lookup counters of the three domains.
    /// Inverted-index lookups are not part of this figure.
    pub fn get_and_reset_stats(&self) -> FilesStats {
        let mut out = FilesStats::default();
        for domain in [&self.accounts, &self.storage, &self.code] {
            let (queries, hits) = domain.take_stats();
            out.file_queries += queries;
            out.file_hits += hits;
        }
        out
    }

    /// Read-only snapshot for reconstruction scans, independent of the
    /// writer.
    pub fn make_context(&self) -> Result<AggregatorContext, StoreError> {
        AggregatorContext::new(&self.accounts, &self.storage, &self.code)
    }

    /// Whether the current txNum is the last one of its step.
    pub fn ready_to_finish_tx(&self) -> bool {
        (self.tx_num + 1) % self.aggregation_step == 0
    }

    /// Called at every transaction boundary. When a step has just completed,
    /// freezes the previous step (the newest step is always held back) and
    /// drives merges until no stream has work left. On error every artifact
    /// produced so far in the failing stage is released; the mutable store
    /// keeps whatever would have been pruned and a later successful cycle
    /// redoes the work.
    pub fn finish_tx(&mut self) -> Result<(), StoreError> {
        if !self.ready_to_finish_tx() {
            return Ok(());
        }
        let closed_steps = self.tx_num / self.aggregation_step;
        let Some(step) = closed_steps.checked_sub(1) else {
            return Ok(());
        };
        let tx_from = step * self.aggregation_step;
        let tx_to = (step + 1) * self.aggregation_step;
        debug!(step, tx_from, tx_to, "freezing step");

        let collation = AggCollation {
            accounts: self.accounts.collate(tx_from, tx_to)?,
            storage: self.storage.collate(tx_from, tx_to)?,
            code: self.code.collate(tx_from, tx_to)?,
            log_addrs: self.log_addrs.collate(tx_from, tx_to)?,
            log_topics: self.log_topics.collate(tx_from, tx_to)?,
            traces_from: self.traces_from.collate(tx_from, tx_to)?,
            traces_to: self.traces_to.collate(tx_from, tx_to)?,
        };

        let mut built = self.build_files(&collation)?;
        drop(collation);

        let (
            Some(accounts),
            Some(storage),
            Some(code),
            Some(log_addrs),
            Some(log_topics),
            Some(traces_from),
            Some(traces_to),
        ) = (
            built.accounts.take(),
            built.storage.take(),
            built.code.take(),
            built.log_addrs.take(),
            built.log_topics.take(),
            built.traces_from.take(),
            built.traces_to.take(),
        )
        else {
            built.close_and_remove();
            return Err(StoreError::Custom(
                "file build finished without artifacts".to_string(),
            ));
        };
        self.accounts.integrate_files(accounts)?;
        self.storage.integrate_files(storage)?;
        self.code.integrate_files(code)?;
        self.log_addrs.integrate_files(log_addrs)?;
        self.log_topics.integrate_files(log_topics)?;
        self.traces_from.integrate_files(traces_from)?;
        self.traces_to.integrate_files(traces_to)?;

        self.accounts.prune(tx_from, tx_to)?;
        self.storage.prune(tx_from, tx_to)?;
        self.code.prune(tx_from, tx_to)?;
        self.log_addrs.prune(tx_from, tx_to)?;
        self.log_topics.prune(tx_from, tx_to)?;
        self.traces_from.prune(tx_from, tx_to)?;
        self.traces_to.prune(tx_from, tx_to)?;
        info!(step, tx_from, tx_to, "froze step into static files");

        loop {
            let minimax = self.end_tx_num_minimax()?;
            let ranges = self.find_merge_ranges(minimax)?;
            if !ranges.any() {
                break;
            }
            debug!(?ranges, "merging static files");
            let selected = self.static_files_in_range(&ranges)?;
            let merged = self.merge_files(&ranges, &selected)?;
            self.integrate_merged_files(&selected, merged)?;
            self.delete_files(&selected)?;
        }
        Ok(())
    }

    fn find_merge_ranges(&self, max_end_tx: u64) -> Result<Ranges, StoreError> {
        Ok(Ranges {
            accounts: self.accounts.find_merge_range(max_end_tx, self.max_span)?,
            storage: self.storage.find_merge_range(max_end_tx, self.max_span)?,
            code: self.code.find_merge_range(max_end_tx, self.max_span)?,
            log_addrs: self.log_addrs.find_merge_range(max_end_tx, self.max_span)?,
            log_topics: self.log_topics.find_merge_range(max_end_tx, self.max_span)?,
            traces_from: self.traces_from.find_merge_range(max_end_tx, self.max_span)?,
            traces_to: self.traces_to.find_merge_range(max_end_tx, self.max_span)?,
        })
    }

    fn static_files_in_range(&self, ranges: &Ranges) -> Result<SelectedStaticFiles, StoreError> {
        let mut selected = SelectedStaticFiles::default();
        if ranges.accounts.any() {
            let r = ranges.accounts.values;
            selected.accounts = self.accounts.files_in_range(r.from, r.to)?;
        }
        if ranges.storage.any() {
            let r = ranges.storage.values;
            selected.storage = self.storage.files_in_range(r.from, r.to)?;
        }
        if ranges.code.any() {
            let r = ranges.code.values;
            selected.code = self.code.files_in_range(r.from, r.to)?;
        }
        if ranges.log_addrs.needs_merge {
            selected.log_addrs = self
                .log_addrs
                .files_in_range(ranges.log_addrs.from, ranges.log_addrs.to)?;
        }
        if ranges.log_topics.needs_merge {
            selected.log_topics = self
                .log_topics
                .files_in_range(ranges.log_topics.from, ranges.log_topics.to)?;
        }
        if ranges.traces_from.needs_merge {
            selected.traces_from = self
                .traces_from
                .files_in_range(ranges.traces_from.from, ranges.traces_from.to)?;
        }
        if ranges.traces_to.needs_merge {
            selected.traces_to = self
                .traces_to
                .files_in_range(ranges.traces_to.from, ranges.traces_to.to)?;
        }
        Ok(selected)
    }

    /// Builds the static files of one step, one task per stream. All seven
    /// tasks run to completion even if one fails; errors funnel through a
    /// bounded channel and the last one received surfaces, after every
    /// successful sibling's artifacts have been removed.
    fn build_files(&self, collation: &AggCollation) -> Result<AggStaticFiles, StoreError> {
        let (err_tx, err_rx) = sync_channel::<StoreError>(STREAM_COUNT);
        let mut built = AggStaticFiles::default();

        thread::scope(|scope| {
            let accounts = spawn_task(scope, "archive_build_accounts", &err_tx, || {
                self.accounts.build_files(&collation.accounts)
            });
            let storage = spawn_task(scope, "archive_build_storage", &err_tx, || {
                self.storage.build_files(&collation.storage)
            });
            let code = spawn_task(scope, "archive_build_code", &err_tx, || {
                self.code.build_files(&collation.code)
            });
            let log_addrs = spawn_task(scope, "archive_build_log_addrs", &err_tx, || {
                self.log_addrs.build_files(&collation.log_addrs)
            });
            let log_topics = spawn_task(scope, "archive_build_log_topics", &err_tx, || {
                self.log_topics.build_files(&collation.log_topics)
            });
            let traces_from = spawn_task(scope, "archive_build_traces_from", &err_tx, || {
                self.traces_from.build_files(&collation.traces_from)
            });
            let traces_to = spawn_task(scope, "archive_build_traces_to", &err_tx, || {
                self.traces_to.build_files(&collation.traces_to)
            });

            built.accounts = accounts.and_then(|h| join_task(h, &err_tx));
            built.storage = storage.and_then(|h| join_task(h, &err_tx));
            built.code = code.and_then(|h| join_task(h, &err_tx));
            built.log_addrs = log_addrs.and_then(|h| join_task(h, &err_tx));
            built.log_topics = log_topics.and_then(|h| join_task(h, &err_tx));
            built.traces_from = traces_from.and_then(|h| join_task(h, &err_tx));
            built.traces_to = traces_to.and_then(|h| join_task(h, &err_tx));
        });

        if let Some(err) = last_error(&err_rx) {
            built.close_and_remove();
            return Err(err);
        }
        Ok(built)
    }

    /// Merges every stream flagged in `ranges`, one task per stream, with the
    /// same join-all-then-release discipline as the build fan-out.
    fn merge_files(
        &self,
        ranges: &Ranges,
        selected: &SelectedStaticFiles,
    ) -> Result<MergedFiles, StoreError> {
        let (err_tx, err_rx) = sync_channel::<StoreError>(STREAM_COUNT);
        let mut merged = MergedFiles::default();

        thread::scope(|scope| {
            let accounts = ranges.accounts.any().then(|| {
                let r = ranges.accounts.values;
                spawn_task(scope, "archive_merge_accounts", &err_tx, move || {
                    self.accounts.merge_files(&selected.accounts, r.from, r.to)
                })
            });
            let storage = ranges.storage.any().then(|| {
                let r = ranges.storage.values;
                spawn_task(scope, "archive_merge_storage", &err_tx, move || {
                    self.storage.merge_files(&selected.storage, r.from, r.to)
                })
            });
            let code = ranges.code.any().then(|| {
                let r = ranges.code.values;
                spawn_task(scope, "archive_merge_code", &err_tx, move || {
                    self.code.merge_files(&selected.code, r.from, r.to)
                })
            });
            let log_addrs = ranges.log_addrs.needs_merge.then(|| {
                let r = ranges.log_addrs;
                spawn_task(scope, "archive_merge_log_addrs", &err_tx, move || {
                    self.log_addrs.merge_files(&selected.log_addrs, r.from, r.to)
                })
            });
            let log_topics = ranges.log_topics.needs_merge.then(|| {
                let r = ranges.log_topics;
                spawn_task(scope, "archive_merge_log_topics", &err_tx, move || {
                    self.log_topics.merge_files(&selected.log_topics, r.from, r.to)
                })
            });
            let traces_from = ranges.traces_from.needs_merge.then(|| {
                let r = ranges.traces_from;
                spawn_task(scope, "archive_merge_traces_from", &err_tx, move || {
                    self.traces_from.merge_files(&selected.traces_from, r.from, r.to)
                })
            });
            let traces_to = ranges.traces_to.needs_merge.then(|| {
                let r = ranges.traces_to;
                spawn_task(scope, "archive_merge_traces_to", &err_tx, move || {
                    self.traces_to.merge_files(&selected.traces_to, r.from, r.to)
                })
            });

            merged.accounts = accounts.flatten().and_then(|h| join_task(h, &err_tx));
            merged.storage = storage.flatten().and_then(|h| join_task(h, &err_tx));
            merged.code = code.flatten().and_then(|h| join_task(h, &err_tx));
            merged.log_addrs = log_addrs.flatten().and_then(|h| join_task(h, &err_tx));
            merged.log_topics = log_topics.flatten().and_then(|h| join_task(h, &err_tx));
            merged.traces_from = traces_from.flatten().and_then(|h| join_task(h, &err_tx));
            merged.traces_to = traces_to.flatten().and_then(|h| join_task(h, &err_tx));
        });

        if let Some(err) = last_error(&err_rx) {
            merged.close_and_remove();
            return Err(err);
        }
        Ok(merged)
    }

    /// Atomically swaps merged outputs in for their inputs, stream by
    /// stream.
    fn integrate_merged_files(
        &mut self,
        selected: &SelectedStaticFiles,
        mut merged: MergedFiles,
    ) -> Result<(), StoreError> {
        if let Some(file) = merged.accounts.take() {
            self.accounts.integrate_merged_files(&selected.accounts, file)?;
        }
        if let Some(file) = merged.storage.take() {
            self.storage.integrate_merged_files(&selected.storage, file)?;
        }
        if let Some(file) = merged.code.take() {
            self.code.integrate_merged_files(&selected.code, file)?;
        }
        if let Some(file) = merged.log_addrs.take() {
            self.log_addrs.integrate_merged_files(&selected.log_addrs, file)?;
        }
        if let Some(file) = merged.log_topics.take() {
            self.log_topics.integrate_merged_files(&selected.log_topics, file)?;
        }
        if let Some(file) = merged.traces_from.take() {
            self.traces_from.integrate_merged_files(&selected.traces_from, file)?;
        }
        if let Some(file) = merged.traces_to.take() {
            self.traces_to.integrate_merged_files(&selected.traces_to, file)?;
        }
        Ok(())
    }

    /// Unlinks the merged-away inputs.
    fn delete_files(&self, selected: &SelectedStaticFiles) -> Result<(), StoreError> {
        self.accounts.delete_files(&selected.accounts)?;
        self.storage.delete_files(&selected.storage)?;
        self.code.delete_files(&selected.code)?;
        self.log_addrs.delete_files(&selected.log_addrs)?;
        self.log_topics.delete_files(&selected.log_topics)?;
        self.traces_from.delete_files(&selected.traces_from)?;
        self.traces_to.delete_files(&selected.traces_to)?;
        Ok(())
    }
}

/// Rebuilds the `address ++ location` composite key in place.
pub(crate) fn compose_storage_key(buf: &mut Vec<u8>, addr: &Address, location: &H256) {
    buf.clear();
    buf.extend_from_slice(addr.as_bytes());
    buf.extend_from_slice(location.as_bytes());
}

/// Spawns one named build/merge task. A spawn failure is reported through the
/// error channel like a task failure, so the caller's join loop stays
/// uniform.
fn spawn_task<'scope, T: Send + 'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    name: &str,
    err_tx: &SyncSender<StoreError>,
    task: impl FnOnce() -> Result<T, StoreError> + Send + 'scope,
) -> Option<thread::ScopedJoinHandle<'scope, Option<T>>> {
    let task_err_tx = err_tx.clone();
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn_scoped(scope, move || match task() {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                let _ = task_err_tx.send(err);
                None
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            let _ = err_tx.send(StoreError::Custom(format!("failed to spawn {name}: {err}")));
            None
        }
    }
}

fn join_task<T>(
    handle: thread::ScopedJoinHandle<'_, Option<T>>,
    err_tx: &SyncSender<StoreError>,
) -> Option<T> {
    match handle.join() {
        Ok(artifact) => artifact,
        Err(_) => {
            let _ = err_tx.send(StoreError::Custom("archive task panicked".to_string()));
            None
        }
    }
}

/// Drains the error channel, keeping the last error received.
fn last_error(err_rx: &Receiver<StoreError>) -> Option<StoreError> {
    let mut last = None;
    while let Ok(err) = err_rx.try_recv() {
        last = Some(err);
    }
    last
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;

    #[test]
    fn merge_range_prefers_aligned_spans() {
        // four single-step files, step 4
        let files = [(0, 4), (4, 8), (8, 12), (12, 16)];
        let r = compute_merge_range(&files, 4, 16, 128);
        assert!(r.needs_merge);
        assert_eq!((r.from, r.to), (0, 8));

        // after merging [0, 8) the next candidate covers [0, 16)
        let files = [(0, 8), (8, 12), (12, 16)];
        let r = compute_merge_range(&files, 4, 16, 128);
        assert_eq!((r.from, r.to), (0, 16));
    }

    #[test]
    fn merge_range_respects_durability_horizon() {
        let files = [(0, 4), (4, 8)];
        let r = compute_merge_range(&files, 4, 4, 128);
        assert!(!r.needs_merge);
    }

    #[test]
    fn merge_range_respects_max_span() {
        let files = [(0, 4), (4, 8)];
        let r = compute_merge_range(&files, 4, 8, 4);
        assert!(!r.needs_merge);
    }

    #[test]
    fn merge_range_is_empty_for_single_merged_file() {
        let r = compute_merge_range(&[(0, 8)], 4, 8, 128);
        assert!(!r.needs_merge);
    }

    #[test]
    fn metadata_rejects_step_change() {
        let dir = tempfile::tempdir().unwrap();
        drop(Aggregator::new(dir.path(), 4).unwrap());
        assert!(matches!(
            Aggregator::new(dir.path(), 8),
            Err(StoreError::StepMismatch {
                found: 4,
                expected: 8
            })
        ));
        assert!(Aggregator::new(dir.path(), 4).is_ok());
    }

    #[test]
    fn rejects_zero_step() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Aggregator::new(dir.path(), 0).is_err());
    }

    #[test]
    fn finish_tx_is_a_no_op_off_step_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Aggregator::new(dir.path(), 4).unwrap();
        archive.set_tx(Arc::new(InMemoryBackend::new().begin()));
        archive.set_tx_num(5);
        assert!(!archive.ready_to_finish_tx());
        archive.finish_tx().unwrap();
        assert_eq!(archive.end_tx_num_minimax().unwrap(), 0);
    }

    #[test]
    fn first_step_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Aggregator::new(dir.path(), 4).unwrap();
        archive.set_tx(Arc::new(InMemoryBackend::new().begin()));
        let addr = Address::from_low_u64_be(1);
        archive.set_tx_num(3);
        archive.update_account_data(&addr, b"v").unwrap();
        assert!(archive.ready_to_finish_tx());
        archive.finish_tx().unwrap();
        assert_eq!(archive.end_tx_num_minimax().unwrap(), 0);
        assert_eq!(
            archive.read_account_data(&addr).unwrap(),
            Some(Bytes::from_static(b"v"))
        );
    }

    #[test]
    fn code_size_of_missing_account_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Aggregator::new(dir.path(), 4).unwrap();
        archive.set_tx(Arc::new(InMemoryBackend::new().begin()));
        assert_eq!(
            archive
                .read_account_code_size(&Address::from_low_u64_be(9))
                .unwrap(),
            0
        );
    }
}
