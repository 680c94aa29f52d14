//! Read-only snapshots for state reconstruction.
//!
//! An [`AggregatorContext`] bundles per-domain file snapshots so a
//! reconstruction loop can replay a historical block range against the state
//! as it was just before a given txNum, independently of the single writer
//! and of other contexts. Contexts only see static files; the mutable
//! overlay belongs to the writer's transaction.

use std::sync::Arc;

use bytes::Bytes;
use ethereum_types::{Address, H256};

use crate::{
    compose_storage_key,
    domain::{Domain, DomainFile, history_seek, history_version_at, non_empty},
    error::StoreError,
};

/// Result of a files-only point read.
///
/// `from_files` disambiguates "the files hold no version of this key at all"
/// from "the files record a deletion": a deletion yields
/// `{ value: None, from_files: true, state_tx_num: <txNum of the delete> }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoStateRead {
    pub value: Option<Bytes>,
    pub from_files: bool,
    pub state_tx_num: u64,
}

/// File snapshot of one domain, newest file first.
pub struct DomainContext {
    files: Vec<Arc<DomainFile>>,
}

impl DomainContext {
    pub(crate) fn new(domain: &Domain) -> Result<Self, StoreError> {
        Ok(Self {
            files: domain.files_newest_first()?,
        })
    }

    /// Point as-of read against the files only: the latest file-resident
    /// version with txNum `<= tx_num`.
    pub fn read_no_state(&self, key: &[u8], tx_num: u64) -> Result<NoStateRead, StoreError> {
        for file in &self.files {
            if file.start_tx > tx_num {
                continue;
            }
            if let Some(pos) = history_seek(&file.history, key, tx_num) {
                let state_tx_num = history_version_at(&file.history, pos, key.len());
                let value = non_empty(file.history.value_at(pos)?).map(Bytes::from);
                return Ok(NoStateRead {
                    value,
                    from_files: true,
                    state_tx_num,
                });
            }
        }
        Ok(NoStateRead {
            value: None,
            from_files: false,
            state_tx_num: 0,
        })
    }

    /// Largest txNum at which `key` was modified in the files.
    pub fn max_tx_num(&self, key: &[u8]) -> Option<u64> {
        for file in &self.files {
            if let Some(pos) = history_seek(&file.history, key, u64::MAX) {
                return Some(history_version_at(&file.history, pos, key.len()));
            }
        }
        None
    }

    /// Lazy scan over file-resident keys in `[from_key, to_key)`, yielding
    /// those with activity strictly before `tx_num` together with the txNum
    /// of their latest such version.
    pub fn recon_keys(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> ReconKeysIterator {
        ReconKeysIterator {
            cursors: self
                .files
                .iter()
                .map(|file| file.values.lower_bound(from_key))
                .collect(),
            files: self.files.clone(),
            to_key: to_key.map(|k| k.to_vec()),
            tx_num,
        }
    }

    /// Lazy iterator over historical values snapshot-consistent with
    /// `tx_num`: for every key in `[from_key, to_key)`, the value visible
    /// just before `tx_num`. Keys that were deleted, or born later, are
    /// skipped.
    pub fn history(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> HistoryIterator {
        HistoryIterator {
            inner: self.recon_keys(from_key, to_key, tx_num),
        }
    }
}

/// Reconstruction snapshot across the three domains. Carries its own
/// storage-key buffer, so concurrent contexts never share mutable state.
pub struct AggregatorContext {
    accounts: DomainContext,
    storage: DomainContext,
    code: DomainContext,
    key_buf: Vec<u8>,
}

impl AggregatorContext {
    pub(crate) fn new(
        accounts: &Domain,
        storage: &Domain,
        code: &Domain,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            accounts: DomainContext::new(accounts)?,
            storage: DomainContext::new(storage)?,
            code: DomainContext::new(code)?,
            key_buf: Vec::new(),
        })
    }

    pub fn accounts(&self) -> &DomainContext {
        &self.accounts
    }

    pub fn storage(&self) -> &DomainContext {
        &self.storage
    }

    pub fn code(&self) -> &DomainContext {
        &self.code
    }

    pub fn read_account_data_no_state(
        &self,
        addr: &Address,
        tx_num: u64,
    ) -> Result<NoStateRead, StoreError> {
        self.accounts.read_no_state(addr.as_bytes(), tx_num)
    }

    pub fn read_account_storage_no_state(
        &mut self,
        addr: &Address,
        location: &H256,
        tx_num: u64,
    ) -> Result<NoStateRead, StoreError> {
        compose_storage_key(&mut self.key_buf, addr, location);
        self.storage.read_no_state(&self.key_buf, tx_num)
    }

    pub fn read_account_code_no_state(
        &self,
        addr: &Address,
        tx_num: u64,
    ) -> Result<NoStateRead, StoreError> {
        self.code.read_no_state(addr.as_bytes(), tx_num)
    }

    pub fn max_accounts_tx_num(&self, addr: &Address) -> Option<u64> {
        self.accounts.max_tx_num(addr.as_bytes())
    }

    pub fn max_storage_tx_num(&mut self, addr: &Address, location: &H256) -> Option<u64> {
        compose_storage_key(&mut self.key_buf, addr, location);
        self.storage.max_tx_num(&self.key_buf)
    }

    pub fn max_code_tx_num(&self, addr: &Address) -> Option<u64> {
        self.code.max_tx_num(addr.as_bytes())
    }

    pub fn iterate_accounts_recon_txs(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> ReconKeysIterator {
        self.accounts.recon_keys(from_key, to_key, tx_num)
    }

    pub fn iterate_storage_recon_txs(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> ReconKeysIterator {
        self.storage.recon_keys(from_key, to_key, tx_num)
    }

    pub fn iterate_code_recon_txs(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> ReconKeysIterator {
        self.code.recon_keys(from_key, to_key, tx_num)
    }

    pub fn iterate_accounts_history(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> HistoryIterator {
        self.accounts.history(from_key, to_key, tx_num)
    }

    pub fn iterate_storage_history(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> HistoryIterator {
        self.storage.history(from_key, to_key, tx_num)
    }

    pub fn iterate_code_history(
        &self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        tx_num: u64,
    ) -> HistoryIterator {
        self.code.history(from_key, to_key, tx_num)
    }
}

/// Lazy, finite, non-restartable scan over file-resident keys with activity
/// before a txNum. Yields `(key, txNum of the latest version before the
/// bound)` in ascending key order.
pub struct ReconKeysIterator {
    files: Vec<Arc<DomainFile>>,
    cursors: Vec<usize>,
    to_key: Option<Vec<u8>>,
    tx_num: u64,
}

impl ReconKeysIterator {
    /// Smallest in-bounds key any cursor still points at.
    fn next_key(&self) -> Option<Vec<u8>> {
        let mut min_key: Option<Vec<u8>> = None;
        for (file, &pos) in self.files.iter().zip(&self.cursors) {
            if pos >= file.values.len() {
                continue;
            }
            let key = file.values.key_at(pos);
            if let Some(to) = &self.to_key {
                if key >= to.as_slice() {
                    continue;
                }
            }
            if min_key.as_deref().is_none_or(|m| key < m) {
                min_key = Some(key.to_vec());
            }
        }
        min_key
    }

    fn advance_past(&mut self, key: &[u8]) {
        for (file, pos) in self.files.iter().zip(self.cursors.iter_mut()) {
            if *pos < file.values.len() && file.values.key_at(*pos) == key {
                *pos += 1;
            }
        }
    }

    /// Latest version of `key` strictly before the iterator's txNum bound.
    fn version_before(&self, key: &[u8]) -> Option<u64> {
        let bound = self.tx_num.checked_sub(1)?;
        for file in &self.files {
            if file.start_tx > bound {
                continue;
            }
            if let Some(pos) = history_seek(&file.history, key, bound) {
                return Some(history_version_at(&file.history, pos, key.len()));
            }
        }
        None
    }

    fn value_before(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(bound) = self.tx_num.checked_sub(1) else {
            return Ok(None);
        };
        for file in &self.files {
            if file.start_tx > bound {
                continue;
            }
            if let Some(pos) = history_seek(&file.history, key, bound) {
                return Ok(Some(file.history.value_at(pos)?));
            }
        }
        Ok(None)
    }
}

impl Iterator for ReconKeysIterator {
    type Item = (Vec<u8>, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.next_key()?;
            self.advance_past(&key);
            if let Some(version) = self.version_before(&key) {
                return Some((key, version));
            }
        }
    }
}

/// Lazy iterator over `(key, value)` pairs snapshot-consistent with a txNum,
/// in ascending key order.
pub struct HistoryIterator {
    inner: ReconKeysIterator,
}

impl Iterator for HistoryIterator {
    type Item = Result<(Vec<u8>, Bytes), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.inner.next_key()?;
            self.inner.advance_past(&key);
            match self.inner.value_before(&key) {
                Ok(Some(value)) if !value.is_empty() => {
                    return Some(Ok((key, Bytes::from(value))));
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        api::tables::ACCOUNTS_TABLES, backend::in_memory::InMemoryBackend, domain::Domain,
    };
    use std::path::Path;

    const STEP: u64 = 4;

    fn frozen_domain(dir: &Path) -> Domain {
        let mut domain = Domain::open(dir, "accounts", ACCOUNTS_TABLES, false, STEP).unwrap();
        domain.set_tx(Arc::new(InMemoryBackend::new().begin()));
        domain.set_tx_num(0);
        domain.put(b"aaa", b"a0").unwrap();
        domain.set_tx_num(2);
        domain.put(b"bbb", b"b2").unwrap();
        domain.set_tx_num(5);
        domain.put(b"aaa", b"a5").unwrap();
        domain.set_tx_num(6);
        domain.delete(b"bbb").unwrap();
        for step in 0..2 {
            let collation = domain.collate(step * STEP, (step + 1) * STEP).unwrap();
            let file = domain.build_files(&collation).unwrap();
            domain.integrate_files(file).unwrap();
            domain.prune(step * STEP, (step + 1) * STEP).unwrap();
        }
        domain
    }

    #[test]
    fn no_state_read_reports_version_and_origin() {
        let dir = tempfile::tempdir().unwrap();
        let domain = frozen_domain(dir.path());
        let ctx = DomainContext::new(&domain).unwrap();

        let read = ctx.read_no_state(b"aaa", 3).unwrap();
        assert_eq!(read.value, Some(Bytes::from_static(b"a0")));
        assert!(read.from_files);
        assert_eq!(read.state_tx_num, 0);

        let read = ctx.read_no_state(b"aaa", 100).unwrap();
        assert_eq!(read.value, Some(Bytes::from_static(b"a5")));
        assert_eq!(read.state_tx_num, 5);

        // deleted at txNum 6: no value, but file-backed
        let read = ctx.read_no_state(b"bbb", 100).unwrap();
        assert_eq!(read.value, None);
        assert!(read.from_files);
        assert_eq!(read.state_tx_num, 6);

        // never written: not file-backed
        let read = ctx.read_no_state(b"zzz", 100).unwrap();
        assert!(!read.from_files);
        assert_eq!(read.state_tx_num, 0);
    }

    #[test]
    fn max_tx_num_tracks_latest_file_version() {
        let dir = tempfile::tempdir().unwrap();
        let domain = frozen_domain(dir.path());
        let ctx = DomainContext::new(&domain).unwrap();
        assert_eq!(ctx.max_tx_num(b"aaa"), Some(5));
        assert_eq!(ctx.max_tx_num(b"bbb"), Some(6));
        assert_eq!(ctx.max_tx_num(b"zzz"), None);
    }

    #[test]
    fn recon_keys_respect_bounds_and_tx_num() {
        let dir = tempfile::tempdir().unwrap();
        let domain = frozen_domain(dir.path());
        let ctx = DomainContext::new(&domain).unwrap();

        // everything active before txNum 8
        let got: Vec<_> = ctx.recon_keys(b"", None, 8).collect();
        assert_eq!(got, vec![(b"aaa".to_vec(), 5), (b"bbb".to_vec(), 6)]);

        // before txNum 1 only the first write of "aaa" exists
        let got: Vec<_> = ctx.recon_keys(b"", None, 1).collect();
        assert_eq!(got, vec![(b"aaa".to_vec(), 0)]);

        // key range excludes "bbb"
        let got: Vec<_> = ctx.recon_keys(b"", Some(b"bbb"), 8).collect();
        assert_eq!(got, vec![(b"aaa".to_vec(), 5)]);

        // nothing happened before txNum 0
        assert_eq!(ctx.recon_keys(b"", None, 0).count(), 0);
    }

    #[test]
    fn history_iterator_skips_deleted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let domain = frozen_domain(dir.path());
        let ctx = DomainContext::new(&domain).unwrap();

        // just before the delete at txNum 6 both keys are visible
        let got: Vec<_> = ctx.history(b"", None, 6).map(|e| e.unwrap()).collect();
        assert_eq!(
            got,
            vec![
                (b"aaa".to_vec(), Bytes::from_static(b"a5")),
                (b"bbb".to_vec(), Bytes::from_static(b"b2")),
            ]
        );

        // after it only "aaa" remains
        let got: Vec<_> = ctx.history(b"", None, 8).map(|e| e.unwrap()).collect();
        assert_eq!(got, vec![(b"aaa".to_vec(), Bytes::from_static(b"a5"))]);
    }
}
