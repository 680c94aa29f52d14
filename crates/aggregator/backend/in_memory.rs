//! In-memory KV backend.
//!
//! Non-persistent, suitable for tests and dev nodes. Transactions share the
//! backing tables directly, so "commit" is implicit; restarts lose all data
//! anyway.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{api::KvTransaction, error::StoreError};

type Tables = HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default, Clone)]
pub struct InMemoryBackend(Arc<Mutex<Tables>>);

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a read-write transaction. Writes land in the shared tables
    /// immediately.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction(self.0.clone())
    }
}

impl Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend").finish()
    }
}

#[derive(Clone)]
pub struct InMemoryTransaction(Arc<Mutex<Tables>>);

impl InMemoryTransaction {
    fn inner(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.0
            .lock()
            .map_err(|_| StoreError::Custom("failed to lock the kv tables".to_string()))
    }
}

impl KvTransaction for InMemoryTransaction {
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner()?
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn put(&self, table: &'static str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner()?
            .entry(table)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, table: &'static str, key: &[u8]) -> Result<(), StoreError> {
        if let Some(t) = self.inner()?.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    fn range(
        &self,
        table: &'static str,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let inner = self.inner()?;
        let Some(t) = inner.get(table) else {
            return Ok(Vec::new());
        };
        let upper = match to {
            Some(to) => Bound::Excluded(to.to_vec()),
            None => Bound::Unbounded,
        };
        Ok(t.range((Bound::Included(from.to_vec()), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction").finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::api::prefix_range;

    #[test]
    fn put_get_delete_roundtrip() {
        let tx = InMemoryBackend::new().begin();
        tx.put("t", b"k", b"v").unwrap();
        assert_eq!(tx.get("t", b"k").unwrap(), Some(b"v".to_vec()));
        tx.delete("t", b"k").unwrap();
        assert_eq!(tx.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn transactions_share_tables() {
        let backend = InMemoryBackend::new();
        backend.begin().put("t", b"k", b"v").unwrap();
        assert_eq!(backend.begin().get("t", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn range_is_half_open_and_sorted() {
        let tx = InMemoryBackend::new().begin();
        for k in [b"a", b"b", b"c", b"d"] {
            tx.put("t", k, b"").unwrap();
        }
        let got = tx.range("t", b"b", Some(b"d")).unwrap();
        let keys: Vec<_> = got.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn prefix_range_scans_only_prefix() {
        let tx = InMemoryBackend::new().begin();
        tx.put("t", b"aa1", b"").unwrap();
        tx.put("t", b"aa2", b"").unwrap();
        tx.put("t", b"ab1", b"").unwrap();
        let got = prefix_range(&tx, "t", b"aa").unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn range_on_missing_table_is_empty() {
        let tx = InMemoryBackend::new().begin();
        assert!(tx.range("missing", b"", None).unwrap().is_empty());
    }
}
