//! Contract between the archive and the node's transactional KV store.

pub mod tables;

use std::fmt::Debug;

use crate::error::StoreError;

/// A read-write transaction over the node's mutable KV store.
///
/// The caller owns the transaction lifecycle (begin/commit/rollback); the
/// archive only reads and writes through it and is rebound to a fresh
/// transaction via `Aggregator::set_tx`. Implementations must be usable from
/// the build fan-out threads, hence `Send + Sync`.
pub trait KvTransaction: Debug + Send + Sync {
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, table: &'static str, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, table: &'static str, key: &[u8]) -> Result<(), StoreError>;

    /// All entries with `from <= key < to`, ascending. `None` means unbounded
    /// above. Returned as a materialized snapshot; scans issued by the archive
    /// are bounded by one step of history.
    fn range(
        &self,
        table: &'static str,
        from: &[u8],
        to: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// All entries whose key starts with `prefix`, ascending.
pub fn prefix_range(
    tx: &dyn KvTransaction,
    table: &'static str,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    tx.range(table, prefix, next_prefix(prefix).as_deref())
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// `None` when no such key exists (all-0xff prefix): the scan is unbounded.
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::next_prefix;

    #[test]
    fn next_prefix_increments_last_byte() {
        assert_eq!(next_prefix(b"abc"), Some(b"abd".to_vec()));
    }

    #[test]
    fn next_prefix_carries_past_ff() {
        assert_eq!(next_prefix(&[0x61, 0xff]), Some(vec![0x62]));
        assert_eq!(next_prefix(&[0x61, 0xff, 0xff]), Some(vec![0x62]));
    }

    #[test]
    fn next_prefix_all_ff_is_unbounded() {
        assert_eq!(next_prefix(&[0xff, 0xff]), None);
        assert_eq!(next_prefix(&[]), None);
    }
}
