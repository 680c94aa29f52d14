//! Table names used by the mutable side of the state archive.
//!
//! Every stream owns a fixed set of tables in the node's KV store. Domains
//! (accounts, storage, code) keep the current value of each key plus the full
//! per-key version history for the unfrozen steps; inverted indices keep the
//! raw `(txNum, key)` appearances until they are frozen into bitmaps.

/// Current account version table: plain key => [`u8; 8`]
/// - plain key = account address bytes
/// - [`u8; 8`] = `tx_num.to_be_bytes()` of the latest write
pub const ACCOUNTS_KEYS: &str = "accounts_keys";

/// Current account value table: plain key => value bytes (empty = tombstone)
pub const ACCOUNTS_VALS: &str = "accounts_vals";

/// Account change index: `tx_num.to_be_bytes() ++ key` => `[]`
pub const ACCOUNTS_HISTORY_KEYS: &str = "accounts_history_keys";

/// Account version history: `key ++ tx_num.to_be_bytes()` => value written at `tx_num`
pub const ACCOUNTS_HISTORY_VALS: &str = "accounts_history_vals";

/// Account stream metadata (prune progress marker)
pub const ACCOUNTS_SETTINGS: &str = "accounts_settings";

/// Current storage version table: `address ++ location` => [`u8; 8`]
pub const STORAGE_KEYS: &str = "storage_keys";

/// Current storage value table: `address ++ location` => value bytes (empty = tombstone)
pub const STORAGE_VALS: &str = "storage_vals";

/// Storage change index: `tx_num.to_be_bytes() ++ key` => `[]`
pub const STORAGE_HISTORY_KEYS: &str = "storage_history_keys";

/// Storage version history: `key ++ tx_num.to_be_bytes()` => value written at `tx_num`
pub const STORAGE_HISTORY_VALS: &str = "storage_history_vals";

/// Storage stream metadata (prune progress marker)
pub const STORAGE_SETTINGS: &str = "storage_settings";

/// Current code version table: plain key => [`u8; 8`]
pub const CODE_KEYS: &str = "code_keys";

/// Current code value table: plain key => bytecode (empty = tombstone)
pub const CODE_VALS: &str = "code_vals";

/// Code change index: `tx_num.to_be_bytes() ++ key` => `[]`
pub const CODE_HISTORY_KEYS: &str = "code_history_keys";

/// Code version history: `key ++ tx_num.to_be_bytes()` => bytecode at `tx_num`
pub const CODE_HISTORY_VALS: &str = "code_history_vals";

/// Code stream metadata (prune progress marker)
pub const CODE_SETTINGS: &str = "code_settings";

/// Log address appearances ordered by txNum: `tx_num.to_be_bytes() ++ key` => `[]`
pub const LOG_ADDRS_KEYS: &str = "log_addrs_keys";

/// Log address appearances ordered by key: `key ++ tx_num.to_be_bytes()` => `[]`
pub const LOG_ADDRS_IDX: &str = "log_addrs_idx";

/// Log topic appearances ordered by txNum: `tx_num.to_be_bytes() ++ key` => `[]`
pub const LOG_TOPICS_KEYS: &str = "log_topics_keys";

/// Log topic appearances ordered by key: `key ++ tx_num.to_be_bytes()` => `[]`
pub const LOG_TOPICS_IDX: &str = "log_topics_idx";

/// Trace sender appearances ordered by txNum: `tx_num.to_be_bytes() ++ key` => `[]`
pub const TRACES_FROM_KEYS: &str = "traces_from_keys";

/// Trace sender appearances ordered by key: `key ++ tx_num.to_be_bytes()` => `[]`
pub const TRACES_FROM_IDX: &str = "traces_from_idx";

/// Trace recipient appearances ordered by txNum: `tx_num.to_be_bytes() ++ key` => `[]`
pub const TRACES_TO_KEYS: &str = "traces_to_keys";

/// Trace recipient appearances ordered by key: `key ++ tx_num.to_be_bytes()` => `[]`
pub const TRACES_TO_IDX: &str = "traces_to_idx";

/// Table bundle of one domain stream.
#[derive(Debug, Clone, Copy)]
pub struct DomainTables {
    pub keys: &'static str,
    pub vals: &'static str,
    pub history_keys: &'static str,
    pub history_vals: &'static str,
    pub settings: &'static str,
}

/// Table pair of one inverted-index stream.
#[derive(Debug, Clone, Copy)]
pub struct IndexTables {
    pub keys: &'static str,
    pub idx: &'static str,
}

pub const ACCOUNTS_TABLES: DomainTables = DomainTables {
    keys: ACCOUNTS_KEYS,
    vals: ACCOUNTS_VALS,
    history_keys: ACCOUNTS_HISTORY_KEYS,
    history_vals: ACCOUNTS_HISTORY_VALS,
    settings: ACCOUNTS_SETTINGS,
};

pub const STORAGE_TABLES: DomainTables = DomainTables {
    keys: STORAGE_KEYS,
    vals: STORAGE_VALS,
    history_keys: STORAGE_HISTORY_KEYS,
    history_vals: STORAGE_HISTORY_VALS,
    settings: STORAGE_SETTINGS,
};

pub const CODE_TABLES: DomainTables = DomainTables {
    keys: CODE_KEYS,
    vals: CODE_VALS,
    history_keys: CODE_HISTORY_KEYS,
    history_vals: CODE_HISTORY_VALS,
    settings: CODE_SETTINGS,
};

pub const LOG_ADDRS_TABLES: IndexTables = IndexTables {
    keys: LOG_ADDRS_KEYS,
    idx: LOG_ADDRS_IDX,
};

pub const LOG_TOPICS_TABLES: IndexTables = IndexTables {
    keys: LOG_TOPICS_KEYS,
    idx: LOG_TOPICS_IDX,
};

pub const TRACES_FROM_TABLES: IndexTables = IndexTables {
    keys: TRACES_FROM_KEYS,
    idx: TRACES_FROM_IDX,
};

pub const TRACES_TO_TABLES: IndexTables = IndexTables {
    keys: TRACES_TO_KEYS,
    idx: TRACES_TO_IDX,
};

pub const TABLES: [&str; 23] = [
    ACCOUNTS_KEYS,
    ACCOUNTS_VALS,
    ACCOUNTS_HISTORY_KEYS,
    ACCOUNTS_HISTORY_VALS,
    ACCOUNTS_SETTINGS,
    STORAGE_KEYS,
    STORAGE_VALS,
    STORAGE_HISTORY_KEYS,
    STORAGE_HISTORY_VALS,
    STORAGE_SETTINGS,
    CODE_KEYS,
    CODE_VALS,
    CODE_HISTORY_KEYS,
    CODE_HISTORY_VALS,
    CODE_SETTINGS,
    LOG_ADDRS_KEYS,
    LOG_ADDRS_IDX,
    LOG_TOPICS_KEYS,
    LOG_TOPICS_IDX,
    TRACES_FROM_KEYS,
    TRACES_FROM_IDX,
    TRACES_TO_KEYS,
    TRACES_TO_IDX,
];
