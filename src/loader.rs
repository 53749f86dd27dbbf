//! Deferred resolution of natural keys to surrogate IDs.
//!
//! Processors register keys while streaming a ledger range and receive a
//! [`FutureId`] placeholder. Once every processor has buffered its rows,
//! [`Loader::exec`] inserts all keys in one bulk insert-or-ignore, reads the
//! assigned IDs back in one bulk lookup, and seals the loader. A loader is
//! single-use: it serves exactly one flush cycle and is then discarded.

use crate::storage::Session;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Keys per insert/lookup round trip.
pub const LOADER_BATCH_SIZE: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderTable {
    Accounts,
    Assets,
    LiquidityPools,
    ClaimableBalances,
}

impl LoaderTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            LoaderTable::Accounts => "history_accounts",
            LoaderTable::Assets => "history_assets",
            LoaderTable::LiquidityPools => "history_liquidity_pools",
            LoaderTable::ClaimableBalances => "history_claimable_balances",
        }
    }

    fn entity_name(&self) -> &'static str {
        match self {
            LoaderTable::Accounts => "account",
            LoaderTable::Assets => "asset",
            LoaderTable::LiquidityPools => "liquidity pool",
            LoaderTable::ClaimableBalances => "claimable balance",
        }
    }

    fn loader_name(&self) -> &'static str {
        match self {
            LoaderTable::Accounts => "AccountLoader",
            LoaderTable::Assets => "AssetLoader",
            LoaderTable::LiquidityPools => "LiquidityPoolLoader",
            LoaderTable::ClaimableBalances => "ClaimableBalanceLoader",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Distinct keys resolved.
    pub total: u64,
    /// Keys that did not exist before the resolving round trip.
    pub inserted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// Lookup attempted before the loader resolved its keys.
    InvalidState { entity: &'static str },
    /// The key has no ID after resolution.
    NotFound { entity: &'static str, key: String },
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderError::InvalidState { entity } => write!(
                f,
                "invalid {entity} loader state, exec was not called yet to properly resolve ids"
            ),
            LoaderError::NotFound { entity, key } => {
                write!(f, "{entity} loader key {key} was not found")
            }
        }
    }
}

impl std::error::Error for LoaderError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Sealed,
}

#[derive(Debug)]
struct LoaderState {
    lifecycle: Lifecycle,
    keys: Vec<Arc<str>>,
    index: HashMap<Arc<str>, Arc<str>>,
    ids: Option<HashMap<String, i64>>,
    stats: LoaderStats,
}

#[derive(Debug)]
struct LoaderShared {
    table: LoaderTable,
    state: Mutex<LoaderState>,
}

impl LoaderShared {
    fn resolve(&self, key: &str) -> Result<i64, LoaderError> {
        let state = self.state.lock().unwrap();
        let entity = self.table.entity_name();
        let ids = state
            .ids
            .as_ref()
            .ok_or(LoaderError::InvalidState { entity })?;
        ids.get(key).copied().ok_or_else(|| LoaderError::NotFound {
            entity,
            key: key.to_string(),
        })
    }
}

/// Deferred key → ID resolver for one entity table. Clones share state.
#[derive(Debug, Clone)]
pub struct Loader {
    shared: Arc<LoaderShared>,
}

impl Loader {
    pub fn new(table: LoaderTable) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                table,
                state: Mutex::new(LoaderState {
                    lifecycle: Lifecycle::Open,
                    keys: Vec::new(),
                    index: HashMap::new(),
                    ids: None,
                    stats: LoaderStats::default(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.table.loader_name()
    }

    pub fn table(&self) -> LoaderTable {
        self.shared.table
    }

    /// Registers `key` and returns its placeholder. Repeated calls with the
    /// same key return handles to the same placeholder.
    ///
    /// # Panics
    ///
    /// When called after [`Loader::exec`]; registering keys on a sealed
    /// loader is a wiring bug.
    pub fn get_future(&self, key: impl AsRef<str>) -> FutureId {
        let key = key.as_ref();
        let mut state = self.shared.state.lock().unwrap();
        assert!(
            state.lifecycle == Lifecycle::Open,
            "cannot call get_future() on {} after exec() was called",
            self.name()
        );
        let interned = match state.index.get(key) {
            Some(existing) => existing.clone(),
            None => {
                let interned: Arc<str> = Arc::from(key);
                state.index.insert(interned.clone(), interned.clone());
                state.keys.push(interned.clone());
                interned
            }
        };
        FutureId {
            key: interned,
            loader: self.shared.clone(),
        }
    }

    /// Resolves every registered key with one insert-or-ignore and one
    /// lookup per [`LOADER_BATCH_SIZE`] keys, then seals the loader.
    ///
    /// # Panics
    ///
    /// When called a second time.
    pub async fn exec(&self, session: &mut dyn Session) -> Result<LoaderStats> {
        let mut keys: Vec<String> = {
            let mut state = self.shared.state.lock().unwrap();
            assert!(
                state.lifecycle == Lifecycle::Open,
                "exec() called twice on {}",
                self.name()
            );
            state.lifecycle = Lifecycle::Sealed;
            state.keys.iter().map(|key| key.to_string()).collect()
        };
        // sorted so concurrent writers take row locks in the same order
        keys.sort_unstable();

        let table = self.shared.table.table_name();
        let mut inserted = 0;
        let mut ids = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(LOADER_BATCH_SIZE) {
            inserted += session.insert_lookup_keys(table, chunk).await?;
            ids.extend(session.lookup_ids(table, chunk).await?);
        }

        let stats = LoaderStats {
            total: keys.len() as u64,
            inserted,
        };
        let mut state = self.shared.state.lock().unwrap();
        state.ids = Some(ids);
        state.stats = stats;
        Ok(stats)
    }

    /// Synchronous lookup for callers that hold the key rather than its
    /// placeholder. Valid after [`Loader::exec`].
    pub fn get_now(&self, key: &str) -> Result<i64> {
        Ok(self.shared.resolve(key)?)
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.state.lock().unwrap().stats
    }

    /// Number of distinct keys registered.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Placeholder for a surrogate ID owned by a [`Loader`].
#[derive(Debug, Clone)]
pub struct FutureId {
    key: Arc<str>,
    loader: Arc<LoaderShared>,
}

impl FutureId {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The resolved ID. Errors before the owning loader ran `exec`, or when
    /// resolution did not produce an ID for this key.
    pub fn value(&self) -> Result<i64> {
        Ok(self.loader.resolve(&self.key)?)
    }

    /// True when both handles refer to the same placeholder instance.
    pub fn same_instance(&self, other: &FutureId) -> bool {
        Arc::ptr_eq(&self.key, &other.key) && Arc::ptr_eq(&self.loader, &other.loader)
    }
}

impl PartialEq for FutureId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.loader, &other.loader) && self.key == other.key
    }
}

impl Eq for FutureId {}
