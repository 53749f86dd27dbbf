use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger entry families tracked in state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Account,
    Trustline,
    Offer,
    Data,
    ClaimableBalance,
    LiquidityPool,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Account => "account",
            EntryType::Trustline => "trustline",
            EntryType::Offer => "offer",
            EntryType::Data => "data",
            EntryType::ClaimableBalance => "claimable_balance",
            EntryType::LiquidityPool => "liquidity_pool",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry as stored in state tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_type: EntryType,
    pub key: String,
    pub last_modified_ledger: u32,
    pub data: serde_json::Value,
}

impl LedgerEntry {
    pub fn new(
        entry_type: EntryType,
        key: impl Into<String>,
        last_modified_ledger: u32,
        data: serde_json::Value,
    ) -> Self {
        Self {
            entry_type,
            key: key.into(),
            last_modified_ledger,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// One entry mutation. The constructors guarantee that exactly the image
/// implied by the kind is present: created has no pre-image, removed has no
/// post-image, updated has both. Deserialization enforces the same rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChange")]
pub struct Change {
    pre: Option<LedgerEntry>,
    post: Option<LedgerEntry>,
}

#[derive(Deserialize)]
struct RawChange {
    pre: Option<LedgerEntry>,
    post: Option<LedgerEntry>,
}

impl TryFrom<RawChange> for Change {
    type Error = anyhow::Error;

    fn try_from(raw: RawChange) -> anyhow::Result<Self> {
        match (raw.pre, raw.post) {
            (None, None) => bail!("change has neither a pre- nor a post-image"),
            (Some(pre), Some(post))
                if (pre.entry_type, &pre.key) != (post.entry_type, &post.key) =>
            {
                bail!(
                    "updated change moves {} {} to {} {}",
                    pre.entry_type,
                    pre.key,
                    post.entry_type,
                    post.key
                )
            }
            (pre, post) => Ok(Self { pre, post }),
        }
    }
}

impl Change {
    pub fn created(post: LedgerEntry) -> Self {
        Self {
            pre: None,
            post: Some(post),
        }
    }

    pub fn updated(pre: LedgerEntry, post: LedgerEntry) -> Self {
        assert_eq!(
            (pre.entry_type, &pre.key),
            (post.entry_type, &post.key),
            "updated change must keep the same entry identity"
        );
        Self {
            pre: Some(pre),
            post: Some(post),
        }
    }

    pub fn removed(pre: LedgerEntry) -> Self {
        Self {
            pre: Some(pre),
            post: None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.pre, &self.post) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), Some(_)) => ChangeKind::Updated,
            (Some(_), None) => ChangeKind::Removed,
            (None, None) => unreachable!("change without pre- or post-image"),
        }
    }

    pub fn pre(&self) -> Option<&LedgerEntry> {
        self.pre.as_ref()
    }

    pub fn post(&self) -> Option<&LedgerEntry> {
        self.post.as_ref()
    }

    pub fn entry_type(&self) -> EntryType {
        self.identity().entry_type
    }

    pub fn key(&self) -> &str {
        &self.identity().key
    }

    fn identity(&self) -> &LedgerEntry {
        match (&self.pre, &self.post) {
            (_, Some(post)) => post,
            (Some(pre), None) => pre,
            (None, None) => unreachable!("change without pre- or post-image"),
        }
    }
}
