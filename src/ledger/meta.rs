use super::change::Change;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Header fields of a closed ledger that the pipeline persists or checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub sequence: u32,
    pub hash: String,
    pub previous_hash: String,
    pub close_time: u64,
    pub protocol_version: u32,
    pub bucket_list_hash: String,
}

impl LedgerHeader {
    /// Header with hashes derived from the sequence, chained to the previous ledger.
    pub fn new(sequence: u32, close_time: u64) -> Self {
        Self {
            sequence,
            hash: format!("ledger-{sequence}"),
            previous_hash: format!("ledger-{}", sequence.saturating_sub(1)),
            close_time,
            protocol_version: 20,
            bucket_list_hash: String::new(),
        }
    }
}

/// A single operation inside a transaction. Only the parts the pipeline needs
/// to derive participants and counts are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: String,
    pub source_account: Option<String>,
    pub participants: Vec<String>,
}

impl Operation {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source_account: None,
            participants: Vec::new(),
        }
    }

    pub fn with_source(mut self, account: impl Into<String>) -> Self {
        self.source_account = Some(account.into());
        self
    }

    pub fn with_participant(mut self, account: impl Into<String>) -> Self {
        self.participants.push(account.into());
        self
    }
}

/// One transaction within a ledger. `index` is 1-based and ascending in
/// application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub index: u32,
    pub hash: String,
    pub source_account: String,
    pub fee_charged: i64,
    pub successful: bool,
    pub operations: Vec<Operation>,
}

impl LedgerTransaction {
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Every account touched by the transaction, deduplicated and sorted so
    /// derived rows are deterministic.
    pub fn participants(&self) -> Vec<String> {
        let mut accounts = BTreeSet::new();
        accounts.insert(self.source_account.clone());
        for op in &self.operations {
            if let Some(source) = &op.source_account {
                accounts.insert(source.clone());
            }
            accounts.extend(op.participants.iter().cloned());
        }
        accounts.into_iter().collect()
    }
}

/// Immutable snapshot of one closed ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLedgerCloseMeta")]
pub struct LedgerCloseMeta {
    header: LedgerHeader,
    transactions: Vec<LedgerTransaction>,
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct RawLedgerCloseMeta {
    header: LedgerHeader,
    transactions: Vec<LedgerTransaction>,
    changes: Vec<Change>,
}

impl TryFrom<RawLedgerCloseMeta> for LedgerCloseMeta {
    type Error = anyhow::Error;

    fn try_from(raw: RawLedgerCloseMeta) -> Result<Self> {
        Self::new(raw.header, raw.transactions, raw.changes)
    }
}

impl LedgerCloseMeta {
    /// Builds a snapshot, sorting transactions by index. Indexes start at 1
    /// and must be unique.
    pub fn new(
        header: LedgerHeader,
        mut transactions: Vec<LedgerTransaction>,
        changes: Vec<Change>,
    ) -> Result<Self> {
        transactions.sort_by_key(|tx| tx.index);
        if transactions.first().is_some_and(|tx| tx.index == 0) {
            bail!("ledger {} contains transaction index 0", header.sequence);
        }
        if let Some(pair) = transactions
            .windows(2)
            .find(|pair| pair[0].index == pair[1].index)
        {
            bail!(
                "ledger {} contains duplicate transaction index {}",
                header.sequence,
                pair[0].index
            );
        }
        Ok(Self {
            header,
            transactions,
            changes,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn header(&self) -> &LedgerHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[LedgerTransaction] {
        &self.transactions
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence: u32) -> LedgerHeader {
        LedgerHeader {
            sequence,
            hash: format!("h{sequence}"),
            previous_hash: format!("h{}", sequence - 1),
            close_time: 1_000 + sequence as u64,
            protocol_version: 20,
            bucket_list_hash: String::new(),
        }
    }

    fn tx(index: u32, source: &str) -> LedgerTransaction {
        LedgerTransaction {
            index,
            hash: format!("tx{index}"),
            source_account: source.to_string(),
            fee_charged: 100,
            successful: true,
            operations: vec![Operation::new("payment")
                .with_source("GOPSOURCE")
                .with_participant("GDEST")
                .with_participant(source)],
        }
    }

    #[test]
    fn transactions_are_ordered_by_index() -> Result<()> {
        let meta =
            LedgerCloseMeta::new(header(5), vec![tx(3, "A"), tx(1, "B"), tx(2, "C")], vec![])?;
        let indexes: Vec<u32> = meta.transactions().iter().map(|tx| tx.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert_eq!(meta.sequence(), 5);
        Ok(())
    }

    #[test]
    fn duplicate_and_zero_indexes_are_rejected() {
        let err = LedgerCloseMeta::new(header(5), vec![tx(2, "A"), tx(1, "C"), tx(2, "B")], vec![])
            .expect_err("index 2 appears twice");
        assert_eq!(
            err.to_string(),
            "ledger 5 contains duplicate transaction index 2"
        );
        assert!(LedgerCloseMeta::new(header(5), vec![tx(0, "A")], vec![]).is_err());
    }

    #[test]
    fn deserialization_sorts_and_validates_transactions() -> Result<()> {
        let unsorted = serde_json::json!({
            "header": header(5),
            "transactions": [tx(2, "A"), tx(1, "B")],
            "changes": [],
        });
        let meta: LedgerCloseMeta = serde_json::from_value(unsorted)?;
        let indexes: Vec<u32> = meta.transactions().iter().map(|tx| tx.index).collect();
        assert_eq!(indexes, vec![1, 2]);

        let duplicated = serde_json::json!({
            "header": header(5),
            "transactions": [tx(1, "A"), tx(1, "B")],
            "changes": [],
        });
        let err = serde_json::from_value::<LedgerCloseMeta>(duplicated)
            .expect_err("duplicate indexes must not decode");
        assert!(err.to_string().contains("duplicate transaction index 1"));
        Ok(())
    }

    #[test]
    fn participants_are_deduplicated_and_sorted() {
        let participants = tx(1, "GSRC").participants();
        assert_eq!(participants, vec!["GDEST", "GOPSOURCE", "GSRC"]);
    }
}
