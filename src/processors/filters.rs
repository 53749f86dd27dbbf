use super::TransactionFilterer;
use crate::ledger::{LedgerCloseMeta, LedgerTransaction};
use anyhow::Result;
use std::collections::HashSet;

/// Includes a transaction when any participant is on the allow-list.
#[derive(Debug, Clone, Default)]
pub struct AccountFilterer {
    accounts: HashSet<String>,
}

impl AccountFilterer {
    pub fn new(accounts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            accounts: accounts.into_iter().map(Into::into).collect(),
        }
    }
}

impl TransactionFilterer for AccountFilterer {
    fn name(&self) -> &str {
        "AccountFilterer"
    }

    fn filter_transaction(
        &self,
        _ledger: &LedgerCloseMeta,
        transaction: &LedgerTransaction,
    ) -> Result<bool> {
        Ok(transaction
            .participants()
            .iter()
            .any(|account| self.accounts.contains(account)))
    }
}
