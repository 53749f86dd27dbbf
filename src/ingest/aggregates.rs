//! Derived tables recomputed from history rows after a reingestion.

use crate::ledger::LedgerRange;
use crate::processors::LEDGERS_TABLE;
use crate::storage::{HistoryRow, Session};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};

pub const LEDGER_AGGREGATES_TABLE: &str = "history_ledger_aggregates";

pub trait DerivedAggregates: Send + Sync {
    fn name(&self) -> &str;

    /// Recomputes every aggregate touched by `range` inside the caller's
    /// transaction.
    fn rebuild<'a>(
        &'a self,
        session: &'a mut dyn Session,
        range: LedgerRange,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Per-bucket ledger, transaction and operation totals over fixed-size
/// ledger buckets `[k * size + 1, (k + 1) * size]`.
///
/// Bucket rows are stored with ledger `0` so range deletes never touch them.
/// Every touched bucket is rewritten, with zero totals once it holds no
/// ledgers.
pub struct LedgerCountAggregates {
    bucket_size: u32,
}

impl LedgerCountAggregates {
    pub fn new(bucket_size: u32) -> Self {
        Self {
            bucket_size: bucket_size.max(1),
        }
    }

    pub fn buckets(&self, range: LedgerRange) -> Result<Vec<LedgerRange>> {
        let size = self.bucket_size;
        let first = (range.start() - 1) / size;
        let last = (range.end() - 1) / size;
        (first..=last)
            .map(|bucket| {
                let start = bucket * size + 1;
                LedgerRange::new(start, start.saturating_add(size - 1))
            })
            .collect()
    }
}

fn count(row: &HistoryRow, field: &str) -> u64 {
    row.data.get(field).and_then(Value::as_u64).unwrap_or(0)
}

impl DerivedAggregates for LedgerCountAggregates {
    fn name(&self) -> &str {
        "LedgerCountAggregates"
    }

    fn rebuild<'a>(
        &'a self,
        session: &'a mut dyn Session,
        range: LedgerRange,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = Vec::new();
            for bucket in self.buckets(range)? {
                let ledgers = session
                    .history_rows(LEDGERS_TABLE, bucket)
                    .await
                    .with_context(|| format!("error reading ledgers for bucket {bucket}"))?;

                let transactions: u64 = ledgers
                    .iter()
                    .map(|row| {
                        count(row, "successful_transaction_count")
                            + count(row, "failed_transaction_count")
                    })
                    .sum();
                let operations: u64 =
                    ledgers.iter().map(|row| count(row, "operation_count")).sum();

                rows.push(HistoryRow::new(
                    0,
                    format!("{:010}", bucket.start()),
                    json!({
                        "start": bucket.start(),
                        "end": bucket.end(),
                        "ledgers": ledgers.len(),
                        "transactions": transactions,
                        "operations": operations,
                    }),
                ));
            }

            tracing::debug!(
                aggregate = self.name(),
                range = %range,
                buckets = rows.len(),
                "rebuilding derived aggregates"
            );
            session
                .upsert_history_rows(LEDGER_AGGREGATES_TABLE, rows)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn ledger_row(sequence: u32, successful: u64, failed: u64) -> HistoryRow {
        HistoryRow::new(
            sequence,
            format!("{sequence:020}"),
            json!({
                "sequence": sequence,
                "successful_transaction_count": successful,
                "failed_transaction_count": failed,
                "operation_count": successful * 2,
            }),
        )
    }

    #[test]
    fn buckets_are_aligned() {
        let aggregates = LedgerCountAggregates::new(10);
        let buckets = aggregates.buckets(LedgerRange::new(8, 21).unwrap()).unwrap();
        let bounds: Vec<(u32, u32)> = buckets.iter().map(|b| (b.start(), b.end())).collect();
        assert_eq!(bounds, vec![(1, 10), (11, 20), (21, 30)]);
    }

    #[tokio::test]
    async fn rebuild_sums_every_touched_bucket() -> Result<()> {
        let store = MemoryStore::new();
        let mut session = store.session();
        session.begin().await?;
        session
            .insert_history_rows(
                LEDGERS_TABLE,
                vec![ledger_row(3, 2, 1), ledger_row(4, 1, 0), ledger_row(12, 5, 0)],
            )
            .await?;

        let aggregates = LedgerCountAggregates::new(10);
        aggregates
            .rebuild(&mut session, LedgerRange::new(4, 12)?)
            .await?;
        session.commit().await?;

        let rows = store.history_rows(LEDGER_AGGREGATES_TABLE);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "0000000001");
        assert_eq!(rows[0].data["ledgers"], 2);
        assert_eq!(rows[0].data["transactions"], 4);
        assert_eq!(rows[0].data["operations"], 6);
        assert_eq!(rows[1].key, "0000000011");
        assert_eq!(rows[1].data["transactions"], 5);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_replaces_previous_totals() -> Result<()> {
        let store = MemoryStore::new();
        let mut session = store.session();
        let aggregates = LedgerCountAggregates::new(10);

        session.begin().await?;
        session
            .insert_history_rows(LEDGERS_TABLE, vec![ledger_row(5, 1, 0)])
            .await?;
        aggregates.rebuild(&mut session, LedgerRange::single(5)).await?;
        session.commit().await?;

        session.begin().await?;
        session.delete_history_range(LedgerRange::single(5)).await?;
        session
            .insert_history_rows(LEDGERS_TABLE, vec![ledger_row(5, 3, 3)])
            .await?;
        aggregates.rebuild(&mut session, LedgerRange::single(5)).await?;
        session.commit().await?;

        let rows = store.history_rows(LEDGER_AGGREGATES_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["transactions"], 6);
        Ok(())
    }

    #[tokio::test]
    async fn emptied_bucket_is_reset_to_zero() -> Result<()> {
        let store = MemoryStore::new();
        let mut session = store.session();
        let aggregates = LedgerCountAggregates::new(10);

        session.begin().await?;
        session
            .insert_history_rows(LEDGERS_TABLE, vec![ledger_row(5, 2, 1)])
            .await?;
        aggregates.rebuild(&mut session, LedgerRange::single(5)).await?;
        session.commit().await?;

        session.begin().await?;
        session.delete_history_range(LedgerRange::new(1, 10)?).await?;
        aggregates.rebuild(&mut session, LedgerRange::new(1, 10)?).await?;
        session.commit().await?;

        let rows = store.history_rows(LEDGER_AGGREGATES_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "0000000001");
        assert_eq!(rows[0].data["ledgers"], 0);
        assert_eq!(rows[0].data["transactions"], 0);
        assert_eq!(rows[0].data["operations"], 0);
        Ok(())
    }
}
