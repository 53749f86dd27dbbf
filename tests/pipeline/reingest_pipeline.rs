use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    chain::Chain,
    helpers::{init_tracing, test_config, wait_until, within},
};
use anyhow::Result;
use ledger_ingest::ingest::{ingest_error, split_ranges, LedgerCountAggregates, SystemFactory};
use ledger_ingest::processors::LEDGERS_TABLE;
use ledger_ingest::{IngestConfig, IngestError, LedgerRange, ParallelReingest};

const WAIT: Duration = Duration::from_secs(10);

fn range(start: u32, end: u32) -> LedgerRange {
    LedgerRange::new(start, end).unwrap()
}

fn factory(chain: &Chain, config: IngestConfig) -> SystemFactory {
    let chain = chain.clone();
    Arc::new(move |_worker| Ok(chain.system(config.clone())))
}

async fn ingest_live(chain: &Chain, through: u32) -> Result<()> {
    let mut system = chain.system(test_config());
    system.build_state(2, false).await?;
    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });
    wait_until("live ingestion", WAIT, || {
        chain.store.last_ledger_ingest() == through
    })
    .await?;
    token.cancel();
    within(WAIT, handle).await???;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_reingest_reproduces_live_history() -> Result<()> {
    init_tracing();
    let chain = Chain::new(10);
    ingest_live(&chain, 10).await?;
    let live_history = chain.history();

    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .reingest_workers(2)
        .reingest_retry_backoff(Duration::from_millis(1))
        .build()?;
    let orchestrator = ParallelReingest::new(config.clone(), factory(&chain, config));
    let report = orchestrator.reingest_range(&[range(3, 5)], 1).await?;

    assert_eq!(
        report.completed_ranges(),
        vec![range(3, 3), range(4, 4), range(5, 5)]
    );
    assert!(report.jobs.iter().all(|job| job.attempts == 1));
    assert_eq!(chain.store.last_ledger_ingest(), 10);
    assert_eq!(chain.history(), live_history);
    assert_eq!(orchestrator.telemetry().reingested_ledgers(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_commit_failures_are_retried() -> Result<()> {
    init_tracing();
    let chain = Chain::new(10);
    ingest_live(&chain, 10).await?;
    let live_history = chain.history();

    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .reingest_workers(1)
        .reingest_job_retries(3)
        .reingest_retry_backoff(Duration::from_millis(1))
        .build()?;
    chain.store.fail_next_commits(1);
    let orchestrator = ParallelReingest::new(config.clone(), factory(&chain, config));
    let report = orchestrator.reingest_range(&[range(4, 7)], 10).await?;

    assert_eq!(report.completed_ranges(), vec![range(4, 7)]);
    assert_eq!(report.jobs[0].attempts, 2);
    assert_eq!(orchestrator.telemetry().snapshot().reingest_job_retries, 1);
    assert_eq!(chain.history(), live_history);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_report_the_range_to_restart() -> Result<()> {
    init_tracing();
    let chain = Chain::new(10);
    ingest_live(&chain, 10).await?;

    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .reingest_workers(1)
        .reingest_job_retries(2)
        .reingest_retry_backoff(Duration::from_millis(1))
        .build()?;
    chain.store.fail_next_commits(2);
    let orchestrator = ParallelReingest::new(config.clone(), factory(&chain, config));
    let err = orchestrator
        .reingest_range(&[range(3, 8)], 3)
        .await
        .expect_err("both attempts of the first job fail");

    assert_eq!(
        ingest_error(&err),
        Some(&IngestError::ReingestFailed {
            job: range(3, 5),
            restart: range(3, 8),
        })
    );
    // The cursor and every other ledger survive a failed job.
    assert_eq!(chain.store.last_ledger_ingest(), 10);
    assert_eq!(chain.store.history_rows(LEDGERS_TABLE).len(), 8);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ranges_reaching_the_live_cursor_need_force() -> Result<()> {
    init_tracing();
    let chain = Chain::new(10);
    ingest_live(&chain, 10).await?;
    let commits = chain.store.commit_count();

    let err = chain
        .system(test_config())
        .reingest_range(&[range(3, 4), range(9, 10)], false, false)
        .await
        .expect_err("range ends at the cursor");
    assert_eq!(
        ingest_error(&err),
        Some(&IngestError::RangeConflict {
            range: range(9, 10),
            cursor: 10,
        })
    );

    let config = test_config();
    let orchestrator = ParallelReingest::new(config.clone(), factory(&chain, config));
    let err = orchestrator
        .reingest_range(&[range(8, 12)], 2)
        .await
        .expect_err("parallel reingestion never forces");
    assert!(matches!(
        ingest_error(&err),
        Some(IngestError::RangeConflict { cursor: 10, .. })
    ));
    // Rejected before any job touched the database.
    assert_eq!(chain.store.commit_count(), commits);

    let mut system = chain
        .system(test_config())
        .with_derived_aggregates(Arc::new(LedgerCountAggregates::new(5)));
    system.reingest_range(&[range(6, 10)], true, true).await?;
    assert_eq!(chain.store.last_ledger_ingest(), 10);

    let aggregates = chain.store.history_rows(ledger_ingest::ingest::LEDGER_AGGREGATES_TABLE);
    let buckets: Vec<(u64, u64)> = aggregates
        .iter()
        .map(|row| {
            (
                row.data["start"].as_u64().unwrap_or(0),
                row.data["ledgers"].as_u64().unwrap_or(0),
            )
        })
        .collect();
    assert_eq!(buckets, vec![(6, 5)]);
    Ok(())
}

#[test]
fn job_split_partitions_every_range() {
    let jobs = split_ranges(&[range(1, 10), range(20, 21)], 4);
    assert_eq!(
        jobs,
        vec![range(1, 4), range(5, 8), range(9, 10), range(20, 21)]
    );
}
