use std::time::Duration;

use crate::support::{
    chain::{expected_state, ledger, Chain, TRANSACTIONS_PER_LEDGER},
    helpers::{init_tracing, test_config, wait_until, within},
};
use anyhow::Result;
use ledger_ingest::ingest::ingest_error;
use ledger_ingest::ledger::{EntryType, LedgerEntry};
use ledger_ingest::processors::{LEDGERS_TABLE, TRANSACTIONS_TABLE};
use ledger_ingest::storage::StateWrite;
use ledger_ingest::{IngestConfig, IngestError, Session, StateName};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builds_then_follows_the_chain_until_cancelled() -> Result<()> {
    init_tracing();
    let chain = Chain::new(10);
    let mut system = chain.system(test_config());

    system.build_state(2, false).await?;
    assert_eq!(chain.store.last_ledger_ingest(), 2);
    assert_eq!(chain.store.state_entries(), expected_state(2));
    assert!(chain.store.history_rows(LEDGERS_TABLE).is_empty());

    let token = system.cancellation_token();
    let progress = system.progress();
    let telemetry = system.telemetry();
    let handle = tokio::spawn(async move { system.run().await });

    wait_until("cursor to reach ledger 10", WAIT, || {
        chain.store.last_ledger_ingest() == 10
    })
    .await?;
    token.cancel();
    within(WAIT, handle).await???;

    assert_eq!(chain.store.state_entries(), expected_state(10));
    let ledgers = chain.store.history_rows(LEDGERS_TABLE);
    let sequences: Vec<u32> = ledgers.iter().map(|row| row.ledger).collect();
    assert_eq!(sequences, (3..=10).collect::<Vec<_>>());
    assert_eq!(
        chain.store.history_rows(TRANSACTIONS_TABLE).len(),
        8 * TRANSACTIONS_PER_LEDGER
    );

    let snapshot = progress.current();
    assert_eq!(snapshot.state, StateName::Stop);
    assert_eq!(snapshot.last_ingested_ledger, 10);
    assert_eq!(telemetry.ledgers_ingested(), 8);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waits_for_ledgers_published_later() -> Result<()> {
    init_tracing();
    let chain = Chain::new(2);
    let mut system = chain.system(test_config());
    system.build_state(2, false).await?;

    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(chain.store.last_ledger_ingest(), 2);
    chain.source.publish(ledger(3));
    chain.source.publish(ledger(4));

    wait_until("late ledgers to be ingested", WAIT, || {
        chain.store.last_ledger_ingest() == 4
    })
    .await?;
    token.cancel();
    within(WAIT, handle).await???;

    let requests = chain.source.requests();
    assert!(
        requests.iter().filter(|sequence| **sequence == 3).count() > 1,
        "ledger 3 should have been polled while missing: {requests:?}"
    );
    Ok(())
}

#[tokio::test]
async fn missing_ledger_times_out() -> Result<()> {
    init_tracing();
    let chain = Chain::new(2);
    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .disable_state_verification(true)
        .ledger_wait_initial_backoff(Duration::from_millis(5))
        .ledger_wait_backoff_step(Duration::from_millis(5))
        .ledger_wait_timeout(Duration::from_millis(40))
        .build()?;
    let mut system = chain.system(config);
    system.build_state(2, false).await?;

    let err = within(WAIT, system.run())
        .await?
        .expect_err("run must fail once the wait times out");
    assert!(
        matches!(
            ingest_error(&err),
            Some(IngestError::LedgerWaitTimeout { sequence: 3, .. })
        ),
        "unexpected error: {err:#}"
    );
    assert_eq!(chain.store.last_ledger_ingest(), 2);
    Ok(())
}

#[tokio::test]
async fn failed_run_still_shuts_down_background_work() -> Result<()> {
    init_tracing();
    // Ledger 5 is a checkpoint eligible for verification; ledger 6 never arrives.
    let chain = Chain::new(5);
    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .state_verification_checkpoint_frequency(1)
        .ledger_wait_initial_backoff(Duration::from_millis(5))
        .ledger_wait_backoff_step(Duration::from_millis(5))
        .ledger_wait_timeout(Duration::from_millis(40))
        .build()?;
    let mut system = chain.system(config);
    system.build_state(2, false).await?;
    let token = system.cancellation_token();

    let err = within(WAIT, system.run())
        .await?
        .expect_err("run must fail once the wait times out");
    assert!(matches!(
        ingest_error(&err),
        Some(IngestError::LedgerWaitTimeout { sequence: 6, .. })
    ));
    assert!(token.is_cancelled());
    assert_eq!(chain.store.last_ledger_ingest(), 5);
    assert_eq!(system.telemetry().verification_failures(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_state_is_rebuilt_from_the_previous_checkpoint() -> Result<()> {
    init_tracing();
    let chain = Chain::new(7);
    let mut system = chain.system(test_config());
    system.build_state(2, false).await?;

    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });
    wait_until("cursor to reach ledger 7", WAIT, || {
        chain.store.last_ledger_ingest() == 7
    })
    .await?;
    token.cancel();
    within(WAIT, handle).await???;
    let history = chain.history();

    let mut session = chain.store.session();
    session
        .write_state_entries(vec![StateWrite::Upsert(LedgerEntry::new(
            EntryType::Data,
            "GBOGUS",
            6,
            json!({ "value": "corrupt" }),
        ))])
        .await?;
    session.update_state_invalid(true).await?;
    assert!(chain.store.state_invalid());

    let mut system = chain.system(test_config());
    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });
    wait_until("state to be rebuilt through ledger 7", WAIT, || {
        !chain.store.state_invalid()
            && chain.store.last_ledger_ingest() == 7
            && chain.store.state_entries() == expected_state(7)
    })
    .await?;
    token.cancel();
    within(WAIT, handle).await???;

    // History for replayed ledgers is left alone.
    assert_eq!(chain.history(), history);
    Ok(())
}

#[tokio::test]
async fn build_skips_when_state_already_exists() -> Result<()> {
    init_tracing();
    let chain = Chain::new(5);
    chain.system(test_config()).build_state(2, false).await?;
    let commits = chain.store.commit_count();

    chain.system(test_config()).build_state(5, false).await?;
    assert_eq!(chain.store.last_ledger_ingest(), 2);
    assert_eq!(chain.store.commit_count(), commits);

    chain.system(test_config()).build_state(5, true).await?;
    assert_eq!(chain.store.last_ledger_ingest(), 5);
    assert_eq!(chain.store.state_entries(), expected_state(5));

    let err = chain
        .system(test_config())
        .build_state(4, true)
        .await
        .expect_err("4 is not a checkpoint");
    assert!(err.to_string().contains("not a checkpoint"));
    Ok(())
}
