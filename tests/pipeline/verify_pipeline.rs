use std::time::Duration;

use crate::support::{
    chain::{expected_state, Chain},
    helpers::{init_tracing, test_config, wait_until, within},
};
use anyhow::Result;
use ledger_ingest::ingest::ingest_error;
use ledger_ingest::{IngestConfig, IngestError};

#[tokio::test]
async fn replays_a_range_and_verifies_the_final_checkpoint() -> Result<()> {
    init_tracing();
    let chain = Chain::new(8);
    let mut system = chain.system(test_config());

    system.verify_range(2, 8, true).await?;

    assert_eq!(chain.store.last_ledger_ingest(), 8);
    assert_eq!(chain.store.state_entries(), expected_state(8));
    assert!(!chain.store.state_invalid());
    assert_eq!(system.telemetry().verification_runs(), 1);
    assert_eq!(system.telemetry().verification_failures(), 0);
    Ok(())
}

#[tokio::test]
async fn rejects_invalid_ranges_and_populated_databases() -> Result<()> {
    init_tracing();
    let chain = Chain::new(8);
    let mut system = chain.system(test_config());

    let err = system
        .verify_range(0, 0, false)
        .await
        .expect_err("ledger 0 is not a valid range start");
    assert_eq!(
        ingest_error(&err),
        Some(&IngestError::InvalidRange { from: 0, to: 0 })
    );
    assert_eq!(err.to_string(), "invalid range: [0, 0]");

    let err = system
        .verify_range(5, 2, false)
        .await
        .expect_err("reversed range");
    assert!(matches!(
        ingest_error(&err),
        Some(IngestError::InvalidRange { from: 5, to: 2 })
    ));

    system.verify_range(2, 5, false).await?;
    let err = chain
        .system(test_config())
        .verify_range(2, 5, false)
        .await
        .expect_err("database already holds ledgers");
    assert_eq!(
        ingest_error(&err),
        Some(&IngestError::DatabaseNotEmpty { cursor: 5 })
    );
    Ok(())
}

#[tokio::test]
async fn mismatching_state_marks_it_invalid() -> Result<()> {
    init_tracing();
    let chain = Chain::new(8);
    chain.archive.set_checkpoint_state(8, expected_state(7));

    let mut system = chain.system(test_config());
    let err = system
        .verify_range(2, 8, true)
        .await
        .expect_err("state must not match a truncated snapshot");

    assert!(format!("{err:#}").contains("state verification failed at ledger 8"));
    assert!(chain.store.state_invalid());
    assert_eq!(system.telemetry().verification_failures(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_ingestion_verifies_eligible_checkpoints_in_the_background() -> Result<()> {
    init_tracing();
    let chain = Chain::new(8);
    // Every third checkpoint: only ledger 8 qualifies on this chain.
    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .state_verification_checkpoint_frequency(3)
        .ledger_wait_initial_backoff(Duration::from_millis(5))
        .ledger_wait_backoff_step(Duration::from_millis(5))
        .ledger_wait_timeout(Duration::from_secs(10))
        .build()?;
    let mut system = chain.system(config);
    system.build_state(2, false).await?;

    let telemetry = system.telemetry();
    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });

    wait_until("background verification", Duration::from_secs(10), || {
        telemetry.verification_runs() == 1
    })
    .await?;
    token.cancel();
    within(Duration::from_secs(10), handle).await???;

    assert_eq!(telemetry.verification_failures(), 0);
    assert!(!chain.store.state_invalid());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catching_up_still_verifies_checkpoints_it_passes() -> Result<()> {
    init_tracing();
    // Checkpoints 5 through 17 are all published before ingestion starts.
    let chain = Chain::new(20);
    let config = IngestConfig::builder()
        .checkpoint_frequency(3)
        .state_verification_checkpoint_frequency(1)
        .ledger_wait_initial_backoff(Duration::from_millis(5))
        .ledger_wait_backoff_step(Duration::from_millis(5))
        .ledger_wait_timeout(Duration::from_secs(10))
        .build()?;
    let mut system = chain.system(config);
    system.build_state(2, false).await?;

    let telemetry = system.telemetry();
    let token = system.cancellation_token();
    let handle = tokio::spawn(async move { system.run().await });

    wait_until("ingestion to reach the tip", Duration::from_secs(10), || {
        chain.store.last_ledger_ingest() == 20
    })
    .await?;
    wait_until("a background verification", Duration::from_secs(10), || {
        telemetry.verification_runs() >= 1
    })
    .await?;
    token.cancel();
    within(Duration::from_secs(10), handle).await???;

    assert_eq!(telemetry.verification_failures(), 0);
    assert!(!chain.store.state_invalid());
    Ok(())
}
